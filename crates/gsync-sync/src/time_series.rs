//! Year-graph diffing.

use std::collections::BTreeSet;

use gsync_core::{CitationGraph, TimeSeriesOp};

/// Operations that turn `stored` into `scraped`, in ascending year order.
///
/// A scraped year missing from storage is inserted, a year present on both
/// sides with a different count is updated, and a stored year the snapshot
/// no longer has is deleted. A year that received an update is never also
/// deleted, so every year is touched at most once.
pub fn diff_graphs(scraped: &CitationGraph, stored: &CitationGraph) -> Vec<TimeSeriesOp> {
    let mut ops = Vec::new();
    let mut updated = BTreeSet::new();

    for point in scraped.iter() {
        match stored.get(point.year) {
            Some(count) if count == point.citations => {}
            Some(_) => {
                updated.insert(point.year);
                ops.push(TimeSeriesOp::Update {
                    year: point.year,
                    citations: point.citations,
                });
            }
            None => ops.push(TimeSeriesOp::Insert {
                year: point.year,
                citations: point.citations,
            }),
        }
    }

    for point in stored.iter() {
        if scraped.get(point.year) == Some(point.citations) || updated.contains(&point.year) {
            continue;
        }
        ops.push(TimeSeriesOp::Delete { year: point.year });
    }

    ops.sort_by_key(TimeSeriesOp::year);
    ops
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(points: &[(i32, i64)]) -> CitationGraph {
        points.iter().copied().collect()
    }

    #[test]
    fn changed_year_updates_and_new_year_inserts() {
        let ops = diff_graphs(
            &graph(&[(2020, 5), (2021, 7), (2022, 1)]),
            &graph(&[(2020, 5), (2021, 3)]),
        );
        assert_eq!(
            ops,
            vec![
                TimeSeriesOp::Update { year: 2021, citations: 7 },
                TimeSeriesOp::Insert { year: 2022, citations: 1 },
            ]
        );
    }

    #[test]
    fn updated_year_is_not_also_deleted() {
        let ops = diff_graphs(&graph(&[(2020, 9)]), &graph(&[(2020, 5)]));
        assert_eq!(ops, vec![TimeSeriesOp::Update { year: 2020, citations: 9 }]);
    }

    #[test]
    fn vanished_year_is_deleted() {
        let ops = diff_graphs(&graph(&[(2021, 4)]), &graph(&[(2019, 2), (2021, 4)]));
        assert_eq!(ops, vec![TimeSeriesOp::Delete { year: 2019 }]);
    }

    #[test]
    fn identical_graphs_produce_nothing() {
        let g = graph(&[(2019, 2), (2020, 8)]);
        assert!(diff_graphs(&g, &g).is_empty());
        assert!(diff_graphs(&CitationGraph::new(), &CitationGraph::new()).is_empty());
    }

    #[test]
    fn empty_store_inserts_everything() {
        let ops = diff_graphs(&graph(&[(2023, 1), (2022, 2)]), &CitationGraph::new());
        assert_eq!(
            ops,
            vec![
                TimeSeriesOp::Insert { year: 2022, citations: 2 },
                TimeSeriesOp::Insert { year: 2023, citations: 1 },
            ]
        );
    }
}
