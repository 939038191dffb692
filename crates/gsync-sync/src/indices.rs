//! h-index and i10-index, over the full record and over the recent window.

use gsync_core::CitationGraph;
use serde::Serialize;

/// One strategy's four indices, in statistics slot order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexSet {
    pub h_index: i64,
    pub recent_h_index: i64,
    pub i10_index: i64,
    pub recent_i10_index: i64,
}

impl IndexSet {
    pub fn to_slots(self) -> [i64; 4] {
        [
            self.h_index,
            self.recent_h_index,
            self.i10_index,
            self.recent_i10_index,
        ]
    }
}

/// Negative counts are clamped to zero before any index is computed.
#[derive(Debug, Clone, Copy)]
pub struct IndexCalculator {
    pub recent_years: i32,
    pub i10_threshold: i64,
}

impl Default for IndexCalculator {
    fn default() -> Self {
        Self {
            recent_years: 5,
            i10_threshold: 10,
        }
    }
}

pub fn h_index(counts: &[i64]) -> i64 {
    let mut sorted: Vec<i64> = counts.iter().map(|&c| c.max(0)).collect();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted
        .iter()
        .enumerate()
        .filter(|&(i, &c)| c >= i as i64 + 1)
        .count() as i64
}

impl IndexCalculator {
    pub fn i10_index(&self, counts: &[i64]) -> i64 {
        counts
            .iter()
            .filter(|&&c| c.max(0) >= self.i10_threshold)
            .count() as i64
    }

    /// First year inside the recent window (inclusive).
    pub fn window_start(&self, current_year: i32) -> i32 {
        current_year.saturating_sub(self.recent_years)
    }

    fn index_set(&self, all: &[i64], recent: &[i64]) -> IndexSet {
        IndexSet {
            h_index: h_index(all),
            recent_h_index: h_index(recent),
            i10_index: self.i10_index(all),
            recent_i10_index: self.i10_index(recent),
        }
    }

    /// Indices over the flat list of `(publication year, total citations)`.
    /// Rows without a year never fall in the recent window.
    pub fn local(
        &self,
        rows: impl IntoIterator<Item = (Option<i32>, i64)>,
        current_year: i32,
    ) -> IndexSet {
        let start = self.window_start(current_year);
        let mut all = Vec::new();
        let mut recent = Vec::new();
        for (year, citations) in rows {
            all.push(citations);
            if year.is_some_and(|y| y >= start) {
                recent.push(citations);
            }
        }
        self.index_set(&all, &recent)
    }

    /// Indices over per-publication year graphs. Each publication counts
    /// with the sum of its points; the recent variant sums only the points
    /// observed inside the window. Publications with no points are ignored.
    pub fn from_graphs<'a>(
        &self,
        graphs: impl IntoIterator<Item = &'a CitationGraph>,
        current_year: i32,
    ) -> IndexSet {
        let start = self.window_start(current_year);
        let mut all = Vec::new();
        let mut recent = Vec::new();
        for graph in graphs {
            if graph.is_empty() {
                continue;
            }
            all.push(graph.iter().map(|p| p.citations.max(0)).sum());
            let windowed: Vec<i64> = graph
                .iter()
                .filter(|p| p.year >= start)
                .map(|p| p.citations.max(0))
                .collect();
            if !windowed.is_empty() {
                recent.push(windowed.iter().sum());
            }
        }
        self.index_set(&all, &recent)
    }
}
