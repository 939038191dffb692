//! Aggregates served by the read API, computed from staff listings.

use std::collections::BTreeMap;

use gsync_core::{Department, StaffSummary, StoredPublication};
use serde::Serialize;

/// Totals and averages over a group of staff. Averages only count staff
/// that have been synced at least once.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupStatistics {
    pub staff_count: usize,
    pub synced_staff: usize,
    pub publication_count: i64,
    pub total_citations: i64,
    pub last_5y_citations: i64,
    pub max_h_index: i64,
    pub average_h_index: f64,
    pub average_i10_index: f64,
}

impl GroupStatistics {
    pub fn over<'a>(staff: impl IntoIterator<Item = &'a StaffSummary>) -> Self {
        let mut group = Self::default();
        let mut h_sum = 0;
        let mut i10_sum = 0;
        for member in staff {
            group.staff_count += 1;
            group.publication_count += member.publication_count;
            let Some(stats) = &member.statistics else {
                continue;
            };
            group.synced_staff += 1;
            group.total_citations += stats.total_citations;
            group.last_5y_citations += stats.last_5y_citations;
            group.max_h_index = group.max_h_index.max(stats.h_index);
            h_sum += stats.h_index;
            i10_sum += stats.i10_index;
        }
        if group.synced_staff > 0 {
            group.average_h_index = h_sum as f64 / group.synced_staff as f64;
            group.average_i10_index = i10_sum as f64 / group.synced_staff as f64;
        }
        group
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DepartmentStatistics {
    pub department_id: i64,
    pub department_name: String,
    #[serde(flatten)]
    pub statistics: GroupStatistics,
}

/// One entry per requested department that exists, in id order, including
/// departments where no staff matched.
pub fn department_statistics(
    departments: &[Department],
    requested: &[i64],
    staff: &[StaffSummary],
) -> Vec<DepartmentStatistics> {
    departments
        .iter()
        .filter(|d| requested.contains(&d.department_id))
        .map(|d| DepartmentStatistics {
            department_id: d.department_id,
            department_name: d.department_name.clone(),
            statistics: GroupStatistics::over(
                staff
                    .iter()
                    .filter(|s| s.department_id == Some(d.department_id)),
            ),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublicationsPerYear {
    pub year: i32,
    pub publications: i64,
}

/// Publication counts by publication year, ascending. Undated works are left out.
pub fn publications_per_year(publications: &[StoredPublication]) -> Vec<PublicationsPerYear> {
    let mut counts: BTreeMap<i32, i64> = BTreeMap::new();
    for year in publications.iter().filter_map(|p| p.year) {
        *counts.entry(year).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(year, publications)| PublicationsPerYear { year, publications })
        .collect()
}
