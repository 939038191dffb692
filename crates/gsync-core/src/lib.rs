//! Core domain model for gsync: subjects, publications, citation graphs and statistics.

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "gsync-core";

pub type SubjectId = i64;
pub type PublicationId = i64;

/// Stored title for works whose scraped title holds characters outside the BMP.
/// Once stored it is never replaced by a later scrape.
pub const NON_BMP_TITLE_PLACEHOLDER: &str = "Unknown Title: Non ASCII";

/// A tracked person. `scholar_id` is the lookup key for the snapshot provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub scholar_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationYearPoint {
    pub year: i32,
    pub citations: i64,
}

/// Year-keyed citation counts for one owner. At most one count per year.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationGraph(BTreeMap<i32, i64>);

impl CitationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from points; a repeated year keeps the last count seen.
    pub fn from_points(points: impl IntoIterator<Item = CitationYearPoint>) -> Self {
        points.into_iter().map(|p| (p.year, p.citations)).collect()
    }

    pub fn insert(&mut self, year: i32, citations: i64) -> Option<i64> {
        self.0.insert(year, citations)
    }

    pub fn remove(&mut self, year: i32) -> Option<i64> {
        self.0.remove(&year)
    }

    pub fn get(&self, year: i32) -> Option<i64> {
        self.0.get(&year).copied()
    }

    pub fn contains_year(&self, year: i32) -> bool {
        self.0.contains_key(&year)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Points in ascending year order.
    pub fn iter(&self) -> impl Iterator<Item = CitationYearPoint> + '_ {
        self.0.iter().map(|(&year, &citations)| CitationYearPoint { year, citations })
    }
}

impl FromIterator<(i32, i64)> for CitationGraph {
    fn from_iter<I: IntoIterator<Item = (i32, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Which time series a set of operations belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphOwner {
    Staff(SubjectId),
    Publication(PublicationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeSeriesOp {
    Insert { year: i32, citations: i64 },
    Update { year: i32, citations: i64 },
    Delete { year: i32 },
}

impl TimeSeriesOp {
    pub fn year(&self) -> i32 {
        match *self {
            Self::Insert { year, .. } | Self::Update { year, .. } | Self::Delete { year } => year,
        }
    }
}

/// One row of a profile's publication list as scraped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedPublication {
    pub title: String,
    pub year: Option<i32>,
    pub url: Option<String>,
    pub citations: i64,
    pub scholar_publication_id: Option<String>,
}

/// Metadata scraped from a single publication's page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationDetail {
    pub authors: Option<String>,
    pub journal: Option<String>,
    pub publisher: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub citation_graph: CitationGraph,
}

/// One line of the provider's statistics table: all-time and recent-window values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRow {
    pub all_time: i64,
    pub recent: i64,
}

/// Everything fetched for one subject in one sync attempt. Never persisted as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeSnapshot {
    pub publications: Vec<ScrapedPublication>,
    pub citation_graph: CitationGraph,
    pub stats_rows: Vec<StatsRow>,
}

/// A publication as currently persisted for one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPublication {
    pub id: PublicationId,
    pub title: String,
    pub year: Option<i32>,
    pub url: String,
    pub citations: i64,
    pub scholar_publication_id: Option<String>,
    pub authors: Option<String>,
    pub journal: Option<String>,
    pub publisher: Option<String>,
    pub publication_date: Option<NaiveDate>,
    /// `None` until a detail fetch has resolved the subject's position.
    pub author_order: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPublication {
    pub title: String,
    pub year: Option<i32>,
    pub url: String,
    pub citations: i64,
    pub scholar_publication_id: Option<String>,
}

/// Persisted state loaded for one subject before reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredState {
    pub statistics: Option<StaffStatistics>,
    pub citation_graph: CitationGraph,
    pub publications: Vec<StoredPublication>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub department_id: i64,
    pub department_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub role_id: i64,
    pub role_name: String,
}

/// One staff member as listed by the read API. `statistics` is `None` until
/// the first successful sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffSummary {
    pub staff_id: SubjectId,
    pub name: String,
    pub scholar_id: Option<String>,
    pub department_id: Option<i64>,
    pub role_id: Option<i64>,
    pub publication_count: i64,
    #[serde(flatten)]
    pub statistics: Option<StaffStatistics>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchValue {
    Int(i64),
    Text(Option<String>),
    Date(Option<NaiveDate>),
}

/// A named, persistable field of a patchable record.
pub trait PatchField: Copy + Eq + Debug {
    fn column(self) -> &'static str;
}

/// Field name to new value, holding only the fields that changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparsePatch<F> {
    entries: Vec<(F, PatchValue)>,
}

impl<F> Default for SparsePatch<F> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<F: PatchField> SparsePatch<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, replacing any earlier value for the same field.
    pub fn set(&mut self, field: F, value: PatchValue) {
        match self.entries.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((field, value)),
        }
    }

    pub fn get(&self, field: F) -> Option<&PatchValue> {
        self.entries.iter().find(|(f, _)| *f == field).map(|(_, v)| v)
    }

    pub fn contains(&self, field: F) -> bool {
        self.get(field).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(F, PatchValue)> {
        self.entries.iter()
    }

    /// Splits off the entries matching `pred`, keeping the rest.
    pub fn partition(self, pred: impl Fn(F) -> bool) -> (Self, Self) {
        let (matched, rest): (Vec<_>, Vec<_>) = self.entries.into_iter().partition(|(f, _)| pred(*f));
        (Self { entries: matched }, Self { entries: rest })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublicationField {
    Title,
    Authors,
    PublicationDate,
    Journal,
    Publisher,
    Citations,
    /// Stored on the subject/publication link rather than the publication.
    AuthorOrder,
}

impl PatchField for PublicationField {
    fn column(self) -> &'static str {
        match self {
            Self::Title => "publication_title",
            Self::Authors => "authors",
            Self::PublicationDate => "publication_date",
            Self::Journal => "journal",
            Self::Publisher => "publisher",
            Self::Citations => "citations",
            Self::AuthorOrder => "author_order",
        }
    }
}

pub type PublicationPatch = SparsePatch<PublicationField>;
pub type StatisticsPatch = SparsePatch<StatsField>;

/// Slots of the staff statistics record, in positional order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatsField {
    TotalCitations,
    Last5yCitations,
    HIndex,
    Last5yHIndex,
    I10Index,
    Last5yI10Index,
    HIndexLocal,
    Last5yHIndexLocal,
    I10IndexLocal,
    Last5yI10IndexLocal,
    HIndexFromGraph,
    Last5yHIndexFromGraph,
    I10IndexFromGraph,
    Last5yI10IndexFromGraph,
}

impl StatsField {
    pub const COUNT: usize = 14;

    /// Position table: `ALL[i]` is the field stored in slot `i`.
    pub const ALL: [StatsField; Self::COUNT] = [
        Self::TotalCitations,
        Self::Last5yCitations,
        Self::HIndex,
        Self::Last5yHIndex,
        Self::I10Index,
        Self::Last5yI10Index,
        Self::HIndexLocal,
        Self::Last5yHIndexLocal,
        Self::I10IndexLocal,
        Self::Last5yI10IndexLocal,
        Self::HIndexFromGraph,
        Self::Last5yHIndexFromGraph,
        Self::I10IndexFromGraph,
        Self::Last5yI10IndexFromGraph,
    ];

    pub fn position(self) -> usize {
        self as usize
    }
}

impl PatchField for StatsField {
    fn column(self) -> &'static str {
        match self {
            Self::TotalCitations => "total_citations",
            Self::Last5yCitations => "last_5y_citations",
            Self::HIndex => "h_index",
            Self::Last5yHIndex => "last_5y_h_index",
            Self::I10Index => "i10_index",
            Self::Last5yI10Index => "last_5y_i10_index",
            Self::HIndexLocal => "h_index_local",
            Self::Last5yHIndexLocal => "last_5y_h_index_local",
            Self::I10IndexLocal => "i10_index_local",
            Self::Last5yI10IndexLocal => "last_5y_i10_index_local",
            Self::HIndexFromGraph => "h_index_from_graph",
            Self::Last5yHIndexFromGraph => "last_5y_h_index_from_graph",
            Self::I10IndexFromGraph => "i10_index_from_graph",
            Self::Last5yI10IndexFromGraph => "last_5y_i10_index_from_graph",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("statistics tuple has {found} positions, expected {expected}")]
    StatisticsWidth { expected: usize, found: usize },
}

/// Citation indices for one subject: provider-reported, computed from the
/// publication list, and computed from the stored year graphs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffStatistics {
    pub total_citations: i64,
    pub last_5y_citations: i64,
    pub h_index: i64,
    pub last_5y_h_index: i64,
    pub i10_index: i64,
    pub last_5y_i10_index: i64,
    pub h_index_local: i64,
    pub last_5y_h_index_local: i64,
    pub i10_index_local: i64,
    pub last_5y_i10_index_local: i64,
    pub h_index_from_graph: i64,
    pub last_5y_h_index_from_graph: i64,
    pub i10_index_from_graph: i64,
    pub last_5y_i10_index_from_graph: i64,
}

impl StaffStatistics {
    pub fn get(&self, field: StatsField) -> i64 {
        *self.slot(field)
    }

    pub fn set(&mut self, field: StatsField, value: i64) {
        *self.slot_mut(field) = value;
    }

    pub fn to_slots(&self) -> [i64; StatsField::COUNT] {
        StatsField::ALL.map(|field| self.get(field))
    }

    pub fn from_slots(slots: &[i64]) -> Result<Self, ShapeError> {
        if slots.len() != StatsField::COUNT {
            return Err(ShapeError::StatisticsWidth {
                expected: StatsField::COUNT,
                found: slots.len(),
            });
        }
        let mut stats = Self::default();
        for (field, value) in StatsField::ALL.iter().zip(slots) {
            stats.set(*field, *value);
        }
        Ok(stats)
    }

    fn slot(&self, field: StatsField) -> &i64 {
        match field {
            StatsField::TotalCitations => &self.total_citations,
            StatsField::Last5yCitations => &self.last_5y_citations,
            StatsField::HIndex => &self.h_index,
            StatsField::Last5yHIndex => &self.last_5y_h_index,
            StatsField::I10Index => &self.i10_index,
            StatsField::Last5yI10Index => &self.last_5y_i10_index,
            StatsField::HIndexLocal => &self.h_index_local,
            StatsField::Last5yHIndexLocal => &self.last_5y_h_index_local,
            StatsField::I10IndexLocal => &self.i10_index_local,
            StatsField::Last5yI10IndexLocal => &self.last_5y_i10_index_local,
            StatsField::HIndexFromGraph => &self.h_index_from_graph,
            StatsField::Last5yHIndexFromGraph => &self.last_5y_h_index_from_graph,
            StatsField::I10IndexFromGraph => &self.i10_index_from_graph,
            StatsField::Last5yI10IndexFromGraph => &self.last_5y_i10_index_from_graph,
        }
    }

    fn slot_mut(&mut self, field: StatsField) -> &mut i64 {
        match field {
            StatsField::TotalCitations => &mut self.total_citations,
            StatsField::Last5yCitations => &mut self.last_5y_citations,
            StatsField::HIndex => &mut self.h_index,
            StatsField::Last5yHIndex => &mut self.last_5y_h_index,
            StatsField::I10Index => &mut self.i10_index,
            StatsField::Last5yI10Index => &mut self.last_5y_i10_index,
            StatsField::HIndexLocal => &mut self.h_index_local,
            StatsField::Last5yHIndexLocal => &mut self.last_5y_h_index_local,
            StatsField::I10IndexLocal => &mut self.i10_index_local,
            StatsField::Last5yI10IndexLocal => &mut self.last_5y_i10_index_local,
            StatsField::HIndexFromGraph => &mut self.h_index_from_graph,
            StatsField::Last5yHIndexFromGraph => &mut self.last_5y_h_index_from_graph,
            StatsField::I10IndexFromGraph => &mut self.i10_index_from_graph,
            StatsField::Last5yI10IndexFromGraph => &mut self.last_5y_i10_index_from_graph,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_table_matches_column_names() {
        let columns = StatsField::ALL.map(|f| f.column());
        assert_eq!(columns[0], "total_citations");
        assert_eq!(columns[1], "last_5y_citations");
        assert_eq!(columns[6], "h_index_local");
        assert_eq!(columns[13], "last_5y_i10_index_from_graph");
        for (i, field) in StatsField::ALL.iter().enumerate() {
            assert_eq!(field.position(), i);
        }
    }

    #[test]
    fn statistics_round_trip_through_slots() {
        let slots: Vec<i64> = (0..14).collect();
        let stats = StaffStatistics::from_slots(&slots).expect("fourteen slots fit");
        assert_eq!(stats.total_citations, 0);
        assert_eq!(stats.i10_index, 4);
        assert_eq!(stats.last_5y_i10_index_from_graph, 13);
        assert_eq!(stats.to_slots().to_vec(), slots);
    }

    #[test]
    fn statistics_reject_wrong_width() {
        let err = StaffStatistics::from_slots(&[1, 2, 3]).expect_err("three slots are too few");
        assert_eq!(
            err,
            ShapeError::StatisticsWidth {
                expected: 14,
                found: 3
            }
        );
    }

    #[test]
    fn sparse_patch_replaces_repeated_field() {
        let mut patch = PublicationPatch::new();
        patch.set(PublicationField::Citations, PatchValue::Int(3));
        patch.set(PublicationField::Journal, PatchValue::Text(None));
        patch.set(PublicationField::Citations, PatchValue::Int(7));
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get(PublicationField::Citations), Some(&PatchValue::Int(7)));

        let (link, rest) = patch.partition(|f| f == PublicationField::AuthorOrder);
        assert!(link.is_empty());
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn graph_keeps_last_point_per_year() {
        let graph = CitationGraph::from_points([
            CitationYearPoint { year: 2021, citations: 3 },
            CitationYearPoint { year: 2020, citations: 5 },
            CitationYearPoint { year: 2021, citations: 4 },
        ]);
        assert_eq!(graph.len(), 2);
        assert_eq!(graph.get(2021), Some(4));
        assert_eq!(graph.iter().map(|p| p.year).collect::<Vec<_>>(), vec![2020, 2021]);
    }
}
