//! Persistence and HTTP session plumbing for gsync.
//!
//! The [`Store`] trait is everything the sync core needs from the database,
//! and [`ReadStore`] is what the HTTP API reads back out of it.
//! [`PgStore`] is the production backend; [`MemoryStore`] backs tests.

mod http;
mod memory;
mod postgres;

use async_trait::async_trait;
use gsync_core::{
    CitationGraph, Department, GraphOwner, NewPublication, PublicationId, PublicationPatch, Role,
    StaffStatistics, StaffSummary, StatisticsPatch, StoredPublication, StoredState, Subject,
    SubjectId, TimeSeriesOp,
};
use thiserror::Error;

pub use http::{
    classify_send_error, classify_status, FetchedResponse, HttpClientConfig, HttpError,
    HttpFetcher, RequestPacer, RetryDecision, RetryDisposition, RetryPolicy,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "gsync-storage";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend cannot be reached at all; callers stop the run.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A single statement failed; callers log it and move on.
    #[error("{operation} failed: {message}")]
    Persistence {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    pub fn persistence(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Persistence {
            operation,
            message: message.into(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Storage operations used by the reconciliation loop.
///
/// Every write commits on its own; nothing spans a whole subject.
#[async_trait]
pub trait Store: Send + Sync {
    /// Subjects ordered by internal id.
    async fn subjects(&self) -> Result<Vec<Subject>, StoreError>;

    async fn current_state(&self, subject_id: SubjectId) -> Result<StoredState, StoreError>;

    async fn publication_graph(
        &self,
        publication_id: PublicationId,
    ) -> Result<CitationGraph, StoreError>;

    /// Inserts the publication and links it to the subject with an unresolved author order.
    async fn insert_publication(
        &self,
        subject_id: SubjectId,
        publication: &NewPublication,
    ) -> Result<PublicationId, StoreError>;

    async fn patch_publication(
        &self,
        subject_id: SubjectId,
        publication_id: PublicationId,
        patch: &PublicationPatch,
    ) -> Result<(), StoreError>;

    async fn insert_statistics(
        &self,
        subject_id: SubjectId,
        statistics: &StaffStatistics,
    ) -> Result<(), StoreError>;

    async fn patch_statistics(
        &self,
        subject_id: SubjectId,
        patch: &StatisticsPatch,
    ) -> Result<(), StoreError>;

    /// Applies each operation independently and returns how many succeeded.
    /// Individual statement failures are logged and skipped.
    async fn apply_time_series_ops(
        &self,
        owner: GraphOwner,
        ops: &[TimeSeriesOp],
    ) -> Result<usize, StoreError>;
}

/// Read-only queries served by the HTTP API.
#[async_trait]
pub trait ReadStore: Send + Sync {
    async fn departments(&self) -> Result<Vec<Department>, StoreError>;

    async fn roles(&self) -> Result<Vec<Role>, StoreError>;

    /// Staff whose department is in `departments` and whose role is in `roles`,
    /// ordered by id.
    async fn staff_by_affiliation(
        &self,
        departments: &[i64],
        roles: &[i64],
    ) -> Result<Vec<StaffSummary>, StoreError>;

    /// Staff with the given ids, ordered by id. Unknown ids are ignored.
    async fn staff_by_ids(&self, ids: &[SubjectId]) -> Result<Vec<StaffSummary>, StoreError>;

    async fn staff_citation_graph(&self, staff_id: SubjectId)
        -> Result<CitationGraph, StoreError>;

    async fn staff_publications(
        &self,
        staff_id: SubjectId,
    ) -> Result<Vec<StoredPublication>, StoreError>;
}
