use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use gsync_storage::StoreError;
use serde::Serialize;
use tokio::fs;
use tracing::error;
use uuid::Uuid;

pub const SUMMARY_FILE_NAME: &str = "sync_summary.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub subjects_processed: usize,
    pub subjects_skipped: usize,
    pub subjects_failed: usize,
    pub publications_inserted: usize,
    pub publications_patched: usize,
    pub detail_fetch_failures: usize,
    pub graph_ops_applied: usize,
    pub statistics_inserted: usize,
    pub statistics_patched: usize,
    pub statistics_skipped: usize,
    pub persistence_errors: usize,
    pub cooldowns: usize,
    pub restarts: usize,
}

impl RunCounters {
    /// Swallows a failed write so the run can move on; an unavailable store
    /// still propagates.
    pub fn tolerate<T>(
        &mut self,
        operation: &'static str,
        result: Result<T, StoreError>,
    ) -> Result<Option<T>, StoreError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_unavailable() => Err(err),
            Err(err) => {
                error!(operation, error = %err, "store write failed; skipping");
                self.persistence_errors += 1;
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub subjects_total: usize,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub report_path: String,
}

/// Writes `<reports_dir>/<run_id>/sync_summary.json` and records its path on
/// the summary.
pub async fn write_summary(reports_dir: &Path, summary: &mut SyncRunSummary) -> Result<()> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let path = run_dir.join(SUMMARY_FILE_NAME);
    summary.report_path = path.display().to_string();
    let bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_errors_are_counted_and_swallowed() {
        let mut counters = RunCounters::default();
        let failed: Result<(), StoreError> = Err(StoreError::persistence("insert", "duplicate key"));
        assert!(counters.tolerate("insert publication", failed).expect("persistence error is tolerated").is_none());
        assert_eq!(counters.persistence_errors, 1);

        let ok: Result<i64, StoreError> = Ok(7);
        assert_eq!(counters.tolerate("insert publication", ok).expect("success passes through"), Some(7));
    }

    #[test]
    fn unavailable_store_propagates() {
        let mut counters = RunCounters::default();
        let down: Result<(), StoreError> = Err(StoreError::Unavailable("pool closed".into()));
        assert!(counters.tolerate("load state", down).is_err());
        assert_eq!(counters.persistence_errors, 0);
    }

    #[tokio::test]
    async fn summary_lands_under_run_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut summary = SyncRunSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            subjects_total: 2,
            counters: RunCounters {
                subjects_processed: 2,
                restarts: 1,
                ..RunCounters::default()
            },
            report_path: String::new(),
        };
        write_summary(dir.path(), &mut summary).await.expect("summary written");

        let expected = dir
            .path()
            .join(summary.run_id.to_string())
            .join(SUMMARY_FILE_NAME);
        assert_eq!(summary.report_path, expected.display().to_string());

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&expected).expect("summary readable")).expect("summary is json");
        assert_eq!(written["subjects_processed"], 2);
        assert_eq!(written["restarts"], 1);
        assert_eq!(written["run_id"], summary.run_id.to_string());
    }
}
