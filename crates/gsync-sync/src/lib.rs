//! Reconciliation core: compares each subject's fresh snapshot with what is
//! stored and writes back only the differences.

mod author_order;
mod config;
mod failure;
mod indices;
mod records;
mod report;
mod similarity;
mod time_series;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use gsync_adapters::{ScholarHtmlProvider, SnapshotProvider};
use gsync_core::{
    CitationGraph, GraphOwner, NewPublication, PublicationDetail, PublicationId,
    PublicationPatch, ScrapeSnapshot, ScrapedPublication, StaffStatistics, StoredPublication,
    StoredState, Subject,
};
use gsync_storage::{PgStore, Store, StoreError};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use author_order::{AuthorOrderResolver, AUTHOR_DELIMITER};
pub use config::{redact_database_url, SyncConfig, DEFAULT_USER_AGENT};
pub use failure::{Directive, FailureCoordinator, FailureState, FetchSignal, HealthState};
pub use indices::{h_index, IndexCalculator, IndexSet};
pub use records::{sanitize_title, PublicationObservation, RecordReconciler, StatisticsPlan};
pub use report::{write_summary, RunCounters, SyncRunSummary, SUMMARY_FILE_NAME};
pub use similarity::{LevenshteinScorer, SimilarityScorer};
pub use time_series::diff_graphs;

pub const CRATE_NAME: &str = "gsync-sync";

pub struct SyncPipeline {
    config: SyncConfig,
    provider: Box<dyn SnapshotProvider>,
    store: Arc<dyn Store>,
    scorer: Box<dyn SimilarityScorer>,
    coordinator: FailureCoordinator,
    indices: IndexCalculator,
    resolver: AuthorOrderResolver,
    records: RecordReconciler,
    counters: RunCounters,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        provider: Box<dyn SnapshotProvider>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            coordinator: FailureCoordinator::new(config.failure_threshold, config.block_cooldown()),
            indices: IndexCalculator {
                recent_years: config.recent_years,
                i10_threshold: config.i10_threshold,
            },
            resolver: AuthorOrderResolver {
                threshold: config.author_match_threshold,
            },
            records: RecordReconciler {
                author_change_threshold: config.author_change_threshold,
            },
            scorer: Box::new(LevenshteinScorer),
            counters: RunCounters::default(),
            config,
            provider,
            store,
        }
    }

    pub fn with_scorer(mut self, scorer: Box<dyn SimilarityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Failure state carries over between runs of the same pipeline.
    pub fn failure_state(&self) -> FailureState {
        self.coordinator.state()
    }

    /// Syncs every subject once, in id order, starting at `start_index`.
    ///
    /// Fetch failures and single failed writes only skip work; an
    /// unavailable store aborts the run.
    pub async fn run_once(&mut self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        self.counters = RunCounters::default();
        let current_year = self.config.current_year.unwrap_or_else(|| Utc::now().year());

        let subjects = self.store.subjects().await.context("loading subjects")?;
        info!(
            %run_id,
            subjects = subjects.len(),
            start_index = self.config.start_index,
            "sync run started"
        );

        for (index, subject) in subjects.iter().enumerate() {
            if index < self.config.start_index {
                self.counters.subjects_skipped += 1;
                continue;
            }
            let span = info_span!(
                "sync_subject",
                staff_id = subject.id,
                scholar_id = %subject.scholar_id
            );
            self.sync_subject(subject, current_year)
                .instrument(span)
                .await
                .with_context(|| format!("syncing staff_id={}", subject.id))?;
        }

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            subjects_total: subjects.len(),
            counters: self.counters.clone(),
            report_path: String::new(),
        };
        if let Err(err) = write_summary(&self.config.reports_dir, &mut summary).await {
            error!(%run_id, error = %format_args!("{err:#}"), "run summary not written");
            summary.report_path.clear();
        }
        info!(
            %run_id,
            processed = summary.counters.subjects_processed,
            failed = summary.counters.subjects_failed,
            restarts = summary.counters.restarts,
            report = %summary.report_path,
            "sync run finished"
        );
        Ok(summary)
    }

    async fn sync_subject(&mut self, subject: &Subject, current_year: i32) -> Result<(), StoreError> {
        info!(name = %subject.name, "syncing subject");

        let snapshot = match self.provider.fetch_profile(&subject.scholar_id).await {
            Ok(snapshot) => {
                self.observe(FetchSignal::Success).await;
                snapshot
            }
            Err(err) => {
                warn!(error = %err, "profile fetch failed; skipping subject");
                self.observe(FetchSignal::from(&err)).await;
                self.counters.subjects_failed += 1;
                return Ok(());
            }
        };

        let loaded = self.store.current_state(subject.id).await;
        let Some(state) = self.counters.tolerate("load stored state", loaded)? else {
            self.counters.subjects_failed += 1;
            return Ok(());
        };

        self.apply_graph(
            GraphOwner::Staff(subject.id),
            &snapshot.citation_graph,
            &state.citation_graph,
        )
        .await?;
        let publication_ids = self.sync_publications(subject, &snapshot, &state).await?;
        self.sync_statistics(
            subject,
            &snapshot,
            state.statistics.as_ref(),
            &publication_ids,
            current_year,
        )
        .await?;

        self.counters.subjects_processed += 1;
        info!(publications = snapshot.publications.len(), "subject synced");
        Ok(())
    }

    async fn apply_graph(
        &mut self,
        owner: GraphOwner,
        scraped: &CitationGraph,
        stored: &CitationGraph,
    ) -> Result<(), StoreError> {
        let ops = diff_graphs(scraped, stored);
        if ops.is_empty() {
            return Ok(());
        }
        debug!(?owner, ops = ops.len(), "applying time series ops");

        let applied = self.store.apply_time_series_ops(owner, &ops).await;
        if let Some(applied) = self.counters.tolerate("apply time series ops", applied)? {
            self.counters.graph_ops_applied += applied;
            self.counters.persistence_errors += ops.len().saturating_sub(applied);
        }
        Ok(())
    }

    /// Returns the ids whose graphs feed the from-graph indices: everything
    /// already stored plus whatever was inserted now.
    async fn sync_publications(
        &mut self,
        subject: &Subject,
        snapshot: &ScrapeSnapshot,
        state: &StoredState,
    ) -> Result<Vec<PublicationId>, StoreError> {
        let stored_by_url: HashMap<&str, &StoredPublication> = state
            .publications
            .iter()
            .map(|p| (p.url.as_str(), p))
            .collect();
        let mut publication_ids: Vec<PublicationId> =
            state.publications.iter().map(|p| p.id).collect();
        let mut seen = HashSet::new();

        for row in &snapshot.publications {
            let Some(url) = row.url.as_deref() else {
                debug!(title = %row.title, "publication row has no link; not stored");
                continue;
            };
            if !seen.insert(url) {
                debug!(url, "duplicate publication row; ignored");
                continue;
            }
            match stored_by_url.get(url) {
                Some(stored) => self.refresh_publication(subject, row, url, stored).await?,
                None => {
                    if let Some(id) = self.add_publication(subject, row, url).await? {
                        publication_ids.push(id);
                    }
                }
            }
        }
        Ok(publication_ids)
    }

    async fn refresh_publication(
        &mut self,
        subject: &Subject,
        row: &ScrapedPublication,
        url: &str,
        stored: &StoredPublication,
    ) -> Result<(), StoreError> {
        if row.citations == stored.citations && stored.author_order.is_some() {
            return Ok(());
        }
        let Some(detail) = self.fetch_detail(url).await else {
            return Ok(());
        };

        let patch = self.plan_patch(subject, row, &detail, stored);
        if !patch.is_empty() {
            debug!(publication_id = stored.id, fields = patch.len(), "patching publication");
            let patched = self
                .store
                .patch_publication(subject.id, stored.id, &patch)
                .await;
            if self.counters.tolerate("patch publication", patched)?.is_some() {
                self.counters.publications_patched += 1;
            }
        }

        // An empty detail graph leaves the stored one alone.
        if !detail.citation_graph.is_empty() {
            let loaded = self.store.publication_graph(stored.id).await;
            if let Some(stored_graph) = self.counters.tolerate("load publication graph", loaded)? {
                self.apply_graph(
                    GraphOwner::Publication(stored.id),
                    &detail.citation_graph,
                    &stored_graph,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn add_publication(
        &mut self,
        subject: &Subject,
        row: &ScrapedPublication,
        url: &str,
    ) -> Result<Option<PublicationId>, StoreError> {
        let new = NewPublication {
            title: sanitize_title(&row.title),
            year: row.year,
            url: url.to_string(),
            citations: row.citations,
            scholar_publication_id: row.scholar_publication_id.clone(),
        };
        let inserted = self.store.insert_publication(subject.id, &new).await;
        let Some(id) = self.counters.tolerate("insert publication", inserted)? else {
            return Ok(None);
        };
        self.counters.publications_inserted += 1;
        debug!(publication_id = id, url, "inserted publication");

        // Without detail the link keeps a NULL author order and is retried next run.
        let Some(detail) = self.fetch_detail(url).await else {
            return Ok(Some(id));
        };

        let fresh = StoredPublication {
            id,
            title: new.title,
            year: new.year,
            url: new.url,
            citations: new.citations,
            scholar_publication_id: new.scholar_publication_id,
            authors: None,
            journal: None,
            publisher: None,
            publication_date: None,
            author_order: None,
        };
        let patch = self.plan_patch(subject, row, &detail, &fresh);
        if !patch.is_empty() {
            let patched = self.store.patch_publication(subject.id, id, &patch).await;
            self.counters.tolerate("store publication detail", patched)?;
        }
        self.apply_graph(
            GraphOwner::Publication(id),
            &detail.citation_graph,
            &CitationGraph::new(),
        )
        .await?;
        Ok(Some(id))
    }

    fn plan_patch(
        &self,
        subject: &Subject,
        row: &ScrapedPublication,
        detail: &PublicationDetail,
        stored: &StoredPublication,
    ) -> PublicationPatch {
        let author_order = self.resolver.resolve(
            self.scorer.as_ref(),
            &subject.name,
            detail.authors.as_deref().unwrap_or_default(),
        );
        if author_order == 0 {
            debug!(name = %subject.name, "subject not found among authors");
        }
        let observed = PublicationObservation {
            title: &row.title,
            citations: row.citations,
            detail,
            author_order,
        };
        self.records
            .plan_publication(self.scorer.as_ref(), &observed, stored)
    }

    async fn sync_statistics(
        &mut self,
        subject: &Subject,
        snapshot: &ScrapeSnapshot,
        stored: Option<&StaffStatistics>,
        publication_ids: &[PublicationId],
        current_year: i32,
    ) -> Result<(), StoreError> {
        let mut graphs = Vec::with_capacity(publication_ids.len());
        for &id in publication_ids {
            let loaded = self.store.publication_graph(id).await;
            match self.counters.tolerate("load publication graph", loaded)? {
                Some(graph) => graphs.push(graph),
                None => {
                    warn!(publication_id = id, "publication graph unreadable; statistics skipped");
                    self.counters.statistics_skipped += 1;
                    return Ok(());
                }
            }
        }

        let mut slots: Vec<i64> = snapshot
            .stats_rows
            .iter()
            .flat_map(|row| [row.all_time, row.recent])
            .collect();
        let local = self.indices.local(
            snapshot.publications.iter().map(|p| (p.year, p.citations)),
            current_year,
        );
        slots.extend(local.to_slots());
        slots.extend(self.indices.from_graphs(&graphs, current_year).to_slots());

        match self.records.plan_statistics(&slots, stored) {
            Err(err) => {
                warn!(
                    error = %err,
                    provider_rows = snapshot.stats_rows.len(),
                    "statistics step skipped"
                );
                self.counters.statistics_skipped += 1;
            }
            Ok(StatisticsPlan::Unchanged) => debug!("statistics unchanged"),
            Ok(StatisticsPlan::Insert(statistics)) => {
                let inserted = self.store.insert_statistics(subject.id, &statistics).await;
                if self.counters.tolerate("insert statistics", inserted)?.is_some() {
                    self.counters.statistics_inserted += 1;
                }
            }
            Ok(StatisticsPlan::Patch(patch)) => {
                debug!(fields = patch.len(), "patching statistics");
                let patched = self.store.patch_statistics(subject.id, &patch).await;
                if self.counters.tolerate("patch statistics", patched)?.is_some() {
                    self.counters.statistics_patched += 1;
                }
            }
        }
        Ok(())
    }

    async fn fetch_detail(&mut self, url: &str) -> Option<PublicationDetail> {
        match self.provider.fetch_publication(url).await {
            Ok(detail) => {
                self.observe(FetchSignal::Success).await;
                Some(detail)
            }
            Err(err) => {
                warn!(url, error = %err, "publication detail fetch failed");
                self.observe(FetchSignal::from(&err)).await;
                self.counters.detail_fetch_failures += 1;
                None
            }
        }
    }

    async fn observe(&mut self, signal: FetchSignal) {
        let directive = self.coordinator.observe(signal);
        if let Some(cooldown) = directive.cooldown {
            error!(cooldown_secs = cooldown.as_secs(), "provider blocked us; cooling down");
            self.counters.cooldowns += 1;
            tokio::time::sleep(cooldown).await;
        }
        if directive.restart {
            warn!(
                failures = self.coordinator.state().consecutive(),
                "consecutive fetch failures; restarting session"
            );
            tokio::time::sleep(self.config.restart_pause()).await;
            if let Err(err) = self.provider.restart().await {
                error!(error = %format!("{err:#}"), "session restart failed");
            }
            self.coordinator.acknowledge_restart();
            self.counters.restarts += 1;
        }
    }
}

/// Connects to Postgres and opens a provider session from `config`.
pub async fn build_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let store = PgStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let provider = ScholarHtmlProvider::new(config.provider_config()?)?;
    Ok(SyncPipeline::new(config, Box::new(provider), Arc::new(store)))
}

/// Runs the pipeline on `cron` until ctrl-c. A trigger that fires while the
/// previous run is still going is skipped.
pub async fn run_scheduled(pipeline: SyncPipeline, cron: &str) -> Result<()> {
    let pipeline = Arc::new(Mutex::new(pipeline));
    let mut sched = JobScheduler::new().await.context("creating scheduler")?;

    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            let Ok(mut pipeline) = pipeline.try_lock() else {
                warn!("previous sync still running; trigger skipped");
                return;
            };
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled sync finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    sched.start().await.context("starting scheduler")?;
    info!(cron, "scheduler running; ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
