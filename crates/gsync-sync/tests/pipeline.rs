use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use gsync_adapters::{FetchError, SnapshotProvider};
use gsync_core::{
    CitationGraph, GraphOwner, PublicationDetail, ScrapeSnapshot, ScrapedPublication, StatsRow,
    StoredPublication, Subject,
};
use gsync_storage::MemoryStore;
use gsync_sync::{SyncConfig, SyncPipeline, SUMMARY_FILE_NAME};

const PUB_A: &str = "https://scholar.example/citations?view_op=view_citation&citation_for_view=mp:A";
const PUB_B: &str = "https://scholar.example/citations?view_op=view_citation&citation_for_view=mp:B";

#[derive(Default)]
struct Script {
    profiles: HashMap<String, ScrapeSnapshot>,
    details: HashMap<String, PublicationDetail>,
    profile_failures: VecDeque<FetchError>,
    calls: Vec<String>,
    restarts: usize,
}

#[derive(Clone, Default)]
struct ScriptedProvider(Arc<Mutex<Script>>);

impl ScriptedProvider {
    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.0.lock().expect("script lock poisoned"))
    }

    fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    fn detail_calls(&self) -> usize {
        self.calls().iter().filter(|c| c.starts_with("detail:")).count()
    }
}

#[async_trait]
impl SnapshotProvider for ScriptedProvider {
    async fn fetch_profile(&mut self, scholar_id: &str) -> Result<ScrapeSnapshot, FetchError> {
        self.with(|s| {
            s.calls.push(format!("profile:{scholar_id}"));
            if let Some(err) = s.profile_failures.pop_front() {
                return Err(err);
            }
            s.profiles
                .get(scholar_id)
                .cloned()
                .ok_or_else(|| FetchError::Transient {
                    url: scholar_id.to_string(),
                    message: "no scripted profile".into(),
                })
        })
    }

    async fn fetch_publication(&mut self, url: &str) -> Result<PublicationDetail, FetchError> {
        self.with(|s| {
            s.calls.push(format!("detail:{url}"));
            s.details.get(url).cloned().ok_or_else(|| FetchError::Transient {
                url: url.to_string(),
                message: "timed out".into(),
            })
        })
    }

    async fn restart(&mut self) -> anyhow::Result<()> {
        self.with(|s| s.restarts += 1);
        Ok(())
    }
}

fn maria() -> Subject {
    Subject {
        id: 1,
        scholar_id: "mp".into(),
        name: "Maria Papadopoulou".into(),
    }
}

fn graph(points: &[(i32, i64)]) -> CitationGraph {
    points.iter().copied().collect()
}

fn profile() -> ScrapeSnapshot {
    ScrapeSnapshot {
        publications: vec![
            ScrapedPublication {
                title: "Graph Neural Networks for Citation Analysis".into(),
                year: Some(2021),
                url: Some(PUB_A.into()),
                citations: 57,
                scholar_publication_id: Some("A".into()),
            },
            ScrapedPublication {
                title: "A Survey of Bibliometric Indicators".into(),
                year: Some(2015),
                url: Some(PUB_B.into()),
                citations: 12,
                scholar_publication_id: Some("B".into()),
            },
            ScrapedPublication {
                title: "Conference Notes".into(),
                year: Some(2023),
                url: None,
                citations: 3,
                scholar_publication_id: None,
            },
        ],
        citation_graph: graph(&[(2022, 40), (2023, 88)]),
        stats_rows: vec![
            StatsRow { all_time: 412, recent: 198 },
            StatsRow { all_time: 11, recent: 7 },
            StatsRow { all_time: 12, recent: 5 },
        ],
    }
}

fn detail_a() -> PublicationDetail {
    PublicationDetail {
        authors: Some("John Smith, Maria Papadopoulou, Jane Doe".into()),
        journal: Some("Journal of Informetrics".into()),
        publisher: Some("Elsevier".into()),
        publication_date: NaiveDate::from_ymd_opt(2021, 3, 1),
        citation_graph: graph(&[(2021, 6), (2022, 18), (2024, 33)]),
    }
}

fn detail_b() -> PublicationDetail {
    PublicationDetail {
        authors: Some("Maria Papadopoulou, Wei Zhang".into()),
        journal: Some("Scientometrics".into()),
        publisher: None,
        publication_date: NaiveDate::from_ymd_opt(2015, 1, 1),
        citation_graph: graph(&[(2016, 4), (2017, 8)]),
    }
}

fn scripted() -> ScriptedProvider {
    let provider = ScriptedProvider::default();
    provider.with(|s| {
        s.profiles.insert("mp".into(), profile());
        s.details.insert(PUB_A.into(), detail_a());
        s.details.insert(PUB_B.into(), detail_b());
    });
    provider
}

fn config(reports: &tempfile::TempDir) -> SyncConfig {
    SyncConfig {
        current_year: Some(2024),
        reports_dir: reports.path().to_path_buf(),
        ..SyncConfig::default()
    }
}

fn pipeline(
    reports: &tempfile::TempDir,
    provider: &ScriptedProvider,
    store: &Arc<MemoryStore>,
) -> SyncPipeline {
    SyncPipeline::new(config(reports), Box::new(provider.clone()), store.clone())
}

fn transient(n: usize) -> FetchError {
    FetchError::Transient {
        url: format!("profile-{n}"),
        message: "connection reset".into(),
    }
}

#[tokio::test]
async fn first_run_populates_store_and_second_run_is_a_noop() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    let provider = scripted();
    let mut pipeline = pipeline(&reports, &provider, &store);

    let first = pipeline.run_once().await.expect("run completes");
    assert_eq!(first.counters.subjects_processed, 1);
    assert_eq!(first.counters.publications_inserted, 2);
    assert_eq!(first.counters.statistics_inserted, 1);

    let stats = store.statistics(1).expect("statistics stored");
    assert_eq!(
        stats.to_slots(),
        [412, 198, 11, 7, 12, 5, 3, 2, 2, 1, 2, 1, 2, 1]
    );
    assert_eq!(store.graph(GraphOwner::Staff(1)), graph(&[(2022, 40), (2023, 88)]));

    let publications = store.publications(1);
    assert_eq!(publications.len(), 2, "row without a link is not stored");
    let a = publications.iter().find(|p| p.url == PUB_A).expect("publication A stored");
    let b = publications.iter().find(|p| p.url == PUB_B).expect("publication B stored");
    assert_eq!(a.author_order, Some(2));
    assert_eq!(b.author_order, Some(1));
    assert_eq!(a.journal.as_deref(), Some("Journal of Informetrics"));
    assert_eq!(a.publication_date, NaiveDate::from_ymd_opt(2021, 3, 1));
    assert_eq!(a.scholar_publication_id.as_deref(), Some("A"));
    assert_eq!(
        store.graph(GraphOwner::Publication(a.id)),
        graph(&[(2021, 6), (2022, 18), (2024, 33)])
    );

    let report = reports
        .path()
        .join(first.run_id.to_string())
        .join(SUMMARY_FILE_NAME);
    assert!(report.exists());

    let writes = store.write_count();
    let fetches = provider.detail_calls();
    let second = pipeline.run_once().await.expect("run completes");
    assert_eq!(second.counters.subjects_processed, 1);
    assert_eq!(store.write_count(), writes, "second pass must not write");
    assert_eq!(provider.detail_calls(), fetches, "second pass must not fetch details");
    assert_eq!(second.counters.publications_patched, 0);
    assert_eq!(second.counters.statistics_patched, 0);
}

#[tokio::test]
async fn unchanged_citations_skip_the_detail_fetch() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    store.seed_publication(
        1,
        StoredPublication {
            id: 40,
            title: "Graph Neural Networks for Citation Analysis".into(),
            year: Some(2021),
            url: PUB_A.into(),
            citations: 57,
            scholar_publication_id: Some("A".into()),
            authors: Some("John Smith, Maria Papadopoulou, Jane Doe".into()),
            journal: Some("Journal of Informetrics".into()),
            publisher: Some("Elsevier".into()),
            publication_date: NaiveDate::from_ymd_opt(2021, 3, 1),
            author_order: Some(2),
        },
    );
    let provider = scripted();
    let mut pipeline = pipeline(&reports, &provider, &store);

    pipeline.run_once().await.expect("run completes");

    let calls = provider.calls();
    assert!(!calls.contains(&format!("detail:{PUB_A}")));
    assert!(calls.contains(&format!("detail:{PUB_B}")));
}

#[tokio::test]
async fn changed_citations_patch_only_what_moved() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    store.seed_publication(
        1,
        StoredPublication {
            id: 40,
            title: "Graph Neural Networks for Citation Analysis".into(),
            year: Some(2021),
            url: PUB_A.into(),
            citations: 50,
            scholar_publication_id: Some("A".into()),
            authors: Some("John Smith, Maria Papadopoulou, Jane Doe".into()),
            journal: Some("Journal of Informetrics".into()),
            publisher: Some("Elsevier".into()),
            publication_date: NaiveDate::from_ymd_opt(2021, 3, 1),
            author_order: Some(2),
        },
    );
    store.seed_graph(GraphOwner::Publication(40), graph(&[(2021, 6), (2022, 11)]));
    let provider = scripted();
    let mut pipeline = pipeline(&reports, &provider, &store);

    let summary = pipeline.run_once().await.expect("run completes");

    assert_eq!(summary.counters.publications_patched, 1);
    let a = store
        .publications(1)
        .into_iter()
        .find(|p| p.id == 40)
        .expect("seeded publication 40 kept");
    assert_eq!(a.citations, 57);
    assert_eq!(
        store.graph(GraphOwner::Publication(40)),
        graph(&[(2021, 6), (2022, 18), (2024, 33)])
    );
}

#[tokio::test]
async fn unwritable_reports_dir_does_not_fail_the_run() {
    let scratch = tempfile::tempdir().expect("tempdir");
    let not_a_dir = scratch.path().join("reports");
    std::fs::write(&not_a_dir, b"occupied").expect("placeholder file");

    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    let provider = scripted();
    let config = SyncConfig {
        current_year: Some(2024),
        reports_dir: not_a_dir,
        ..SyncConfig::default()
    };
    let mut pipeline = SyncPipeline::new(config, Box::new(provider.clone()), store.clone());

    let summary = pipeline.run_once().await.expect("run completes without a report");
    assert_eq!(summary.counters.subjects_processed, 1);
    assert_eq!(summary.counters.publications_inserted, 2);
    assert!(summary.report_path.is_empty());
    assert!(store.statistics(1).is_some());
}

#[tokio::test]
async fn failed_detail_fetch_is_retried_on_the_next_run() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    let provider = scripted();
    provider.with(|s| s.details.remove(PUB_B));
    let mut pipeline = pipeline(&reports, &provider, &store);

    let first = pipeline.run_once().await.expect("run completes");
    assert_eq!(first.counters.detail_fetch_failures, 1);
    let b = store
        .publications(1)
        .into_iter()
        .find(|p| p.url == PUB_B)
        .expect("publication B inserted");
    assert_eq!(b.author_order, None);

    provider.with(|s| s.details.insert(PUB_B.into(), detail_b()));
    pipeline.run_once().await.expect("run completes");
    let b = store
        .publications(1)
        .into_iter()
        .find(|p| p.url == PUB_B)
        .expect("publication B still stored");
    assert_eq!(b.author_order, Some(1));
    assert_eq!(b.journal.as_deref(), Some("Scientometrics"));
}

#[tokio::test(start_paused = true)]
async fn five_consecutive_failures_restart_the_session_once() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    for id in 1..=5 {
        store.add_subject(Subject {
            id,
            scholar_id: format!("s{id}"),
            name: format!("Subject {id}"),
        });
    }
    let provider = ScriptedProvider::default();
    provider.with(|s| s.profile_failures.extend((0..5).map(transient)));
    let mut pipeline = pipeline(&reports, &provider, &store);

    let summary = pipeline.run_once().await.expect("run completes");

    assert_eq!(summary.counters.subjects_failed, 5);
    assert_eq!(summary.counters.restarts, 1);
    assert_eq!(provider.with(|s| s.restarts), 1);
    assert_eq!(pipeline.failure_state().consecutive(), 0);
}

#[tokio::test]
async fn success_before_the_threshold_resets_the_count() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    for id in 1..=4 {
        store.add_subject(Subject {
            id,
            scholar_id: if id == 4 { "mp".into() } else { format!("s{id}") },
            name: "Maria Papadopoulou".into(),
        });
    }
    let provider = scripted();
    provider.with(|s| s.profile_failures.extend((0..3).map(transient)));
    let mut pipeline = pipeline(&reports, &provider, &store);

    let summary = pipeline.run_once().await.expect("run completes");

    assert_eq!(summary.counters.subjects_failed, 3);
    assert_eq!(summary.counters.subjects_processed, 1);
    assert_eq!(summary.counters.restarts, 0);
    assert_eq!(pipeline.failure_state().consecutive(), 0);
}

#[tokio::test(start_paused = true)]
async fn block_forces_a_cooldown_before_continuing() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(Subject {
        id: 1,
        scholar_id: "blocked".into(),
        name: "First".into(),
    });
    store.add_subject(Subject {
        id: 2,
        scholar_id: "mp".into(),
        name: "Maria Papadopoulou".into(),
    });
    let provider = scripted();
    provider.with(|s| {
        s.profile_failures.push_back(FetchError::Blocked {
            url: "https://scholar.example/sorry/index".into(),
            reason: "redirected to /sorry".into(),
        })
    });
    let mut pipeline = pipeline(&reports, &provider, &store);

    let started = tokio::time::Instant::now();
    let summary = pipeline.run_once().await.expect("run completes");

    assert!(started.elapsed() >= Duration::from_secs(300));
    assert_eq!(summary.counters.cooldowns, 1);
    assert_eq!(summary.counters.subjects_failed, 1);
    assert_eq!(summary.counters.subjects_processed, 1);
}

#[tokio::test]
async fn unavailable_store_aborts_the_run() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    store.set_unavailable(true);
    let provider = scripted();
    let mut pipeline = pipeline(&reports, &provider, &store);

    assert!(pipeline.run_once().await.is_err());
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn rejected_writes_are_logged_and_skipped() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    store.set_fail_writes(true);
    let provider = scripted();
    let mut pipeline = pipeline(&reports, &provider, &store);

    let summary = pipeline.run_once().await.expect("run completes");

    assert_eq!(summary.counters.subjects_processed, 1);
    assert_eq!(summary.counters.publications_inserted, 0);
    assert_eq!(summary.counters.statistics_inserted, 0);
    assert!(summary.counters.persistence_errors >= 4);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn malformed_provider_statistics_skip_only_that_step() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(maria());
    let provider = scripted();
    provider.with(|s| {
        if let Some(snapshot) = s.profiles.get_mut("mp") {
            snapshot.stats_rows.truncate(2);
        }
    });
    let mut pipeline = pipeline(&reports, &provider, &store);

    let summary = pipeline.run_once().await.expect("run completes");

    assert_eq!(summary.counters.statistics_skipped, 1);
    assert_eq!(summary.counters.publications_inserted, 2);
    assert!(store.statistics(1).is_none());
    assert_eq!(store.graph(GraphOwner::Staff(1)).len(), 2);
}

#[tokio::test]
async fn start_index_skips_leading_subjects() {
    let reports = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    store.add_subject(Subject {
        id: 1,
        scholar_id: "done-already".into(),
        name: "Someone".into(),
    });
    store.add_subject(Subject {
        id: 2,
        scholar_id: "mp".into(),
        name: "Maria Papadopoulou".into(),
    });
    let provider = scripted();
    let mut pipeline = SyncPipeline::new(
        SyncConfig {
            start_index: 1,
            ..config(&reports)
        },
        Box::new(provider.clone()),
        store.clone(),
    );

    let summary = pipeline.run_once().await.expect("run completes");

    assert_eq!(summary.counters.subjects_skipped, 1);
    assert_eq!(summary.counters.subjects_processed, 1);
    assert_eq!(provider.calls()[0], "profile:mp");
}
