use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use doha_harvest::artifacts::ArtifactStore;
use doha_harvest::browser::{Driver, Launcher, SessionPolicy, SessionPool};
use doha_harvest::catalog::{Catalog, CatalogEntry, Category};
use doha_harvest::config::ExportSettings;
use doha_harvest::error::{FailureKind, FetchError};
use doha_harvest::ledger::Ledger;
use doha_harvest::orchestrator::{self, RunOptions};
use doha_harvest::parser::Outcome;
use doha_harvest::sink::{columnar, DatasetSink};

/// Serves a fixed decision for every URL, except `/21-4` while `block` is set.
#[derive(Clone, Default)]
struct Site {
    block: Arc<AtomicBool>,
    fetches: Arc<AtomicUsize>,
}

struct SiteDriver(Site);

#[async_trait]
impl Launcher for Site {
    async fn launch(&self) -> Result<Box<dyn Driver>, FetchError> {
        Ok(Box::new(SiteDriver(self.clone())))
    }
}

#[async_trait]
impl Driver for SiteDriver {
    async fn fetch(&mut self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.0.fetches.fetch_add(1, Ordering::SeqCst);
        if url.ends_with("/21-4") && self.0.block.load(Ordering::SeqCst) {
            return Err(FetchError::Blocked {
                url: url.to_string(),
                status: Some(403),
            });
        }
        let id = url.rsplit('/').next().unwrap_or_default();
        Ok(format!(
            "<html><body><main><h1>Case No. {id}</h1>\
             <p>Guideline F, Financial Considerations.</p>\
             <p>Eligibility for access to classified information is denied.</p>\
             </main></body></html>"
        )
        .into_bytes())
    }

    async fn close(&mut self) {}
}

fn catalog() -> Catalog {
    Catalog::from_entries((1..=10).map(|i| CatalogEntry {
        category: Category::Hearing,
        year: 2021,
        document_id: format!("21-{i}"),
        retrieval_url: format!("https://doha.test/decisions/21-{i}"),
    }))
}

fn pool(site: &Site) -> Arc<SessionPool> {
    Arc::new(SessionPool::new(
        Arc::new(site.clone()),
        SessionPolicy {
            min_interval: Duration::from_millis(50),
            fetch_timeout: Duration::from_secs(5),
            recycle_after: 4,
        },
    ))
}

fn options() -> RunOptions {
    RunOptions {
        workers: 3,
        max_items: None,
        force: false,
        checkpoint_every: 3,
        fetch_retries: 1,
        retry_backoff: Duration::from_millis(20),
        category: None,
        show_progress: false,
        stop: Arc::new(AtomicBool::new(false)),
    }
}

#[tokio::test(start_paused = true)]
async fn resume_after_partial_failure_then_export() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = dir.path().join("checkpoints");
    let artifacts = ArtifactStore::new(dir.path().join("artifacts"));
    let site = Site::default();
    site.block.store(true, Ordering::SeqCst);

    // First pass: one document is blocked, the rest land.
    let mut ledger = Ledger::open(&checkpoints).unwrap();
    let first = orchestrator::run(&catalog(), &mut ledger, &artifacts, pool(&site), options())
        .await
        .unwrap();
    assert_eq!(first.succeeded, 9);
    assert_eq!(first.failed.get(&FailureKind::Blocked), Some(&1));
    assert_eq!(first.exit_code(), 2);
    drop(ledger);

    // Second pass from a fresh ledger handle: only the failed item is retried.
    site.block.store(false, Ordering::SeqCst);
    let mut ledger = Ledger::open(&checkpoints).unwrap();
    let before = site.fetches.load(Ordering::SeqCst);
    let second = orchestrator::run(&catalog(), &mut ledger, &artifacts, pool(&site), options())
        .await
        .unwrap();
    assert_eq!((second.skipped, second.attempted, second.succeeded), (9, 1, 1));
    assert_eq!(second.exit_code(), 0);
    assert_eq!(site.fetches.load(Ordering::SeqCst) - before, 1);

    // Third pass: nothing left.
    let third = orchestrator::run(&catalog(), &mut ledger, &artifacts, pool(&site), options())
        .await
        .unwrap();
    assert_eq!((third.skipped, third.attempted), (10, 0));

    // Consolidate, then export both representations.
    let merged = ledger.consolidate().unwrap();
    assert_eq!(merged.records, 10);
    assert_eq!(merged.cases, 10);
    let cases = ledger.state().exportable_cases();
    assert!(cases.iter().all(|c| c.outcome == Outcome::Denied));
    assert!(cases.iter().all(|c| c.guidelines.contains(&'F')));

    let sink = DatasetSink::new(
        dir.path().join("dataset"),
        ExportSettings {
            max_shard_bytes: 1024 * 1024,
            sample_rows: 5,
        },
    );
    let out = sink.write(&cases).unwrap();
    assert_eq!(out.rows, 10);
    let keys: HashSet<_> = out
        .columnar_paths
        .iter()
        .flat_map(|p| columnar::read_keys(p).unwrap())
        .collect();
    assert_eq!(keys, catalog().entries().iter().map(|e| e.key()).collect());
}
