//! Concurrent download: N workers, one session each, one aggregator.
//!
//! Workers take units from a shared queue, fetch and parse, and send the
//! result down a channel. Only the aggregator touches the artifact store and
//! the ledger, flushing every `checkpoint_every` terminal units.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::FutureExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::artifacts::ArtifactStore;
use crate::browser::{backoff_delay, Session, SessionPool};
use crate::catalog::{Catalog, CatalogEntry, Category};
use crate::config::DownloadSettings;
use crate::error::{FailureKind, FetchError, ParseError};
use crate::ledger::{CheckpointRecord, Ledger};
use crate::parser::{self, ParsedCase};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    pub max_items: Option<usize>,
    /// Ignore the skip test and re-fetch everything in scope.
    pub force: bool,
    pub checkpoint_every: usize,
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    pub category: Option<Category>,
    pub show_progress: bool,
    /// Set externally (Ctrl-C) to halt admission.
    pub stop: Arc<AtomicBool>,
}

impl RunOptions {
    pub fn from_settings(s: &DownloadSettings) -> Self {
        Self {
            workers: s.workers,
            max_items: None,
            force: false,
            checkpoint_every: s.checkpoint_every,
            fetch_retries: s.fetch_retries,
            retry_backoff: Duration::from_millis(s.retry_backoff_ms),
            category: None,
            show_progress: false,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub catalog_size: usize,
    pub skipped: usize,
    pub queued: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: BTreeMap<FailureKind, usize>,
    pub flushes: usize,
    pub sessions_failed: usize,
    /// Worker tasks that died outside any single item.
    pub workers_lost: usize,
    pub stopped: bool,
    /// Work existed but nothing reached the ledger.
    pub aborted: bool,
}

impl RunSummary {
    pub fn failed_total(&self) -> usize {
        self.failed.values().sum()
    }

    pub fn exit_code(&self) -> u8 {
        if self.aborted {
            3
        } else if self.failed_total() > 0 || self.workers_lost > 0 {
            2
        } else {
            0
        }
    }
}

// ── Queue ──

struct WorkQueue {
    inner: Mutex<(VecDeque<CatalogEntry>, usize)>,
    cap: Option<usize>,
    stop: Arc<AtomicBool>,
}

impl WorkQueue {
    fn new(units: VecDeque<CatalogEntry>, cap: Option<usize>, stop: Arc<AtomicBool>) -> Self {
        Self {
            inner: Mutex::new((units, 0)),
            cap,
            stop,
        }
    }

    /// Next unit, or `None` once stopped, capped or drained.
    async fn next(&self) -> Option<CatalogEntry> {
        if self.stop.load(Ordering::SeqCst) {
            return None;
        }
        let mut guard = self.inner.lock().await;
        let (units, admitted) = &mut *guard;
        if self.cap.is_some_and(|cap| *admitted >= cap) {
            return None;
        }
        let unit = units.pop_front()?;
        *admitted += 1;
        Some(unit)
    }
}

// ── Messages ──

enum UnitOutcome {
    Parsed { bytes: Vec<u8>, case: Box<ParsedCase> },
    Unparsable { bytes: Vec<u8>, error: ParseError },
    FetchFailed(FetchError),
    Panicked(String),
}

struct UnitResult {
    entry: CatalogEntry,
    attempts: u32,
    outcome: UnitOutcome,
}

enum Message {
    Done(UnitResult),
    SessionFailed { worker: usize, error: FetchError },
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    retries: u32,
    backoff: Duration,
}

// ── Run ──

/// Download and parse every catalog entry not already done.
pub async fn run(
    catalog: &Catalog,
    ledger: &mut Ledger,
    artifacts: &ArtifactStore,
    pool: Arc<SessionPool>,
    opts: RunOptions,
) -> Result<RunSummary> {
    let mut summary = RunSummary {
        catalog_size: catalog.len(),
        ..Default::default()
    };

    let mut units = VecDeque::new();
    for entry in catalog.entries() {
        if opts.category.is_some_and(|c| c != entry.category) {
            continue;
        }
        if !opts.force && ledger.is_done(entry, artifacts) {
            summary.skipped += 1;
            continue;
        }
        units.push_back(entry.clone());
    }
    summary.queued = units.len();
    let admissible = opts.max_items.map_or(units.len(), |cap| cap.min(units.len()));
    info!(
        catalog = summary.catalog_size,
        skipped = summary.skipped,
        queued = summary.queued,
        admissible,
        "download plan"
    );
    if admissible == 0 {
        return Ok(summary);
    }

    let workers = opts.workers.clamp(1, admissible);
    let queue = Arc::new(WorkQueue::new(units, opts.max_items, Arc::clone(&opts.stop)));
    let retry = RetryPolicy {
        retries: opts.fetch_retries,
        backoff: opts.retry_backoff,
    };
    let (tx, mut rx) = mpsc::channel::<Message>(workers * 2);

    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        let pool = Arc::clone(&pool);
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        tasks.spawn(async move { work(worker, pool, queue, tx, retry).await });
    }
    drop(tx);

    let pb = if opts.show_progress {
        let pb = ProgressBar::new(admissible as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta}) {msg}")?
                .progress_chars("=> "),
        );
        pb
    } else {
        ProgressBar::hidden()
    };

    let mut since_flush = 0usize;
    while let Some(message) = rx.recv().await {
        let unit = match message {
            Message::Done(unit) => unit,
            Message::SessionFailed { worker, error } => {
                error!(worker, "browser session failed to start: {}", error);
                summary.sessions_failed += 1;
                continue;
            }
        };
        if let Err(e) = absorb(unit, ledger, artifacts, &mut summary) {
            // Keep what already reached the ledger before giving up.
            rx.close();
            if let Err(flush_err) = ledger.flush() {
                error!("final flush after failure also failed: {}", flush_err);
            }
            return Err(e);
        }
        pb.inc(1);
        pb.set_message(format!("{} failed", summary.failed_total()));

        since_flush += 1;
        if since_flush >= opts.checkpoint_every {
            if ledger.flush()?.is_some() {
                summary.flushes += 1;
            }
            since_flush = 0;
        }
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("worker task lost: {}", e);
            summary.workers_lost += 1;
        }
    }
    if ledger.flush()?.is_some() {
        summary.flushes += 1;
    }
    pb.finish_and_clear();

    summary.stopped = opts.stop.load(Ordering::SeqCst);
    summary.aborted = summary.attempted == 0;
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed_total(),
        flushes = summary.flushes,
        stopped = summary.stopped,
        "download finished"
    );
    Ok(summary)
}

/// Persist one terminal unit: artifact first, then its ledger record.
fn absorb(
    unit: UnitResult,
    ledger: &mut Ledger,
    artifacts: &ArtifactStore,
    summary: &mut RunSummary,
) -> Result<()> {
    let UnitResult {
        entry,
        attempts,
        outcome,
    } = unit;
    summary.attempted += 1;
    match outcome {
        UnitOutcome::Parsed { bytes, case } => {
            artifacts.write(&entry, &bytes)?;
            ledger.append(CheckpointRecord::succeeded(&entry, attempts));
            ledger.append_case(*case);
            summary.succeeded += 1;
        }
        UnitOutcome::Unparsable { bytes, error } => {
            // Kept so `reprocess` can retry once the parser improves.
            artifacts.write(&entry, &bytes)?;
            warn!(document_id = %entry.document_id, "unparsable document: {}", error);
            ledger.append(CheckpointRecord::failed(
                &entry,
                FailureKind::ParseError,
                attempts,
                error.to_string(),
            ));
            *summary.failed.entry(FailureKind::ParseError).or_default() += 1;
        }
        UnitOutcome::FetchFailed(error) => {
            let kind = error.kind();
            warn!(document_id = %entry.document_id, %kind, attempts, "fetch failed: {}", error);
            ledger.append(CheckpointRecord::failed(&entry, kind, attempts, error.to_string()));
            *summary.failed.entry(kind).or_default() += 1;
        }
        UnitOutcome::Panicked(message) => {
            ledger.append(CheckpointRecord::failed(
                &entry,
                FailureKind::WorkerPanic,
                attempts,
                message,
            ));
            *summary.failed.entry(FailureKind::WorkerPanic).or_default() += 1;
        }
    }
    Ok(())
}

// ── Workers ──

async fn work(
    worker: usize,
    pool: Arc<SessionPool>,
    queue: Arc<WorkQueue>,
    tx: mpsc::Sender<Message>,
    retry: RetryPolicy,
) {
    let mut session = match pool.acquire().await {
        Ok(session) => session,
        Err(error) => {
            let _ = tx.send(Message::SessionFailed { worker, error }).await;
            return;
        }
    };
    info!(worker, session = session.id(), "worker started");

    while let Some(entry) = queue.next().await {
        let handled = AssertUnwindSafe(handle(&mut session, &entry, retry))
            .catch_unwind()
            .await;
        let (attempts, outcome) = match handled {
            Ok(done) => done,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker, document_id = %entry.document_id, "worker panicked: {}", message);
                // The driver may be mid-request; start the next item on a fresh one.
                if let Err(e) = session.recycle().await {
                    warn!(worker, "relaunch after panic failed: {}", e);
                }
                (1, UnitOutcome::Panicked(format!("worker panicked: {message}")))
            }
        };
        let result = UnitResult {
            entry,
            attempts,
            outcome,
        };
        if tx.send(Message::Done(result)).await.is_err() {
            break;
        }
    }

    info!(worker, fetches = session.fetches(), launches = session.launches(), "worker finished");
    pool.release(session).await;
}

async fn handle(session: &mut Session, entry: &CatalogEntry, retry: RetryPolicy) -> (u32, UnitOutcome) {
    let (attempts, fetched) = fetch_with_retry(session, entry, retry).await;
    let outcome = match fetched {
        Ok(bytes) => parse_unit(bytes, entry).await,
        Err(error) => UnitOutcome::FetchFailed(error),
    };
    (attempts, outcome)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

async fn fetch_with_retry(
    session: &mut Session,
    entry: &CatalogEntry,
    retry: RetryPolicy,
) -> (u32, Result<Vec<u8>, FetchError>) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match session.fetch(&entry.retrieval_url).await {
            Ok(bytes) => return (attempt, Ok(bytes)),
            Err(e) if attempt > retry.retries => return (attempt, Err(e)),
            Err(e) => {
                let backoff = backoff_delay(retry.backoff, attempt);
                warn!(
                    "{} on {} (attempt {}/{}), backing off {:.1}s",
                    e.kind(),
                    entry.document_id,
                    attempt,
                    retry.retries + 1,
                    backoff.as_secs_f64()
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Parse off the async threads; a parser panic becomes a parse failure.
async fn parse_unit(bytes: Vec<u8>, entry: &CatalogEntry) -> UnitOutcome {
    let bytes = Arc::new(bytes);
    let job = {
        let bytes = Arc::clone(&bytes);
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || parser::parse(&bytes, &entry))
    };
    let parsed = match job.await {
        Ok(parsed) => parsed,
        Err(e) => Err(ParseError::Pdf(format!("parser aborted: {e}"))),
    };
    let bytes = Arc::try_unwrap(bytes).unwrap_or_else(|shared| (*shared).clone());
    match parsed {
        Ok(case) => UnitOutcome::Parsed {
            bytes,
            case: Box::new(case),
        },
        Err(error) => UnitOutcome::Unparsable { bytes, error },
    }
}

// ── Tests ──
