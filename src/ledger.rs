//! Durable record of which documents are done.
//!
//! Each flush writes a new `checkpoint_{seq}.json` holding only what was
//! appended since the previous flush, then swaps the `CURRENT` pointer that
//! lists the live shards. A crash mid-flush leaves the previous pointer and
//! every shard it names intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifacts::ArtifactStore;
use crate::catalog::{CaseKey, CatalogEntry, Category};
use crate::error::{FailureKind, IntegrityError};
use crate::fsutil;
use crate::parser::ParsedCase;

pub const POINTER_FILE: &str = "CURRENT";
const SHARD_PREFIX: &str = "checkpoint_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub document_id: String,
    pub category: Category,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckpointRecord {
    pub fn succeeded(entry: &CatalogEntry, attempts: u32) -> Self {
        Self {
            document_id: entry.document_id.clone(),
            category: entry.category,
            status: Status::Succeeded,
            timestamp: Utc::now(),
            error_kind: None,
            attempts,
            message: None,
        }
    }

    pub fn failed(entry: &CatalogEntry, kind: FailureKind, attempts: u32, message: String) -> Self {
        Self {
            document_id: entry.document_id.clone(),
            category: entry.category,
            status: Status::Failed,
            timestamp: Utc::now(),
            error_kind: Some(kind),
            attempts,
            message: Some(message),
        }
    }

    pub fn key(&self) -> CaseKey {
        (self.category, self.document_id.clone())
    }
}

/// One flush worth of appends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointShard {
    pub seq: u64,
    pub written_at: DateTime<Utc>,
    pub records: Vec<CheckpointRecord>,
    #[serde(default)]
    pub cases: Vec<ParsedCase>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Pointer {
    next_seq: u64,
    shards: Vec<String>,
}

// ── Merged view ──

/// Union of shards, one record and at most one case per key, latest wins.
#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    records: HashMap<CaseKey, CheckpointRecord>,
    cases: HashMap<CaseKey, ParsedCase>,
}

impl LedgerState {
    pub fn merge_record(&mut self, record: CheckpointRecord) {
        match self.records.get(&record.key()) {
            Some(existing) if existing.timestamp > record.timestamp => {}
            _ => {
                self.records.insert(record.key(), record);
            }
        }
    }

    pub fn merge_case(&mut self, case: ParsedCase) {
        match self.cases.get(&case.key()) {
            Some(existing) if existing.parsed_at > case.parsed_at => {}
            _ => {
                self.cases.insert(case.key(), case);
            }
        }
    }

    pub fn absorb(&mut self, shard: CheckpointShard) {
        for record in shard.records {
            self.merge_record(record);
        }
        for case in shard.cases {
            self.merge_case(case);
        }
    }

    pub fn record(&self, category: Category, document_id: &str) -> Option<&CheckpointRecord> {
        self.records.get(&(category, document_id.to_string()))
    }

    pub fn records(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.records.values()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn case_count(&self) -> usize {
        self.cases.len()
    }

    /// Records ordered by key.
    pub fn sorted_records(&self) -> Vec<CheckpointRecord> {
        let mut out: Vec<_> = self.records.values().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Every parsed case ordered by key.
    pub fn sorted_cases(&self) -> Vec<ParsedCase> {
        let mut out: Vec<_> = self.cases.values().cloned().collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    /// Cases whose latest record is a success: what the dataset publishes.
    pub fn exportable_cases(&self) -> Vec<ParsedCase> {
        let mut out: Vec<_> = self
            .cases
            .iter()
            .filter(|(key, _)| {
                self.records
                    .get(*key)
                    .map_or(true, |r| r.status == Status::Succeeded)
            })
            .map(|(_, c)| c.clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }
}

pub fn read_shard(path: &Path) -> Result<CheckpointShard> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(IntegrityError::MissingShard(path.to_path_buf()).into())
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_slice(&bytes).map_err(|source| {
        IntegrityError::CorruptShard {
            path: path.to_path_buf(),
            source,
        }
        .into()
    })
}

/// Merge shards into one state. Any unreadable shard fails the whole merge.
pub fn merge_shards(paths: &[PathBuf]) -> Result<LedgerState> {
    let mut state = LedgerState::default();
    for path in paths {
        let shard = read_shard(path)?;
        debug!(path = %path.display(), records = shard.records.len(), "merged shard");
        state.absorb(shard);
    }
    Ok(state)
}

fn shard_seq(name: &str) -> Option<u64> {
    name.strip_prefix(SHARD_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Every `checkpoint_*.json` directly under `dir`, in sequence order.
pub fn discover_shards(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for item in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let item = item?;
        if let Some(seq) = item.file_name().to_str().and_then(shard_seq) {
            found.push((seq, item.path()));
        }
    }
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

// ── Ledger ──

pub struct Ledger {
    dir: PathBuf,
    pointer: Pointer,
    state: LedgerState,
    pending_records: Vec<CheckpointRecord>,
    pending_cases: Vec<ParsedCase>,
}

/// Result of folding every shard into one.
#[derive(Debug)]
pub struct Consolidation {
    pub shard: PathBuf,
    pub superseded: Vec<PathBuf>,
    pub records: usize,
    pub cases: usize,
}

impl Ledger {
    /// Load the pointer and every shard it names.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

        let pointer_path = dir.join(POINTER_FILE);
        let mut pointer: Pointer = if pointer_path.exists() {
            let bytes = std::fs::read(&pointer_path)
                .with_context(|| format!("reading {}", pointer_path.display()))?;
            serde_json::from_slice(&bytes).map_err(|source| IntegrityError::CorruptPointer {
                path: pointer_path.clone(),
                source,
            })?
        } else {
            Pointer::default()
        };

        // Never reuse a sequence number, even one left by a flush that crashed
        // before its pointer swap.
        let highest = discover_shards(&dir)?
            .iter()
            .filter_map(|p| p.file_name()?.to_str().and_then(shard_seq))
            .max();
        if let Some(seq) = highest {
            pointer.next_seq = pointer.next_seq.max(seq + 1);
        }

        let paths: Vec<PathBuf> = pointer.shards.iter().map(|s| dir.join(s)).collect();
        let state = merge_shards(&paths)?;
        info!(
            shards = paths.len(),
            records = state.record_count(),
            cases = state.case_count(),
            "ledger loaded"
        );
        Ok(Self {
            dir,
            pointer,
            state,
            pending_records: Vec::new(),
            pending_cases: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    pub fn shard_paths(&self) -> Vec<PathBuf> {
        self.pointer.shards.iter().map(|s| self.dir.join(s)).collect()
    }

    /// True when the ledger's latest record for the key is a success.
    pub fn record_exists(&self, category: Category, document_id: &str) -> bool {
        self.state
            .record(category, document_id)
            .is_some_and(|r| r.status == Status::Succeeded)
    }

    /// Done means both a stored artifact and a success record.
    pub fn is_done(&self, entry: &CatalogEntry, artifacts: &ArtifactStore) -> bool {
        self.record_exists(entry.category, &entry.document_id) && artifacts.exists(entry)
    }

    pub fn append(&mut self, record: CheckpointRecord) {
        self.state.merge_record(record.clone());
        self.pending_records.push(record);
    }

    pub fn append_case(&mut self, case: ParsedCase) {
        self.state.merge_case(case.clone());
        self.pending_cases.push(case);
    }

    pub fn pending(&self) -> usize {
        self.pending_records.len() + self.pending_cases.len()
    }

    /// Persist everything appended since the last flush. `None` when idle.
    pub fn flush(&mut self) -> Result<Option<PathBuf>> {
        if self.pending() == 0 {
            return Ok(None);
        }
        let shard = CheckpointShard {
            seq: self.pointer.next_seq,
            written_at: Utc::now(),
            records: std::mem::take(&mut self.pending_records),
            cases: std::mem::take(&mut self.pending_cases),
        };
        let name = format!("{SHARD_PREFIX}{:06}.json", shard.seq);
        let path = self.dir.join(&name);
        fsutil::write_json_atomic(&path, &shard)?;

        let mut next = self.pointer.clone();
        next.next_seq = shard.seq + 1;
        next.shards.push(name);
        self.swap_pointer(next)?;

        debug!(
            path = %path.display(),
            records = shard.records.len(),
            cases = shard.cases.len(),
            "checkpoint flushed"
        );
        Ok(Some(path))
    }

    fn swap_pointer(&mut self, next: Pointer) -> Result<()> {
        fsutil::write_json_atomic(&self.dir.join(POINTER_FILE), &next)?;
        self.pointer = next;
        Ok(())
    }

    /// Fold every shard in the directory, listed or orphaned, into one new
    /// shard and point at it alone.
    pub fn consolidate(&mut self) -> Result<Consolidation> {
        self.flush()?;
        let mut paths = discover_shards(&self.dir)?;
        for listed in self.shard_paths() {
            if !paths.contains(&listed) {
                paths.push(listed);
            }
        }
        let state = merge_shards(&paths)?;

        let shard = CheckpointShard {
            seq: self.pointer.next_seq,
            written_at: Utc::now(),
            records: state.sorted_records(),
            cases: state.sorted_cases(),
        };
        let name = format!("{SHARD_PREFIX}{:06}.json", shard.seq);
        let path = self.dir.join(&name);
        fsutil::write_json_atomic(&path, &shard)?;
        self.swap_pointer(Pointer {
            next_seq: shard.seq + 1,
            shards: vec![name],
        })?;

        let records = shard.records.len();
        let cases = shard.cases.len();
        self.state = state;
        info!(shards = paths.len(), records, cases, "checkpoints consolidated");
        Ok(Consolidation {
            shard: path,
            superseded: paths,
            records,
            cases,
        })
    }

    /// Move superseded shards under `archive/checkpoints_{stamp}/`.
    pub fn archive(&self, superseded: &[PathBuf], now: DateTime<Utc>) -> Result<PathBuf> {
        let target = self
            .dir
            .join("archive")
            .join(format!("checkpoints_{}", now.format("%Y%m%d_%H%M%S")));
        std::fs::create_dir_all(&target)
            .with_context(|| format!("creating {}", target.display()))?;
        let live = self.shard_paths();
        for path in superseded.iter().filter(|p| !live.contains(p)) {
            let Some(name) = path.file_name() else {
                continue;
            };
            std::fs::rename(path, target.join(name))
                .with_context(|| format!("archiving {}", path.display()))?;
        }
        Ok(target)
    }
}

// ── Tests ──
