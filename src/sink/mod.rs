//! Publishes parsed cases as a SQLite record store plus Parquet shards.
//!
//! Both outputs are staged next to their final location and verified before
//! either replaces the previous export, so a failed verification leaves the
//! last good dataset in place.

pub mod columnar;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::catalog::CaseKey;
use crate::config::ExportSettings;
use crate::db;
use crate::error::IntegrityError;
use crate::parser::ParsedCase;

pub const COLUMNAR_DIR: &str = "parquet";

#[derive(Debug)]
pub struct SinkOutput {
    pub store_path: PathBuf,
    pub columnar_paths: Vec<PathBuf>,
    pub rows: usize,
}

pub struct DatasetSink {
    dir: PathBuf,
    settings: ExportSettings,
}

impl DatasetSink {
    pub fn new(dir: impl Into<PathBuf>, settings: ExportSettings) -> Self {
        Self {
            dir: dir.into(),
            settings,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir.join(db::STORE_FILE)
    }

    /// Rebuild only the record store.
    pub fn write_store(&self, cases: &[ParsedCase]) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        unique_keys(cases)?;
        let staged = self.dir.join(format!("{}.tmp", db::STORE_FILE));
        write_store(&staged, cases)?;
        let store_path = self.store_path();
        std::fs::rename(&staged, &store_path)
            .with_context(|| format!("publishing {}", store_path.display()))?;
        info!(rows = cases.len(), store = %store_path.display(), "record store written");
        Ok(store_path)
    }

    pub fn write(&self, cases: &[ParsedCase]) -> Result<SinkOutput> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let expected = unique_keys(cases)?;

        let staged_store = self.dir.join(format!("{}.tmp", db::STORE_FILE));
        write_store(&staged_store, cases)?;

        let staging = self.dir.join(format!("{COLUMNAR_DIR}.staging"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        let staged = columnar::write_shards(
            &staging,
            cases,
            self.settings.max_shard_bytes,
            self.settings.sample_rows,
        )?;
        verify_columnar(&staged, &expected)?;

        // Verified: publish the shards, then the store. A store that cannot
        // be published puts the previous shards back.
        let store_path = self.store_path();
        let columnar_dir = self.dir.join(COLUMNAR_DIR);
        let previous = swap_dir(&staging, &columnar_dir)?;
        if let Err(e) = std::fs::rename(&staged_store, &store_path) {
            restore_dir(previous.as_deref(), &columnar_dir)?;
            return Err(e).with_context(|| format!("publishing {}", store_path.display()));
        }
        if let Some(previous) = previous {
            std::fs::remove_dir_all(&previous)?;
        }

        let columnar_paths = staged
            .iter()
            .filter_map(|p| p.file_name())
            .map(|name| columnar_dir.join(name))
            .collect::<Vec<_>>();
        info!(
            rows = cases.len(),
            shards = columnar_paths.len(),
            store = %store_path.display(),
            "dataset exported"
        );
        Ok(SinkOutput {
            store_path,
            columnar_paths,
            rows: cases.len(),
        })
    }
}

fn unique_keys(cases: &[ParsedCase]) -> Result<HashSet<CaseKey>> {
    let mut keys = HashSet::with_capacity(cases.len());
    for case in cases {
        if !keys.insert(case.key()) {
            return Err(IntegrityError::DuplicateKey {
                category: case.category.to_string(),
                document_id: case.document_id.clone(),
            }
            .into());
        }
    }
    Ok(keys)
}

/// Build a fresh store at `path` and check its row count.
fn write_store(path: &Path, cases: &[ParsedCase]) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let conn = db::connect(path)?;
    db::init_schema(&conn)?;
    db::insert_cases(&conn, cases)?;
    let actual = db::count_cases(&conn)?;
    conn.close().map_err(|(_, e)| e)?;
    if actual != cases.len() {
        return Err(IntegrityError::StoreMismatch {
            expected: cases.len(),
            actual,
        }
        .into());
    }
    Ok(())
}

/// Re-read every shard: row total, no duplicate keys, no missing keys.
pub fn verify_columnar(paths: &[PathBuf], expected: &HashSet<CaseKey>) -> Result<()> {
    let mut seen = HashSet::with_capacity(expected.len());
    let mut rows = 0;
    for path in paths {
        for key in columnar::read_keys(path)? {
            rows += 1;
            if !seen.insert(key.clone()) {
                return Err(IntegrityError::DuplicateKey {
                    category: key.0.to_string(),
                    document_id: key.1,
                }
                .into());
            }
        }
    }
    if rows != expected.len() {
        return Err(IntegrityError::RowCountMismatch {
            expected: expected.len(),
            actual: rows,
        }
        .into());
    }
    let missing = expected.difference(&seen).count();
    if missing > 0 {
        return Err(IntegrityError::MissingKeys(missing).into());
    }
    Ok(())
}

/// Move `staging` onto `target`, returning where the old `target` was parked.
fn swap_dir(staging: &Path, target: &Path) -> Result<Option<PathBuf>> {
    let parked = target.with_extension("old");
    if parked.exists() {
        std::fs::remove_dir_all(&parked)?;
    }
    let previous = if target.exists() {
        std::fs::rename(target, &parked)
            .with_context(|| format!("moving aside {}", target.display()))?;
        Some(parked)
    } else {
        None
    };
    if let Err(e) = std::fs::rename(staging, target) {
        restore_dir(previous.as_deref(), target)?;
        return Err(e).with_context(|| format!("publishing {}", target.display()));
    }
    Ok(previous)
}

fn restore_dir(previous: Option<&Path>, target: &Path) -> Result<()> {
    if target.exists() {
        std::fs::remove_dir_all(target)?;
    }
    if let Some(previous) = previous {
        std::fs::rename(previous, target)
            .with_context(|| format!("restoring {}", target.display()))?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::catalog::{CatalogEntry, Category};
    use crate::parser::{self, ParsedCase};

    /// `n` distinct cases with roughly `text_len` bytes of low-redundancy text.
    pub fn cases(n: usize, text_len: usize) -> Vec<ParsedCase> {
        (0..n)
            .map(|i| {
                let entry = CatalogEntry {
                    category: if i % 3 == 0 { Category::Appeal } else { Category::Hearing },
                    year: 2021,
                    document_id: format!("21-{i:05}"),
                    retrieval_url: format!("https://doha.test/{i}"),
                };
                let mut text = format!("Case {i}. Guideline F. Eligibility is denied. ");
                while text.len() < text_len {
                    text.push_str(&format!("{:x} ", (i * 7919 + text.len()) % 65521));
                }
                parser::classify(text, &entry)
            })
            .collect()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Category;

    fn sink(dir: &Path, max_shard_bytes: u64) -> DatasetSink {
        DatasetSink::new(
            dir,
            ExportSettings {
                max_shard_bytes,
                sample_rows: 200,
            },
        )
    }

    #[test]
    fn ten_thousand_records_survive_sharding() {
        let dir = tempfile::tempdir().unwrap();
        let input = testing::cases(10_000, 300);
        let out = sink(dir.path(), 256 * 1024).write(&input).unwrap();

        assert_eq!(out.rows, 10_000);
        assert!(out.columnar_paths.len() > 1);
        let mut keys = HashSet::new();
        for path in &out.columnar_paths {
            for key in columnar::read_keys(path).unwrap() {
                assert!(keys.insert(key), "duplicate row");
            }
        }
        assert_eq!(keys.len(), 10_000);

        let conn = db::connect(&out.store_path).unwrap();
        assert_eq!(db::count_cases(&conn).unwrap(), 10_000);
        assert!(!dir.path().join(format!("{COLUMNAR_DIR}.staging")).exists());
    }

    #[test]
    fn re_export_replaces_previous_shards() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(dir.path(), 64 * 1024);
        let first = s.write(&testing::cases(300, 1000)).unwrap();
        assert!(first.columnar_paths.len() > 1);
        let second = s.write(&testing::cases(5, 100)).unwrap();
        assert_eq!(second.columnar_paths.len(), 1);

        let on_disk = std::fs::read_dir(dir.path().join(COLUMNAR_DIR)).unwrap().count();
        assert_eq!(on_disk, 1);
        let conn = db::connect(&second.store_path).unwrap();
        assert_eq!(db::count_cases(&conn).unwrap(), 5);
    }

    #[test]
    fn verification_catches_missing_and_extra_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = testing::cases(10, 100);
        let path = dir.path().join("a.parquet");
        columnar::write_file(&path, &input[..9]).unwrap();

        let expected: HashSet<_> = input.iter().map(|c| c.key()).collect();
        let err = verify_columnar(&[path.clone()], &expected).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IntegrityError>(),
            Some(IntegrityError::RowCountMismatch { expected: 10, actual: 9 })
        ));

        let err = verify_columnar(&[path.clone(), path], &expected).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IntegrityError>(),
            Some(IntegrityError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn unpublishable_store_puts_previous_shards_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(dir.path(), 64 * 1024);
        let first = s.write(&testing::cases(5, 100)).unwrap();
        let before: HashSet<_> = first
            .columnar_paths
            .iter()
            .flat_map(|p| columnar::read_keys(p).unwrap())
            .collect();

        // A non-empty directory where the store file belongs blocks the rename.
        std::fs::remove_file(s.store_path()).unwrap();
        std::fs::create_dir(s.store_path()).unwrap();
        std::fs::write(s.store_path().join("keep"), b"x").unwrap();

        assert!(s.write(&testing::cases(8, 100)).is_err());
        let columnar_dir = dir.path().join(COLUMNAR_DIR);
        let after: HashSet<_> = std::fs::read_dir(&columnar_dir)
            .unwrap()
            .flat_map(|e| columnar::read_keys(&e.unwrap().path()).unwrap())
            .collect();
        assert_eq!(after, before);
        assert!(!columnar_dir.with_extension("old").exists());
    }

    #[test]
    fn failed_verification_keeps_previous_export() {
        let dir = tempfile::tempdir().unwrap();
        let s = sink(dir.path(), 64 * 1024);
        s.write(&testing::cases(5, 100)).unwrap();

        let mut dupes = testing::cases(3, 100);
        dupes.push(dupes[0].clone());
        let err = s.write(&dupes).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<IntegrityError>(),
            Some(IntegrityError::DuplicateKey { .. })
        ));
        let conn = db::connect(&s.store_path()).unwrap();
        assert_eq!(db::count_cases(&conn).unwrap(), 5);
        assert_eq!(
            db::case_keys(&conn).unwrap().iter().filter(|k| k.0 == Category::Appeal).count(),
            2
        );
    }
}
