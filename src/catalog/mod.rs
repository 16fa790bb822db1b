pub mod builder;
pub mod links;
pub mod sections;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::FetchError;

pub const COMBINED_FILE: &str = "all_case_links.json";

/// Document category: a hearing decision or an Appeal Board review of one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[serde(alias = "primary")]
    #[value(alias = "primary")]
    Hearing,
    #[serde(alias = "review")]
    #[value(alias = "review")]
    Appeal,
}

impl Category {
    pub const ALL: [Category; 2] = [Category::Hearing, Category::Appeal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Hearing => "hearing",
            Category::Appeal => "appeal",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hearing" | "primary" => Ok(Category::Hearing),
            "appeal" | "review" => Ok(Category::Appeal),
            other => Err(format!("unknown category {other:?}")),
        }
    }
}

/// Identity of a document across catalog, ledger and dataset.
pub type CaseKey = (Category, String);

/// One discovered document link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CatalogRecord")]
pub struct CatalogEntry {
    pub category: Category,
    pub year: i32,
    pub document_id: String,
    pub retrieval_url: String,
}

impl CatalogEntry {
    pub fn key(&self) -> CaseKey {
        (self.category, self.document_id.clone())
    }
}

// ── On-disk encodings ──

/// Every shape a catalog line has been written in. Older collectors wrote
/// bare tuples; category-less tuples predate appeal collection.
#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogRecord {
    Current {
        category: Category,
        year: i32,
        document_id: String,
        retrieval_url: String,
    },
    Tagged(Category, i32, String, String),
    Legacy(i32, String, String),
}

impl From<CatalogRecord> for CatalogEntry {
    fn from(record: CatalogRecord) -> Self {
        let (category, year, document_id, retrieval_url) = match record {
            CatalogRecord::Current {
                category,
                year,
                document_id,
                retrieval_url,
            } => (category, year, document_id, retrieval_url),
            CatalogRecord::Tagged(c, y, id, url) => (c, y, id, url),
            CatalogRecord::Legacy(y, id, url) => (Category::Hearing, y, id, url),
        };
        CatalogEntry {
            category,
            year,
            document_id,
            retrieval_url,
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{category} {year}: page {page} failed after {attempts} attempt(s): {source}")]
    SectionFailed {
        category: Category,
        year: i32,
        page: u32,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("reading catalog file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("decoding catalog file {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("writing catalog file {path}: {message}")]
    Write { path: PathBuf, message: String },
}

// ── Shards ──

/// Entries for one (category, year); written once and never mutated.
#[derive(Debug, Clone)]
pub struct CatalogShard {
    pub category: Category,
    pub year: i32,
    pub entries: Vec<CatalogEntry>,
    /// True when the shard was loaded from an earlier run.
    pub from_disk: bool,
}

pub fn shard_path(dir: &Path, category: Category, year: i32) -> PathBuf {
    dir.join(format!("{}_links_{}.json", category, year))
}

/// Inverse of [`shard_path`] on the file name.
pub fn parse_shard_name(name: &str) -> Option<(Category, i32)> {
    let stem = name.strip_suffix(".json")?;
    let (category, year) = stem.split_once("_links_")?;
    Some((category.parse().ok()?, year.parse().ok()?))
}

pub fn read_entries(path: &Path) -> Result<Vec<CatalogEntry>, CatalogError> {
    let bytes = std::fs::read(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| CatalogError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_entries(path: &Path, entries: &[CatalogEntry]) -> Result<(), CatalogError> {
    crate::fsutil::write_json_atomic(path, entries).map_err(|e| CatalogError::Write {
        path: path.to_path_buf(),
        message: format!("{e:#}"),
    })
}

// ── Combined catalog ──

/// Union of shards, unique by (category, document_id).
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    index: HashMap<CaseKey, usize>,
}

impl Catalog {
    /// First occurrence of a key wins; later duplicates are dropped.
    pub fn from_entries(entries: impl IntoIterator<Item = CatalogEntry>) -> Self {
        let mut catalog = Catalog::default();
        let mut dropped = 0usize;
        for entry in entries {
            let key = entry.key();
            if catalog.index.contains_key(&key) {
                dropped += 1;
                continue;
            }
            catalog.index.insert(key, catalog.entries.len());
            catalog.entries.push(entry);
        }
        if dropped > 0 {
            debug!(dropped, "dropped duplicate catalog entries");
        }
        catalog
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        Ok(Self::from_entries(read_entries(path)?))
    }

    pub fn save(&self, path: &Path) -> Result<(), CatalogError> {
        write_entries(path, &self.entries)
    }

    /// Union every `{category}_links_{year}.json` shard under `dir`.
    pub fn from_shard_dir(dir: &Path) -> Result<Self, CatalogError> {
        let listing = std::fs::read_dir(dir).map_err(|source| CatalogError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut shards: Vec<(Category, i32, PathBuf)> = Vec::new();
        for item in listing {
            let item = item.map_err(|source| CatalogError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let name = item.file_name();
            if let Some((category, year)) = name.to_str().and_then(parse_shard_name) {
                shards.push((category, year, item.path()));
            }
        }
        shards.sort();

        let mut entries = Vec::new();
        for (_, _, path) in &shards {
            entries.extend(read_entries(path)?);
        }
        Ok(Self::from_entries(entries))
    }

    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, category: Category, document_id: &str) -> Option<&CatalogEntry> {
        self.index
            .get(&(category, document_id.to_string()))
            .map(|&i| &self.entries[i])
    }

    pub fn counts(&self) -> BTreeMap<(Category, i32), usize> {
        let mut counts = BTreeMap::new();
        for e in &self.entries {
            *counts.entry((e.category, e.year)).or_insert(0) += 1;
        }
        counts
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: Category, id: &str) -> CatalogEntry {
        CatalogEntry {
            category,
            year: 2021,
            document_id: id.into(),
            retrieval_url: format!("https://example.test/{id}"),
        }
    }

    #[test]
    fn legacy_tuple_upgrades_to_primary() {
        let legacy: CatalogEntry =
            serde_json::from_str(r#"[2021, "21-01234", "https://x/21-01234.pdf"]"#).unwrap();
        let tagged: CatalogEntry =
            serde_json::from_str(r#"["primary", 2021, "21-01234", "https://x/21-01234.pdf"]"#)
                .unwrap();
        assert_eq!(legacy, tagged);
        assert_eq!(legacy.category, Category::Hearing);
    }

    #[test]
    fn object_form_and_review_alias() {
        let e: CatalogEntry = serde_json::from_str(
            r#"{"category":"review","year":2019,"document_id":"19-0001","retrieval_url":"u"}"#,
        )
        .unwrap();
        assert_eq!(e.category, Category::Appeal);

        let written = serde_json::to_value(&e).unwrap();
        assert_eq!(written["category"], "appeal");
        let back: CatalogEntry = serde_json::from_value(written).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn catalog_dedups_by_category_and_id() {
        let catalog = Catalog::from_entries(vec![
            entry(Category::Hearing, "21-1"),
            entry(Category::Hearing, "21-1"),
            entry(Category::Appeal, "21-1"),
        ]);
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get(Category::Appeal, "21-1").is_some());
    }

    #[test]
    fn shard_names_round_trip() {
        let p = shard_path(Path::new("/c"), Category::Appeal, 2022);
        assert_eq!(p, PathBuf::from("/c/appeal_links_2022.json"));
        assert_eq!(
            parse_shard_name("appeal_links_2022.json"),
            Some((Category::Appeal, 2022))
        );
        assert_eq!(parse_shard_name(COMBINED_FILE), None);
    }

    #[test]
    fn combined_catalog_unions_shards() {
        let dir = tempfile::tempdir().unwrap();
        write_entries(
            &shard_path(dir.path(), Category::Hearing, 2021),
            &[entry(Category::Hearing, "21-1"), entry(Category::Hearing, "21-2")],
        )
        .unwrap();
        std::fs::write(
            shard_path(dir.path(), Category::Hearing, 2020),
            r#"[[2020, "20-9", "https://x/20-9"]]"#,
        )
        .unwrap();

        let catalog = Catalog::from_shard_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.entries()[0].document_id, "20-9");
    }
}
