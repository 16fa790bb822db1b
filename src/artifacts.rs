use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::catalog::{CatalogEntry, Category};
use crate::fsutil;
use crate::parser::text::is_pdf;

const EXTENSIONS: [&str; 2] = ["pdf", "html"];

/// Raw fetched bytes, one file per document: `{root}/{category}/{id}.{pdf|html}`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, category: Category, document_id: &str, ext: &str) -> PathBuf {
        let file = document_id.replace(['/', '\\'], "_");
        self.root
            .join(category.as_str())
            .join(format!("{file}.{ext}"))
    }

    pub fn find(&self, category: Category, document_id: &str) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.path_for(category, document_id, ext))
            .find(|p| p.is_file())
    }

    pub fn exists(&self, entry: &CatalogEntry) -> bool {
        self.find(entry.category, &entry.document_id).is_some()
    }

    /// Atomically store `bytes`, replacing any copy under the other extension.
    pub fn write(&self, entry: &CatalogEntry, bytes: &[u8]) -> Result<PathBuf> {
        let ext = if is_pdf(bytes) { "pdf" } else { "html" };
        let path = self.path_for(entry.category, &entry.document_id, ext);
        fsutil::write_atomic(&path, bytes)?;
        for other in EXTENSIONS.iter().filter(|e| **e != ext) {
            let stale = self.path_for(entry.category, &entry.document_id, other);
            if stale.exists() {
                std::fs::remove_file(&stale)
                    .with_context(|| format!("removing {}", stale.display()))?;
            }
        }
        Ok(path)
    }

    pub fn read(&self, category: Category, document_id: &str) -> Result<Option<Vec<u8>>> {
        match self.find(category, document_id) {
            Some(path) => Ok(Some(
                std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
            )),
            None => Ok(None),
        }
    }
}
