use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Upper bound for any configured retry count.
pub const MAX_RETRIES: u32 = 10;

/// Which browser capability backs a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Chromium,
    Http,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub browser: BrowserSettings,
    pub catalog: CatalogSettings,
    pub download: DownloadSettings,
    pub export: ExportSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub backend: Backend,
    pub headless: bool,
    pub origin: String,
    pub user_agent: String,
    /// Minimum spacing between two fetches on one session.
    pub min_interval_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Tear a session down after this many fetches. 0 disables recycling.
    pub recycle_after: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub legacy_page_bound: u32,
    pub page_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub workers: usize,
    pub checkpoint_every: usize,
    pub fetch_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportSettings {
    /// Ceiling for one columnar shard, in bytes.
    pub max_shard_bytes: u64,
    /// Records written to the probe file that estimates bytes-per-record.
    pub sample_rows: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            browser: BrowserSettings::default(),
            catalog: CatalogSettings::default(),
            download: DownloadSettings::default(),
            export: ExportSettings::default(),
        }
    }
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            backend: Backend::Chromium,
            headless: true,
            origin: crate::catalog::sections::ORIGIN.to_string(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/126.0 Safari/537.36"
                .to_string(),
            min_interval_ms: 3000,
            fetch_timeout_secs: 60,
            recycle_after: 250,
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            legacy_page_bound: 17,
            page_retries: 3,
            retry_backoff_ms: 3000,
        }
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            checkpoint_every: 50,
            fetch_retries: 3,
            retry_backoff_ms: 2000,
        }
    }
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_shard_bytes: 90 * 1024 * 1024,
            sample_rows: 200,
        }
    }
}

impl Settings {
    /// Layer defaults, `harvest.toml` (or an explicit file) and `DOHA_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name("harvest").required(false),
        };
        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("DOHA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("loading configuration")?
            .try_deserialize::<Settings>()
            .context("decoding configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.download.workers > 0, "download.workers must be at least 1");
        anyhow::ensure!(
            self.download.checkpoint_every > 0,
            "download.checkpoint_every must be at least 1"
        );
        anyhow::ensure!(
            self.download.fetch_retries <= MAX_RETRIES,
            "download.fetch_retries must be at most {MAX_RETRIES}"
        );
        anyhow::ensure!(
            self.catalog.page_retries <= MAX_RETRIES,
            "catalog.page_retries must be at most {MAX_RETRIES}"
        );
        anyhow::ensure!(
            self.export.max_shard_bytes > 0,
            "export.max_shard_bytes must be positive"
        );
        Ok(())
    }

    pub fn catalog_dir(&self) -> PathBuf {
        self.data_dir.join("catalog")
    }

    pub fn combined_catalog_path(&self) -> PathBuf {
        self.catalog_dir().join(crate::catalog::COMBINED_FILE)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.data_dir.join("dataset")
    }
}

impl BrowserSettings {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}
