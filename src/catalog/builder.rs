use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use tracing::{error, info, warn};

use super::sections::{self, Section};
use super::{
    links, read_entries, shard_path, write_entries, Catalog, CatalogError, CatalogShard,
    Category, COMBINED_FILE,
};
use crate::browser::{backoff_delay, Session};
use crate::config::CatalogSettings;

/// Outcome of a sweep over many (category, year) sections.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub fetched: Vec<(Category, i32, usize)>,
    pub loaded: Vec<(Category, i32, usize)>,
    /// Sections that returned no links; nothing is persisted so they are retried.
    pub empty: Vec<(Category, i32)>,
    pub failed: Vec<CatalogError>,
    pub catalog: Catalog,
}

pub struct CatalogBuilder<'s> {
    session: &'s mut Session,
    dir: PathBuf,
    settings: CatalogSettings,
}

impl<'s> CatalogBuilder<'s> {
    pub fn new(session: &'s mut Session, dir: impl Into<PathBuf>, settings: CatalogSettings) -> Self {
        Self {
            session,
            dir: dir.into(),
            settings,
        }
    }

    /// Shard for one (category, year). An existing shard file is returned as-is.
    pub async fn discover(&mut self, category: Category, year: i32) -> Result<CatalogShard, CatalogError> {
        let year = sections::shard_year(category, year);
        let path = shard_path(&self.dir, category, year);
        if path.exists() {
            let entries = read_entries(&path)?;
            info!(%category, year, entries = entries.len(), "catalog shard already on disk");
            return Ok(CatalogShard {
                category,
                year,
                entries,
                from_disk: true,
            });
        }

        let section = sections::section_for(category, year, self.settings.legacy_page_bound);
        let entries = match &section {
            Section::Single { url } => {
                let html = self.fetch_page(category, year, 1, url).await?;
                links::extract(&html, url, category, year)
            }
            Section::Paged { bound, .. } => {
                let mut seen = HashSet::new();
                let mut all = Vec::new();
                for page in 1..=*bound {
                    let url = section.page_url(page);
                    let html = self.fetch_page(category, year, page, &url).await?;
                    let mut fresh = 0usize;
                    for entry in links::extract(&html, &url, category, year) {
                        if seen.insert(entry.document_id.clone()) {
                            all.push(entry);
                            fresh += 1;
                        }
                    }
                    info!(%category, year, page, fresh, "legacy listing page");
                    if fresh == 0 {
                        break;
                    }
                }
                all
            }
        };

        if entries.is_empty() {
            warn!(%category, year, "section listed no documents; shard not written");
        } else {
            write_entries(&path, &entries)?;
            info!(%category, year, entries = entries.len(), "catalog shard written");
        }
        Ok(CatalogShard {
            category,
            year,
            entries,
            from_disk: false,
        })
    }

    async fn fetch_page(
        &mut self,
        category: Category,
        year: i32,
        page: u32,
        url: &str,
    ) -> Result<String, CatalogError> {
        let max_attempts = self.settings.page_retries + 1;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.session.fetch(url).await {
                Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) if attempt < max_attempts => {
                    let backoff = backoff_delay(
                        Duration::from_millis(self.settings.retry_backoff_ms),
                        attempt,
                    );
                    warn!(
                        "{} {} page {} failed (attempt {}/{}): {}; backing off {:.1}s",
                        category,
                        year,
                        page,
                        attempt,
                        max_attempts,
                        e,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(source) => {
                    return Err(CatalogError::SectionFailed {
                        category,
                        year,
                        page,
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    /// Discover every planned section, then rewrite the combined catalog.
    ///
    /// `years` narrows the sweep; otherwise it runs from the legacy section
    /// through the year after `now`. A section that exhausts its retries is
    /// reported in `failed` and the sweep continues.
    pub async fn discover_range(
        &mut self,
        categories: &[Category],
        years: Option<(i32, i32)>,
        now: DateTime<Utc>,
    ) -> Result<DiscoveryReport, CatalogError> {
        let mut report = DiscoveryReport::default();
        for &category in categories {
            let plan = match years {
                Some((from, to)) => sections::plan(category, from, to),
                None => sections::default_plan(category, now.year()),
            };
            for year in plan {
                match self.discover(category, year).await {
                    Ok(shard) if shard.from_disk => {
                        report.loaded.push((category, shard.year, shard.entries.len()))
                    }
                    Ok(shard) if shard.entries.is_empty() => report.empty.push((category, shard.year)),
                    Ok(shard) => report.fetched.push((category, shard.year, shard.entries.len())),
                    Err(e @ CatalogError::SectionFailed { .. }) => {
                        error!("{}", e);
                        report.failed.push(e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let catalog = Catalog::from_shard_dir(&self.dir)?;
        catalog.save(&self.dir.join(COMBINED_FILE))?;
        info!(entries = catalog.len(), "combined catalog written");
        report.catalog = catalog;
        Ok(report)
    }
}
