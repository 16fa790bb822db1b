use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};

use super::sections::{self, ORIGIN};
use super::{CatalogEntry, Category};

static FILE_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/FileId/(\d+)").unwrap());
static CASE_NO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{2}-\d+)").unwrap());
static ANCHOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").unwrap());

/// Whether `url` is a `/FileId/{n}` link, whose document id was built from the section year.
pub fn is_file_id_link(url: &str) -> bool {
    FILE_ID_RE.is_match(url)
}

/// Collect document links from one listing page, in page order, one per id.
pub fn extract(html: &str, page_url: &str, category: Category, year: i32) -> Vec<CatalogEntry> {
    let doc = Html::parse_document(html);
    let base = Url::parse(page_url).ok();
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for a in doc.select(&ANCHOR) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let document_id = if let Some(caps) = FILE_ID_RE.captures(href) {
            sections::file_id(category, year, &caps[1])
        } else if let Some(caps) = CASE_NO_RE.captures(href) {
            caps[1].to_string()
        } else {
            continue;
        };
        if !seen.insert(document_id.clone()) {
            continue;
        }
        out.push(CatalogEntry {
            category,
            year,
            document_id,
            retrieval_url: absolutize(href, base.as_ref()),
        });
    }
    out
}

fn absolutize(href: &str, base: Option<&Url>) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    if href.starts_with('/') {
        return format!("{ORIGIN}{href}");
    }
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => format!("{ORIGIN}/{href}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = "https://doha.ogc.osd.mil/Industrial-Security-Program/Industrial-Security-Clearance-Decisions/ISCR-Hearing-Decisions/2021-ISCR-Hearing-Decisions/";

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR")))
            .unwrap()
    }

    #[test]
    fn yearly_listing() {
        let entries = extract(&fixture("hearing_2021.html"), PAGE, Category::Hearing, 2021);
        let ids: Vec<_> = entries.iter().map(|e| e.document_id.as_str()).collect();
        assert_eq!(ids, vec!["2021-31245", "2021-31247", "21-00412"]);
        assert_eq!(
            entries[0].retrieval_url,
            "https://doha.ogc.osd.mil/Portals/100/Documents/ISCR/2021/FileId/31245/"
        );
        assert!(entries[2].retrieval_url.starts_with(PAGE));
        assert!(entries.iter().all(|e| e.year == 2021));
    }

    #[test]
    fn legacy_listing_prefixes_ids() {
        let html = r#"<a href="/Portals/100/FileId/881/">a</a><a href="https://x.test/FileId/882">b</a>"#;
        let entries = extract(html, PAGE, Category::Hearing, 2016);
        assert_eq!(entries[0].document_id, "pre2016-881");
        assert_eq!(entries[1].retrieval_url, "https://x.test/FileId/882");
    }

    #[test]
    fn page_without_links() {
        assert!(extract("<html><body><p>Nothing</p></body></html>", PAGE, Category::Appeal, 2022)
            .is_empty());
    }
}
