use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::error::ParseError;

const SKIPPED_TAGS: &[&str] = &["script", "style", "nav", "header", "footer", "noscript"];

static CONTENT_ROOTS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    ["main", "article", "body"]
        .iter()
        .map(|s| Selector::parse(s).unwrap())
        .collect()
});

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}

/// Plain text of a decision: PDF pages joined, or the visible HTML text.
pub fn extract_text(bytes: &[u8]) -> Result<String, ParseError> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ParseError::Empty);
    }
    let text = if is_pdf(bytes) {
        pdf_text(bytes)?
    } else {
        html_text(&String::from_utf8_lossy(bytes))
    };
    if text.trim().is_empty() {
        return Err(ParseError::NoText(bytes.len()));
    }
    Ok(text)
}

fn pdf_text(bytes: &[u8]) -> Result<String, ParseError> {
    let doc = lopdf::Document::load_mem(bytes).map_err(|e| ParseError::Pdf(e.to_string()))?;
    let mut pages = Vec::new();
    for (number, _) in doc.get_pages() {
        match doc.extract_text(&[number]) {
            Ok(text) => pages.push(text),
            Err(e) => debug!(page = number, "skipping unreadable pdf page: {}", e),
        }
    }
    Ok(pages.join("\n"))
}

fn html_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let root = CONTENT_ROOTS
        .iter()
        .find_map(|sel| doc.select(sel).next())
        .unwrap_or_else(|| doc.root_element());
    visible_text(root)
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut lines = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| SKIPPED_TAGS.contains(&e.name()))
        });
        if hidden {
            continue;
        }
        let line = text.trim();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }
    lines.join("\n")
}
