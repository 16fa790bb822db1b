//! Category-gated structured fields: judges, findings, panels, dates.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use super::rules;
use super::{AppealDetails, Finding, GuidelineFinding, HearingDetails, Panel};

pub const SUMMARY_CHARS: usize = 1500;
pub const MAX_ALLEGATIONS: usize = 10;
pub const MAX_MITIGATING: usize = 5;
pub const MITIGATING_CHARS: usize = 300;
/// Shorter spans are a bare heading or citation.
const MITIGATING_MIN_CHARS: usize = 20;
const HEAD_CHARS: usize = 3000;
const DATE_HEAD_CHARS: usize = 2000;

const NAME: &str = r"[A-Z][a-z]+(?:[ \t]+[A-Z]\.)?[ \t]+[A-Z][a-z]+(?:[-'][A-Z][a-z]+)?";

// "LOUGHRAN, Edward W., Administrative Judge:"
static SURNAME_FIRST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Z'\-]+),[ \t]+([A-Z][a-z]+)(?:[ \t]+([A-Z])\.)?,?[ \t]+Administrative\s+Judge")
        .unwrap()
});
static NAME_THEN_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"({NAME})[ \t]*\r?\n?[ \t]*Administrative\s+Judge")).unwrap());
static TITLE_THEN_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?:Administrative\s+Judge|AJ):?[ \t]+({NAME})")).unwrap());
static JUDGE_BELOW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"Administrative\s+Judge\s+({NAME})\s+(?:denied|granted|revoked|concluded|found|determined|issued)"
    ))
    .unwrap()
});

static PARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*Paragraph\s+(\d+)\s*,?\s*Guideline\s+([A-M])\s*:\s*(For|Against)\s+Applicant")
        .unwrap()
});
static SUBPARAGRAPH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^\s*Subparagraphs?\s+(\d+)\.\s*([a-z])(?:\s*[-–]\s*(?:\d+\.\s*)?([a-z]))?\s*:\s*(For|Against)\s+Applicant",
    )
    .unwrap()
});
static SOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"SOR\s*¶+\s*(\d+\.[a-z])\s*[,:\-]?\s*([^.]{10,500})").unwrap());
// Each span runs to the end of its line.
static MITIGATING_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)(?:mitigating\s+condition|\bMC\b|AG\s*¶\s*\d+\([a-z]\))[^\n]*").unwrap(),
        Regex::new(r"(?i)(?:in\s+mitigation|mitigating\s+factor)[^\n]*").unwrap(),
    ]
});
static OPINION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:dissenting|concurring|separate)\s+opinion\b").unwrap()
});

static DATE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    const MONTH: &str =
        "(?:January|February|March|April|May|June|July|August|September|October|November|December)";
    vec![
        Regex::new(&format!(r"(?i)\b(?:Date|Dated|Decided)[:\s]+({MONTH}\s+\d{{1,2}},?\s+\d{{4}})")).unwrap(),
        Regex::new(&format!(r"\b({MONTH}\s+\d{{1,2}},\s+\d{{4}})\b")).unwrap(),
        Regex::new(r"\b(\d{1,2}/\d{1,2}/\d{4})\b").unwrap(),
    ]
});

static SUMMARY_SECTIONS: LazyLock<Vec<(Regex, Regex)>> = LazyLock::new(|| {
    let heading = |s: &str| Regex::new(&format!(r"(?im)^[ \t]*(?:{s})\b")).unwrap();
    vec![
        (heading(r"findings\s+of\s+fact"), heading(r"policies|analysis|discussion")),
        (heading(r"analysis|discussion"), heading(r"conclusion|formal\s+findings|order")),
        (heading(r"statement\s+of\s+the\s+case"), heading(r"findings|analysis")),
    ]
});

// ── Hearing ──

pub fn hearing_details(text: &str) -> HearingDetails {
    HearingDetails {
        judge: hearing_judge(text),
        formal_findings: formal_findings(text),
        sor_allegations: sor_allegations(text),
        mitigating_factors: mitigating_factors(text),
    }
}

fn hearing_judge(text: &str) -> Option<String> {
    let head = head(text, HEAD_CHARS);
    if let Some(c) = SURNAME_FIRST_RE.captures(head) {
        let mut name = c[2].to_string();
        if let Some(initial) = c.get(3) {
            name.push_str(&format!(" {}.", initial.as_str()));
        }
        name.push(' ');
        name.push_str(&title_case(&c[1]));
        return Some(name);
    }
    if let Some(c) = TITLE_THEN_NAME_RE.captures(head) {
        return Some(c[1].to_string());
    }
    // Signature block at the end.
    NAME_THEN_TITLE_RE
        .captures_iter(rules::tail(text, HEAD_CHARS))
        .last()
        .map(|c| c[1].to_string())
}

fn formal_findings(text: &str) -> BTreeMap<String, GuidelineFinding> {
    let mut by_paragraph: BTreeMap<u32, String> = BTreeMap::new();
    let mut findings: BTreeMap<String, GuidelineFinding> = BTreeMap::new();

    for c in PARAGRAPH_RE.captures_iter(text) {
        let Ok(number) = c[1].parse::<u32>() else {
            continue;
        };
        let guideline = c[2].to_ascii_uppercase();
        by_paragraph.insert(number, guideline.clone());
        findings.insert(
            guideline,
            GuidelineFinding {
                finding: finding(&c[3]),
                subparagraphs: BTreeMap::new(),
            },
        );
    }

    for c in SUBPARAGRAPH_RE.captures_iter(text) {
        let Some(guideline) = c[1].parse::<u32>().ok().and_then(|n| by_paragraph.get(&n)) else {
            continue;
        };
        let Some(entry) = findings.get_mut(guideline) else {
            continue;
        };
        let first = c[2].to_ascii_lowercase().as_bytes()[0];
        let last = c
            .get(3)
            .map(|m| m.as_str().to_ascii_lowercase().as_bytes()[0])
            .unwrap_or(first);
        let value = finding(&c[4]);
        for letter in first..=last.max(first) {
            entry.subparagraphs.insert((letter as char).to_string(), value);
        }
    }
    findings
}

fn finding(word: &str) -> Finding {
    if word.eq_ignore_ascii_case("for") {
        Finding::For
    } else {
        Finding::Against
    }
}

fn sor_allegations(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    SOR_RE
        .captures_iter(text)
        .filter(|c| seen.insert(c[1].to_string()))
        .map(|c| format!("{}: {}", &c[1], collapse_whitespace(&c[2])))
        .take(MAX_ALLEGATIONS)
        .collect()
}

fn mitigating_factors(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for re in MITIGATING_RES.iter() {
        for m in re.find_iter(text) {
            let span = truncate_chars(m.as_str().trim(), MITIGATING_CHARS);
            if span.chars().count() > MITIGATING_MIN_CHARS && !out.contains(&span) {
                out.push(span);
            }
        }
    }
    out.truncate(MAX_MITIGATING);
    out
}

// ── Appeal ──

pub fn appeal_details(text: &str) -> AppealDetails {
    AppealDetails {
        panel: panel(text),
        clearance_effect: rules::classify_clearance_effect(text),
        judge_below: JUDGE_BELOW_RE
            .captures(head(text, HEAD_CHARS))
            .map(|c| c[1].to_string()),
        separate_opinion: OPINION_RE.is_match(text),
    }
}

/// Chair and members from the "Signed:" block.
fn panel(text: &str) -> Panel {
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let mut panel = Panel::default();
    for (i, line) in lines.iter().enumerate() {
        let Some(name) = line.strip_prefix("Signed:").map(str::trim) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let is_chair = lines[i + 1..]
            .iter()
            .take(4)
            .take_while(|l| !l.starts_with("Signed:"))
            .any(|l| l.to_ascii_lowercase().contains("chair"));
        if is_chair && panel.chair.is_none() {
            panel.chair = Some(name.to_string());
        } else if !panel.members.iter().any(|m| m == name) {
            panel.members.push(name.to_string());
        }
    }
    panel
}

// ── Shared ──

pub fn decision_date(text: &str) -> Option<String> {
    let head = head(text, DATE_HEAD_CHARS);
    DATE_RES
        .iter()
        .find_map(|re| re.captures(head).map(|c| collapse_whitespace(&c[1])))
}

/// Findings of fact, else analysis, else the statement of the case.
pub fn summary(text: &str) -> String {
    for (start, end) in SUMMARY_SECTIONS.iter() {
        let Some(m) = start.find(text) else {
            continue;
        };
        let body = &text[m.end()..];
        let body = match end.find(body) {
            Some(e) => &body[..e.start()],
            None => body,
        };
        let collapsed = collapse_whitespace(body);
        if !collapsed.is_empty() {
            return truncate_chars(&collapsed, SUMMARY_CHARS);
        }
    }
    truncate_chars(&collapse_whitespace(text), SUMMARY_CHARS)
}

fn head(text: &str, chars: usize) -> &str {
    match text.char_indices().nth(chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    head(s, max).to_string()
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_string() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

// ── Tests ──
