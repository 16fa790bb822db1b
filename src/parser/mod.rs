pub mod findings;
pub mod rules;
pub mod text;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{links, CaseKey, CatalogEntry, Category};
use crate::error::ParseError;

/// Two-digit id prefixes below this are 20yy, the rest 19yy.
pub const CENTURY_PIVOT: i32 = 50;

static YEAR_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[A-Za-z]+-)?(\d{4}|\d{2})-\d+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Granted,
    Denied,
    Revoked,
    Affirmed,
    Reversed,
    Remanded,
    Dismissed,
    Unknown,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Granted => "GRANTED",
            Outcome::Denied => "DENIED",
            Outcome::Revoked => "REVOKED",
            Outcome::Affirmed => "AFFIRMED",
            Outcome::Reversed => "REVERSED",
            Outcome::Remanded => "REMANDED",
            Outcome::Dismissed => "DISMISSED",
            Outcome::Unknown => "UNKNOWN",
        }
    }
}

/// What an appeal ruling means for the applicant's clearance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClearanceEffect {
    Granted,
    Denied,
    Remanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Finding {
    For,
    Against,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineFinding {
    pub finding: Finding,
    pub subparagraphs: BTreeMap<String, Finding>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HearingDetails {
    pub judge: Option<String>,
    pub formal_findings: BTreeMap<String, GuidelineFinding>,
    pub sor_allegations: Vec<String>,
    #[serde(default)]
    pub mitigating_factors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub chair: Option<String>,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppealDetails {
    pub panel: Panel,
    pub clearance_effect: Option<ClearanceEffect>,
    pub judge_below: Option<String>,
    pub separate_opinion: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CaseDetails {
    Hearing(HearingDetails),
    Appeal(AppealDetails),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum YearSource {
    IdPrefix,
    Catalog,
}

impl YearSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            YearSource::IdPrefix => "id-prefix",
            YearSource::Catalog => "catalog",
        }
    }
}

/// One classified decision; the unit the dataset stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedCase {
    pub document_id: String,
    pub category: Category,
    pub outcome: Outcome,
    pub guidelines: BTreeSet<char>,
    pub details: CaseDetails,
    pub decision_date: Option<String>,
    pub summary: String,
    pub full_text: String,
    pub source_url: String,
    pub inferred_year: i32,
    pub year_source: YearSource,
    pub parsed_at: DateTime<Utc>,
}

impl ParsedCase {
    pub fn key(&self) -> CaseKey {
        (self.category, self.document_id.clone())
    }
}

/// Three passes over the extracted text: outcome, guideline codes, details.
pub fn parse(bytes: &[u8], entry: &CatalogEntry) -> Result<ParsedCase, ParseError> {
    let full_text = text::extract_text(bytes)?;
    Ok(classify(full_text, entry))
}

pub fn classify(full_text: String, entry: &CatalogEntry) -> ParsedCase {
    let outcome = rules::classify_outcome(entry.category, &full_text);
    let guidelines = rules::guideline_codes(&full_text);
    let details = match entry.category {
        Category::Hearing => CaseDetails::Hearing(findings::hearing_details(&full_text)),
        Category::Appeal => CaseDetails::Appeal(findings::appeal_details(&full_text)),
    };
    let (inferred_year, year_source) = entry_year(entry);

    ParsedCase {
        document_id: entry.document_id.clone(),
        category: entry.category,
        outcome,
        guidelines,
        details,
        decision_date: findings::decision_date(&full_text),
        summary: findings::summary(&full_text),
        source_url: entry.retrieval_url.clone(),
        inferred_year,
        year_source,
        parsed_at: Utc::now(),
        full_text,
    }
}

/// `FileId` ids carry the section year as their prefix, so that year is the catalog's.
pub fn entry_year(entry: &CatalogEntry) -> (i32, YearSource) {
    if links::is_file_id_link(&entry.retrieval_url) {
        return (entry.year, YearSource::Catalog);
    }
    infer_year(&entry.document_id, entry.year)
}

/// Year from the id's numeric prefix, else the catalog's declared year.
pub fn infer_year(document_id: &str, declared: i32) -> (i32, YearSource) {
    let prefix = YEAR_PREFIX_RE
        .captures(document_id)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    match prefix {
        Some(p) if p.len() == 4 => match p.parse() {
            Ok(year) => (year, YearSource::IdPrefix),
            Err(_) => (declared, YearSource::Catalog),
        },
        Some(p) => match p.parse::<i32>() {
            Ok(yy) if yy < CENTURY_PIVOT => (2000 + yy, YearSource::IdPrefix),
            Ok(yy) => (1900 + yy, YearSource::IdPrefix),
            Err(_) => (declared, YearSource::Catalog),
        },
        None => {
            warn!(document_id, declared, "id has no numeric year prefix; using catalog year");
            (declared, YearSource::Catalog)
        }
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
            retrieval_url: format!("https://doha.test/{id}"),
        }
    }

    fn fixture(name: &str) -> Vec<u8> {
        std::fs::read(format!("{}/tests/fixtures/{name}", env!("CARGO_MANIFEST_DIR"))).unwrap()
    }

    #[test]
    fn century_pivot() {
        assert_eq!(infer_year("21-01234", 1999), (2021, YearSource::IdPrefix));
        assert_eq!(infer_year("49-1", 1999), (2049, YearSource::IdPrefix));
        assert_eq!(infer_year("98-0455", 2020), (1998, YearSource::IdPrefix));
        assert_eq!(infer_year("ISCR-23-01234", 2020), (2023, YearSource::IdPrefix));
        assert_eq!(infer_year("2019-31245", 2018), (2019, YearSource::IdPrefix));
    }

    #[test]
    fn non_numeric_prefix_falls_back() {
        assert_eq!(infer_year("pre2016-4411", 2016), (2016, YearSource::Catalog));
        assert_eq!(infer_year("guidance", 2010), (2010, YearSource::Catalog));
    }

    #[test]
    fn file_id_years_come_from_the_catalog() {
        let archived = CatalogEntry {
            category: Category::Appeal,
            year: 2018,
            document_id: "2018-553".into(),
            retrieval_url: "https://doha.ogc.osd.mil/Portals/100/Documents/ISCR/FileId/553/".into(),
        };
        assert_eq!(entry_year(&archived), (2018, YearSource::Catalog));
        let case = classify("The Judge's decision is AFFIRMED.".into(), &archived);
        assert_eq!(case.year_source, YearSource::Catalog);

        let docket = CatalogEntry {
            retrieval_url: "https://doha.ogc.osd.mil/Portals/100/ISCR/14-03542.a1.pdf".into(),
            document_id: "14-03542".into(),
            ..archived
        };
        assert_eq!(entry_year(&docket), (2014, YearSource::IdPrefix));
    }

    #[test]
    fn hearing_decision_fixture() {
        let case = parse(&fixture("hearing_decision.html"), &entry(Category::Hearing, "21-00412")).unwrap();
        assert_eq!(case.outcome, Outcome::Denied);
        assert_eq!(case.guidelines.iter().collect::<String>(), "EF");
        assert_eq!(case.decision_date.as_deref(), Some("September 14, 2021"));
        assert!(case.summary.starts_with("Applicant is 38 years old"));
        let CaseDetails::Hearing(d) = &case.details else {
            panic!("expected hearing details");
        };
        assert_eq!(d.judge.as_deref(), Some("Edward W. Loughran"));
        assert_eq!(d.formal_findings["F"].subparagraphs["c"], Finding::Against);
        assert_eq!(d.formal_findings["E"].finding, Finding::For);
        assert_eq!(d.sor_allegations.len(), 3);
        assert_eq!(d.mitigating_factors.len(), 2);
        assert!(d.mitigating_factors[0].starts_with("AG ¶ 19(a) and AG ¶ 19(c) apply."));
        assert!(d.mitigating_factors[1].starts_with("In mitigation, Applicant presented"));
        let exported: serde_json::Value = serde_json::to_value(&case.details).unwrap();
        assert_eq!(exported["mitigating_factors"].as_array().map(Vec::len), Some(2));
        assert_eq!((case.inferred_year, case.year_source), (2021, YearSource::IdPrefix));
    }

    #[test]
    fn appeal_decision_fixture() {
        let case = parse(&fixture("appeal_decision.html"), &entry(Category::Appeal, "2022-4471")).unwrap();
        assert_eq!(case.outcome, Outcome::Reversed);
        assert!(case.guidelines.contains(&'H'));
        let CaseDetails::Appeal(d) = &case.details else {
            panic!("expected appeal details");
        };
        assert_eq!(d.clearance_effect, Some(ClearanceEffect::Denied));
        assert_eq!(d.judge_below.as_deref(), Some("Candace Garcia"));
        assert_eq!(d.panel.chair.as_deref(), Some("Moira Modzelewski"));
        assert_eq!(d.panel.members.len(), 2);
        assert!(d.separate_opinion);
    }

    #[test]
    fn unmatched_outcome_is_unknown_not_error() {
        let case = parse(b"<html><body><p>Order of continuance.</p></body></html>", &entry(Category::Hearing, "21-9"))
            .unwrap();
        assert_eq!(case.outcome, Outcome::Unknown);
        assert!(case.guidelines.is_empty());
    }

    #[test]
    fn details_tagged_by_kind() {
        let case = classify("Eligibility is granted.".into(), &entry(Category::Appeal, "21-9"));
        let json = serde_json::to_value(&case).unwrap();
        assert_eq!(json["details"]["kind"], "appeal");
        assert_eq!(json["outcome"], "UNKNOWN");
        assert_eq!(json["year_source"], "id-prefix");
        let back: ParsedCase = serde_json::from_value(json).unwrap();
        assert_eq!(back, case);
    }
}
