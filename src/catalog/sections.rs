//! Where each (category, year) lives on the DOHA site.

use super::Category;

pub const ORIGIN: &str = "https://doha.ogc.osd.mil";

const DECISIONS: &str =
    "https://doha.ogc.osd.mil/Industrial-Security-Program/Industrial-Security-Clearance-Decisions";

/// First year with its own yearly listing.
pub const FIRST_YEARLY: i32 = 2019;
/// First year on the hearing archive listing; earlier years are the legacy section.
pub const FIRST_ARCHIVED: i32 = 2017;
/// Shard year that stands for "2016 and prior".
pub const LEGACY_YEAR: i32 = 2016;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// One listing page.
    Single { url: String },
    /// A multi-page listing; `{page}` in the pattern is the 1-based page number.
    Paged { pattern: String, bound: u32 },
}

impl Section {
    pub fn page_url(&self, page: u32) -> String {
        match self {
            Section::Single { url } => url.clone(),
            Section::Paged { pattern, .. } => pattern.replace("{page}", &page.to_string()),
        }
    }
}

/// The shard year a requested year is filed under.
pub fn shard_year(category: Category, year: i32) -> i32 {
    match category {
        Category::Hearing if year <= LEGACY_YEAR => LEGACY_YEAR,
        Category::Appeal if year < FIRST_YEARLY => FIRST_YEARLY - 1,
        _ => year,
    }
}

pub fn section_for(category: Category, year: i32, legacy_bound: u32) -> Section {
    let url = match (category, year) {
        (Category::Hearing, 2024) => format!("{DECISIONS}/ISCR-Hearing-Decisions/2024-ISCR-Hearing/"),
        (Category::Hearing, y) if y >= FIRST_YEARLY => {
            format!("{DECISIONS}/ISCR-Hearing-Decisions/{y}-ISCR-Hearing-Decisions/")
        }
        (Category::Hearing, y) if y >= FIRST_ARCHIVED => format!(
            "{DECISIONS}/Archived-ISCR-Hearing-Decisions/{y}-ISCR-Hearing-Decisions/"
        ),
        (Category::Hearing, _) => {
            return Section::Paged {
                pattern: format!(
                    "{DECISIONS}/Archived-ISCR-Hearing-Decisions/ISCR-Hearing-Decisions-2016-and-Prior/?page={{page}}"
                ),
                bound: legacy_bound,
            }
        }
        (Category::Appeal, 2019) => format!("{DECISIONS}/ISCR-Appeal-Board-Decisions/2019-DOHA-Appeal-Board-Decisions/"),
        (Category::Appeal, 2020) => format!("{DECISIONS}/ISCR-Appeal-Board-Decisions/2020-DOHA-Appeal-Board-Decisions/"),
        (Category::Appeal, 2021) => format!("{DECISIONS}/ISCR-Appeal-Board-Decisions/2021-DOHA-Appeal-Board-Decisions/"),
        (Category::Appeal, 2022) => format!("{DECISIONS}/ISCR-Appeal-Board-Decisions/2022-ISCR-Appeal-Board-Decisions/"),
        (Category::Appeal, y) if y > 2022 => {
            format!("{DECISIONS}/ISCR-Appeal-Board-Decisions/{y}-ISCR-Appeal-Board-Decisions/")
        }
        (Category::Appeal, _) => {
            format!("{DECISIONS}/Archived-ISCR-Appeal-Board-Decisions/")
        }
    };
    Section::Single { url }
}

/// Document id for a `/FileId/{n}` link found in a (category, year) section.
pub fn file_id(category: Category, year: i32, n: &str) -> String {
    match category {
        Category::Hearing if year <= LEGACY_YEAR => format!("pre2016-{n}"),
        _ => format!("{year}-{n}"),
    }
}

/// Shard years to discover for `category` between `from` and `to` inclusive.
pub fn plan(category: Category, from: i32, to: i32) -> Vec<i32> {
    let mut years: Vec<i32> = (from..=to).map(|y| shard_year(category, y)).collect();
    years.sort_unstable();
    years.dedup();
    years
}

/// The default sweep: the legacy section through next year.
pub fn default_plan(category: Category, current_year: i32) -> Vec<i32> {
    plan(category, LEGACY_YEAR, current_year + 1)
}
