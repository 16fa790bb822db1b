//! Ordered pattern rules. Within a list the first match wins, so specific
//! and negated phrasings sit above the general ones they contain.

use std::sync::LazyLock;

use regex::Regex;

use super::{ClearanceEffect, Outcome};
use crate::catalog::Category;

/// Outcome language sits at the end of a decision.
pub const TAIL_CHARS: usize = 3000;

pub struct Rule<T> {
    pub label: T,
    pub pattern: &'static str,
    re: Regex,
}

impl<T: Copy> Rule<T> {
    pub fn is_match(&self, text: &str) -> bool {
        self.re.is_match(text)
    }
}

fn compile<T: Copy>(table: &[(T, &'static str)]) -> Vec<Rule<T>> {
    table
        .iter()
        .map(|&(label, pattern)| Rule {
            label,
            pattern,
            re: Regex::new(&format!("(?i){pattern}")).unwrap(),
        })
        .collect()
}

/// First rule in `rules` matching `text`.
pub fn first_match<'r, T: Copy>(rules: &'r [Rule<T>], text: &str) -> Option<&'r Rule<T>> {
    rules.iter().find(|r| r.is_match(text))
}

/// The last `chars` characters of `text`.
pub fn tail(text: &str, chars: usize) -> &str {
    match text.char_indices().rev().nth(chars.saturating_sub(1)) {
        Some((i, _)) => &text[i..],
        None => text,
    }
}

pub fn outcome_rules(category: Category) -> &'static [Rule<Outcome>] {
    match category {
        Category::Hearing => &HEARING_OUTCOMES,
        Category::Appeal => &APPEAL_OUTCOMES,
    }
}

pub fn classify_outcome(category: Category, text: &str) -> Outcome {
    first_match(outcome_rules(category), tail(text, TAIL_CHARS))
        .map(|r| r.label)
        .unwrap_or(Outcome::Unknown)
}

pub fn classify_clearance_effect(text: &str) -> Option<ClearanceEffect> {
    first_match(&CLEARANCE_EFFECT, tail(text, TAIL_CHARS)).map(|r| r.label)
}

// ── Hearing ──

static HEARING_OUTCOMES: LazyLock<Vec<Rule<Outcome>>> = LazyLock::new(|| {
    use Outcome::*;
    compile(&[
        (Revoked, r"(?:security\s+)?clearance\s+is\s+revoked"),
        (Revoked, r"access\s+to\s+classified\s+information\s+is\s+revoked"),
        (Revoked, r"eligibility\s+[^.]{0,50}\s+is\s+revoked"),
        (Revoked, r"(?:eligibility|clearance)\s+revoked"),
        // Negated conclusions contain their positive form.
        (Denied, r"not\s+clearly\s+consistent[\s\d]*with\s+the\s+national\s+interest"),
        (Denied, r"not\s+clearly\s+consistent[\s\d]*with\s+the\s+interests\s+of\s+national\s+security"),
        (Denied, r"not\s+clearly\s+consistent[\s\d]*with\s+the\s+security\s+interests"),
        (Denied, r"not\s+clearly\s+consistent\s+with\s+national\s+security"),
        (Denied, r"clearly\s+not\s+consistent[\s\d]*with\s+the\s+national\s+interest"),
        (Denied, r"clearly\s+consistent[\s\d]*with\s+the\s+national\s+interests?\s+to\s+deny"),
        (Denied, r"eligibility\s+for\s+access\s+to\s+classified\s+information\s+is\s+denied"),
        (Denied, r"(?:security\s+)?clearance\s+(?:eligibility\s+)?is\s+denied"),
        (Denied, r"national\s+security\s+eligibility\s+is\s+denied"),
        (Denied, r"trustworthiness\s+(?:designation\s+)?is\s+denied"),
        (Denied, r"eligibility\s+for\s+(?:a\s+)?(?:adp|public\s+trust)\s+position\s+(?:is\s+)?denied"),
        (Denied, r"(?:adp|public\s+trust)\s+position\s+(?:is\s+)?denied"),
        (Denied, r"eligibility\s+for\s+(?:assignment\s+to\s+)?sensitive\s+(?:positions?|duties)\s+is\s+denied"),
        (Denied, r"eligibility\s+[^.]{0,50}\s+is\s+denied"),
        (Granted, r"eligibility\s+for\s+access\s+to\s+classified\s+information\s+is\s+granted"),
        (Granted, r"(?:security\s+)?clearance\s+(?:eligibility\s+)?is\s+granted"),
        (Granted, r"national\s+security\s+eligibility\s+is\s+granted"),
        (Granted, r"trustworthiness\s+(?:designation\s+)?(?:is\s+)?granted"),
        (Granted, r"eligibility\s+for\s+(?:a\s+)?(?:adp|public\s+trust)\s+position\s+(?:is\s+)?granted"),
        (Granted, r"(?:adp|public\s+trust)\s+position\s+(?:is\s+)?granted"),
        (Granted, r"request\s+for\s+(?:a\s+)?position\s+of\s+trust\s+is\s+granted"),
        (Granted, r"eligibility\s+for\s+(?:assignment\s+to\s+)?sensitive\s+(?:positions?|duties)\s+is\s+granted"),
        (Granted, r"eligibility\s+[^.]{0,50}\s+is\s+granted"),
        (Granted, r"clearly\s+consistent[\s\d]*with\s+the\s+national\s+interests?\s+to\s+(?:grant|continue|make)"),
        (Granted, r"clearly\s+consistent[\s\d]*with\s+the\s+interests\s+of\s+national\s+security"),
        (Granted, r"clearly\s+consistent[\s\d]*with\s+the\s+security\s+interests"),
        (Granted, r"clearly\s+consistent\s+with\s+national\s+security\s+to\s+(?:approve|grant|continue)"),
        (Granted, r"clearly\s+consistent\s+to\s+grant"),
        (Denied, r"record\s+(?:evidence\s+)?(?:is\s+)?not\s+sufficient\s+to\s+mitigate"),
        (Denied, r"unfavorable\s+determination"),
        (Granted, r"favorable\s+determination"),
        (Denied, r"(?:eligibility|clearance)\s+denied"),
        (Granted, r"(?:eligibility|clearance)\s+granted"),
    ])
});

// ── Appeal ──

static APPEAL_OUTCOMES: LazyLock<Vec<Rule<Outcome>>> = LazyLock::new(|| {
    use Outcome::*;
    compile(&[
        (Remanded, r"remanded\s+to\s+the\s+administrative\s+judge"),
        (Remanded, r"remanded\s+for\s+(?:further|additional)\s+proceedings"),
        (Remanded, r"(?:case|decision)\s+(?:is\s+)?remanded"),
        (Dismissed, r"appeal\s+(?:is\s+(?:hereby\s+)?)?dismissed"),
        (Reversed, r"not\s+sustainable[^.]*reversed"),
        (Reversed, r"determination\s+cannot\s+be\s+sustained"),
        (Reversed, r"decision\s+(?:is\s+)?reversed"),
        (Affirmed, r"decision\s+(?:is\s+)?affirmed"),
        (Affirmed, r"affirms?\s+the\s+(?:judge'?s\s+)?decision"),
    ])
});

static CLEARANCE_EFFECT: LazyLock<Vec<Rule<ClearanceEffect>>> = LazyLock::new(|| {
    use ClearanceEffect::*;
    compile(&[
        (Remanded, r"(?:case|decision)\s+(?:is\s+)?remanded"),
        (Remanded, r"remanded\s+(?:to\s+the\s+administrative\s+judge|for\s+(?:further|additional)\s+proceedings)"),
        (Granted, r"(?:adverse|unfavorable)\s+decision\s+(?:is\s+)?reversed"),
        (Granted, r"adverse\s+findings\s+are\s+not\s+sustainable"),
        (Granted, r"\bfavorable\s+decision\s+(?:is\s+)?affirmed"),
        (Denied, r"(?:adverse|unfavorable)\s+decision\s+(?:is\s+)?affirmed"),
        (Denied, r"\bfavorable\s+decision\s+(?:is\s+)?reversed"),
        (Denied, r"\bfavorable\s+(?:security\s+)?(?:clearance\s+)?determination\s+cannot\s+be\s+sustained"),
        (Denied, r"decision\s+(?:is\s+)?not\s+sustainable[^.]*reversed"),
        (Denied, r"runs\s+contrary\s+to\s+the\s+(?:weight\s+of\s+the\s+)?record\s+evidence[^.]*not\s+sustainable"),
    ])
});

// ── Guidelines ──

/// SEAD-4 adjudicative guidelines by name, letter, or AG paragraph.
/// AG ¶ 2 (whole person) maps to no guideline.
static GUIDELINES: LazyLock<Vec<Rule<char>>> = LazyLock::new(|| {
    compile(&[
        ('A', r"Guidelines?\s*A\b|Allegiance\s+to\s+the\s+United\s+States|AG\s*¶\s*[34]\b"),
        ('B', r"Guidelines?\s*B\b|Foreign\s*Influence|AG\s*¶\s*[67]\b"),
        ('C', r"Guidelines?\s*C\b|Foreign\s*Preference|AG\s*¶\s*(?:9|10)\b"),
        ('D', r"Guidelines?\s*D\b|Sexual\s*Behavior|AG\s*¶\s*1[23]\b"),
        ('E', r"Guidelines?\s*E\b|Personal\s*Conduct|AG\s*¶\s*1[56]\b"),
        ('F', r"Guidelines?\s*F\b|Financial\s*Considerations|AG\s*¶\s*(?:18|19|20)\b"),
        ('G', r"Guidelines?\s*G\b|Alcohol\s*Consumption|AG\s*¶\s*2[12]\b"),
        ('H', r"Guidelines?\s*H\b|Drug\s*Involvement|AG\s*¶\s*2[456]\b"),
        ('I', r"Guidelines?\s*I\b|Psychological\s*Conditions|AG\s*¶\s*2[78]\b"),
        ('J', r"Guidelines?\s*J\b|Criminal\s*Conduct|AG\s*¶\s*3[012]\b"),
        ('K', r"Guidelines?\s*K\b|Handling\s*Protected\s*Information|AG\s*¶\s*3[34]\b"),
        ('L', r"Guidelines?\s*L\b|Outside\s*Activities|AG\s*¶\s*3[67]\b"),
        ('M', r"Guidelines?\s*M\b|Use\s*of\s*Information\s*Technology|AG\s*¶\s*(?:39|40)\b"),
    ])
});

/// Every guideline letter referenced anywhere in `text`.
pub fn guideline_codes(text: &str) -> std::collections::BTreeSet<char> {
    GUIDELINES
        .iter()
        .filter(|r| r.is_match(text))
        .map(|r| r.label)
        .collect()
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn hearing(text: &str) -> Outcome {
        classify_outcome(Category::Hearing, text)
    }

    #[test]
    fn specific_rule_beats_general() {
        // "unfavorable determination" also contains "favorable determination".
        let text = "I make an unfavorable determination in this case.";
        let rules = outcome_rules(Category::Hearing);
        let general = rules
            .iter()
            .position(|r| r.pattern == r"favorable\s+determination")
            .unwrap();
        let hit = first_match(rules, text).unwrap();
        assert!(rules[general].is_match(text));
        assert_eq!(hit.label, Outcome::Denied);
        assert_eq!(hit.pattern, r"unfavorable\s+determination");
    }

    #[test]
    fn negation_ordered_before_positive() {
        assert_eq!(
            hearing("It is not clearly consistent with the national interest to grant Applicant eligibility."),
            Outcome::Denied
        );
        assert_eq!(
            hearing("It is clearly consistent\n5\nwith the national interest to grant Applicant eligibility."),
            Outcome::Granted
        );
    }

    #[test]
    fn hearing_vocabulary() {
        assert_eq!(hearing("Eligibility for access to classified information is granted."), Outcome::Granted);
        assert_eq!(hearing("Eligibility for access to classified information is denied."), Outcome::Denied);
        assert_eq!(hearing("Applicant's security clearance is revoked."), Outcome::Revoked);
        assert_eq!(hearing("Eligibility for a public trust position is granted."), Outcome::Granted);
        assert_eq!(hearing("The hearing was held on March 3."), Outcome::Unknown);
    }

    #[test]
    fn only_the_tail_decides() {
        let mut text = String::from("Eligibility for access to classified information is denied. ");
        text.push_str(&"x ".repeat(TAIL_CHARS));
        text.push_str("Eligibility for access to classified information is granted.");
        assert_eq!(hearing(&text), Outcome::Granted);
    }

    #[test]
    fn appeal_vocabulary_and_effect() {
        let appeal = |t: &str| classify_outcome(Category::Appeal, t);
        assert_eq!(appeal("Order\nThe Judge's adverse decision is AFFIRMED."), Outcome::Affirmed);
        assert_eq!(appeal("The Judge's favorable decision is REVERSED."), Outcome::Reversed);
        assert_eq!(appeal("The decision is reversed and the case is remanded to the Administrative Judge."), Outcome::Remanded);
        assert_eq!(appeal("The appeal is dismissed."), Outcome::Dismissed);

        assert_eq!(classify_clearance_effect("The Judge's unfavorable decision is affirmed."), Some(ClearanceEffect::Denied));
        assert_eq!(classify_clearance_effect("The Judge's favorable decision is affirmed."), Some(ClearanceEffect::Granted));
        assert_eq!(classify_clearance_effect("The Judge's unfavorable decision is reversed."), Some(ClearanceEffect::Granted));
        assert_eq!(classify_clearance_effect("The Judge's favorable decision is reversed."), Some(ClearanceEffect::Denied));
        assert_eq!(classify_clearance_effect("Nothing decided here."), None);
    }

    #[test]
    fn guideline_references() {
        let codes = guideline_codes(
            "The SOR alleged security concerns under Guideline F and Personal Conduct. \
             AG ¶ 20(b) applies. Whole-person analysis under AG ¶ 2(d).",
        );
        assert_eq!(codes.into_iter().collect::<String>(), "EF");
        assert!(guideline_codes("Guidelines H and J").contains(&'H'));
        assert!(guideline_codes("This guideline is not").is_empty());
    }

    #[test]
    fn tail_is_char_safe() {
        assert_eq!(tail("¶¶¶abc", 3), "abc");
        assert_eq!(tail("short", 100), "short");
    }
}
