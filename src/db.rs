use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::catalog::CaseKey;
use crate::parser::ParsedCase;

pub const STORE_FILE: &str = "cases.sqlite";

pub fn connect(path: &Path) -> Result<Connection> {
    let conn =
        Connection::open(path).with_context(|| format!("opening store {}", path.display()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cases (
            category       TEXT NOT NULL CHECK(category IN ('hearing','appeal')),
            document_id    TEXT NOT NULL,
            outcome        TEXT NOT NULL,
            inferred_year  INTEGER NOT NULL,
            year_source    TEXT NOT NULL,
            decision_date  TEXT,
            guidelines     TEXT NOT NULL,
            source_url     TEXT NOT NULL,
            parsed_at      TEXT NOT NULL,
            document       TEXT NOT NULL,
            PRIMARY KEY (category, document_id)
        );
        CREATE INDEX IF NOT EXISTS idx_cases_outcome ON cases(outcome);
        CREATE INDEX IF NOT EXISTS idx_cases_year ON cases(inferred_year);
        CREATE INDEX IF NOT EXISTS idx_cases_guidelines ON cases(guidelines);
        ",
    )?;
    Ok(())
}

// ── Writes ──

pub fn insert_cases(conn: &Connection, cases: &[ParsedCase]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut count = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO cases
             (category, document_id, outcome, inferred_year, year_source, decision_date,
              guidelines, source_url, parsed_at, document)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for c in cases {
            let guidelines: String = c.guidelines.iter().collect();
            let document = serde_json::to_string(c)?;
            count += stmt.execute(rusqlite::params![
                c.category.as_str(),
                c.document_id,
                c.outcome.as_str(),
                c.inferred_year,
                c.year_source.as_str(),
                c.decision_date,
                guidelines,
                c.source_url,
                c.parsed_at.to_rfc3339(),
                document,
            ])?;
        }
    }
    tx.commit()?;
    Ok(count)
}

// ── Reads ──

pub fn count_cases(conn: &Connection) -> Result<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM cases", [], |row| row.get(0))?;
    Ok(n as usize)
}

pub fn case_keys(conn: &Connection) -> Result<Vec<CaseKey>> {
    let mut stmt = conn.prepare("SELECT category, document_id FROM cases ORDER BY category, document_id")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter()
        .map(|(cat, id)| Ok((cat.parse().map_err(anyhow::Error::msg)?, id)))
        .collect()
}

/// Full cases decoded from the stored JSON documents.
pub fn fetch_cases(conn: &Connection, limit: Option<usize>) -> Result<Vec<ParsedCase>> {
    let sql = match limit {
        Some(n) => format!("SELECT document FROM cases ORDER BY category, document_id LIMIT {}", n),
        None => "SELECT document FROM cases ORDER BY category, document_id".to_string(),
    };
    let mut stmt = conn.prepare(&sql)?;
    let docs = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    docs.iter()
        .map(|d| serde_json::from_str(d).context("decoding stored case"))
        .collect()
}

pub struct OutcomeRow {
    pub category: String,
    pub outcome: String,
    pub count: usize,
}

pub fn outcome_counts(conn: &Connection) -> Result<Vec<OutcomeRow>> {
    let mut stmt = conn.prepare(
        "SELECT category, outcome, COUNT(*) FROM cases
         GROUP BY category, outcome
         ORDER BY category, COUNT(*) DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(OutcomeRow {
                category: row.get(0)?,
                outcome: row.get(1)?,
                count: row.get::<_, i64>(2)? as usize,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, Category};
    use crate::parser;

    fn case(cat: Category, id: &str, text: &str) -> ParsedCase {
        let entry = CatalogEntry {
            category: cat,
            year: 2021,
            document_id: id.into(),
            retrieval_url: format!("https://doha.test/{id}"),
        };
        parser::classify(text.into(), &entry)
    }

    #[test]
    fn insert_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let conn = connect(&dir.path().join(STORE_FILE)).unwrap();
        init_schema(&conn).unwrap();

        let cases = vec![
            case(Category::Hearing, "21-1", "Eligibility for access to classified information is denied."),
            case(Category::Hearing, "21-2", "Eligibility for access to classified information is granted."),
            case(Category::Appeal, "21-3", "The Judge's adverse decision is AFFIRMED."),
        ];
        assert_eq!(insert_cases(&conn, &cases).unwrap(), 3);
        // Replacing by key does not add rows.
        insert_cases(&conn, &cases[..1]).unwrap();
        assert_eq!(count_cases(&conn).unwrap(), 3);

        let mut stored = fetch_cases(&conn, None).unwrap();
        stored.sort_by(|a, b| a.key().cmp(&b.key()));
        assert_eq!(stored, cases);
        assert!(case_keys(&conn).unwrap().contains(&(Category::Appeal, "21-3".to_string())));

        let outcomes = outcome_counts(&conn).unwrap();
        assert!(outcomes
            .iter()
            .any(|r| r.category == "appeal" && r.outcome == "AFFIRMED" && r.count == 1));
    }
}
