//! SQLite-backed record store for postings, matched people, and scan positions.
//!
//! The store is append-only from the pipeline's perspective: inserts use
//! `INSERT OR IGNORE` keyed by each entity's uniqueness constraint, so
//! re-persisting an already-seen record is a silent no-op. Uniqueness
//! enforcement is also the only concurrency guard against duplicate
//! persistence when multiple producers run at once.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use itrak_core::{MatchedPerson, Posting};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::debug;

pub const CRATE_NAME: &str = "itrak-store";

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct Store {
    conn: Connection,
}

/// Optional shape shared by posting and people reads.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only records discovered within the trailing N days.
    pub days: Option<i64>,
    /// Case-insensitive organization substring.
    pub organization: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub postings: usize,
    pub people: usize,
    pub postings_last_week: usize,
    pub people_last_week: usize,
}

/// One row of the combined CSV export: a posting joined with any matched
/// person at the same organization.
#[derive(Debug, Clone)]
pub struct OpportunityRow {
    pub organization: String,
    pub role: String,
    pub location: String,
    pub application_link: String,
    pub posting_discovered_at: DateTime<Utc>,
    pub person_name: Option<String>,
    pub person_headline: Option<String>,
    pub person_profile_url: Option<String>,
    pub person_discovered_at: Option<DateTime<Utc>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Insert-or-ignore keyed by (organization, role, application_link).
    /// Returns whether a new row was created.
    pub fn insert_posting(&self, posting: &Posting) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO postings
             (organization, role, location, application_link, source_id, change_id, section, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                posting.organization,
                posting.role,
                posting.location,
                posting.application_link,
                posting.source_id,
                posting.change_id,
                posting.section,
                format_ts(posting.discovered_at),
            ],
        )?;
        if changed > 0 {
            debug!(
                organization = %posting.organization,
                role = %posting.role,
                "saved new posting"
            );
        }
        Ok(changed > 0)
    }

    /// Insert a batch in one transaction; returns the number of new rows.
    pub fn insert_postings(&self, postings: &[Posting]) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO postings
                 (organization, role, location, application_link, source_id, change_id, section, discovered_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for posting in postings {
                inserted += stmt.execute(rusqlite::params![
                    posting.organization,
                    posting.role,
                    posting.location,
                    posting.application_link,
                    posting.source_id,
                    posting.change_id,
                    posting.section,
                    format_ts(posting.discovered_at),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Insert-or-ignore keyed by profile URL. Returns whether a new row was
    /// created.
    pub fn insert_person(&self, person: &MatchedPerson) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO people
             (name, headline, organization, profile_url, affiliation_confirmed, discovered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                person.name,
                person.headline,
                person.organization,
                person.profile_url,
                person.affiliation_confirmed,
                format_ts(person.discovered_at),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn postings(&self, filter: &RecordFilter) -> Result<Vec<Posting>> {
        let (where_clause, params) = filter_clause(filter);
        let sql = format!(
            "SELECT organization, role, location, application_link, source_id, change_id, section, discovered_at
             FROM postings{where_clause}
             ORDER BY discovered_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok(Posting {
                    organization: row.get(0)?,
                    role: row.get(1)?,
                    location: row.get(2)?,
                    application_link: row.get(3)?,
                    source_id: row.get(4)?,
                    change_id: row.get(5)?,
                    section: row.get(6)?,
                    discovered_at: ts_from_sql(7, row.get(7)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn people(&self, filter: &RecordFilter) -> Result<Vec<MatchedPerson>> {
        let (where_clause, params) = filter_clause(filter);
        let sql = format!(
            "SELECT name, headline, organization, profile_url, affiliation_confirmed, discovered_at
             FROM people{where_clause}
             ORDER BY discovered_at DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), |row| {
                Ok(MatchedPerson {
                    name: row.get(0)?,
                    headline: row.get(1)?,
                    organization: row.get(2)?,
                    profile_url: row.get(3)?,
                    affiliation_confirmed: row.get(4)?,
                    discovered_at: ts_from_sql(5, row.get(5)?)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Distinct organizations with at least one posting discovered in the
    /// trailing 24 hours. Seeds the work queue after a scan.
    pub fn organizations_with_recent_postings(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT organization FROM postings
             WHERE discovered_at > datetime('now', '-1 day')",
        )?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn counts(&self) -> Result<Counts> {
        let postings: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM postings", [], |r| r.get(0))?;
        let people: usize = self
            .conn
            .query_row("SELECT COUNT(*) FROM people", [], |r| r.get(0))?;
        let postings_last_week: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM postings WHERE discovered_at > datetime('now', '-7 days')",
            [],
            |r| r.get(0),
        )?;
        let people_last_week: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM people WHERE discovered_at > datetime('now', '-7 days')",
            [],
            |r| r.get(0),
        )?;
        Ok(Counts {
            postings,
            people,
            postings_last_week,
            people_last_week,
        })
    }

    /// Organizations and posting counts, most postings first.
    pub fn postings_by_organization(&self, limit: usize) -> Result<Vec<(String, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT organization, COUNT(*) AS n FROM postings
             GROUP BY organization ORDER BY n DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Postings LEFT JOINed with matched people at the same organization,
    /// newest first. Feeds the CSV export.
    pub fn opportunity_rows(&self) -> Result<Vec<OpportunityRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.organization, i.role, i.location, i.application_link, i.discovered_at,
                    p.name, p.headline, p.profile_url, p.discovered_at
             FROM postings i
             LEFT JOIN people p ON i.organization = p.organization
             ORDER BY i.discovered_at DESC, p.discovered_at DESC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let person_ts: Option<String> = row.get(8)?;
                Ok(OpportunityRow {
                    organization: row.get(0)?,
                    role: row.get(1)?,
                    location: row.get(2)?,
                    application_link: row.get(3)?,
                    posting_discovered_at: ts_from_sql(4, row.get(4)?)?,
                    person_name: row.get(5)?,
                    person_headline: row.get(6)?,
                    person_profile_url: row.get(7)?,
                    person_discovered_at: person_ts.map(|s| ts_from_sql(8, s)).transpose()?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Last-processed change identifier for a source, if it has ever been
    /// scanned successfully.
    pub fn processed_position(&self, source_id: &str) -> Result<Option<String>> {
        let position = self
            .conn
            .query_row(
                "SELECT last_change_id FROM scan_positions WHERE source_id = ?1",
                [source_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(position)
    }

    /// Overwrite the position after a scan completes without a fetch-level
    /// error. A failed scan never reaches this call, leaving the prior
    /// position intact.
    pub fn set_processed_position(&self, source_id: &str, change_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO scan_positions (source_id, last_change_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source_id) DO UPDATE SET
               last_change_id = excluded.last_change_id,
               updated_at = excluded.updated_at",
            rusqlite::params![source_id, change_id, format_ts(Utc::now())],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS postings (
            id               INTEGER PRIMARY KEY,
            organization     TEXT NOT NULL,
            role             TEXT NOT NULL,
            location         TEXT NOT NULL,
            application_link TEXT NOT NULL,
            source_id        TEXT NOT NULL,
            change_id        TEXT NOT NULL,
            section          TEXT NOT NULL DEFAULT '',
            discovered_at    TEXT NOT NULL,
            UNIQUE(organization, role, application_link)
        );
        CREATE INDEX IF NOT EXISTS idx_postings_discovered ON postings(discovered_at);
        CREATE INDEX IF NOT EXISTS idx_postings_organization ON postings(organization);

        CREATE TABLE IF NOT EXISTS people (
            id                    INTEGER PRIMARY KEY,
            name                  TEXT NOT NULL,
            headline              TEXT NOT NULL,
            organization          TEXT NOT NULL,
            profile_url           TEXT NOT NULL UNIQUE,
            affiliation_confirmed INTEGER NOT NULL DEFAULT 0,
            discovered_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_people_organization ON people(organization);

        CREATE TABLE IF NOT EXISTS scan_positions (
            source_id      TEXT PRIMARY KEY,
            last_change_id TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn filter_clause(filter: &RecordFilter) -> (String, Vec<Box<dyn rusqlite::types::ToSql>>) {
    let mut conditions = Vec::new();
    let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

    if let Some(days) = filter.days {
        conditions.push(format!(
            "discovered_at > datetime('now', ?{})",
            params.len() + 1
        ));
        params.push(Box::new(format!("-{days} days")));
    }
    if let Some(org) = &filter.organization {
        conditions.push(format!(
            "organization LIKE '%' || ?{} || '%'",
            params.len() + 1
        ));
        params.push(Box::new(org.clone()));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    (where_clause, params)
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn ts_from_sql(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(&raw, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn posting(organization: &str, role: &str, link: &str) -> Posting {
        Posting {
            organization: organization.to_string(),
            role: role.to_string(),
            location: "Seattle, WA".to_string(),
            application_link: link.to_string(),
            source_id: "SimplifyJobs-Summer2026-Internships".to_string(),
            change_id: "abc123".to_string(),
            section: "## Software Engineering".to_string(),
            discovered_at: Utc::now(),
        }
    }

    fn person(name: &str, organization: &str, url: &str) -> MatchedPerson {
        MatchedPerson {
            name: name.to_string(),
            headline: "Software Engineer".to_string(),
            organization: organization.to_string(),
            profile_url: url.to_string(),
            affiliation_confirmed: true,
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn duplicate_posting_triple_is_a_silent_noop() {
        let store = Store::open_in_memory().unwrap();
        let p = posting("Acme", "Software Engineer Intern", "https://a.co/apply");

        assert!(store.insert_posting(&p).unwrap());
        assert!(!store.insert_posting(&p).unwrap());
        assert_eq!(store.counts().unwrap().postings, 1);
    }

    #[test]
    fn different_link_is_a_distinct_posting() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_posting(&posting("Acme", "Intern", "https://a.co/1"))
            .unwrap();
        store
            .insert_posting(&posting("Acme", "Intern", "https://a.co/2"))
            .unwrap();
        assert_eq!(store.counts().unwrap().postings, 2);
    }

    #[test]
    fn rediscovered_person_is_a_silent_noop() {
        let store = Store::open_in_memory().unwrap();
        let p = person("Ada Lovelace", "Acme", "https://example.com/in/ada");

        assert!(store.insert_person(&p).unwrap());
        assert!(!store.insert_person(&p).unwrap());
        assert_eq!(store.counts().unwrap().people, 1);
    }

    #[test]
    fn batch_insert_reports_only_new_rows() {
        let store = Store::open_in_memory().unwrap();
        let rows = vec![
            posting("Acme", "Intern", "https://a.co/1"),
            posting("Acme", "Intern", "https://a.co/1"),
            posting("Globex", "Intern", "https://g.co/1"),
        ];
        assert_eq!(store.insert_postings(&rows).unwrap(), 2);
    }

    #[test]
    fn recent_organizations_respect_the_24_hour_window() {
        let store = Store::open_in_memory().unwrap();
        let mut old = posting("Stale Corp", "Intern", "https://s.co/1");
        old.discovered_at = Utc::now() - Duration::days(3);
        store.insert_posting(&old).unwrap();
        store
            .insert_posting(&posting("Acme", "Intern", "https://a.co/1"))
            .unwrap();

        let orgs = store.organizations_with_recent_postings().unwrap();
        assert_eq!(orgs, vec!["Acme".to_string()]);
    }

    #[test]
    fn posting_reads_round_trip_and_filter_by_organization() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_posting(&posting("Acme", "Software Engineer Intern", "https://a.co/1"))
            .unwrap();
        store
            .insert_posting(&posting("Globex", "Data Intern", "https://g.co/1"))
            .unwrap();

        let all = store.postings(&RecordFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store
            .postings(&RecordFilter {
                organization: Some("acme".to_string()),
                ..RecordFilter::default()
            })
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].organization, "Acme");
        assert_eq!(filtered[0].section, "## Software Engineering");
    }

    #[test]
    fn day_window_filter_excludes_older_records() {
        let store = Store::open_in_memory().unwrap();
        let mut old = posting("Stale Corp", "Intern", "https://s.co/1");
        old.discovered_at = Utc::now() - Duration::days(30);
        store.insert_posting(&old).unwrap();
        store
            .insert_posting(&posting("Acme", "Intern", "https://a.co/1"))
            .unwrap();

        let recent = store
            .postings(&RecordFilter {
                days: Some(7),
                ..RecordFilter::default()
            })
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].organization, "Acme");
    }

    #[test]
    fn organization_counts_are_ordered_descending() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_posting(&posting("Acme", "Intern A", "https://a.co/1"))
            .unwrap();
        store
            .insert_posting(&posting("Acme", "Intern B", "https://a.co/2"))
            .unwrap();
        store
            .insert_posting(&posting("Globex", "Intern", "https://g.co/1"))
            .unwrap();

        let top = store.postings_by_organization(5).unwrap();
        assert_eq!(top[0], ("Acme".to_string(), 2));
        assert_eq!(top[1], ("Globex".to_string(), 1));
    }

    #[test]
    fn opportunity_rows_join_people_by_organization() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_posting(&posting("Acme", "Intern", "https://a.co/1"))
            .unwrap();
        store
            .insert_posting(&posting("Globex", "Intern", "https://g.co/1"))
            .unwrap();
        store
            .insert_person(&person("Ada Lovelace", "Acme", "https://example.com/in/ada"))
            .unwrap();

        let rows = store.opportunity_rows().unwrap();
        assert_eq!(rows.len(), 2);
        let acme = rows.iter().find(|r| r.organization == "Acme").unwrap();
        assert_eq!(acme.person_name.as_deref(), Some("Ada Lovelace"));
        let globex = rows.iter().find(|r| r.organization == "Globex").unwrap();
        assert!(globex.person_name.is_none());
    }

    #[test]
    fn processed_position_is_absent_then_overwritten() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.processed_position("repo").unwrap(), None);

        store.set_processed_position("repo", "aaa").unwrap();
        assert_eq!(
            store.processed_position("repo").unwrap().as_deref(),
            Some("aaa")
        );

        store.set_processed_position("repo", "bbb").unwrap();
        assert_eq!(
            store.processed_position("repo").unwrap().as_deref(),
            Some("bbb")
        );
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("itrak.sqlite");
        {
            let store = Store::open(&path).unwrap();
            store
                .insert_posting(&posting("Acme", "Intern", "https://a.co/1"))
                .unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.counts().unwrap().postings, 1);
    }
}
