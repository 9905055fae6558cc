//! C5: the statistics store.
//!
//! An append-only log of successful and failed jobs plus maintained
//! per-resource counters, backed by an embedded SQLite database. Emails
//! are optionally anonymised before they ever reach storage.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use bcrypt::Version;
use rusqlite::{params, Connection, OptionalExtension};

use crate::prelude::*;

/// The sentinel `resource_id` whose totals accumulate across every
/// resource.
pub const ALL_RESOURCES: &str = "*";

/// A single row of the `requests` table, as returned by
/// [`StatsStore::get_requests`] (without the surrogate `id` column).
#[derive(Debug, Clone, Serialize)]
pub struct RequestRow {
    pub timestamp: i64,
    pub resource_id: String,
    pub email: String,
    pub domain: String,
    pub count: Option<i64>,
}

/// A single row of the `errors` table, as returned by
/// [`StatsStore::get_errors`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRow {
    pub timestamp: i64,
    pub resource_id: String,
    pub email: String,
    pub message: String,
}

/// Maintained counters for one resource (or [`ALL_RESOURCES`]).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Totals {
    pub requests: i64,
    pub errors: i64,
    pub emails: i64,
}

/// Extract the domain portion of an email address: the substring after
/// the first `@`, empty if `@` is the last character, or the whole
/// string if there's no `@` at all.
pub fn extract_domain(email: &str) -> String {
    match email.find('@') {
        Some(i) => email[i + 1..].to_owned(),
        None => email.to_owned(),
    }
}

fn domain_salt(domain: &str) -> [u8; 16] {
    let mut salt = [0u8; 16];
    let bytes = domain.as_bytes();
    let n = bytes.len().min(16);
    salt[..n].copy_from_slice(&bytes[..n]);
    salt
}

/// Deterministically hash `email`, salted by its `domain`, so that the
/// same (email, domain) pair always produces the same hash and the raw
/// address never has to be stored or compared in the clear.
pub fn anonymize_email(email: &str, domain: &str) -> Result<String> {
    let salt = domain_salt(domain);
    let parts = bcrypt::hash_with_salt(email, 12, salt).context("could not hash email")?;
    Ok(parts.format_for_version(Version::TwoB))
}

/// The statistics store. A single connection guarded by a mutex gives us
/// the "per-process lock around counter updates" the specification calls
/// for if the backend's upsert isn't otherwise atomic.
pub struct StatsStore {
    conn: Mutex<Connection>,
    anonymize: bool,
}

impl StatsStore {
    /// Open (creating if necessary) the statistics database at `path`
    /// (`:memory:` for an ephemeral store) and ensure its schema exists.
    pub fn open(path: &str, anonymize: bool) -> Result<StatsStore> {
        let conn = Connection::open(path)
            .with_context(|| format!("could not open statistics database {path}"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                resource_id TEXT NOT NULL,
                email TEXT NOT NULL,
                domain TEXT NOT NULL,
                count INTEGER
            );
            CREATE TABLE IF NOT EXISTS errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                resource_id TEXT NOT NULL,
                email TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS totals (
                resource_id TEXT PRIMARY KEY,
                requests INTEGER NOT NULL DEFAULT 0,
                errors INTEGER NOT NULL DEFAULT 0,
                emails INTEGER NOT NULL DEFAULT 0
            );",
        )
        .context("could not create statistics schema")?;
        Ok(StatsStore {
            conn: Mutex::new(conn),
            anonymize,
        })
    }

    fn storage_email(&self, email: &str, domain: &str) -> Result<String> {
        if self.anonymize {
            anonymize_email(email, domain)
        } else {
            Ok(email.to_owned())
        }
    }

    fn bump_total(conn: &Connection, resource_id: &str, column: &str) -> Result<()> {
        conn.execute(
            "INSERT INTO totals (resource_id) VALUES (?1) ON CONFLICT(resource_id) DO NOTHING",
            params![resource_id],
        )
        .context("could not seed totals row")?;
        conn.execute(
            &format!("UPDATE totals SET {column} = {column} + 1 WHERE resource_id = ?1"),
            params![resource_id],
        )
        .context("could not increment totals")?;
        Ok(())
    }

    /// Record one successful job.
    #[instrument(skip(self), level = "debug")]
    pub fn log_request(&self, resource_id: &str, email: &str, count: Option<i64>) -> Result<()> {
        let domain = extract_domain(email);
        let stored_email = self.storage_email(email, &domain)?;

        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tx = conn
            .unchecked_transaction()
            .context("could not start transaction")?;

        let has_email_anywhere: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM requests WHERE email = ?1 LIMIT 1",
                params![stored_email],
                |row| row.get(0),
            )
            .optional()
            .context("could not check prior requests")?;
        if has_email_anywhere.is_none() {
            Self::bump_total(&tx, ALL_RESOURCES, "emails")?;
        }

        let has_email_for_resource: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM requests WHERE email = ?1 AND resource_id = ?2 LIMIT 1",
                params![stored_email, resource_id],
                |row| row.get(0),
            )
            .optional()
            .context("could not check prior requests for resource")?;
        if has_email_for_resource.is_none() {
            Self::bump_total(&tx, resource_id, "emails")?;
        }

        Self::bump_total(&tx, ALL_RESOURCES, "requests")?;
        Self::bump_total(&tx, resource_id, "requests")?;

        tx.execute(
            "INSERT INTO requests (timestamp, resource_id, email, domain, count)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![now(), resource_id, stored_email, domain, count],
        )
        .context("could not insert request row")?;

        tx.commit().context("could not commit request log")?;
        Ok(())
    }

    /// Record one failed job. `message` is expected to carry the full
    /// error chain / stack trace.
    #[instrument(skip(self, message), level = "debug")]
    pub fn log_error(&self, resource_id: &str, email: &str, message: &str) -> Result<()> {
        let domain = extract_domain(email);
        let stored_email = self.storage_email(email, &domain)?;

        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let tx = conn
            .unchecked_transaction()
            .context("could not start transaction")?;

        Self::bump_total(&tx, ALL_RESOURCES, "errors")?;
        Self::bump_total(&tx, resource_id, "errors")?;

        tx.execute(
            "INSERT INTO errors (timestamp, resource_id, email, message) VALUES (?1, ?2, ?3, ?4)",
            params![now(), resource_id, stored_email, message],
        )
        .context("could not insert error row")?;

        tx.commit().context("could not commit error log")?;
        Ok(())
    }

    /// Anonymise `email` the same way the store would before comparing it
    /// against stored rows, for use as a query filter.
    pub fn filter_email(&self, email: &str) -> Result<String> {
        let domain = extract_domain(email);
        self.storage_email(email, &domain)
    }

    /// Paginated request log, newest first.
    pub fn get_requests(
        &self,
        offset: i64,
        limit: i64,
        resource_id: Option<&str>,
        email: Option<&str>,
    ) -> Result<Vec<RequestRow>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut sql = String::from(
            "SELECT timestamp, resource_id, email, domain, count FROM requests WHERE 1=1",
        );
        if resource_id.is_some() {
            sql.push_str(" AND resource_id = ?1");
        }
        if email.is_some() {
            sql.push_str(if resource_id.is_some() { " AND email = ?2" } else { " AND email = ?1" });
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
        sql.push_str(&(limit.to_string()));
        sql.push_str(" OFFSET ");
        sql.push_str(&offset.to_string());

        let mut stmt = conn.prepare(&sql).context("could not prepare query")?;
        let rows = match (resource_id, email) {
            (Some(r), Some(e)) => stmt.query_map(params![r, e], Self::row_to_request),
            (Some(r), None) => stmt.query_map(params![r], Self::row_to_request),
            (None, Some(e)) => stmt.query_map(params![e], Self::row_to_request),
            (None, None) => stmt.query_map(params![], Self::row_to_request),
        }
        .context("could not run query")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("could not read request rows")
    }

    fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
        Ok(RequestRow {
            timestamp: row.get(0)?,
            resource_id: row.get(1)?,
            email: row.get(2)?,
            domain: row.get(3)?,
            count: row.get(4)?,
        })
    }

    /// Paginated error log, newest first.
    pub fn get_errors(
        &self,
        offset: i64,
        limit: i64,
        resource_id: Option<&str>,
        email: Option<&str>,
    ) -> Result<Vec<ErrorRow>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut sql =
            String::from("SELECT timestamp, resource_id, email, message FROM errors WHERE 1=1");
        if resource_id.is_some() {
            sql.push_str(" AND resource_id = ?1");
        }
        if email.is_some() {
            sql.push_str(if resource_id.is_some() { " AND email = ?2" } else { " AND email = ?1" });
        }
        sql.push_str(" ORDER BY timestamp DESC LIMIT ");
        sql.push_str(&limit.to_string());
        sql.push_str(" OFFSET ");
        sql.push_str(&offset.to_string());

        let mut stmt = conn.prepare(&sql).context("could not prepare query")?;
        let rows = match (resource_id, email) {
            (Some(r), Some(e)) => stmt.query_map(params![r, e], Self::row_to_error),
            (Some(r), None) => stmt.query_map(params![r], Self::row_to_error),
            (None, Some(e)) => stmt.query_map(params![e], Self::row_to_error),
            (None, None) => stmt.query_map(params![], Self::row_to_error),
        }
        .context("could not run query")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("could not read error rows")
    }

    fn row_to_error(row: &rusqlite::Row<'_>) -> rusqlite::Result<ErrorRow> {
        Ok(ErrorRow {
            timestamp: row.get(0)?,
            resource_id: row.get(1)?,
            email: row.get(2)?,
            message: row.get(3)?,
        })
    }

    /// Maintained counters, optionally restricted to one resource.
    pub fn get_totals(&self, resource_id: Option<&str>) -> Result<HashMap<String, Totals>> {
        let conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = HashMap::new();
        if let Some(r) = resource_id {
            let row = conn
                .query_row(
                    "SELECT resource_id, requests, errors, emails FROM totals WHERE resource_id = ?1",
                    params![r],
                    Self::row_to_totals,
                )
                .optional()
                .context("could not read totals")?;
            if let Some((id, totals)) = row {
                out.insert(id, totals);
            }
        } else {
            let mut stmt = conn
                .prepare("SELECT resource_id, requests, errors, emails FROM totals")
                .context("could not prepare totals query")?;
            let rows = stmt
                .query_map(params![], Self::row_to_totals)
                .context("could not run totals query")?;
            for row in rows {
                let (id, totals) = row.context("could not read totals row")?;
                out.insert(id, totals);
            }
        }
        Ok(out)
    }

    fn row_to_totals(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, Totals)> {
        Ok((
            row.get(0)?,
            Totals {
                requests: row.get(1)?,
                errors: row.get(2)?,
                emails: row.get(3)?,
            },
        ))
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction_matches_spec_edge_cases() {
        assert_eq!(extract_domain("a@x.com"), "x.com");
        assert_eq!(extract_domain("a@"), "");
        assert_eq!(extract_domain("nodomain"), "nodomain");
    }

    #[test]
    fn stats_conservation_across_resources() {
        let store = StatsStore::open(":memory:", false).unwrap();
        store.log_request("r1", "a@x.com", Some(10)).unwrap();
        store.log_request("r1", "b@x.com", Some(5)).unwrap();
        store.log_request("r2", "a@x.com", Some(1)).unwrap();

        let totals = store.get_totals(None).unwrap();
        assert_eq!(totals[ALL_RESOURCES].requests, 3);
        assert_eq!(totals["r1"].requests, 2);
        assert_eq!(totals["r2"].requests, 1);
    }

    #[test]
    fn unique_emailer_counting() {
        let store = StatsStore::open(":memory:", false).unwrap();
        store.log_request("r1", "a@x.com", None).unwrap();
        store.log_request("r1", "a@x.com", None).unwrap();
        store.log_request("r1", "b@x.com", None).unwrap();
        store.log_request("r2", "a@x.com", None).unwrap();

        let totals = store.get_totals(None).unwrap();
        assert_eq!(totals["r1"].emails, 2);
        assert_eq!(totals[ALL_RESOURCES].emails, 2);
    }

    #[test]
    fn anonymisation_hides_raw_email_but_keeps_domain() {
        let store = StatsStore::open(":memory:", true).unwrap();
        store.log_request("r", "a@x.com", None).unwrap();

        let filter = store.filter_email("a@x.com").unwrap();
        let rows = store.get_requests(0, 10, None, Some(&filter)).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].domain, "x.com");
        assert_ne!(rows[0].email, "a@x.com");
        assert!(rows[0].email.starts_with("$2b$12$"));
    }

    #[test]
    fn errors_increment_their_own_counters() {
        let store = StatsStore::open(":memory:", false).unwrap();
        store.log_error("r1", "a@x.com", "boom").unwrap();
        let totals = store.get_totals(None).unwrap();
        assert_eq!(totals[ALL_RESOURCES].errors, 1);
        assert_eq!(totals["r1"].errors, 1);
    }
}
