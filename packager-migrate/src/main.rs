#![deny(unsafe_code)]

//! `packager-migrate`: one-shot tool that rehashes an existing, non-
//! anonymised statistics database in place after `ANONYMIZE_EMAILS` is
//! turned on.
//!
//! This must only be run once, against a database that was populated
//! while anonymisation was off. Running it twice would hash already-
//! hashed values, and there is no way to recover the original email
//! from a hash to undo it.

use std::collections::HashMap;

use clap::Parser;
use packager_common::prelude::*;
use packager_common::stats::{anonymize_email, extract_domain};
use rusqlite::{params, Connection};

#[derive(Debug, Parser)]
#[command(about = "Rehash a pre-existing, non-anonymised stats database in place.")]
struct Opt {
    /// Path to the SQLite statistics database to migrate.
    database: String,

    /// Report what would change without writing anything.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    packager_common::tracing_support::init_tracing()?;
    let opt = Opt::parse();

    let conn = Connection::open(&opt.database)
        .with_context(|| format!("could not open {}", opt.database))?;

    let mut cache: HashMap<String, String> = HashMap::new();
    let requests = migrate_requests(&conn, &mut cache)?;
    let errors = migrate_errors(&conn, &mut cache)?;

    if opt.dry_run {
        for (id, email, domain) in &requests {
            info!(table = "requests", id, domain, hashed = %email, "would update");
        }
        for (id, email) in &errors {
            info!(table = "errors", id, hashed = %email, "would update");
        }
    } else {
        let tx = conn
            .unchecked_transaction()
            .context("could not start migration transaction")?;
        for (id, email, domain) in &requests {
            tx.execute(
                "UPDATE requests SET email = ?1, domain = ?2 WHERE id = ?3",
                params![email, domain, id],
            )
            .context("could not update requests row")?;
        }
        for (id, email) in &errors {
            tx.execute(
                "UPDATE errors SET email = ?1 WHERE id = ?2",
                params![email, id],
            )
            .context("could not update errors row")?;
        }
        tx.commit().context("could not commit migration")?;
    }

    info!(
        requests = requests.len(),
        errors = errors.len(),
        dry_run = opt.dry_run,
        "migration complete"
    );
    Ok(())
}

/// Returns `(row id, hashed email, domain)` for every row in `requests`.
fn migrate_requests(
    conn: &Connection,
    cache: &mut HashMap<String, String>,
) -> Result<Vec<(i64, String, String)>> {
    let mut stmt = conn
        .prepare("SELECT id, email FROM requests")
        .context("could not prepare requests scan")?;
    let rows = stmt
        .query_map(params![], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .context("could not scan requests")?;

    let mut out = Vec::new();
    for row in rows {
        let (id, email) = row.context("could not read requests row")?;
        let email = email.to_lowercase();
        let domain = extract_domain(&email);
        let hashed = hashed_email(cache, &email, &domain)?;
        out.push((id, hashed, domain));
    }
    Ok(out)
}

/// Returns `(row id, hashed email)` for every row in `errors`.
fn migrate_errors(
    conn: &Connection,
    cache: &mut HashMap<String, String>,
) -> Result<Vec<(i64, String)>> {
    let mut stmt = conn
        .prepare("SELECT id, email FROM errors")
        .context("could not prepare errors scan")?;
    let rows = stmt
        .query_map(params![], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .context("could not scan errors")?;

    let mut out = Vec::new();
    for row in rows {
        let (id, email) = row.context("could not read errors row")?;
        let email = email.to_lowercase();
        let domain = extract_domain(&email);
        let hashed = hashed_email(cache, &email, &domain)?;
        out.push((id, hashed));
    }
    Ok(out)
}

/// Hash `email`, memoising by the raw (lowercased) address so repeat
/// requesters only cost one bcrypt call.
fn hashed_email(cache: &mut HashMap<String, String>, email: &str, domain: &str) -> Result<String> {
    if let Some(hashed) = cache.get(email) {
        return Ok(hashed.clone());
    }
    let hashed = anonymize_email(email, domain)?;
    cache.insert(email.to_owned(), hashed.clone());
    Ok(hashed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE requests (id INTEGER PRIMARY KEY, timestamp INTEGER, resource_id TEXT,
                email TEXT, domain TEXT, count INTEGER);
             CREATE TABLE errors (id INTEGER PRIMARY KEY, timestamp INTEGER, resource_id TEXT,
                email TEXT, message TEXT);
             INSERT INTO requests (id, timestamp, resource_id, email, domain, count)
                VALUES (1, 0, 'r1', 'A@X.com', '', NULL);
             INSERT INTO errors (id, timestamp, resource_id, email, message)
                VALUES (1, 0, 'r1', 'A@X.com', 'boom');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn migration_lowercases_and_hashes_every_row() {
        let conn = seeded_db();
        let mut cache = HashMap::new();
        let requests = migrate_requests(&conn, &mut cache).unwrap();
        let errors = migrate_errors(&conn, &mut cache).unwrap();

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].2, "x.com");
        assert!(requests[0].1.starts_with("$2b$12$"));
        assert_eq!(errors[0].1, requests[0].1);
    }

    #[test]
    fn repeat_emails_share_one_hash_via_the_cache() {
        let mut cache = HashMap::new();
        let a = hashed_email(&mut cache, "a@x.com", "x.com").unwrap();
        let b = hashed_email(&mut cache, "a@x.com", "x.com").unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
    }
}
