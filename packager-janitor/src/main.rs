#![deny(unsafe_code)]

//! `packager-janitor`: housekeeping script that deletes expired archives
//! from the store directory by mtime, run periodically outside the
//! ingress daemon (e.g. from cron).

use std::time::SystemTime;

use packager_common::config::Config;
use packager_common::prelude::*;

fn main() -> Result<()> {
    packager_common::tracing_support::init_tracing()?;
    let config = Config::from_env().context("could not load configuration")?;
    let removed = sweep(&config.store_directory, config.cache_time)?;
    info!(removed, "swept store directory");
    Ok(())
}

/// Remove every file under `store_directory` whose mtime is older than
/// `cache_ttl`. Mirrors the cache-hit rule in reverse: a file only
/// remains a valid cache hit while `now - mtime < cache_ttl`.
fn sweep(store_directory: &std::path::Path, cache_ttl: std::time::Duration) -> Result<usize> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(store_directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).context("could not read store directory"),
    };
    let now = SystemTime::now();
    for entry in entries {
        let entry = entry.context("could not read store directory entry")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("zip") {
            continue;
        }
        let metadata = entry.metadata().context("could not stat archive")?;
        let mtime = metadata.modified().context("could not read archive mtime")?;
        let age = now.duration_since(mtime).unwrap_or_default();
        if age >= cache_ttl {
            std::fs::remove_file(&path)
                .with_context(|| format!("could not remove {}", path.display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sweep_is_a_no_op_on_a_missing_directory() {
        let removed = sweep(std::path::Path::new("/no/such/packager-store"), Duration::from_secs(1)).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn sweep_removes_only_expired_zip_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join("abc-1-1000.zip");
        let stale = dir.path().join("def-1-1.zip");
        let other = dir.path().join("notes.txt");
        std::fs::write(&fresh, b"fresh").unwrap();
        std::fs::write(&stale, b"stale").unwrap();
        std::fs::write(&other, b"ignored").unwrap();

        let long_ago = SystemTime::now() - Duration::from_secs(10_000);
        filetime_set(&stale, long_ago);

        let removed = sweep(dir.path(), Duration::from_secs(86_400)).unwrap();
        assert_eq!(removed, 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
        assert!(other.exists());
    }

    fn filetime_set(path: &std::path::Path, time: SystemTime) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(time).unwrap();
    }
}
