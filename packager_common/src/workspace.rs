//! C4: the resource workspace.
//!
//! Owns the per-job scratch directory, the writers opened inside it, the
//! content-addressed cache lookup against the store directory, and ZIP
//! finalisation.

use std::fs::File;
use std::time::{Duration, SystemTime};

use tempfile::TempDir;

use crate::prelude::*;
use crate::request::Format;
use crate::zipper;

/// Scan `store_dir` for a file whose basename starts with `fingerprint`
/// and whose mtime is within `ttl` of now. First match wins; the janitor
/// is responsible for reclaiming expired duplicates.
#[instrument(skip(store_dir), level = "debug")]
pub fn find_cached_archive(store_dir: &Path, fingerprint: &str, ttl: Duration) -> Result<Option<PathBuf>> {
    let entries = match std::fs::read_dir(store_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("could not read store directory"),
    };
    let now = SystemTime::now();
    for entry in entries {
        let entry = entry.context("could not read store directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with(fingerprint) {
            continue;
        }
        let metadata = entry.metadata().context("could not stat store entry")?;
        let mtime = metadata.modified().context("could not read mtime")?;
        let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
        if age < ttl {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

/// Resolve the writer name to use when a package task did not ask for one
/// explicitly: the basename of `resource_url`'s path if present, else
/// `resource_id`; a trailing `.csv` is remapped to the working extension
/// of `format`.
pub fn default_writer_name(resource_url: Option<&str>, resource_id: &str, format: Format) -> String {
    let base = resource_url
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segs| segs.next_back().map(|s| s.to_owned()))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| resource_id.to_owned());

    match base.strip_suffix(".csv") {
        Some(stem) => format!("{stem}.{}", format.working_extension()),
        None => base,
    }
}

/// A per-job scratch area. The backing temp directory is removed when
/// this value is dropped (including on a panic unwinding through it),
/// which is how cleanup is guaranteed on every exit path of a package
/// task without a separate `finally` construct.
pub struct Workspace {
    dir: TempDir,
    writers: HashMap<String, File>,
    csv_writers: HashMap<String, csv::Writer<File>>,
    external_files: Vec<String>,
}

impl Workspace {
    /// Allocate a fresh scratch directory under `temp_root`.
    pub fn create(temp_root: &Path) -> Result<Workspace> {
        std::fs::create_dir_all(temp_root)
            .with_context(|| format!("could not create temp root {}", temp_root.display()))?;
        let dir = tempfile::Builder::new()
            .prefix("packager-")
            .tempdir_in(temp_root)
            .context("could not create workspace directory")?;
        Ok(Workspace {
            dir,
            writers: HashMap::new(),
            csv_writers: HashMap::new(),
            external_files: Vec::new(),
        })
    }

    /// Path to the workspace directory, useful for debugging.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Record that `name` was written directly to the workspace directory
    /// outside of [`Workspace::get_writer`]/[`Workspace::get_csv_writer`]
    /// (e.g. via an async file handle), so [`Workspace::create_zip`] still
    /// picks it up.
    pub fn register_external_file(&mut self, name: &str) {
        if !self.external_files.iter().any(|n| n == name) {
            self.external_files.push(name.to_owned());
        }
    }

    /// Open (creating on first call) a raw writer for a logical file
    /// name, e.g. for the URL variant's verbatim byte stream.
    pub fn get_writer(&mut self, name: &str) -> Result<&mut File> {
        if !self.writers.contains_key(name) {
            let path = self.dir.path().join(name);
            let file = File::create(&path)
                .with_context(|| format!("could not create {}", path.display()))?;
            self.writers.insert(name.to_owned(), file);
        }
        Ok(self.writers.get_mut(name).expect("just inserted"))
    }

    /// Open (creating on first call) a CSV writer for a logical file
    /// name, using `delimiter` for the field separator.
    pub fn get_csv_writer(&mut self, name: &str, delimiter: u8) -> Result<&mut csv::Writer<File>> {
        if !self.csv_writers.contains_key(name) {
            let path = self.dir.path().join(name);
            let file = File::create(&path)
                .with_context(|| format!("could not create {}", path.display()))?;
            let writer = csv::WriterBuilder::new()
                .delimiter(delimiter)
                .quote(b'"')
                .terminator(csv::Terminator::Any(b'\n'))
                .from_writer(file);
            self.csv_writers.insert(name.to_owned(), writer);
        }
        Ok(self.csv_writers.get_mut(name).expect("just inserted"))
    }

    /// Drop a previously-opened writer (raw or CSV) without deleting its
    /// underlying file, so a finalisation step that replaces it on disk
    /// under a different name (e.g. the xlsx conversion) doesn't leave a
    /// stale entry for [`Workspace::create_zip`] to pick up.
    pub fn forget_writer(&mut self, name: &str) {
        self.writers.remove(name);
        self.csv_writers.remove(name);
        self.external_files.retain(|n| n != name);
    }

    /// File names currently open in this workspace, in no particular
    /// order.
    pub fn file_names(&self) -> Vec<String> {
        self.writers
            .keys()
            .chain(self.csv_writers.keys())
            .chain(self.external_files.iter())
            .cloned()
            .collect()
    }

    /// Flush and drop every open writer so their files are safe to read
    /// or hand to an external process.
    pub fn flush_all(&mut self) -> Result<()> {
        for (name, writer) in self.csv_writers.iter_mut() {
            writer
                .flush()
                .with_context(|| format!("could not flush {name}"))?;
        }
        self.csv_writers.clear();
        self.writers.clear();
        Ok(())
    }

    /// Flush all writers and invoke the configured zip command once per
    /// file, appending each into the target archive in the store
    /// directory. Returns the finished archive's path.
    #[instrument(skip(self, command_template), level = "debug")]
    pub async fn create_zip(
        &mut self,
        store_dir: &Path,
        fingerprint: &str,
        command_template: &str,
    ) -> Result<PathBuf> {
        let names = self.file_names();
        self.flush_all()?;

        std::fs::create_dir_all(store_dir)
            .with_context(|| format!("could not create store directory {}", store_dir.display()))?;

        let epoch = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let pid = std::process::id();
        let target = store_dir.join(format!("{fingerprint}-{pid}-{epoch}.zip"));

        for name in &names {
            let input = self.dir.path().join(name);
            zipper::append_to_archive(command_template, &input, &target).await?;
        }

        Ok(target)
    }

    /// Close writers and recursively delete the workspace. Called
    /// explicitly so logging/tests can observe cleanup timing; dropping a
    /// [`Workspace`] without calling this still removes the directory.
    pub fn clean_work_files(self) -> Result<()> {
        let path = self.dir.path().to_owned();
        drop(self);
        if path.exists() {
            std::fs::remove_dir_all(&path)
                .with_context(|| format!("could not remove workspace {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn default_writer_name_prefers_url_basename() {
        let name = default_writer_name(Some("http://example.org/data/f.csv"), "r1", Format::Tsv);
        assert_eq!(name, "f.tsv");
    }

    #[test]
    fn default_writer_name_falls_back_to_resource_id() {
        let name = default_writer_name(None, "r1", Format::Csv);
        assert_eq!(name, "r1");
    }

    #[test]
    fn cache_lookup_respects_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc123-42-100.zip");
        std::fs::write(&path, b"zip").unwrap();

        let hit = find_cached_archive(dir.path(), "abc123", Duration::from_secs(3600)).unwrap();
        assert_eq!(hit, Some(path.clone()));

        let miss = find_cached_archive(dir.path(), "abc123", Duration::from_secs(0)).unwrap();
        assert_eq!(miss, None);
    }

    #[test]
    fn workspace_cleanup_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut ws = Workspace::create(root.path()).unwrap();
        {
            let f = ws.get_writer("out.txt").unwrap();
            f.write_all(b"hello").unwrap();
        }
        let path = ws.path().to_owned();
        assert!(path.exists());
        ws.clean_work_files().unwrap();
        assert!(!path.exists());
    }
}
