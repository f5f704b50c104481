//! Durable append-only example log and training batch carver.
//!
//! The store is a single newline-delimited JSON file holding
//! [ExampleRecord]s in arrival order. Appends only ever grow the file;
//! carving removes the most-recent records into immutable batch files and
//! atomically rewrites the store so that it holds a strict suffix-complement
//! (the oldest remainder) of its previous contents. No observer ever sees a
//! state where the carved records and the remainder are both missing.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use relearn_types::ExampleRecord;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("store holds {total} records, need at least {batch_size} to carve")]
    NotEnoughRecords { total: usize, batch_size: usize },
    #[error("store path {} has no file name", .0.display())]
    BadStorePath(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The append-only example log.
///
/// `append` and `carve` are mutually exclusive; both run under the single
/// writer lock. Batch files are immutable once written, so readers of those
/// need no coordination.
pub struct ExampleStore {
    path: PathBuf,
    writer_lock: Mutex<()>,
}

/// Result of a successful carve.
#[derive(Debug)]
pub struct Carved {
    /// Newly written batch files, in sequence order.
    pub batch_files: Vec<PathBuf>,
    /// Records left in the store (the oldest ones, strictly fewer than the
    /// batch size).
    pub remainder: usize,
}

impl ExampleStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            writer_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append records as JSON lines in caller-supplied order.
    ///
    /// Returns `(total_after_append, appended_count)`.
    pub fn append(&self, records: &[ExampleRecord]) -> Result<(usize, usize)> {
        let _guard = self.writer_lock.lock().unwrap();

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let current_total = self.read_lines()?.len();

        let mut fd = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for record in records {
            serde_json::to_writer(&mut fd, record)?;
            fd.write_all(b"\n")?;
        }
        fd.sync_all()?;

        Ok((current_total + records.len(), records.len()))
    }

    /// Number of records currently in the store.
    pub fn len(&self) -> Result<usize> {
        let _guard = self.writer_lock.lock().unwrap();
        Ok(self.read_lines()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Carve as many full `batch_size`-record batches as possible out of the
    /// store, newest records first, leaving the oldest remainder behind.
    ///
    /// The batches are cut from the tail of the file: with N records and
    /// K = N div `batch_size`, the records at positions `[N - K*B, N)` are
    /// written out as K sequence-numbered batch files and the store is
    /// atomically rewritten to hold only the first `N mod B` records.
    pub fn carve(&self, batch_size: usize) -> Result<Carved> {
        assert!(batch_size > 0);
        let _guard = self.writer_lock.lock().unwrap();

        let lines = self.read_lines()?;
        let total = lines.len();
        if total < batch_size {
            return Err(Error::NotEnoughRecords { total, batch_size });
        }

        let num_batches = total / batch_size;
        let remainder_count = total % batch_size;
        let export_start = total - num_batches * batch_size;

        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::BadStorePath(self.path.clone()))?;
        let timestamp_base = Utc::now().format("%Y%m%d_%H%M%S%6f");

        let mut batch_files = Vec::with_capacity(num_batches);
        for i in 0..num_batches {
            let start = export_start + i * batch_size;
            let batch_lines = &lines[start..start + batch_size];

            let batch_path = self.path.with_file_name(format!(
                "{stem}_train_batch_{timestamp_base}_{:03}.jsonl",
                i + 1
            ));
            let mut fd = std::fs::File::create(&batch_path)?;
            for line in batch_lines {
                fd.write_all(line.as_bytes())?;
                fd.write_all(b"\n")?;
            }
            fd.sync_all()?;
            debug!("wrote batch file {}", batch_path.display());
            batch_files.push(batch_path);
        }

        // Rewrite the store with the oldest remainder. Write-temp, fsync,
        // rename: a crash before the rename leaves the store intact, a crash
        // after leaves the batch files plus the truncated store.
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        for line in &lines[..export_start] {
            tmp.write_all(line.as_bytes())?;
            tmp.write_all(b"\n")?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        Ok(Carved {
            batch_files,
            remainder: remainder_count,
        })
    }

    /// All batch files previously carved from this store, sorted by
    /// modification time, most recent first.
    pub fn batch_files(&self) -> Result<Vec<PathBuf>> {
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::BadStorePath(self.path.clone()))?;
        let prefix = format!("{stem}_train_batch_");

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut found: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        let entries = match std::fs::read_dir(parent) {
            Ok(entries) => entries,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with(&prefix) && name.ends_with(".jsonl") {
                let mtime = entry.metadata()?.modified()?;
                found.push((mtime, entry.path()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(found.into_iter().map(|(_, p)| p).collect())
    }

    fn read_lines(&self) -> Result<Vec<String>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(ref e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| line.to_string())
            .collect())
    }
}

/// Read the records of a batch file, skipping unparseable lines.
pub fn read_batch_file(path: &Path) -> Result<Vec<ExampleRecord>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(i: usize) -> ExampleRecord {
        ExampleRecord {
            prompt: format!("prompt-{i}"),
            completion: format!("completion-{i}"),
        }
    }

    fn records(range: std::ops::Range<usize>) -> Vec<ExampleRecord> {
        range.map(record).collect()
    }

    fn store_in(dir: &tempfile::TempDir) -> ExampleStore {
        ExampleStore::new(dir.path().join("recent_examples.jsonl"))
    }

    #[test]
    fn append_counts_and_totals() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let (total, appended) = store.append(&records(0..3)).unwrap();
        assert_eq!((total, appended), (3, 3));

        let (total, appended) = store.append(&records(3..5)).unwrap();
        assert_eq!((total, appended), (5, 2));
        assert_eq!(store.len().unwrap(), 5);
    }

    #[test]
    fn blank_lines_are_ignored_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.append(&records(0..2)).unwrap();

        let mut contents = std::fs::read_to_string(store.path()).unwrap();
        contents.push_str("\n\n   \n");
        std::fs::write(store.path(), contents).unwrap();

        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn first_full_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let (total, _) = store.append(&records(0..63)).unwrap();
        assert_eq!(total, 63);
        assert!(total < 64);

        let (total, _) = store.append(&records(63..64)).unwrap();
        assert_eq!(total, 64);

        let carved = store.carve(64).unwrap();
        assert_eq!(carved.batch_files.len(), 1);
        assert_eq!(carved.remainder, 0);
        assert_eq!(store.len().unwrap(), 0);
        assert_eq!(read_batch_file(&carved.batch_files[0]).unwrap().len(), 64);
    }

    #[test]
    fn multi_batch_carve_keeps_oldest_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append(&records(0..200)).unwrap();
        let carved = store.carve(64).unwrap();

        assert_eq!(carved.batch_files.len(), 3);
        assert_eq!(carved.remainder, 8);
        assert_eq!(store.len().unwrap(), 8);

        for path in &carved.batch_files {
            assert_eq!(read_batch_file(path).unwrap().len(), 64);
        }

        // The remainder is the *oldest* 8 of the 200.
        let kept = std::fs::read_to_string(store.path()).unwrap();
        let kept: Vec<ExampleRecord> = kept
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(kept, records(0..8));

        // The first batch starts right after the remainder.
        let first = read_batch_file(&carved.batch_files[0]).unwrap();
        assert_eq!(first, records(8..72));
    }

    #[test]
    fn carve_takes_tail_across_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append(&records(0..10)).unwrap();
        let (total, _) = store.append(&records(10..70)).unwrap();
        assert_eq!(total, 70);

        let carved = store.carve(64).unwrap();
        assert_eq!(carved.batch_files.len(), 1);
        assert_eq!(carved.remainder, 6);

        // Batch holds records 6..70 in arrival order; store keeps 0..6.
        let batch = read_batch_file(&carved.batch_files[0]).unwrap();
        assert_eq!(batch, records(6..70));
        let kept = std::fs::read_to_string(store.path()).unwrap();
        let kept: Vec<ExampleRecord> = kept
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(kept, records(0..6));
    }

    #[test]
    fn batch_names_sort_in_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append(&records(0..12)).unwrap();
        let carved = store.carve(4).unwrap();
        assert_eq!(carved.batch_files.len(), 3);

        let mut sorted = carved.batch_files.clone();
        sorted.sort();
        assert_eq!(sorted, carved.batch_files);

        for (i, path) in carved.batch_files.iter().enumerate() {
            let name = path.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with("recent_examples_train_batch_"));
            assert!(name.ends_with(&format!("_{:03}.jsonl", i + 1)));
        }
    }

    #[test]
    fn carve_below_batch_size_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append(&records(0..3)).unwrap();
        match store.carve(64) {
            Err(Error::NotEnoughRecords { total, batch_size }) => {
                assert_eq!((total, batch_size), (3, 64));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Refused carve leaves the store untouched.
        assert_eq!(store.len().unwrap(), 3);
    }

    #[test]
    fn batch_files_listed_latest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store.append(&records(0..4)).unwrap();
        let first = store.carve(4).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        store.append(&records(4..8)).unwrap();
        let second = store.carve(4).unwrap();

        let listed = store.batch_files().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], second.batch_files[0]);
        assert_eq!(listed[1], first.batch_files[0]);
    }

    #[test]
    fn records_are_never_lost_to_carving() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let mut expected_total = 0usize;
        let mut in_batches = 0usize;
        for chunk in [37usize, 51, 64, 3, 128] {
            let (total, appended) =
                store.append(&records(expected_total..expected_total + chunk)).unwrap();
            assert_eq!(appended, chunk);
            expected_total += chunk;
            assert_eq!(total + in_batches, expected_total);

            if total >= 64 {
                let carved = store.carve(64).unwrap();
                in_batches += carved.batch_files.len() * 64;
                assert_eq!(carved.remainder + in_batches, expected_total);
                assert!(carved.remainder < 64);
            }
        }
    }
}
