//! On-disk snapshot model: dump files, compare files and their sentinels.
//!
//! A companion file (`*.csv.gz`) counts as complete only when a sentinel
//! (`*.txt`) with the same base name sits next to it. Listing therefore
//! filters on sentinels, and cleanup removes companions that lack one.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use idwatch_core::{format_timestamp, parse_timestamp, RecordStatus};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const ARTIFACT_EXT: &str = ".csv.gz";
pub const SENTINEL_EXT: &str = ".txt";
pub const COMPARE_PREFIX: &str = "CMP_";
pub const DUMP_MARKER_NAME: &str = ".dump-in-progress";

const DATE_FORMAT: &str = "%Y-%m-%d";
const STAGING_SUFFIX: &str = ".tmp";

static DUMP_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2})\.csv\.gz$").expect("dump file pattern is valid")
});

static COMPARE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CMP_(\d{4}-\d{2}-\d{2})_(\d{4}-\d{2}-\d{2})_(MISSING|NEW)\.csv\.gz$")
        .expect("compare file pattern is valid")
});

static SENTINEL_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(CMP_\d{4}-\d{2}-\d{2}_\d{4}-\d{2}-\d{2}_(MISSING|NEW)|\d{4}-\d{2}-\d{2})\.txt$")
        .expect("sentinel pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DumpFile {
    pub date: NaiveDate,
    pub path: PathBuf,
}

impl DumpFile {
    pub fn base_name(&self) -> String {
        self.date.format(DATE_FORMAT).to_string()
    }

    pub fn sentinel_path(&self) -> PathBuf {
        sentinel_path_for(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompareFile {
    pub older: NaiveDate,
    pub newer: NaiveDate,
    pub status: RecordStatus,
    pub path: PathBuf,
}

impl CompareFile {
    pub fn file_name(&self) -> String {
        compare_file_name(self.older, self.newer, self.status)
    }

    pub fn sentinel_path(&self) -> PathBuf {
        sentinel_path_for(&self.path)
    }
}

pub fn dump_file_name(date: NaiveDate) -> String {
    format!("{}{ARTIFACT_EXT}", date.format(DATE_FORMAT))
}

pub fn compare_file_name(older: NaiveDate, newer: NaiveDate, status: RecordStatus) -> String {
    format!(
        "{COMPARE_PREFIX}{}_{}_{}{ARTIFACT_EXT}",
        older.format(DATE_FORMAT),
        newer.format(DATE_FORMAT),
        status
    )
}

/// `2024-01-01.csv.gz` -> `2024-01-01.txt`, in the same directory.
pub fn sentinel_path_for(artifact: &Path) -> PathBuf {
    let name = artifact
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let base = name.strip_suffix(ARTIFACT_EXT).unwrap_or(&name);
    artifact.with_file_name(format!("{base}{SENTINEL_EXT}"))
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT).ok()
}

fn parse_dump_name(name: &str) -> Option<NaiveDate> {
    DUMP_NAME.captures(name).and_then(|caps| parse_date(&caps[1]))
}

fn parse_compare_name(name: &str) -> Option<(NaiveDate, NaiveDate, RecordStatus)> {
    let caps = COMPARE_NAME.captures(name)?;
    let status = caps[3].parse().ok()?;
    Some((parse_date(&caps[1])?, parse_date(&caps[2])?, status))
}

fn sentinel_name_for(name: &str) -> String {
    let base = name.strip_suffix(ARTIFACT_EXT).unwrap_or(name);
    format!("{base}{SENTINEL_EXT}")
}

fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(STAGING_SUFFIX)
}

/// Failed deletions, retried later and once more when the last store handle drops.
#[derive(Debug, Default)]
struct DeferredDeletes {
    paths: Mutex<Vec<PathBuf>>,
}

impl DeferredDeletes {
    fn push(&self, path: PathBuf) {
        self.paths
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(path);
    }

    fn retry(&self) -> usize {
        let mut paths = self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        paths.retain(|path| match fs::remove_file(path) {
            Ok(()) => false,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "deferred delete failed again");
                true
            }
        });
        paths.len()
    }
}

impl Drop for DeferredDeletes {
    fn drop(&mut self) {
        self.retry();
    }
}

/// File set of one entity type: dumps, compares and sentinels in a single directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
    deferred: Arc<DeferredDeletes>,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            deferred: Arc::new(DeferredDeletes::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating data directory {}", self.root.display()))
    }

    pub fn dump_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(dump_file_name(date))
    }

    pub fn compare_path(&self, older: NaiveDate, newer: NaiveDate, status: RecordStatus) -> PathBuf {
        self.root.join(compare_file_name(older, newer, status))
    }

    /// File names in the data directory; a missing directory lists as empty.
    fn file_names(&self) -> HashSet<String> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(dir = %self.root.display(), "data directory does not exist yet");
                return HashSet::new();
            }
            Err(err) => {
                warn!(dir = %self.root.display(), error = %err, "could not list data directory");
                return HashSet::new();
            }
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect()
    }

    /// Dumps that have a sentinel, ordered by file name (chronological).
    pub fn list_valid_dumps(&self, order: ListOrder) -> Vec<DumpFile> {
        let names = self.file_names();
        let mut dumps: Vec<DumpFile> = names
            .iter()
            .filter(|name| names.contains(&sentinel_name_for(name)))
            .filter_map(|name| {
                parse_dump_name(name).map(|date| DumpFile {
                    date,
                    path: self.root.join(name),
                })
            })
            .collect();
        dumps.sort_by_key(|d| d.date);
        if order == ListOrder::Descending {
            dumps.reverse();
        }
        dumps
    }

    /// Compare files that have a sentinel, ordered by file name.
    pub fn list_valid_compares(&self, order: ListOrder) -> Vec<CompareFile> {
        let names = self.file_names();
        let mut compares: Vec<CompareFile> = names
            .iter()
            .filter(|name| names.contains(&sentinel_name_for(name)))
            .filter_map(|name| {
                parse_compare_name(name).map(|(older, newer, status)| CompareFile {
                    older,
                    newer,
                    status,
                    path: self.root.join(name),
                })
            })
            .collect();
        compares.sort_by_key(|c| c.file_name());
        if order == ListOrder::Descending {
            compares.reverse();
        }
        compares
    }

    pub fn is_complete(&self, artifact: &Path) -> bool {
        artifact.is_file() && sentinel_path_for(artifact).is_file()
    }

    /// Deletes companions without a sentinel, sentinels without a companion
    /// and leftover staging files. Never fails; problems are logged.
    pub fn purge_invalid(&self) -> usize {
        let names = self.file_names();
        let mut removed = 0usize;

        for name in &names {
            let is_artifact = parse_dump_name(name).is_some() || parse_compare_name(name).is_some();
            let orphan_artifact = is_artifact && !names.contains(&sentinel_name_for(name));
            let orphan_sentinel = SENTINEL_NAME.is_match(name) && {
                let base = name.strip_suffix(SENTINEL_EXT).unwrap_or(name);
                !names.contains(&format!("{base}{ARTIFACT_EXT}"))
            };

            if orphan_artifact {
                warn!(file = %self.root.join(name).display(), "corrupt artifact without sentinel, deleting");
            } else if orphan_sentinel {
                warn!(file = %self.root.join(name).display(), "sentinel without companion, deleting");
            } else if is_staging_name(name) {
                warn!(file = %self.root.join(name).display(), "leftover staging file, deleting");
            } else {
                continue;
            }

            if self.remove_artifact_file(&self.root.join(name)) {
                removed += 1;
            }
        }
        removed
    }

    /// Deletes dumps (and compares whose newer side) dated before `cutoff`,
    /// judged by the date encoded in the file name, never by mtime.
    pub fn purge_older_than(&self, cutoff: NaiveDate) -> usize {
        info!(dir = %self.root.display(), %cutoff, "deleting artifacts older than cutoff");
        let mut removed = 0usize;

        for dump in self.list_valid_dumps(ListOrder::Ascending) {
            if dump.date >= cutoff {
                continue;
            }
            info!(file = %dump.path.display(), date = %dump.date, %cutoff, "deleting expired dump");
            if self.remove_artifact_file(&dump.path) {
                removed += 1;
            }
            self.remove_artifact_file(&dump.sentinel_path());
        }

        for compare in self.list_valid_compares(ListOrder::Ascending) {
            if compare.newer >= cutoff {
                continue;
            }
            info!(file = %compare.path.display(), %cutoff, "deleting expired compare file");
            if self.remove_artifact_file(&compare.path) {
                removed += 1;
            }
            self.remove_artifact_file(&compare.sentinel_path());
        }
        removed
    }

    /// Removes one file; a failed delete is deferred instead of reported.
    pub fn remove_artifact_file(&self, path: &Path) -> bool {
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => true,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "delete failed, deferring");
                self.deferred.push(path.to_path_buf());
                false
            }
        }
    }

    /// Retries deferred deletions, returning how many are still pending.
    pub fn retry_deferred(&self) -> usize {
        self.deferred.retry()
    }

    pub fn read_sentinel(&self, artifact: &Path) -> Result<DateTime<Utc>> {
        let path = sentinel_path_for(artifact);
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading sentinel {}", path.display()))?;
        let first = text.lines().next().unwrap_or_default();
        parse_timestamp(first)
            .with_context(|| format!("parsing sentinel timestamp {first:?} in {}", path.display()))
    }

    /// Must only be called after the companion is fully written and closed.
    pub fn write_sentinel(&self, artifact: &Path, completed_at: DateTime<Utc>) -> Result<()> {
        let path = sentinel_path_for(artifact);
        let staging = self.staging_path();
        fs::write(&staging, format!("{}\n", format_timestamp(completed_at)))
            .with_context(|| format!("writing sentinel {}", staging.display()))?;
        self.commit_staged(&staging, &path)
    }

    /// Unique hidden name in the data directory; never matches artifact patterns.
    pub fn staging_path(&self) -> PathBuf {
        self.root.join(format!(".{}{STAGING_SUFFIX}", Uuid::new_v4()))
    }

    pub fn commit_staged(&self, staging: &Path, target: &Path) -> Result<()> {
        match fs::rename(staging, target) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.remove_artifact_file(staging);
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming staged file {} -> {}",
                        staging.display(),
                        target.display()
                    )
                })
            }
        }
    }

    pub fn begin_dump(&self) -> Result<DumpMarker> {
        let path = self.root.join(DUMP_MARKER_NAME);
        fs::write(&path, format!("{}\n", format_timestamp(Utc::now())))
            .with_context(|| format!("writing dump marker {}", path.display()))?;
        Ok(DumpMarker { path })
    }
}

/// Marks a dump as in progress for readers of the data directory; removed on drop.
#[derive(Debug)]
pub struct DumpMarker {
    path: PathBuf,
}

impl DumpMarker {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DumpMarker {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(file = %self.path.display(), error = %err, "could not remove dump marker");
        }
    }
}

pub type GzCsvReader = csv::Reader<GzDecoder<BufReader<File>>>;
pub type GzCsvWriter = csv::Writer<GzEncoder<BufWriter<File>>>;

pub fn open_gz_csv(path: &Path) -> Result<GzCsvReader> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    Ok(csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(GzDecoder::new(BufReader::new(file))))
}

pub fn create_gz_csv(path: &Path) -> Result<GzCsvWriter> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    Ok(csv::Writer::from_writer(GzEncoder::new(
        BufWriter::new(file),
        Compression::default(),
    )))
}

/// Flushes the CSV buffer, writes the gzip trailer and syncs the file.
pub fn finish_gz_csv(mut writer: GzCsvWriter) -> Result<()> {
    writer.flush().context("flushing csv writer")?;
    let encoder = writer
        .into_inner()
        .map_err(|err| anyhow!("flushing csv writer: {}", err.error()))?;
    let buffered = encoder.finish().context("finishing gzip stream")?;
    let file = buffered
        .into_inner()
        .map_err(|err| err.into_error())
        .context("flushing file buffer")?;
    file.sync_all().context("syncing output file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DATE_FORMAT).unwrap()
    }

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn sentinel_names_follow_companions() {
        assert_eq!(sentinel_path_for(Path::new("/d/2024-01-01.csv.gz")), Path::new("/d/2024-01-01.txt"));
        assert_eq!(
            compare_file_name(date("2024-01-01"), date("2024-01-02"), RecordStatus::Missing),
            "CMP_2024-01-01_2024-01-02_MISSING.csv.gz"
        );
    }

    #[test]
    fn missing_directory_lists_empty() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("absent"));
        assert!(store.list_valid_dumps(ListOrder::Ascending).is_empty());
        assert!(store.list_valid_compares(ListOrder::Ascending).is_empty());
        assert_eq!(store.purge_invalid(), 0);
    }

    #[test]
    fn listing_keeps_only_sentinel_backed_files_in_order() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        for d in ["2024-01-03", "2024-01-01", "2024-01-02"] {
            touch(&store.dump_path(date(d)));
        }
        store.write_sentinel(&store.dump_path(date("2024-01-01")), Utc::now()).unwrap();
        store.write_sentinel(&store.dump_path(date("2024-01-03")), Utc::now()).unwrap();
        touch(&dir.path().join("notes.csv.gz"));

        let asc: Vec<_> = store.list_valid_dumps(ListOrder::Ascending).iter().map(|d| d.base_name()).collect();
        assert_eq!(asc, vec!["2024-01-01", "2024-01-03"]);
        let desc = store.list_valid_dumps(ListOrder::Descending);
        assert_eq!(desc[0].date, date("2024-01-03"));
    }

    #[test]
    fn compares_sort_by_file_name() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let (a, b, c) = (date("2024-01-01"), date("2024-01-02"), date("2024-01-03"));
        for (older, newer, status) in [
            (b, c, RecordStatus::New),
            (a, b, RecordStatus::New),
            (a, b, RecordStatus::Missing),
        ] {
            let path = store.compare_path(older, newer, status);
            touch(&path);
            store.write_sentinel(&path, Utc::now()).unwrap();
        }
        touch(&store.compare_path(b, c, RecordStatus::Missing));

        let names: Vec<_> = store
            .list_valid_compares(ListOrder::Ascending)
            .iter()
            .map(|c| c.file_name())
            .collect();
        assert_eq!(
            names,
            vec![
                "CMP_2024-01-01_2024-01-02_MISSING.csv.gz",
                "CMP_2024-01-01_2024-01-02_NEW.csv.gz",
                "CMP_2024-01-02_2024-01-03_NEW.csv.gz",
            ]
        );
    }

    #[test]
    fn purge_invalid_removes_unsentineled_artifacts_and_staging_files() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let good = store.dump_path(date("2024-01-01"));
        let corrupt = store.dump_path(date("2024-01-02"));
        let corrupt_cmp = store.compare_path(date("2024-01-01"), date("2024-01-02"), RecordStatus::New);
        touch(&good);
        store.write_sentinel(&good, Utc::now()).unwrap();
        touch(&corrupt);
        touch(&corrupt_cmp);
        touch(&store.staging_path());
        touch(&dir.path().join("2024-01-05.txt"));
        touch(&dir.path().join("README.md"));

        assert_eq!(store.purge_invalid(), 4);
        assert!(store.is_complete(&good));
        assert!(!corrupt.exists());
        assert!(!corrupt_cmp.exists());
        assert!(dir.path().join("README.md").exists());
        for entry in fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            assert!(!is_staging_name(&name), "staging file {name} survived");
        }
    }

    #[test]
    fn retention_uses_file_name_dates_not_mtime() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let old = store.dump_path(date("2024-01-01"));
        let edge = store.dump_path(date("2024-01-10"));
        let recent = store.dump_path(date("2024-01-20"));
        for path in [&old, &edge, &recent] {
            touch(path);
            store.write_sentinel(path, Utc::now()).unwrap();
        }
        // Give the old dump the newest mtime and the recent one an ancient mtime.
        File::options().write(true).open(&old).unwrap().set_modified(SystemTime::now()).unwrap();
        File::options()
            .write(true)
            .open(&recent)
            .unwrap()
            .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(60))
            .unwrap();

        let expired_cmp = store.compare_path(date("2024-01-01"), date("2024-01-05"), RecordStatus::Missing);
        touch(&expired_cmp);
        store.write_sentinel(&expired_cmp, Utc::now()).unwrap();

        assert_eq!(store.purge_older_than(date("2024-01-10")), 2);
        assert!(!old.exists());
        assert!(!sentinel_path_for(&old).exists());
        assert!(!expired_cmp.exists());
        assert!(store.is_complete(&edge));
        assert!(store.is_complete(&recent));
    }

    #[test]
    fn sentinel_round_trip() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let dump = store.dump_path(date("2024-02-01"));
        touch(&dump);
        let at = DateTime::parse_from_rfc3339("2024-02-01T10:00:00Z").unwrap().with_timezone(&Utc);
        store.write_sentinel(&dump, at).unwrap();
        assert_eq!(store.read_sentinel(&dump).unwrap(), at);
        assert_eq!(
            fs::read_to_string(sentinel_path_for(&dump)).unwrap(),
            "2024-02-01T10:00:00+0000\n"
        );
    }

    #[test]
    fn failed_delete_is_deferred_until_it_succeeds() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let blocked = dir.path().join("2024-01-01.csv.gz");
        fs::create_dir(&blocked).unwrap();
        touch(&blocked.join("inner"));

        assert!(!store.remove_artifact_file(&blocked));
        assert_eq!(store.retry_deferred(), 1);
        assert!(blocked.exists());

        fs::remove_dir_all(&blocked).unwrap();
        touch(&blocked);
        assert_eq!(store.retry_deferred(), 0);
        assert!(!blocked.exists());
    }

    #[test]
    fn pending_deletes_are_retried_when_the_last_handle_drops() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let clone = store.clone();
        let blocked = dir.path().join("2024-01-01.txt");
        fs::create_dir(&blocked).unwrap();
        assert!(!store.remove_artifact_file(&blocked));

        fs::remove_dir(&blocked).unwrap();
        touch(&blocked);
        drop(store);
        assert!(blocked.exists());
        drop(clone);
        assert!(!blocked.exists());
    }

    #[test]
    fn dump_marker_is_removed_on_drop() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path());
        let marker = store.begin_dump().unwrap();
        let path = marker.path().to_path_buf();
        assert!(path.exists());
        drop(marker);
        assert!(!path.exists());
    }

    #[test]
    fn gz_csv_helpers_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.csv.gz");
        let mut writer = create_gz_csv(&path).unwrap();
        writer.write_record(["id", "label"]).unwrap();
        writer.write_record(["A", "x, y"]).unwrap();
        finish_gz_csv(writer).unwrap();

        let mut reader = open_gz_csv(&path).unwrap();
        assert_eq!(reader.headers().unwrap(), vec!["id", "label"]);
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][1], "x, y");
    }
}
