//! Filesystem based storage.
//!
//! Events are kept one file per append, under a directory per entity. The
//! file holds the appended batch and is named after its first and last
//! version:
//!
//! ```text
//! <base>/events/<entity type>/<entity id>/delta-<first>-<last>.json
//! <base>/events/<entity type>/<entity id>/snapshot.json
//! <base>/read_models/<read model>/<id>.json
//! ```
//!
//! Path segments are percent encoded. Every file is written to a temporary
//! file under `<base>/.tmp` first and then moved in place, so readers never
//! see partial files and an append is stored whole or not at all. Deleted
//! read models are kept as tombstones. Writers take an advisory lock on a lock file under
//! `<base>/.locks`, which makes the version checks and the writes atomic
//! between processes sharing the directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

use crate::constants::{
    EVENT_FILE_PREFIX, EVENTS_DIR, LOCK_FILE_NAME, READ_MODELS_DIR,
    SNAPSHOT_FILE_NAME, TMP_DIR,
};
use crate::eventsourcing::{
    AppendOutcome, DeleteOutcome, EventEnvelope, EventStoreClient, Page,
    PutOutcome, ReadModelEntry, ReadModelRecord, ReadModelStore,
    ReadModelWrite, SnapshotEnvelope, SourceVersions, StoreError,
};

use super::check_append;

/// The directory under the base that contains the lock files.
const LOCK_FILE_DIR: &str = ".locks";

/// Characters kept as is in path segments. Everything else, including `.`,
/// is encoded, so no segment can be `..` or hidden.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

fn encode(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

fn decode(segment: &str) -> Option<String> {
    percent_decode_str(segment)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

//------------ Files ---------------------------------------------------------

/// Paths and file operations shared by both stores.
#[derive(Debug)]
struct Files {
    root: PathBuf,
    tmp: PathBuf,
    locks: PathBuf,
}

impl Files {
    fn new(base: &Path, name: &str) -> Result<Self, StoreError> {
        let root = base.join(name);
        let tmp = base.join(TMP_DIR);
        let locks = base.join(LOCK_FILE_DIR).join(name);

        for dir in [&root, &tmp, &locks] {
            fs::create_dir_all(dir).map_err(|e| {
                StoreError::io(
                    format!("failed to create directory '{}'", dir.display()),
                    e,
                )
            })?;
        }

        Ok(Files { root, tmp, locks })
    }

    fn dir(&self, segments: &[&str]) -> PathBuf {
        let mut path = self.root.clone();
        for segment in segments {
            path.push(encode(segment));
        }
        path
    }

    fn lock(&self, segments: &[&str]) -> Result<FileLock, StoreError> {
        let mut path = self.locks.clone();
        for segment in segments {
            path.push(encode(segment));
        }
        FileLock::create(path)
    }

    fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, StoreError> {
        let file = match File::open(path) {
            Ok(file) => io::BufReader::new(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::io(
                    format!("failed to open file '{}'", path.display()),
                    e,
                ));
            }
        };
        serde_json::from_reader(file).map(Some).map_err(|e| {
            StoreError::json(format!("failed to parse '{}'", path.display()), e)
        })
    }

    /// Writes the value to a temporary file and moves it into place.
    ///
    /// With `replace` false an existing file is an error.
    fn write<T: Serialize>(
        &self,
        path: &Path,
        value: &T,
        replace: bool,
    ) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::io(
                    format!("failed to create directory '{}'", parent.display()),
                    e,
                )
            })?;
        }

        let mut tmp_file = NamedTempFile::new_in(&self.tmp).map_err(|e| {
            StoreError::io(
                format!("failed to create temp file for '{}'", path.display()),
                e,
            )
        })?;

        let mut writer = io::BufWriter::new(&mut tmp_file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| {
            StoreError::json(
                format!("failed to write temp file for '{}'", path.display()),
                e,
            )
        })?;
        writer.flush().map_err(|e| {
            StoreError::io(
                format!("failed to write temp file for '{}'", path.display()),
                e,
            )
        })?;
        drop(writer);

        let persisted = if replace {
            tmp_file.persist(path)
        } else {
            tmp_file.persist_noclobber(path)
        };
        persisted.map_err(|e| {
            StoreError::io(
                format!(
                    "failed to rename temp file '{}' to '{}'",
                    e.file.path().display(),
                    path.display()
                ),
                e.error,
            )
        })?;
        Ok(())
    }

    /// Lists the decoded names of the entries in a directory, sorted.
    ///
    /// Names are taken from directories or from files with the extension,
    /// depending on what is asked for.
    fn list(
        &self,
        dir: &Path,
        json_files: bool,
    ) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(StoreError::io(
                    format!("failed to read directory '{}'", dir.display()),
                    e,
                ));
            }
        };

        let mut names = vec![];
        for entry in entries {
            let entry = entry.map_err(|e| {
                StoreError::io(
                    format!("failed to read directory '{}'", dir.display()),
                    e,
                )
            })?;
            let path = entry.path();

            let name = if json_files {
                if !path.is_file() {
                    continue;
                }
                path.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| n.strip_suffix(".json"))
                    .and_then(decode)
            } else {
                if !path.is_dir() {
                    continue;
                }
                path.file_name().and_then(|n| n.to_str()).and_then(decode)
            };
            if let Some(name) = name {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

fn page_after(
    names: Vec<String>,
    after: Option<&str>,
    limit: usize,
) -> Vec<String> {
    names
        .into_iter()
        .filter(|name| after.is_none_or(|after| name.as_str() > after))
        .take(limit)
        .collect()
}

async fn blocking<F, T>(op: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| StoreError::other(format!("storage task failed: {e}")))?
}

//------------ FileLock ------------------------------------------------------

#[derive(Debug)]
struct FileLock {
    lock: fd_lock::RwLock<File>,
}

impl FileLock {
    fn create(path: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&path).map_err(|e| {
            StoreError::io(
                format!("failed to create directory '{}'", path.display()),
                e,
            )
        })?;

        let lock_path = path.join(LOCK_FILE_NAME);
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| {
                StoreError::io(
                    format!("failed to open lock file '{}'", lock_path.display()),
                    e,
                )
            })?;

        Ok(FileLock {
            lock: fd_lock::RwLock::new(lock_file),
        })
    }

    fn write(&mut self) -> Result<fd_lock::RwLockWriteGuard<'_, File>, StoreError> {
        self.lock
            .write()
            .map_err(|e| StoreError::io("cannot get file lock", e))
    }
}

//------------ DiskEventStore ------------------------------------------------

/// Event streams as JSON files.
#[derive(Clone, Debug)]
pub struct DiskEventStore {
    files: Arc<Files>,
}

impl DiskEventStore {
    pub fn new(base: &Path) -> Result<Self, StoreError> {
        Ok(DiskEventStore {
            files: Arc::new(Files::new(base, EVENTS_DIR)?),
        })
    }

    fn batch_path(dir: &Path, first: u64, last: u64) -> PathBuf {
        dir.join(format!("{EVENT_FILE_PREFIX}{first}-{last}.json"))
    }

    /// Returns the event batches of a stream as first and last versions.
    ///
    /// The batches must follow each other from version 1. A file that
    /// looks like an event file but does not fit is an error, the stream
    /// cannot be trusted then.
    fn batches(files: &Files, dir: &Path) -> Result<Vec<(u64, u64)>, StoreError> {
        let mut batches = vec![];
        for name in files.list(dir, true)? {
            let range = match name.strip_prefix(EVENT_FILE_PREFIX) {
                Some(range) => range,
                None => continue,
            };
            let parsed = range.split_once('-').and_then(|(first, last)| {
                Some((first.parse::<u64>().ok()?, last.parse::<u64>().ok()?))
            });
            match parsed {
                Some((first, last)) if first >= 1 && first <= last => {
                    batches.push((first, last))
                }
                _ => {
                    return Err(StoreError::other(format!(
                        "unexpected event file '{name}.json' in '{}'",
                        dir.display()
                    )));
                }
            }
        }
        batches.sort();

        let mut next = 1;
        for (first, last) in &batches {
            if *first != next {
                return Err(StoreError::other(format!(
                    "events in '{}' do not continue at version {next}",
                    dir.display()
                )));
            }
            next = last + 1;
        }
        Ok(batches)
    }

    /// Returns the version of the last event in the stream.
    fn last_version(files: &Files, dir: &Path) -> Result<u64, StoreError> {
        Ok(Self::batches(files, dir)?
            .last()
            .map(|(_, last)| *last)
            .unwrap_or(0))
    }
}

#[async_trait]
impl EventStoreClient for DiskEventStore {
    async fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: u64,
        events: Vec<EventEnvelope>,
    ) -> Result<AppendOutcome, StoreError> {
        check_append(entity_type, entity_id, expected_version, &events)?;

        let files = self.files.clone();
        let segments = [entity_type.to_string(), entity_id.to_string()];
        blocking(move || {
            let segments = [segments[0].as_str(), segments[1].as_str()];
            let mut lock = files.lock(&segments)?;
            let _guard = lock.write()?;

            let dir = files.dir(&segments);
            let actual = Self::last_version(&files, &dir)?;
            if actual != expected_version {
                return Ok(AppendOutcome::VersionConflict { actual });
            }

            let (first, last) = match (events.first(), events.last()) {
                (Some(first), Some(last)) => (first.version, last.version),
                _ => return Ok(AppendOutcome::Appended { version: actual }),
            };
            files.write(&Self::batch_path(&dir, first, last), &events, false)?;
            Ok(AppendOutcome::Appended { version: last })
        })
        .await
    }

    async fn read_since(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_version: u64,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let files = self.files.clone();
        let dir = files.dir(&[entity_type, entity_id]);
        blocking(move || {
            let mut events = vec![];
            for (first, last) in Self::batches(&files, &dir)? {
                if last <= after_version {
                    continue;
                }
                let path = Self::batch_path(&dir, first, last);
                let batch: Vec<EventEnvelope> = files.read(&path)?.unwrap_or_default();
                if batch.len() as u64 != last - first + 1 {
                    return Err(StoreError::other(format!(
                        "'{}' does not hold versions {first} to {last}",
                        path.display()
                    )));
                }
                events.extend(
                    batch.into_iter().filter(|event| event.version > after_version),
                );
            }
            Ok(events)
        })
        .await
    }

    async fn read_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<SnapshotEnvelope>, StoreError> {
        let files = self.files.clone();
        let path = files.dir(&[entity_type, entity_id]).join(SNAPSHOT_FILE_NAME);
        blocking(move || files.read(&path)).await
    }

    async fn store_snapshot(
        &self,
        snapshot: &SnapshotEnvelope,
    ) -> Result<(), StoreError> {
        let files = self.files.clone();
        let snapshot = snapshot.clone();
        blocking(move || {
            let segments = [
                snapshot.entity_type_name.as_str(),
                snapshot.entity_id.as_str(),
            ];
            let mut lock = files.lock(&segments)?;
            let _guard = lock.write()?;

            let path = files.dir(&segments).join(SNAPSHOT_FILE_NAME);
            files.write(&path, &snapshot, true)
        })
        .await
    }

    async fn list_entity_ids(
        &self,
        entity_type: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<String>, StoreError> {
        let files = self.files.clone();
        let type_dir = files.dir(&[entity_type]);
        let after = after.map(str::to_string);
        blocking(move || {
            let mut ids = vec![];
            for id in files.list(&type_dir, false)? {
                let dir = type_dir.join(encode(&id));
                if !Self::batches(&files, &dir)?.is_empty() {
                    ids.push(id);
                }
            }
            let ids = page_after(ids, after.as_deref(), limit);
            Ok(Page::new(ids, limit, String::clone))
        })
        .await
    }
}

//------------ DiskReadModelStore --------------------------------------------

/// Read models as JSON files, one per record.
#[derive(Clone, Debug)]
pub struct DiskReadModelStore {
    files: Arc<Files>,
}

impl DiskReadModelStore {
    pub fn new(base: &Path) -> Result<Self, StoreError> {
        Ok(DiskReadModelStore {
            files: Arc::new(Files::new(base, READ_MODELS_DIR)?),
        })
    }

    fn record_path(files: &Files, read_model: &str, id: &str) -> PathBuf {
        files.dir(&[read_model]).join(format!("{}.json", encode(id)))
    }
}

#[async_trait]
impl ReadModelStore for DiskReadModelStore {
    async fn entry(
        &self,
        read_model: &str,
        id: &str,
    ) -> Result<Option<ReadModelEntry>, StoreError> {
        let files = self.files.clone();
        let path = Self::record_path(&files, read_model, id);
        blocking(move || files.read(&path)).await
    }

    async fn write_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        write: ReadModelWrite,
    ) -> Result<PutOutcome, StoreError> {
        let files = self.files.clone();
        let read_model = read_model.to_string();
        let id = id.to_string();
        blocking(move || {
            let mut lock = files.lock(&[read_model.as_str()])?;
            let _guard = lock.write()?;

            let path = Self::record_path(&files, &read_model, &id);
            let current = files
                .read::<ReadModelEntry>(&path)?
                .map(|entry| entry.version())
                .unwrap_or(0);
            if current != expected_version {
                return Ok(PutOutcome::VersionConflict);
            }

            let version = current + 1;
            let entry = ReadModelEntry::Present(write.into_record(&id, version));
            files.write(&path, &entry, true)?;
            Ok(PutOutcome::Stored { version })
        })
        .await
    }

    async fn remove_if_version(
        &self,
        read_model: &str,
        id: &str,
        expected_version: u64,
        sources: SourceVersions,
    ) -> Result<DeleteOutcome, StoreError> {
        let files = self.files.clone();
        let read_model = read_model.to_string();
        let id = id.to_string();
        blocking(move || {
            let mut lock = files.lock(&[read_model.as_str()])?;
            let _guard = lock.write()?;

            let path = Self::record_path(&files, &read_model, &id);
            match files.read::<ReadModelEntry>(&path)? {
                None | Some(ReadModelEntry::Deleted { .. }) => {
                    Ok(DeleteOutcome::AlreadyAbsent)
                }
                Some(entry) if entry.version() != expected_version => {
                    Ok(DeleteOutcome::VersionConflict)
                }
                Some(entry) => {
                    files.write(&path, &entry.tombstone(sources), true)?;
                    Ok(DeleteOutcome::Deleted)
                }
            }
        })
        .await
    }

    async fn list(
        &self,
        read_model: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Page<ReadModelRecord>, StoreError> {
        let files = self.files.clone();
        let read_model = read_model.to_string();
        let after = after.map(str::to_string);
        blocking(move || {
            let ids = files.list(&files.dir(&[read_model.as_str()]), true)?;
            let mut records = vec![];
            for id in page_after(ids, after.as_deref(), usize::MAX) {
                if records.len() == limit {
                    break;
                }
                let path = Self::record_path(&files, &read_model, &id);
                if let Some(ReadModelEntry::Present(record)) = files.read(&path)? {
                    records.push(record);
                }
            }
            Ok(Page::new(records, limit, |record: &ReadModelRecord| {
                record.id.clone()
            }))
        })
        .await
    }
}

//------------ Tests ---------------------------------------------------------
