// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use hashing::ContentDigest;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

const SNAPSHOT_FILE: &str = "hash_cache.json";
const JOURNAL_FILE: &str = "hash_cache.journal";

#[derive(Clone, Debug, Deserialize, Serialize)]
struct CacheEntry {
    mtime_nanos: u64,
    size: u64,
    digest: ContentDigest,
}

#[derive(Deserialize, Serialize)]
struct JournalRecord {
    path: String,
    entry: CacheEntry,
}

///
/// A persistent map of `(absolute path, mtime, size)` to the file's content digest, so that
/// unchanged files are never re-hashed. Loss or corruption of the backing files is never a
/// correctness hazard: the cache silently starts empty and digests are recomputed.
///
/// Writes append to a journal as they happen; `flush` folds the journal into a snapshot that
/// is rewritten atomically. Lookups take a read lock only, so they do not serialize behind
/// stores.
///
pub struct HashCache {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
    // All mutation (journal appends and snapshot rewrites) is funnelled through this lock.
    writer: Mutex<()>,
}

impl HashCache {
    pub fn open(state_dir: &Path) -> Result<HashCache, String> {
        fs::create_dir_all(state_dir)
            .map_err(|e| format!("Failed to create {}: {e}", state_dir.display()))?;
        let snapshot_path = state_dir.join(SNAPSHOT_FILE);
        let journal_path = state_dir.join(JOURNAL_FILE);

        let mut entries: HashMap<String, CacheEntry> = match fs::read(&snapshot_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                log::debug!("Discarding unreadable hash cache snapshot: {e}");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };

        if let Ok(file) = fs::File::open(&journal_path) {
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                match serde_json::from_str::<JournalRecord>(&line) {
                    Ok(record) => {
                        entries.insert(record.path, record.entry);
                    }
                    Err(e) => {
                        // A torn write at the tail is expected after a crash; everything after
                        // it is untrusted.
                        log::debug!("Discarding hash cache journal from corrupt record: {e}");
                        break;
                    }
                }
            }
        }

        Ok(HashCache {
            snapshot_path,
            journal_path,
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
        })
    }

    ///
    /// The cached digest for `path`, if the file's current `(mtime, size)` still matches the
    /// cached key. Any difference is a miss.
    ///
    pub fn lookup(&self, path: &Path) -> Option<ContentDigest> {
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let key = cache_key(path);
        let entries = self.entries.read();
        let entry = entries.get(&key)?;
        if entry.mtime_nanos != mtime_nanos(&metadata) || entry.size != metadata.len() {
            return None;
        }
        Some(entry.digest)
    }

    ///
    /// Record the digest of `path`. The file is stat'ed now; if it no longer matches the
    /// digested size the store is skipped, since the keying tuple would be a lie.
    ///
    pub fn store(&self, path: &Path, digest: ContentDigest) -> Result<(), String> {
        let metadata = fs::metadata(path)
            .map_err(|e| format!("Failed to stat {} for the hash cache: {e}", path.display()))?;
        if metadata.len() != digest.size_bytes {
            log::debug!(
                "Not caching digest for {}: the file changed while it was being hashed",
                path.display()
            );
            return Ok(());
        }

        let key = cache_key(path);
        let entry = CacheEntry {
            mtime_nanos: mtime_nanos(&metadata),
            size: metadata.len(),
            digest,
        };
        let record = JournalRecord {
            path: key.clone(),
            entry: entry.clone(),
        };
        let line = serde_json::to_string(&record)
            .map_err(|e| format!("Failed to encode hash cache record: {e}"))?;

        let _writer = self.writer.lock();
        self.entries.write().insert(key, entry);
        let mut journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| format!("Failed to open {}: {e}", self.journal_path.display()))?;
        journal
            .write_all(format!("{line}\n").as_bytes())
            .map_err(|e| format!("Failed to append to {}: {e}", self.journal_path.display()))?;
        Ok(())
    }

    ///
    /// Fold the journal into the snapshot. The snapshot is written to a temporary file and
    /// renamed into place, so a crash leaves either the old or the new snapshot, never a
    /// truncated one.
    ///
    pub fn flush(&self) -> Result<(), String> {
        let _writer = self.writer.lock();
        let serialized = {
            let entries = self.entries.read();
            serde_json::to_vec(&*entries)
                .map_err(|e| format!("Failed to encode hash cache snapshot: {e}"))?
        };

        let directory = self
            .snapshot_path
            .parent()
            .ok_or_else(|| "The hash cache snapshot has no parent directory".to_owned())?;
        let mut temp = tempfile::NamedTempFile::new_in(directory)
            .map_err(|e| format!("Failed to create a temporary snapshot: {e}"))?;
        temp.write_all(&serialized)
            .map_err(|e| format!("Failed to write the snapshot: {e}"))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| format!("Failed to persist the snapshot: {e}"))?;

        let _ = fs::remove_file(&self.journal_path);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

fn cache_key(path: &Path) -> String {
    if path.is_absolute() {
        path.to_string_lossy().into_owned()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned()
    }
}

fn mtime_nanos(metadata: &fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}
