// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hashing::{ContentDigest, Fingerprint};
use serde::{Deserialize, Serialize};

const UPLOADS_DIR: &str = "uploads";
const DOWNLOADS_DIR: &str = "downloads";

///
/// Durable state for one in-flight upload. The chunk structure (`chunk_size`, `block_md5s`)
/// is immutable for the lifetime of `upload_id`; only `completed_chunks` grows.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct UploadSession {
    pub upload_id: String,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub chunk_size: u64,
    pub total_chunks: usize,
    pub block_md5s: Vec<Fingerprint>,
    pub completed_chunks: BTreeSet<usize>,
    pub digest: ContentDigest,
    /// The local file's mtime when it was digested. A change mid-upload invalidates the
    /// session: the declared block structure no longer describes what is on disk.
    pub local_mtime_nanos: u64,
    /// Seconds since the epoch at precreate time.
    pub created_at: u64,
}

impl UploadSession {
    pub fn remaining_chunks(&self) -> Vec<usize> {
        (0..self.total_chunks)
            .filter(|index| !self.completed_chunks.contains(index))
            .collect()
    }
}

///
/// Durable state for one in-flight download. Segment `i` covers bytes
/// `[i * segment_size, min((i + 1) * segment_size, total_size))` of the temp file.
///
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DownloadSession {
    pub remote_fsid: u64,
    pub remote_path: String,
    pub local_path: PathBuf,
    pub total_size: u64,
    pub segment_size: u64,
    pub completed_segments: BTreeSet<usize>,
    pub temp_path: PathBuf,
}

///
/// One small JSON file per in-flight transfer, under the state directory. Saves are atomic
/// (write-temp then rename); unreadable session files are discarded rather than trusted.
///
pub struct ResumeStore {
    uploads_dir: PathBuf,
    downloads_dir: PathBuf,
}

impl ResumeStore {
    pub fn open(state_dir: &Path) -> Result<ResumeStore, String> {
        let uploads_dir = state_dir.join(UPLOADS_DIR);
        let downloads_dir = state_dir.join(DOWNLOADS_DIR);
        for directory in [&uploads_dir, &downloads_dir] {
            fs::create_dir_all(directory)
                .map_err(|e| format!("Failed to create {}: {e}", directory.display()))?;
        }
        Ok(ResumeStore {
            uploads_dir,
            downloads_dir,
        })
    }

    /// Uploads are keyed by everything that pins the chunk structure: a session must never be
    /// resumed against a different file, size, chunking, or destination.
    pub fn upload_key(
        local_path: &Path,
        size: u64,
        chunk_size: u64,
        remote_path: &str,
    ) -> String {
        let material = format!(
            "{}\n{size}\n{chunk_size}\n{remote_path}",
            local_path.display()
        );
        Fingerprint::of_bytes(material.as_bytes()).to_hex()
    }

    pub fn download_key(remote_fsid: u64, local_path: &Path) -> String {
        let material = format!("{remote_fsid}\n{}", local_path.display());
        Fingerprint::of_bytes(material.as_bytes()).to_hex()
    }

    pub fn load_upload(&self, key: &str) -> Option<UploadSession> {
        load_session(&self.uploads_dir.join(format!("{key}.json")))
    }

    pub fn save_upload(&self, key: &str, session: &UploadSession) -> Result<(), String> {
        save_session(&self.uploads_dir, key, session)
    }

    pub fn clear_upload(&self, key: &str) {
        let _ = fs::remove_file(self.uploads_dir.join(format!("{key}.json")));
    }

    pub fn load_download(&self, key: &str) -> Option<DownloadSession> {
        load_session(&self.downloads_dir.join(format!("{key}.json")))
    }

    pub fn save_download(&self, key: &str, session: &DownloadSession) -> Result<(), String> {
        save_session(&self.downloads_dir, key, session)
    }

    pub fn clear_download(&self, key: &str) {
        let _ = fs::remove_file(self.downloads_dir.join(format!("{key}.json")));
    }
}

fn load_session<S: serde::de::DeserializeOwned>(path: &Path) -> Option<S> {
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(session) => Some(session),
        Err(e) => {
            log::debug!("Discarding unreadable session file {}: {e}", path.display());
            let _ = fs::remove_file(path);
            None
        }
    }
}

fn save_session<S: Serialize>(directory: &Path, key: &str, session: &S) -> Result<(), String> {
    let serialized = serde_json::to_vec(session)
        .map_err(|e| format!("Failed to encode the session for {key}: {e}"))?;
    let mut temp = tempfile::NamedTempFile::new_in(directory)
        .map_err(|e| format!("Failed to create a temporary session file: {e}"))?;
    temp.write_all(&serialized)
        .map_err(|e| format!("Failed to write the session for {key}: {e}"))?;
    temp.persist(directory.join(format!("{key}.json")))
        .map_err(|e| format!("Failed to persist the session for {key}: {e}"))?;
    Ok(())
}
