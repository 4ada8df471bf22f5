// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashing::{ContentDigest, Fingerprint};
use parking_lot::Mutex;
use store::{ResumeStore, UploadSession};
use task_executor::WorkerPool;
use xpan_api::{Error, OverwritePolicy, RemoteFile};

use crate::{mtime_nanos, Transfers, UploadOptions};

impl Transfers {
    ///
    /// Upload one local file. In order: digest (through the hash cache), rapid-upload probe,
    /// session resume or precreate, parallel slice upload, create. Returns the resulting
    /// remote file; for `Skip` against an existing destination, that is the existing file and
    /// no bytes move.
    ///
    pub async fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
    ) -> Result<RemoteFile, Error> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if matches!(
            options.policy,
            OverwritePolicy::Skip | OverwritePolicy::FailIfExists
        ) {
            if let Some(existing) = inner.client.meta(remote_path).await? {
                return match options.policy {
                    OverwritePolicy::Skip => {
                        log::debug!("Skipping upload of {}: {remote_path} exists", local_path.display());
                        Ok(existing)
                    }
                    _ => Err(Error::Conflict(format!(
                        "{remote_path} already exists on the server"
                    ))),
                };
            }
        }

        let digest = self.digest_local(local_path, options.slice_md5_size).await?;
        inner.progress.set_total(digest.size_bytes);

        if digest.size_bytes >= options.rapid_upload_threshold {
            if let Some(remote) = inner
                .client
                .rapid_upload(remote_path, &digest, options.policy)
                .await?
            {
                log::info!(
                    "Rapid upload matched {} as {}: no bytes transferred",
                    local_path.display(),
                    remote.path
                );
                return Ok(remote);
            }
        }

        let chunk_size = options.chunk_size.max(1);
        let session_key =
            ResumeStore::upload_key(local_path, digest.size_bytes, chunk_size, remote_path);

        // One restart when the server expires the upload id mid-flight; a second expiry is
        // surfaced to the caller.
        let mut restarted = false;
        loop {
            match self
                .upload_once(local_path, remote_path, options, &digest, chunk_size, &session_key)
                .await
            {
                Err(Error::Expired(message)) if !restarted => {
                    log::debug!("Upload session for {remote_path} expired; restarting: {message}");
                    inner.resume.clear_upload(&session_key);
                    restarted = true;
                }
                other => return other,
            }
        }
    }

    async fn upload_once(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
        digest: &ContentDigest,
        chunk_size: u64,
        session_key: &str,
    ) -> Result<RemoteFile, Error> {
        let inner = &self.inner;

        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| Error::LocalIo(format!("Failed to stat {}: {e}", local_path.display())))?;
        if metadata.len() != digest.size_bytes {
            return Err(Error::LocalIo(format!(
                "{} changed size while preparing its upload",
                local_path.display()
            )));
        }
        let local_mtime = mtime_nanos(&metadata);

        // The per-chunk MD5 list doubles as resume validation: a saved session is only
        // trusted when it declares exactly this block structure.
        let block_md5s =
            compute_block_md5s(self, local_path.to_path_buf(), chunk_size, digest.size_bytes)
                .await?;

        let session = match inner.resume.load_upload(session_key) {
            Some(saved)
                if saved.digest == *digest
                    && saved.chunk_size == chunk_size
                    && saved.local_mtime_nanos == local_mtime
                    && saved.block_md5s == block_md5s =>
            {
                log::debug!(
                    "Resuming upload session {} for {remote_path}: {} of {} chunks already done",
                    saved.upload_id,
                    saved.completed_chunks.len(),
                    saved.total_chunks,
                );
                saved
            }
            Some(_) => {
                log::debug!("Discarding a drifted upload session for {remote_path}");
                inner.resume.clear_upload(session_key);
                self.precreate_session(
                    local_path,
                    remote_path,
                    options,
                    digest,
                    chunk_size,
                    local_mtime,
                    block_md5s,
                    session_key,
                )
                .await?
            }
            None => {
                self.precreate_session(
                    local_path,
                    remote_path,
                    options,
                    digest,
                    chunk_size,
                    local_mtime,
                    block_md5s,
                    session_key,
                )
                .await?
            }
        };

        let remaining = session.remaining_chunks();
        let session = Arc::new(Mutex::new(session));

        if !remaining.is_empty() {
            let pool = WorkerPool::new(options.workers);
            let run_task = {
                let this = self.clone();
                let local_path = local_path.to_path_buf();
                let remote_path = remote_path.to_owned();
                let session_key = session_key.to_owned();
                let session = session.clone();
                let digest = *digest;
                move |_: usize, chunk_index: usize| {
                    let this = this.clone();
                    let local_path = local_path.clone();
                    let remote_path = remote_path.clone();
                    let session_key = session_key.clone();
                    let session = session.clone();
                    async move {
                        this.upload_one_chunk(
                            &local_path,
                            &remote_path,
                            chunk_index,
                            chunk_size,
                            &digest,
                            &session,
                            &session_key,
                        )
                        .await
                    }
                }
            };
            pool.run(&inner.executor, &inner.cancel, remaining, run_task)
                .await
                .map_err(Error::from)?;
        }

        let committed = {
            let session = session.lock();
            (session.upload_id.clone(), session.block_md5s.clone())
        };
        let remote = inner
            .client
            .create(
                &committed.0,
                remote_path,
                digest.size_bytes,
                &committed.1,
                options.policy,
            )
            .await?;
        inner.resume.clear_upload(session_key);
        Ok(remote)
    }

    async fn precreate_session(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: &UploadOptions,
        digest: &ContentDigest,
        chunk_size: u64,
        local_mtime: u64,
        block_md5s: Vec<Fingerprint>,
        session_key: &str,
    ) -> Result<UploadSession, Error> {
        let inner = &self.inner;
        let precreated = inner
            .client
            .precreate(remote_path, digest.size_bytes, &block_md5s, options.policy)
            .await?;

        // Chunks the server did not ask for are already on its side.
        let needed: BTreeSet<usize> = precreated.needed.iter().copied().collect();
        let completed_chunks: BTreeSet<usize> =
            (0..block_md5s.len()).filter(|i| !needed.contains(i)).collect();

        let session = UploadSession {
            upload_id: precreated.upload_id,
            remote_path: remote_path.to_owned(),
            local_path: local_path.to_path_buf(),
            chunk_size,
            total_chunks: block_md5s.len(),
            block_md5s,
            completed_chunks,
            digest: *digest,
            local_mtime_nanos: local_mtime,
            created_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        inner
            .resume
            .save_upload(session_key, &session)
            .map_err(Error::LocalIo)?;
        Ok(session)
    }

    async fn upload_one_chunk(
        &self,
        local_path: &Path,
        remote_path: &str,
        chunk_index: usize,
        chunk_size: u64,
        digest: &ContentDigest,
        session: &Arc<Mutex<UploadSession>>,
        session_key: &str,
    ) -> Result<(), Error> {
        let inner = &self.inner;

        // Stat before every read: a file mutated mid-upload would otherwise commit a body
        // that matches neither the old nor the new content.
        let metadata = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| Error::LocalIo(format!("{} vanished mid-upload: {e}", local_path.display())))?;
        let expected_mtime = session.lock().local_mtime_nanos;
        if metadata.len() != digest.size_bytes || mtime_nanos(&metadata) != expected_mtime {
            inner.resume.clear_upload(session_key);
            return Err(Error::LocalIo(format!(
                "{} changed mid-upload; the session has been discarded",
                local_path.display()
            )));
        }

        let offset = chunk_index as u64 * chunk_size;
        let length = chunk_size.min(digest.size_bytes - offset);
        let bytes = {
            let local_path = local_path.to_path_buf();
            inner
                .executor
                .spawn_blocking(
                    move || -> Result<Bytes, Error> {
                        let file = std::fs::File::open(&local_path).map_err(|e| {
                            Error::LocalIo(format!("Failed to open {}: {e}", local_path.display()))
                        })?;
                        let mut buf = vec![0_u8; length as usize];
                        file.read_exact_at(&mut buf, offset).map_err(|e| {
                            Error::LocalIo(format!("Failed to read {}: {e}", local_path.display()))
                        })?;
                        Ok(Bytes::from(buf))
                    },
                    |join_error| {
                        Err(Error::LocalIo(format!("Chunk read task died: {join_error}")))
                    },
                )
                .await?
        };

        let (upload_id, expected_md5) = {
            let session = session.lock();
            (session.upload_id.clone(), session.block_md5s[chunk_index])
        };

        // The server echoes the MD5 it computed for the received bytes. A mismatch means the
        // slice was corrupted in flight: re-issue the same upload.
        let max_retries = inner.client.retry_options().max_retries;
        let mut mismatches = 0;
        loop {
            let echoed = inner
                .client
                .upload_slice(&upload_id, remote_path, chunk_index, bytes.clone())
                .await?;
            if echoed == expected_md5 {
                break;
            }
            if mismatches >= max_retries {
                return Err(Error::Transient(format!(
                    "The server kept echoing a mismatched md5 for chunk {chunk_index} of {remote_path}"
                )));
            }
            mismatches += 1;
            log::warn!(
                "Re-uploading chunk {chunk_index} of {remote_path}: the server echoed a mismatched md5"
            );
        }

        let snapshot = {
            let mut session = session.lock();
            session.completed_chunks.insert(chunk_index);
            session.clone()
        };
        inner
            .resume
            .save_upload(session_key, &snapshot)
            .map_err(Error::LocalIo)?;
        inner.progress.add(length);
        Ok(())
    }
}

///
/// The ordered per-chunk MD5 list, from one streaming pass over the file. This is a distinct
/// quantity from both the whole-file and the slice MD5.
///
async fn compute_block_md5s(
    transfers: &Transfers,
    local_path: PathBuf,
    chunk_size: u64,
    expected_size: u64,
) -> Result<Vec<Fingerprint>, Error> {
    transfers
        .inner
        .executor
        .spawn_blocking(
            move || -> Result<Vec<Fingerprint>, Error> {
                let mut file = std::fs::File::open(&local_path).map_err(|e| {
                    Error::LocalIo(format!("Failed to open {}: {e}", local_path.display()))
                })?;
                let mut block_md5s = Vec::new();
                let mut buf = vec![0_u8; chunk_size as usize];
                let mut total: u64 = 0;
                loop {
                    let n = read_full(&mut file, &mut buf).map_err(|e| {
                        Error::LocalIo(format!("Failed to read {}: {e}", local_path.display()))
                    })?;
                    if n == 0 {
                        break;
                    }
                    block_md5s.push(Fingerprint::of_bytes(&buf[0..n]));
                    total += n as u64;
                    if (n as u64) < chunk_size {
                        break;
                    }
                }
                if total != expected_size {
                    return Err(Error::LocalIo(format!(
                        "{} changed size while computing its block list",
                        local_path.display()
                    )));
                }
                Ok(block_md5s)
            },
            |join_error| Err(Error::LocalIo(format!("Block hashing task died: {join_error}"))),
        )
        .await
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
