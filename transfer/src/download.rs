// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeSet;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use store::{DownloadSession, ResumeStore};
use task_executor::WorkerPool;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::{Retry, RetryError};
use url::Url;
use xpan_api::{Error, RemoteFile};

use crate::{DownloadOptions, Transfers};

pub fn jitter(duration: Duration) -> Duration {
    duration.mul_f64(rand::random::<f64>())
}

impl Transfers {
    ///
    /// Download one remote file. Small files take a single GET; everything else is segmented
    /// across `workers` independent signed links with positional writes into a preallocated
    /// `.part` file, then renamed into place after the mandatory length check.
    ///
    pub async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf, Error> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let remote = inner
            .client
            .meta(remote_path)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{remote_path} does not exist on the server")))?;
        if remote.is_dir {
            return Err(Error::Conflict(format!(
                "{remote_path} is a directory, not a file"
            )));
        }

        inner.progress.set_total(remote.size);
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::LocalIo(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }

        let temp_path = {
            let mut os = local_path.as_os_str().to_owned();
            os.push(".part");
            PathBuf::from(os)
        };

        if remote.size < options.small_file_threshold {
            self.download_small(&remote, local_path, &temp_path, options)
                .await
        } else {
            self.download_segmented(&remote, local_path, &temp_path, options)
                .await
        }
    }

    ///
    /// The unsegmented path: one GET through one link, retried as a whole with exponential
    /// backoff and jitter.
    ///
    async fn download_small(
        &self,
        remote: &RemoteFile,
        local_path: &Path,
        temp_path: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf, Error> {
        let inner = &self.inner;
        let retry = inner.client.retry_options();
        let retry_strategy = ExponentialFactorBackoff::from_millis(
            retry.backoff_base.as_millis().max(1) as u64,
            2.0,
        )
        .map(jitter)
        .take(retry.max_retries);

        let mut attempt_number = 0;
        Retry::spawn(retry_strategy, || {
            attempt_number += 1;
            log::debug!(
                "Downloading {} (attempt #{})",
                remote.path,
                attempt_number
            );
            let this = self.clone();
            let remote = remote.clone();
            let temp_path = temp_path.to_path_buf();
            let idle_timeout = options.idle_timeout;
            async move {
                this.attempt_small_download(&remote, &temp_path, idle_timeout)
                    .await
                    .map_err(|err| match err {
                        // A link can expire between issuance and use; fetch a fresh one.
                        Error::Transient(_) | Error::Expired(_) | Error::Integrity(_) => {
                            RetryError::transient(err)
                        }
                        other => RetryError::permanent(other),
                    })
            }
        })
        .await?;

        tokio::fs::rename(temp_path, local_path).await.map_err(|e| {
            Error::LocalIo(format!("Failed to move into {}: {e}", local_path.display()))
        })?;
        Ok(local_path.to_path_buf())
    }

    async fn attempt_small_download(
        &self,
        remote: &RemoteFile,
        temp_path: &Path,
        idle_timeout: Duration,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let link = inner.client.dlink(remote.fsid).await?;
        let response = inner.client.read_dlink(&link, None).await?;
        let mut stream = response.bytes_stream();

        let mut file = tokio::fs::File::create(temp_path).await.map_err(|e| {
            Error::LocalIo(format!("Failed to create {}: {e}", temp_path.display()))
        })?;
        let mut written: u64 = 0;
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| {
                    Error::Transient(format!(
                        "The download of {} stalled with no bytes received",
                        remote.path
                    ))
                })?;
            let Some(chunk) = next else { break };
            let chunk =
                chunk.map_err(|e| Error::Transient(format!("Error reading {}: {e}", remote.path)))?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
                .await
                .map_err(|e| {
                    Error::LocalIo(format!("Failed to write {}: {e}", temp_path.display()))
                })?;
            written += chunk.len() as u64;
            inner.progress.add(chunk.len() as u64);
        }

        if written != remote.size {
            let _ = tokio::fs::remove_file(temp_path).await;
            return Err(Error::Integrity(format!(
                "Downloaded {written} bytes of {}, expected {}",
                remote.path, remote.size
            )));
        }
        Ok(())
    }

    async fn download_segmented(
        &self,
        remote: &RemoteFile,
        local_path: &Path,
        temp_path: &Path,
        options: &DownloadOptions,
    ) -> Result<PathBuf, Error> {
        let inner = &self.inner;
        let segment_size = options.segment_size.max(1);
        let total_segments = remote.size.div_ceil(segment_size) as usize;
        let session_key = ResumeStore::download_key(remote.fsid, local_path);

        // A resumable temp file must exist at full length; anything else restarts clean.
        let temp_usable = std::fs::metadata(temp_path)
            .map(|m| m.is_file() && m.len() == remote.size)
            .unwrap_or(false);

        let mut session = match inner.resume.load_download(&session_key) {
            Some(saved)
                if saved.remote_fsid == remote.fsid
                    && saved.total_size == remote.size
                    && saved.segment_size == segment_size
                    && temp_usable =>
            {
                log::debug!(
                    "Resuming download of {}: {} of {total_segments} segments already done",
                    remote.path,
                    saved.completed_segments.len(),
                );
                saved
            }
            Some(_) => {
                log::debug!("Discarding a drifted download session for {}", remote.path);
                inner.resume.clear_download(&session_key);
                new_session(remote, local_path, temp_path, segment_size)
            }
            None => new_session(remote, local_path, temp_path, segment_size),
        };
        if !temp_usable {
            session.completed_segments.clear();
        }

        // Preallocate (sparse is fine): every write below is positional.
        let file = {
            let temp_path = temp_path.to_path_buf();
            let size = remote.size;
            let preallocate = !temp_usable;
            inner
                .executor
                .spawn_blocking(
                    move || -> Result<std::fs::File, Error> {
                        let file = std::fs::OpenOptions::new()
                            .read(true)
                            .write(true)
                            .create(true)
                            .truncate(false)
                            .open(&temp_path)
                            .map_err(|e| {
                                Error::LocalIo(format!(
                                    "Failed to open {}: {e}",
                                    temp_path.display()
                                ))
                            })?;
                        if preallocate {
                            file.set_len(size).map_err(|e| {
                                Error::LocalIo(format!(
                                    "Failed to preallocate {}: {e}",
                                    temp_path.display()
                                ))
                            })?;
                        }
                        Ok(file)
                    },
                    |join_error| {
                        Err(Error::LocalIo(format!("Preallocation task died: {join_error}")))
                    },
                )
                .await?
        };
        let file = Arc::new(file);

        // Multiple independent signed links, acquired in parallel, to escape per-connection
        // throttling. Tasks pick a link slot by index; an expired link is refreshed in place.
        let links_needed = options.workers.min(total_segments).max(1);
        let links = future::try_join_all(
            (0..links_needed).map(|_| inner.client.dlink(remote.fsid)),
        )
        .await?;
        let links: Arc<Vec<Mutex<Url>>> = Arc::new(links.into_iter().map(Mutex::new).collect());

        let remaining: Vec<usize> = (0..total_segments)
            .filter(|segment| !session.completed_segments.contains(segment))
            .collect();
        let session = Arc::new(Mutex::new(session));

        let pool = WorkerPool::new(options.workers);
        let run_task = {
            let this = self.clone();
            let links = links.clone();
            let file = file.clone();
            let session = session.clone();
            let session_key = session_key.clone();
            let options = options.clone();
            let fsid = remote.fsid;
            let total_size = remote.size;
            move |_: usize, segment: usize| {
                let this = this.clone();
                let links = links.clone();
                let file = file.clone();
                let session = session.clone();
                let session_key = session_key.clone();
                let options = options.clone();
                async move {
                    this.download_one_segment(
                        fsid,
                        segment,
                        segment_size,
                        total_size,
                        total_segments,
                        file,
                        links,
                        session,
                        &session_key,
                        &options,
                    )
                    .await
                }
            }
        };
        let run_result = pool
            .run(&inner.executor, &inner.cancel, remaining, run_task)
            .await;

        // Flush the session before surfacing anything, including cancellation: the next
        // invocation resumes from whatever completed.
        {
            let snapshot = session.lock().clone();
            if let Err(e) = inner.resume.save_download(&session_key, &snapshot) {
                log::warn!("Failed to persist the download session for {}: {e}", remote.path);
            }
        }
        run_result.map_err(Error::from)?;

        // Assemble: best-effort fsync, mandatory length check, optional digest check, rename.
        {
            let file = file.clone();
            let synced = inner
                .executor
                .spawn_blocking(move || file.sync_all(), |_| Ok(()))
                .await;
            if let Err(e) = synced {
                log::warn!("fsync of {} failed: {e}", temp_path.display());
            }
        }

        let final_len = std::fs::metadata(temp_path)
            .map(|m| m.len())
            .map_err(|e| Error::LocalIo(format!("Failed to stat {}: {e}", temp_path.display())))?;
        if final_len != remote.size {
            let _ = std::fs::remove_file(temp_path);
            return Err(Error::Integrity(format!(
                "Assembled {} bytes of {}, expected {}",
                final_len, remote.path, remote.size
            )));
        }

        if options.verify_md5 {
            if let Some(expected) = remote.md5 {
                let temp = temp_path.to_path_buf();
                let digest = inner
                    .executor
                    .spawn_blocking(
                        move || {
                            let mut file = std::fs::File::open(&temp)?;
                            hashing::sync_digest(&mut file, hashing::DEFAULT_SLICE_SIZE)
                        },
                        |join_error| {
                            Err(std::io::Error::other(format!(
                                "Verification task died: {join_error}"
                            )))
                        },
                    )
                    .await
                    .map_err(|e| {
                        Error::LocalIo(format!("Failed to verify {}: {e}", temp_path.display()))
                    })?;
                if digest.md5 != expected {
                    let _ = std::fs::remove_file(temp_path);
                    return Err(Error::Integrity(format!(
                        "md5 mismatch for {}: expected {expected}, got {}",
                        remote.path, digest.md5
                    )));
                }
            }
        }

        tokio::fs::rename(temp_path, local_path).await.map_err(|e| {
            Error::LocalIo(format!("Failed to move into {}: {e}", local_path.display()))
        })?;
        inner.resume.clear_download(&session_key);
        Ok(local_path.to_path_buf())
    }

    async fn download_one_segment(
        &self,
        fsid: u64,
        segment: usize,
        segment_size: u64,
        total_size: u64,
        total_segments: usize,
        file: Arc<std::fs::File>,
        links: Arc<Vec<Mutex<Url>>>,
        session: Arc<Mutex<DownloadSession>>,
        session_key: &str,
        options: &DownloadOptions,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let start = segment as u64 * segment_size;
        let end = total_size.min(start + segment_size);
        let expected = end - start;
        let slot = segment % links.len();

        let retry = inner.client.retry_options();
        let mut attempts = 0;
        let mut link_refreshes = 0;
        loop {
            if inner.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let link = links[slot].lock().clone();
            let result = self
                .fetch_segment(&link, start..end, &file, options.idle_timeout)
                .await;
            match result {
                Ok(written) if written == expected => break,
                Ok(written) => {
                    // A short body is treated like any other transient wire failure.
                    if attempts >= retry.max_retries {
                        return Err(Error::Transient(format!(
                            "Segment {segment} kept coming back short: got {written} of {expected} bytes"
                        )));
                    }
                    attempts += 1;
                }
                Err(Error::Expired(message)) => {
                    if link_refreshes >= retry.max_retries {
                        return Err(Error::Expired(message));
                    }
                    link_refreshes += 1;
                    log::debug!("Refreshing an expired download link: {message}");
                    let fresh = inner.client.dlink(fsid).await?;
                    *links[slot].lock() = fresh;
                }
                Err(err) if err.is_retryable() && attempts < retry.max_retries => {
                    attempts += 1;
                    log::debug!("Retrying segment {segment}: {err}");
                    tokio::time::sleep(jitter(retry.backoff_base * (1_u32 << attempts.min(8))))
                        .await;
                }
                Err(err) => return Err(err),
            }
        }

        // Batched session flush to avoid write amplification; the final segment always
        // flushes, and so does the engine on the way out.
        let flush = {
            let mut session = session.lock();
            session.completed_segments.insert(segment);
            let done = session.completed_segments.len();
            done == total_segments || done % options.session_flush_interval.max(1) == 0
        };
        if flush {
            let snapshot = session.lock().clone();
            inner
                .resume
                .save_download(session_key, &snapshot)
                .map_err(Error::LocalIo)?;
        }
        Ok(())
    }

    ///
    /// Stream one ranged GET directly into the temp file at its offset. Returns the number of
    /// bytes written; the caller judges completeness. The watchdog resets on every received
    /// chunk, so only a genuinely idle connection is killed.
    ///
    async fn fetch_segment(
        &self,
        link: &Url,
        range: Range<u64>,
        file: &Arc<std::fs::File>,
        idle_timeout: Duration,
    ) -> Result<u64, Error> {
        let inner = &self.inner;
        let response = inner.client.read_dlink(link, Some(range.clone())).await?;
        let mut stream = response.bytes_stream();

        let mut offset = range.start;
        loop {
            let next = tokio::time::timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| {
                    Error::Transient(format!(
                        "Range {}-{} stalled with no bytes received",
                        range.start, range.end
                    ))
                })?;
            let Some(chunk) = next else { break };
            let chunk = chunk
                .map_err(|e| Error::Transient(format!("Error reading ranged response: {e}")))?;
            let chunk_len = chunk.len() as u64;
            if offset + chunk_len > range.end {
                return Err(Error::Transient(format!(
                    "The server sent more bytes than the requested range {}-{}",
                    range.start, range.end
                )));
            }

            let write_at = offset;
            let file = file.clone();
            inner
                .executor
                .spawn_blocking(
                    move || file.write_all_at(&chunk, write_at),
                    |join_error| {
                        Err(std::io::Error::other(format!(
                            "Segment write task died: {join_error}"
                        )))
                    },
                )
                .await
                .map_err(|e| Error::LocalIo(format!("Failed to write segment bytes: {e}")))?;

            offset += chunk_len;
            inner.progress.add(chunk_len);
        }
        Ok(offset - range.start)
    }
}

fn new_session(
    remote: &RemoteFile,
    local_path: &Path,
    temp_path: &Path,
    segment_size: u64,
) -> DownloadSession {
    DownloadSession {
        remote_fsid: remote.fsid,
        remote_path: remote.path.clone(),
        local_path: local_path.to_path_buf(),
        total_size: remote.size,
        segment_size,
        completed_segments: BTreeSet::new(),
        temp_path: temp_path.to_path_buf(),
    }
}
