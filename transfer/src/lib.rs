// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hashing::ContentDigest;
use store::{HashCache, ResumeStore};
use task_executor::Executor;
use tokio_util::sync::CancellationToken;
use xpan_api::{Error, OverwritePolicy, ProgressSink, XpanClient};

mod download;
mod upload;

#[cfg(test)]
mod download_tests;

#[derive(Clone, Debug)]
pub struct UploadOptions {
    /// Per-slice size. Must match across resume attempts: it pins the declared block
    /// structure.
    pub chunk_size: u64,
    pub workers: usize,
    pub policy: OverwritePolicy,
    /// The provider-mandated rapid-upload slice; distinct from `chunk_size`.
    pub slice_md5_size: u64,
    /// Files smaller than this skip the rapid-upload probe.
    pub rapid_upload_threshold: u64,
}

impl Default for UploadOptions {
    fn default() -> UploadOptions {
        UploadOptions {
            chunk_size: 4 * 1024 * 1024,
            workers: 8,
            policy: OverwritePolicy::Overwrite,
            slice_md5_size: hashing::DEFAULT_SLICE_SIZE,
            rapid_upload_threshold: 256 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    /// Per-segment range size.
    pub segment_size: u64,
    /// Download parallelism, and the number of independent signed links acquired.
    pub workers: usize,
    /// Below this, a single GET avoids segmentation overhead.
    pub small_file_threshold: u64,
    /// End-to-end MD5 verification over the assembled file. Off by default: the provider's
    /// reported MD5 is not the standard whole-file MD5 for some large files. The length check
    /// always runs.
    pub verify_md5: bool,
    /// Kill a segment read that has not produced a byte for this long.
    pub idle_timeout: Duration,
    /// Persist the session every N completed segments (and always at the end).
    pub session_flush_interval: usize,
}

impl Default for DownloadOptions {
    fn default() -> DownloadOptions {
        DownloadOptions {
            segment_size: 4 * 1024 * 1024,
            workers: 32,
            small_file_threshold: 1024 * 1024,
            verify_md5: false,
            idle_timeout: Duration::from_secs(60),
            session_flush_interval: 8,
        }
    }
}

struct Inner {
    client: XpanClient,
    hash_cache: HashCache,
    resume: ResumeStore,
    executor: Executor,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

///
/// The transfer engine: uploads and downloads, both resumable, both cancellable, both driving
/// the worker pool. Cheap to clone; all clones share the same stores and cancellation signal.
///
#[derive(Clone)]
pub struct Transfers {
    inner: Arc<Inner>,
}

impl Transfers {
    pub fn new(
        client: XpanClient,
        hash_cache: HashCache,
        resume: ResumeStore,
        executor: Executor,
        progress: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Transfers {
        Transfers {
            inner: Arc::new(Inner {
                client,
                hash_cache,
                resume,
                executor,
                progress,
                cancel,
            }),
        }
    }

    pub fn client(&self) -> &XpanClient {
        &self.inner.client
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    ///
    /// The content digest of a local file, via the hash cache. A hit costs one stat; a miss
    /// costs one sequential read of the file.
    ///
    pub async fn digest_local(
        &self,
        path: &Path,
        slice_limit: u64,
    ) -> Result<ContentDigest, Error> {
        if let Some(digest) = self.inner.hash_cache.lookup(path) {
            return Ok(digest);
        }
        let digest = hashing::digest_file(path, slice_limit)
            .await
            .map_err(|e| Error::LocalIo(format!("Failed to hash {}: {e}", path.display())))?;
        if let Err(e) = self.inner.hash_cache.store(path, digest) {
            log::warn!("Failed to cache the digest of {}: {e}", path.display());
        }
        Ok(digest)
    }

    /// Persist the hash cache snapshot. Called once per process exit, not per file.
    pub fn flush_hash_cache(&self) {
        if let Err(e) = self.inner.hash_cache.flush() {
            log::warn!("Failed to flush the hash cache: {e}");
        }
    }
}

pub(crate) fn mtime_nanos(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|duration| duration.as_nanos() as u64)
        .unwrap_or(0)
}
