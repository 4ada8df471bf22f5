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

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use hashing::Fingerprint;

mod client;
pub mod retry;

#[cfg(test)]
mod client_tests;
#[cfg(test)]
mod retry_tests;

pub use crate::client::{Precreated, XpanClient, XpanClientOptions};

/// Provider `errno` values the engines react to. Anything not listed here is surfaced as a
/// `ProtocolError` with the raw code attached.
pub mod errno {
    pub const OK: i64 = 0;
    pub const NOT_AUTHORIZED: i64 = -6;
    pub const FILE_EXISTS: i64 = -8;
    pub const TOKEN_INVALID: i64 = 110;
    pub const TOKEN_EXPIRED: i64 = 111;
    pub const RATE_LIMITED: i64 = 31034;
    pub const NO_SUCH_FILE: i64 = 31066;
    pub const RAPID_NO_MATCH: i64 = 31079;
    pub const UPLOAD_ID_EXPIRED: i64 = 31363;
}

///
/// The error taxonomy of the client and the engines built on it. The retry harness acts on the
/// classification: `Transient` is retried with backoff, `AuthExpired` triggers one token
/// refresh, everything else propagates to the caller.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Missing/invalid token that a refresh could not repair. Fatal to the operation.
    Auth(String),
    /// The provider rejected the token; a refresh may repair it.
    AuthExpired(String),
    /// Retryable at the harness level; never surfaces if a retry succeeds.
    Transient(String),
    /// The provider returned a well-formed but semantically invalid response.
    Protocol(String),
    /// Disk full, permission denied, file vanished or mutated. Fatal to the current file.
    LocalIo(String),
    /// `FailIfExists` hit an existing remote file. Non-fatal; reported as skipped.
    Conflict(String),
    /// Post-download length or digest mismatch.
    Integrity(String),
    /// A provider-issued artifact (upload id or download link) outlived its validity.
    Expired(String),
    /// The named remote path does not exist.
    NotFound(String),
    /// The process-wide cancellation signal fired.
    Cancelled,
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Auth(s) => write!(f, "Authentication failed: {s}"),
            Error::AuthExpired(s) => write!(f, "Access token expired: {s}"),
            Error::Transient(s) => write!(f, "{s} (retryable)"),
            Error::Protocol(s) => write!(f, "Protocol error: {s}"),
            Error::LocalIo(s) => write!(f, "Local I/O error: {s}"),
            Error::Conflict(s) => write!(f, "Conflict: {s}"),
            Error::Integrity(s) => write!(f, "Integrity check failed: {s}"),
            Error::Expired(s) => write!(f, "{s} (expired)"),
            Error::NotFound(s) => write!(f, "Not found: {s}"),
            Error::Cancelled => write!(f, "Cancelled"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}

impl From<task_executor::RunError<Error>> for Error {
    fn from(err: task_executor::RunError<Error>) -> Self {
        match err {
            task_executor::RunError::Cancelled => Error::Cancelled,
            task_executor::RunError::Failed(e) => e,
        }
    }
}

///
/// One remote file or directory. `fsid` is the durable identity across renames and moves; the
/// `md5` is present for files only, and for certain large files is a provider-defined variant
/// rather than the standard whole-file MD5.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteFile {
    pub fsid: u64,
    pub path: String,
    pub size: u64,
    pub mtime: u64,
    pub is_dir: bool,
    pub md5: Option<Fingerprint>,
}

///
/// What to do when the destination of an upload already exists. `Rename` asks the server to
/// append a numeric suffix; `Skip` is resolved client-side by probing before transferring.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OverwritePolicy {
    FailIfExists,
    Overwrite,
    Rename,
    Skip,
}

impl OverwritePolicy {
    /// The provider's `rtype` request field.
    pub fn rtype(self) -> u32 {
        match self {
            OverwritePolicy::FailIfExists | OverwritePolicy::Skip => 0,
            OverwritePolicy::Rename => 1,
            OverwritePolicy::Overwrite => 3,
        }
    }
}

impl FromStr for OverwritePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(OverwritePolicy::FailIfExists),
            "overwrite" => Ok(OverwritePolicy::Overwrite),
            "rename" => Ok(OverwritePolicy::Rename),
            "skip" => Ok(OverwritePolicy::Skip),
            _ => Err(format!(
                "Not a valid overwrite policy: {s}. Should be one of fail, overwrite, rename, skip."
            )),
        }
    }
}

///
/// Yields a currently-valid bearer token, refreshing on demand. Implementations own token
/// persistence and the authorization dance; the engines only ever ask for a token.
///
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn current_token(&self) -> Result<String, Error>;

    /// Force a refresh, returning the new token. Called by the retry harness when the provider
    /// rejects the current token.
    async fn refresh(&self) -> Result<String, Error>;
}

/// A static token that cannot be refreshed. Suitable for tests and short-lived invocations.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new<S: Into<String>>(token: S) -> StaticTokenProvider {
        StaticTokenProvider {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn current_token(&self) -> Result<String, Error> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<String, Error> {
        Err(Error::Auth(
            "This token provider cannot refresh its token.".to_owned(),
        ))
    }
}

///
/// A monotonic byte counter consumed by the engines. Implementations must not block.
///
pub trait ProgressSink: Send + Sync + 'static {
    fn add(&self, bytes: u64);
    fn set_total(&self, bytes: u64);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn add(&self, _: u64) {}
    fn set_total(&self, _: u64) {}
}

/// Counts into atomics. Useful for tests and as a building block for renderers.
#[derive(Default)]
pub struct CountingProgress {
    transferred: AtomicU64,
    total: AtomicU64,
}

impl CountingProgress {
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl ProgressSink for CountingProgress {
    fn add(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    fn set_total(&self, bytes: u64) {
        self.total.store(bytes, Ordering::Relaxed);
    }
}
