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

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use parking_lot::Mutex;
use store::{HashCache, ResumeStore};
use sync::{SyncOptions, Syncer};
use task_executor::Executor;
use tokio_util::sync::CancellationToken;
use transfer::{DownloadOptions, Transfers, UploadOptions};
use url::Url;
use xpan_api::retry::RetryOptions;
use xpan_api::{
    Error, OverwritePolicy, ProgressSink, TokenProvider, XpanClient, XpanClientOptions,
};

// Aggregate exit codes: 0 all-success, 1 any-failure, 2 cancelled. A cancelled run leaves
// resume state behind, so the next invocation picks up where this one stopped.
const EXIT_FAILURE: i32 = 1;
const EXIT_CANCELLED: i32 = 2;

#[derive(Parser)]
#[command(name = "xpan", about = "Transfer and synchronize files against an xpan drive.")]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonOpts {
    /// Path to a file containing the oauth bearer token for the provider. Refreshing re-reads
    /// the file, so an external authorization flow can rotate it while transfers run.
    #[arg(long)]
    token_path: PathBuf,

    /// Directory for the hash cache and resume state. Defaults to the XDG state directory.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Host for control calls.
    #[arg(long, default_value = "https://pan.baidu.com")]
    base_url: Url,

    /// Host for slice uploads.
    #[arg(long, default_value = "https://d.pcs.baidu.com")]
    data_url: Url,

    /// The vendor sandbox all remote paths are relative to.
    #[arg(long, default_value = "/apps/xpan")]
    app_root: String,

    /// Per-slice size for chunked uploads. Must match across resume attempts.
    #[arg(long, default_value = "4194304")]
    upload_chunk_size: u64,

    /// Per-segment range size for downloads.
    #[arg(long, default_value = "4194304")]
    download_segment_size: u64,

    #[arg(long, default_value = "8")]
    max_upload_workers: usize,

    /// Download parallelism, and the number of independent signed links acquired.
    #[arg(long, default_value = "32")]
    max_download_workers: usize,

    /// Retries per API call.
    #[arg(long, default_value = "3")]
    max_retries: usize,

    /// The provider-mandated rapid-upload slice size.
    #[arg(long, default_value = "262144")]
    slice_md5_size: u64,

    /// Below this size, the rapid-upload probe is skipped.
    #[arg(long, default_value = "262144")]
    rapid_upload_threshold: u64,

    /// Parallelism across files during sync, distinct from per-file workers.
    #[arg(long, default_value = "4")]
    file_concurrency: usize,

    /// Verify assembled downloads against the server's md5. Off by default: the server's md5
    /// is not the standard whole-file md5 for some large files.
    #[arg(long)]
    verify_md5: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Upload one local file.
    Upload {
        local: PathBuf,
        /// Destination path relative to the app root.
        remote: String,
        /// What to do when the destination exists: fail, overwrite, rename or skip.
        #[arg(long, default_value = "overwrite")]
        on_existing: OverwritePolicy,
    },
    /// Download one remote file.
    Download {
        /// Source path relative to the app root.
        remote: String,
        local: PathBuf,
    },
    /// Make the remote directory mirror a local one.
    SyncUp {
        local: PathBuf,
        remote: String,
        /// Also delete remote entries with no local counterpart.
        #[arg(long)]
        delete_extraneous: bool,
    },
    /// Make a local directory mirror a remote one.
    SyncDown {
        remote: String,
        local: PathBuf,
        /// Also delete local entries with no remote counterpart.
        #[arg(long)]
        delete_extraneous: bool,
    },
    /// Show the difference between a local and a remote directory without transferring.
    Compare { local: PathBuf, remote: String },
}

impl CommonOpts {
    fn client_options(&self) -> XpanClientOptions {
        XpanClientOptions {
            base_url: self.base_url.clone(),
            data_url: self.data_url.clone(),
            app_root: self.app_root.clone(),
            request_timeout: Duration::from_secs(30),
            retry: RetryOptions {
                max_retries: self.max_retries,
                ..RetryOptions::default()
            },
        }
    }

    fn upload_options(&self, policy: OverwritePolicy) -> UploadOptions {
        UploadOptions {
            chunk_size: self.upload_chunk_size,
            workers: self.max_upload_workers,
            policy,
            slice_md5_size: self.slice_md5_size,
            rapid_upload_threshold: self.rapid_upload_threshold,
        }
    }

    fn download_options(&self) -> DownloadOptions {
        DownloadOptions {
            segment_size: self.download_segment_size,
            workers: self.max_download_workers,
            verify_md5: self.verify_md5,
            ..DownloadOptions::default()
        }
    }
}

///
/// Reads the bearer token from a file. The authorization dance lives outside this process;
/// whatever refreshes the token rewrites the file, so `refresh` is a re-read.
///
struct FileTokenProvider {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl FileTokenProvider {
    fn new(path: PathBuf) -> FileTokenProvider {
        FileTokenProvider {
            path,
            cached: Mutex::new(None),
        }
    }

    fn read_token(&self) -> Result<String, Error> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Auth(format!(
                "Failed to read the token file {}: {e}",
                self.path.display()
            ))
        })?;
        let token = raw.trim().to_owned();
        if token.is_empty() {
            return Err(Error::Auth(format!(
                "The token file {} is empty",
                self.path.display()
            )));
        }
        Ok(token)
    }
}

#[async_trait]
impl TokenProvider for FileTokenProvider {
    async fn current_token(&self) -> Result<String, Error> {
        if let Some(token) = self.cached.lock().clone() {
            return Ok(token);
        }
        let token = self.read_token()?;
        *self.cached.lock() = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> Result<String, Error> {
        let token = self.read_token()?;
        *self.cached.lock() = Some(token.clone());
        Ok(token)
    }
}

/// Logs running totals instead of drawing progress bars; quiet enough for batch usage.
struct LogProgress {
    transferred: AtomicU64,
    next_report: AtomicU64,
}

const REPORT_EVERY_BYTES: u64 = 64 * 1024 * 1024;

impl LogProgress {
    fn new() -> LogProgress {
        LogProgress {
            transferred: AtomicU64::new(0),
            next_report: AtomicU64::new(REPORT_EVERY_BYTES),
        }
    }
}

impl ProgressSink for LogProgress {
    fn add(&self, bytes: u64) {
        let total = self.transferred.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let threshold = self.next_report.load(Ordering::Relaxed);
        if total >= threshold
            && self
                .next_report
                .compare_exchange(
                    threshold,
                    total + REPORT_EVERY_BYTES,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
        {
            info!("Transferred {} MiB", total / (1024 * 1024));
        }
    }

    fn set_total(&self, bytes: u64) {
        if bytes > 0 {
            log::debug!("Transfer size: {bytes} bytes");
        }
    }
}

fn exit_code(report: &sync::SyncReport) -> i32 {
    if report.was_cancelled() {
        EXIT_CANCELLED
    } else if report.failed() > 0 {
        EXIT_FAILURE
    } else {
        0
    }
}

async fn execute(cli: Cli) -> Result<i32, String> {
    let executor = Executor::new();
    let tokens = Arc::new(FileTokenProvider::new(cli.common.token_path.clone()));
    let client = XpanClient::new(cli.common.client_options(), tokens)?;

    let state_dir = cli
        .common
        .state_dir
        .clone()
        .unwrap_or_else(store::default_state_path);
    let hash_cache = HashCache::open(&state_dir)?;
    let resume = ResumeStore::open(&state_dir)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted; flushing state. Re-run to resume.");
                cancel.cancel();
            }
        });
    }

    let transfers = Transfers::new(
        client,
        hash_cache,
        resume,
        executor,
        Arc::new(LogProgress::new()),
        cancel,
    );

    let code = match &cli.command {
        Command::Upload {
            local,
            remote,
            on_existing,
        } => {
            let remote_path = transfers.client().app_path(remote);
            let options = cli.common.upload_options(*on_existing);
            match transfers.upload(local, &remote_path, &options).await {
                Ok(file) => {
                    println!("{} ({} bytes, fsid {})", file.path, file.size, file.fsid);
                    0
                }
                Err(Error::Cancelled) => EXIT_CANCELLED,
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_FAILURE
                }
            }
        }
        Command::Download { remote, local } => {
            let remote_path = transfers.client().app_path(remote);
            let options = cli.common.download_options();
            match transfers.download(&remote_path, local, &options).await {
                Ok(path) => {
                    println!("{}", path.display());
                    0
                }
                Err(Error::Cancelled) => EXIT_CANCELLED,
                Err(e) => {
                    eprintln!("{e}");
                    EXIT_FAILURE
                }
            }
        }
        Command::SyncUp {
            local,
            remote,
            delete_extraneous,
        } => {
            let remote_dir = transfers.client().app_path(remote);
            let syncer = Syncer::new(transfers.clone());
            let options = SyncOptions {
                delete_extraneous: *delete_extraneous,
                file_concurrency: cli.common.file_concurrency,
                upload: cli.common.upload_options(OverwritePolicy::Overwrite),
                download: cli.common.download_options(),
            };
            let report = syncer.sync_up(local, &remote_dir, &options).await?;
            print_report(&report);
            exit_code(&report)
        }
        Command::SyncDown {
            remote,
            local,
            delete_extraneous,
        } => {
            let remote_dir = transfers.client().app_path(remote);
            let syncer = Syncer::new(transfers.clone());
            let options = SyncOptions {
                delete_extraneous: *delete_extraneous,
                file_concurrency: cli.common.file_concurrency,
                upload: cli.common.upload_options(OverwritePolicy::Overwrite),
                download: cli.common.download_options(),
            };
            let report = syncer.sync_down(&remote_dir, local, &options).await?;
            print_report(&report);
            exit_code(&report)
        }
        Command::Compare { local, remote } => {
            let remote_dir = transfers.client().app_path(remote);
            let syncer = Syncer::new(transfers.clone());
            let options = SyncOptions {
                file_concurrency: cli.common.file_concurrency,
                upload: cli.common.upload_options(OverwritePolicy::Overwrite),
                download: cli.common.download_options(),
                ..SyncOptions::default()
            };
            let report = syncer.compare(local, &remote_dir, &options).await?;
            for path in &report.local_only {
                println!("local only:  {path}");
            }
            for path in &report.remote_only {
                println!("remote only: {path}");
            }
            for path in &report.differing {
                println!("differs:     {path}");
            }
            println!(
                "{} local only, {} remote only, {} differing, {} matching",
                report.local_only.len(),
                report.remote_only.len(),
                report.differing.len(),
                report.matching.len()
            );
            if report.local_only.is_empty()
                && report.remote_only.is_empty()
                && report.differing.is_empty()
            {
                0
            } else {
                EXIT_FAILURE
            }
        }
    };

    transfers.flush_hash_cache();
    Ok(code)
}

fn print_report(report: &sync::SyncReport) {
    for (entry, result) in &report.outcomes {
        if let Err(err) = result {
            eprintln!("failed: {entry:?}: {err}");
        }
    }
    info!(
        "{} action(s) succeeded, {} failed",
        report.succeeded(),
        report.failed()
    );
}

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().filter_or("XPAN_LOG", "info"));
    match execute(Cli::parse()).await {
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(EXIT_FAILURE);
        }
        Ok(code) => std::process::exit(code),
    }
}
