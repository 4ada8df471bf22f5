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

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use futures::StreamExt;
use transfer::{DownloadOptions, Transfers, UploadOptions};
use xpan_api::{Error, OverwritePolicy, RemoteFile};

mod walk;

#[cfg(test)]
mod tests;

pub use crate::walk::{walk_local_tree, LocalEntry};

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Delete destination entries with no counterpart on the source side.
    pub delete_extraneous: bool,
    /// Parallelism across files; distinct from the per-file chunk/segment parallelism.
    pub file_concurrency: usize,
    pub upload: UploadOptions,
    pub download: DownloadOptions,
}

impl Default for SyncOptions {
    fn default() -> SyncOptions {
        SyncOptions {
            delete_extraneous: false,
            file_concurrency: 4,
            upload: UploadOptions::default(),
            download: DownloadOptions::default(),
        }
    }
}

///
/// One step of a sync plan. The plan is ordered: directory creation precedes the uploads that
/// need it, and deletions run children-first.
///
#[derive(Clone, Debug)]
pub enum PlanEntry {
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    DeleteLocal(PathBuf),
    DeleteRemote(String),
    Skip { path: String, reason: String },
}

impl PlanEntry {
    fn is_transfer(&self) -> bool {
        matches!(self, PlanEntry::Upload { .. } | PlanEntry::Download { .. })
    }
}

///
/// Per-action outcomes for one sync invocation. A failed action never aborts the batch, so
/// the report is the only place failures surface.
///
pub struct SyncReport {
    pub outcomes: Vec<(PlanEntry, Result<(), Error>)>,
}

impl SyncReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, r)| r.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn transfers_attempted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(entry, _)| entry.is_transfer())
            .count()
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|(_, r)| matches!(r, Err(Error::Cancelled)))
    }
}

/// The direction-neutral difference between a local and a remote tree, by relative path.
pub struct CompareReport {
    pub local_only: Vec<String>,
    pub remote_only: Vec<String>,
    pub differing: Vec<String>,
    pub matching: Vec<String>,
}

struct TreeDiff {
    local_files: BTreeMap<String, LocalEntry>,
    local_dirs: BTreeSet<String>,
    remote_files: BTreeMap<String, RemoteFile>,
    remote_dirs: BTreeSet<String>,
    local_only: Vec<String>,
    remote_only: Vec<String>,
    differing: Vec<String>,
    matching: Vec<String>,
}

///
/// Directory synchronization as a three-way compare: the local tree, the remote tree, and the
/// hash cache standing in for prior state (an unchanged file is never re-read, let alone
/// re-transferred).
///
#[derive(Clone)]
pub struct Syncer {
    transfers: Transfers,
}

impl Syncer {
    pub fn new(transfers: Transfers) -> Syncer {
        Syncer { transfers }
    }

    pub fn transfers(&self) -> &Transfers {
        &self.transfers
    }

    pub async fn compare(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        options: &SyncOptions,
    ) -> Result<CompareReport, Error> {
        let diff = self.diff_trees(local_dir, remote_dir, true, options).await?;
        Ok(CompareReport {
            local_only: diff.local_only,
            remote_only: diff.remote_only,
            differing: diff.differing,
            matching: diff.matching,
        })
    }

    ///
    /// Make the remote tree mirror the local one. Local-only and differing files upload;
    /// matching files are skipped; remote-only entries are deleted only with
    /// `delete_extraneous`.
    ///
    pub async fn sync_up(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        options: &SyncOptions,
    ) -> Result<SyncReport, Error> {
        let diff = self.diff_trees(local_dir, remote_dir, true, options).await?;

        // mkdir -p prerequisites, shallowest first, before anything transfers.
        let mut needed_dirs: BTreeSet<String> = BTreeSet::new();
        for rel in diff.local_only.iter().chain(diff.differing.iter()) {
            let mut current = rel.as_str();
            while let Some(slash) = current.rfind('/') {
                current = &current[0..slash];
                if !diff.remote_dirs.contains(current) {
                    needed_dirs.insert(current.to_owned());
                }
            }
        }
        for dir in &needed_dirs {
            self.transfers
                .client()
                .mkdir(&join_remote(remote_dir, dir))
                .await?;
        }

        let upload_options = UploadOptions {
            // The derivation already decided these files need to move.
            policy: OverwritePolicy::Overwrite,
            ..options.upload.clone()
        };
        let mut plan: Vec<PlanEntry> = Vec::new();
        for rel in diff.local_only.iter().chain(diff.differing.iter()) {
            plan.push(PlanEntry::Upload {
                local: diff.local_files[rel].path.clone(),
                remote: join_remote(remote_dir, rel),
            });
        }
        for rel in &diff.matching {
            plan.push(PlanEntry::Skip {
                path: rel.clone(),
                reason: "up to date".to_owned(),
            });
        }

        let mut outcomes = self
            .execute_transfers(plan, &upload_options, &options.download, options.file_concurrency)
            .await;

        if options.delete_extraneous {
            // Files first, then directories deepest-first.
            for rel in &diff.remote_only {
                let remote_path = join_remote(remote_dir, rel);
                let result = self.transfers.client().delete(&remote_path).await;
                outcomes.push((PlanEntry::DeleteRemote(remote_path), result));
            }
            let mut extraneous_dirs: Vec<&String> = diff
                .remote_dirs
                .iter()
                .filter(|dir| !diff.local_dirs.contains(*dir))
                .collect();
            extraneous_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.len()));
            for dir in extraneous_dirs {
                let remote_path = join_remote(remote_dir, dir);
                let result = self.transfers.client().delete(&remote_path).await;
                outcomes.push((PlanEntry::DeleteRemote(remote_path), result));
            }
        } else {
            for rel in &diff.remote_only {
                outcomes.push((
                    PlanEntry::Skip {
                        path: rel.clone(),
                        reason: "extraneous on the server".to_owned(),
                    },
                    Ok(()),
                ));
            }
        }

        Ok(SyncReport { outcomes })
    }

    ///
    /// Make the local tree mirror the remote one. The mirror image of `sync_up`.
    ///
    pub async fn sync_down(
        &self,
        remote_dir: &str,
        local_dir: &Path,
        options: &SyncOptions,
    ) -> Result<SyncReport, Error> {
        tokio::fs::create_dir_all(local_dir).await.map_err(|e| {
            Error::LocalIo(format!("Failed to create {}: {e}", local_dir.display()))
        })?;
        let diff = self.diff_trees(local_dir, remote_dir, false, options).await?;

        let mut plan: Vec<PlanEntry> = Vec::new();
        for rel in diff.remote_only.iter().chain(diff.differing.iter()) {
            plan.push(PlanEntry::Download {
                remote: diff.remote_files[rel].path.clone(),
                local: local_dir.join(Path::new(rel)),
            });
        }
        for rel in &diff.matching {
            plan.push(PlanEntry::Skip {
                path: rel.clone(),
                reason: "up to date".to_owned(),
            });
        }

        let mut outcomes = self
            .execute_transfers(plan, &options.upload, &options.download, options.file_concurrency)
            .await;

        if options.delete_extraneous {
            for rel in &diff.local_only {
                let local_path = diff.local_files[rel].path.clone();
                let result = tokio::fs::remove_file(&local_path).await.map_err(|e| {
                    Error::LocalIo(format!("Failed to delete {}: {e}", local_path.display()))
                });
                outcomes.push((PlanEntry::DeleteLocal(local_path), result));
            }
            let mut extraneous_dirs: Vec<&String> = diff
                .local_dirs
                .iter()
                .filter(|dir| !diff.remote_dirs.contains(*dir))
                .collect();
            extraneous_dirs.sort_by_key(|dir| std::cmp::Reverse(dir.len()));
            for dir in extraneous_dirs {
                let local_path = local_dir.join(Path::new(dir));
                let result = tokio::fs::remove_dir_all(&local_path).await.map_err(|e| {
                    Error::LocalIo(format!("Failed to delete {}: {e}", local_path.display()))
                });
                outcomes.push((PlanEntry::DeleteLocal(local_path), result));
            }
        } else {
            for rel in &diff.local_only {
                outcomes.push((
                    PlanEntry::Skip {
                        path: rel.clone(),
                        reason: "extraneous locally".to_owned(),
                    },
                    Ok(()),
                ));
            }
        }

        Ok(SyncReport { outcomes })
    }

    ///
    /// Run the transfer entries of a plan with bounded cross-file concurrency. Skips pass
    /// through untouched; failures are recorded, never propagated.
    ///
    async fn execute_transfers(
        &self,
        plan: Vec<PlanEntry>,
        upload_options: &UploadOptions,
        download_options: &DownloadOptions,
        file_concurrency: usize,
    ) -> Vec<(PlanEntry, Result<(), Error>)> {
        let mut stream = futures::stream::iter(plan.into_iter().map(|entry| {
            let syncer = self.clone();
            let upload_options = upload_options.clone();
            let download_options = download_options.clone();
            async move {
                let result = match &entry {
                    PlanEntry::Upload { local, remote } => syncer
                        .transfers
                        .upload(local, remote, &upload_options)
                        .await
                        .map(|_| ()),
                    PlanEntry::Download { remote, local } => syncer
                        .transfers
                        .download(remote, local, &download_options)
                        .await
                        .map(|_| ()),
                    _ => Ok(()),
                };
                (entry, result)
            }
        }))
        .buffer_unordered(file_concurrency.max(1));

        let mut outcomes = Vec::new();
        while let Some((entry, result)) = stream.next().await {
            if let Err(err) = &result {
                log::warn!("Sync action failed for {entry:?}: {err}");
            }
            outcomes.push((entry, result));
        }
        outcomes
    }

    ///
    /// Enumerate both trees and bucket every file by the equivalence predicate: equal iff the
    /// sizes match and the local MD5 (through the hash cache) equals the remote MD5. mtimes
    /// are not comparable across filesystems and play no part.
    ///
    async fn diff_trees(
        &self,
        local_dir: &Path,
        remote_dir: &str,
        missing_remote_ok: bool,
        options: &SyncOptions,
    ) -> Result<TreeDiff, Error> {
        let (local_files, local_dirs) = {
            let root = local_dir.to_path_buf();
            self.transfers
                .executor()
                .spawn_blocking(
                    move || walk_local_tree(&root),
                    |join_error| Err(Error::LocalIo(format!("Tree walk died: {join_error}"))),
                )
                .await?
        };

        let (remote_files, remote_dirs) = match self.list_remote_tree(remote_dir).await {
            Ok(trees) => trees,
            Err(Error::NotFound(_)) if missing_remote_ok => (BTreeMap::new(), BTreeSet::new()),
            Err(err) => return Err(err),
        };

        let mut local_only = Vec::new();
        let mut differing = Vec::new();
        let mut matching = Vec::new();
        for (rel, local) in &local_files {
            match remote_files.get(rel) {
                None => local_only.push(rel.clone()),
                Some(remote) => {
                    if self.files_equal(local, remote, options).await? {
                        matching.push(rel.clone());
                    } else {
                        differing.push(rel.clone());
                    }
                }
            }
        }
        let remote_only: Vec<String> = remote_files
            .keys()
            .filter(|rel| !local_files.contains_key(*rel))
            .cloned()
            .collect();

        Ok(TreeDiff {
            local_files,
            local_dirs,
            remote_files,
            remote_dirs,
            local_only,
            remote_only,
            differing,
            matching,
        })
    }

    async fn files_equal(
        &self,
        local: &LocalEntry,
        remote: &RemoteFile,
        options: &SyncOptions,
    ) -> Result<bool, Error> {
        if local.size != remote.size {
            return Ok(false);
        }
        // Size alone is not evidence of equality.
        let Some(remote_md5) = remote.md5 else {
            return Ok(false);
        };
        let digest = self
            .transfers
            .digest_local(&local.path, options.upload.slice_md5_size)
            .await?;
        Ok(digest.md5 == remote_md5)
    }

    ///
    /// The remote tree under `remote_dir`, keyed by relative path, with pagination exhausted.
    ///
    async fn list_remote_tree(
        &self,
        remote_dir: &str,
    ) -> Result<(BTreeMap<String, RemoteFile>, BTreeSet<String>), Error> {
        let client = self.transfers.client();
        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        let mut start = 0;
        loop {
            let (page, next) = client.list(remote_dir, true, start).await?;
            for entry in page {
                let Some(rel) = entry.path.strip_prefix(&prefix) else {
                    log::debug!("Ignoring a listing entry outside {remote_dir}: {}", entry.path);
                    continue;
                };
                let rel = rel.to_owned();
                if entry.is_dir {
                    dirs.insert(rel);
                } else {
                    files.insert(rel, entry);
                }
            }
            match next {
                Some(cursor) => start = cursor,
                None => break,
            }
        }
        Ok((files, dirs))
    }
}

fn join_remote(remote_dir: &str, relative: &str) -> String {
    format!("{}/{}", remote_dir.trim_end_matches('/'), relative)
}
