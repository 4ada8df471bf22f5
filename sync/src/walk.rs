// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use xpan_api::Error;

/// One regular file found under the sync root.
#[derive(Clone, Debug)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub size: u64,
}

///
/// Enumerate the local tree, keyed by `/`-separated relative path. Only regular files and
/// directories participate: sockets, devices and the like are skipped, as is any symlink
/// whose resolved target escapes the root.
///
pub fn walk_local_tree(
    root: &Path,
) -> Result<(BTreeMap<String, LocalEntry>, BTreeSet<String>), Error> {
    let canonical_root = root
        .canonicalize()
        .map_err(|e| Error::LocalIo(format!("Failed to resolve {}: {e}", root.display())))?;

    let mut files = BTreeMap::new();
    let mut dirs = BTreeSet::new();
    for entry in walkdir::WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry =
            entry.map_err(|e| Error::LocalIo(format!("Failed to walk {}: {e}", root.display())))?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::LocalIo(format!("Path escaped the walk root: {e}")))?
            .to_string_lossy()
            .into_owned();

        let file_type = entry.file_type();
        let metadata = if file_type.is_symlink() {
            let Ok(target) = entry.path().canonicalize() else {
                log::debug!("Skipping dangling symlink {}", entry.path().display());
                continue;
            };
            if !target.starts_with(&canonical_root) {
                log::debug!(
                    "Skipping symlink {} pointing outside the sync root",
                    entry.path().display()
                );
                continue;
            }
            match std::fs::metadata(entry.path()) {
                Ok(metadata) => metadata,
                Err(_) => continue,
            }
        } else {
            match entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            }
        };

        if metadata.is_dir() {
            dirs.insert(relative);
        } else if metadata.is_file() {
            files.insert(
                relative,
                LocalEntry {
                    path: entry.path().to_path_buf(),
                    size: metadata.len(),
                },
            );
        } else {
            log::debug!("Skipping non-regular entry {}", entry.path().display());
        }
    }
    Ok((files, dirs))
}
