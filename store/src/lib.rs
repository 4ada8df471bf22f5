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

mod hash_cache;
mod resume;

#[cfg(test)]
mod resume_tests;

pub use crate::hash_cache::HashCache;
pub use crate::resume::{DownloadSession, ResumeStore, UploadSession};

const XDG_STATE_HOME: &str = "XDG_STATE_HOME";

/// Follows the unix XDG base spec: <http://standards.freedesktop.org/basedir-spec/latest/index.html>.
pub fn default_state_path() -> PathBuf {
    let state_path = std::env::var(XDG_STATE_HOME)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs_next::home_dir().map(|home| home.join(".local").join("state")))
        .unwrap_or_else(|| panic!("Could not find home dir or {XDG_STATE_HOME}."));
    state_path.join("xpan")
}
