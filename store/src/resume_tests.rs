// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeSet;
use std::path::PathBuf;

use hashing::{ContentDigest, Fingerprint};

use crate::{DownloadSession, ResumeStore, UploadSession};

fn upload_session() -> UploadSession {
    UploadSession {
        upload_id: "upid-1".to_owned(),
        remote_path: "/apps/xpan/a.bin".to_owned(),
        local_path: PathBuf::from("/tmp/a.bin"),
        chunk_size: 4 * 1024 * 1024,
        total_chunks: 3,
        block_md5s: vec![
            Fingerprint::of_bytes(b"one"),
            Fingerprint::of_bytes(b"two"),
            Fingerprint::of_bytes(b"three"),
        ],
        completed_chunks: BTreeSet::from([0, 2]),
        digest: ContentDigest::of_bytes(b"whatever", 256 * 1024),
        local_mtime_nanos: 1_700_000_000_000_000_000,
        created_at: 1_700_000_000,
    }
}

#[test]
fn upload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResumeStore::open(dir.path()).unwrap();
    let session = upload_session();
    let key = ResumeStore::upload_key(
        &session.local_path,
        session.digest.size_bytes,
        session.chunk_size,
        &session.remote_path,
    );

    assert_eq!(store.load_upload(&key), None);
    store.save_upload(&key, &session).unwrap();
    assert_eq!(store.load_upload(&key), Some(session.clone()));
    assert_eq!(store.load_upload(&key).unwrap().remaining_chunks(), vec![1]);

    store.clear_upload(&key);
    assert_eq!(store.load_upload(&key), None);
}

#[test]
fn download_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResumeStore::open(dir.path()).unwrap();
    let session = DownloadSession {
        remote_fsid: 42,
        remote_path: "/apps/xpan/b.bin".to_owned(),
        local_path: PathBuf::from("/tmp/b.bin"),
        total_size: 10 * 1024 * 1024,
        segment_size: 4 * 1024 * 1024,
        completed_segments: BTreeSet::from([1]),
        temp_path: PathBuf::from("/tmp/b.bin.part"),
    };
    let key = ResumeStore::download_key(session.remote_fsid, &session.local_path);

    store.save_download(&key, &session).unwrap();
    assert_eq!(store.load_download(&key), Some(session));
    store.clear_download(&key);
    assert_eq!(store.load_download(&key), None);
}

#[test]
fn corrupt_session_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let store = ResumeStore::open(dir.path()).unwrap();
    let key = "abcd1234";
    std::fs::write(dir.path().join("uploads").join("abcd1234.json"), b"{oops").unwrap();

    assert_eq!(store.load_upload(key), None);
    // The broken file was removed, not left to fail again.
    assert!(!dir.path().join("uploads").join("abcd1234.json").exists());
}

#[test]
fn keys_separate_by_every_component() {
    let base = ResumeStore::upload_key(
        &PathBuf::from("/tmp/a.bin"),
        100,
        10,
        "/apps/xpan/a.bin",
    );
    assert_ne!(
        base,
        ResumeStore::upload_key(&PathBuf::from("/tmp/b.bin"), 100, 10, "/apps/xpan/a.bin")
    );
    assert_ne!(
        base,
        ResumeStore::upload_key(&PathBuf::from("/tmp/a.bin"), 101, 10, "/apps/xpan/a.bin")
    );
    assert_ne!(
        base,
        ResumeStore::upload_key(&PathBuf::from("/tmp/a.bin"), 100, 20, "/apps/xpan/a.bin")
    );
    assert_ne!(
        base,
        ResumeStore::upload_key(&PathBuf::from("/tmp/a.bin"), 100, 10, "/apps/xpan/b.bin")
    );
}
