// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::collections::BTreeSet;
use std::time::Duration;

use store::{DownloadSession, ResumeStore};
use tempfile::TempDir;
use testutil::{patterned_bytes, write_file, RequestType, StubXpan};

use crate::upload_tests::test_transfers;
use crate::{DownloadOptions, UploadOptions};

fn segmented_options() -> DownloadOptions {
    DownloadOptions {
        segment_size: 1024,
        workers: 4,
        small_file_threshold: 2048,
        verify_md5: false,
        idle_timeout: Duration::from_secs(5),
        session_flush_interval: 2,
    }
}

#[tokio::test]
async fn small_file_single_get() {
    let content = patterned_bytes(1000, 31);
    let stub = StubXpan::builder()
        .file("/apps/test/small.bin", content.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());

    let local = state.path().join("downloads").join("small.bin");
    transfers
        .download("/apps/test/small.bin", &local, &segmented_options())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), content);
    // Under the threshold: one link, one unranged GET.
    assert_eq!(stub.request_count(RequestType::Dlink), 1);
    assert_eq!(stub.request_count(RequestType::DataRead), 1);
    // No stray temp file.
    assert!(!local.with_extension("bin.part").exists());
}

#[tokio::test]
async fn empty_file_download() {
    let stub = StubXpan::builder()
        .file("/apps/test/empty.bin", bytes::Bytes::new())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());

    let local = state.path().join("empty.bin");
    transfers
        .download("/apps/test/empty.bin", &local, &segmented_options())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&local).unwrap().len(), 0);
}

#[tokio::test]
async fn segmented_download_assembles_in_order() {
    let content = patterned_bytes(10 * 1024 + 137, 32);
    let stub = StubXpan::builder()
        .file("/apps/test/big.bin", content.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());

    let local = state.path().join("big.bin");
    transfers
        .download("/apps/test/big.bin", &local, &segmented_options())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), content);
    // Eleven segments of up to 1 KiB, four independent links.
    assert_eq!(stub.request_count(RequestType::DataRead), 11);
    assert_eq!(stub.request_count(RequestType::Dlink), 4);
    // The session did not outlive the rename.
    let meta = transfers
        .client()
        .meta("/apps/test/big.bin")
        .await
        .unwrap()
        .unwrap();
    let key = ResumeStore::download_key(meta.fsid, &local);
    assert_eq!(
        ResumeStore::open(state.path()).unwrap().load_download(&key),
        None
    );
}

#[tokio::test]
async fn expired_link_is_refreshed_per_worker() {
    let content = patterned_bytes(10 * 1024, 33);
    let stub = StubXpan::builder()
        .file("/apps/test/throttled.bin", content.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());
    // One worker (and one link) per segment, so exactly one worker hits the stale link.
    let options = DownloadOptions {
        workers: 10,
        ..segmented_options()
    };

    stub.expire_next_dlinks(1);
    let local = state.path().join("throttled.bin");
    transfers
        .download("/apps/test/throttled.bin", &local, &options)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), content);
    // Ten initial links plus exactly one refresh for the expired one.
    assert_eq!(stub.request_count(RequestType::Dlink), 11);
}

#[tokio::test]
async fn resume_skips_completed_segments() {
    let content = patterned_bytes(8 * 1024, 34);
    let stub = StubXpan::builder()
        .file("/apps/test/resume.bin", content.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());
    let options = segmented_options();

    let local = state.path().join("resume.bin");
    let temp = state.path().join("resume.bin.part");
    let meta = transfers
        .client()
        .meta("/apps/test/resume.bin")
        .await
        .unwrap()
        .unwrap();

    // A prior invocation got segments 0 and 1 onto disk before dying.
    let mut partial = vec![0_u8; content.len()];
    partial[0..2048].copy_from_slice(&content[0..2048]);
    write_file(&temp, &partial);
    let session = DownloadSession {
        remote_fsid: meta.fsid,
        remote_path: "/apps/test/resume.bin".to_owned(),
        local_path: local.clone(),
        total_size: content.len() as u64,
        segment_size: options.segment_size,
        completed_segments: BTreeSet::from([0, 1]),
        temp_path: temp.clone(),
    };
    let key = ResumeStore::download_key(meta.fsid, &local);
    ResumeStore::open(state.path())
        .unwrap()
        .save_download(&key, &session)
        .unwrap();

    transfers
        .download("/apps/test/resume.bin", &local, &options)
        .await
        .unwrap();

    assert_eq!(std::fs::read(&local).unwrap(), content);
    // Only the six missing segments were fetched.
    assert_eq!(stub.request_count(RequestType::DataRead), 6);
}

#[tokio::test]
async fn drifted_session_restarts_clean() {
    let content = patterned_bytes(4 * 1024, 35);
    let stub = StubXpan::builder()
        .file("/apps/test/drift.bin", content.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());
    let options = segmented_options();

    let local = state.path().join("drift.bin");
    let meta = transfers
        .client()
        .meta("/apps/test/drift.bin")
        .await
        .unwrap()
        .unwrap();
    // A session whose recorded size disagrees with the server is untrustworthy.
    let session = DownloadSession {
        remote_fsid: meta.fsid,
        remote_path: "/apps/test/drift.bin".to_owned(),
        local_path: local.clone(),
        total_size: 1,
        segment_size: options.segment_size,
        completed_segments: BTreeSet::from([0, 1, 2, 3]),
        temp_path: state.path().join("drift.bin.part"),
    };
    let key = ResumeStore::download_key(meta.fsid, &local);
    ResumeStore::open(state.path())
        .unwrap()
        .save_download(&key, &session)
        .unwrap();

    transfers
        .download("/apps/test/drift.bin", &local, &options)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), content);
    assert_eq!(stub.request_count(RequestType::DataRead), 4);
}

#[tokio::test]
async fn verified_download_passes_on_good_content() {
    let content = patterned_bytes(5 * 1024, 36);
    let stub = StubXpan::builder()
        .file("/apps/test/verified.bin", content.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());
    let options = DownloadOptions {
        verify_md5: true,
        ..segmented_options()
    };

    let local = state.path().join("verified.bin");
    transfers
        .download("/apps/test/verified.bin", &local, &options)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&local).unwrap(), content);
}

#[tokio::test]
async fn upload_then_download_round_trip() {
    let stub = StubXpan::spawn().await;
    let state = TempDir::new().unwrap();
    let transfers = test_transfers(&stub, state.path());

    let content = patterned_bytes(6 * 1024 + 7, 37);
    let source = state.path().join("source.bin");
    write_file(&source, &content);

    transfers
        .upload(
            &source,
            "/apps/test/round-trip.bin",
            &UploadOptions {
                chunk_size: 1024,
                ..UploadOptions::default()
            },
        )
        .await
        .unwrap();

    let destination = state.path().join("destination.bin");
    transfers
        .download("/apps/test/round-trip.bin", &destination, &segmented_options())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&destination).unwrap(), content);
}
