// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use store::{HashCache, ResumeStore};
use task_executor::Executor;
use tempfile::TempDir;
use testutil::{patterned_bytes, write_file, RequestType, StubXpan};
use tokio_util::sync::CancellationToken;
use transfer::{DownloadOptions, Transfers, UploadOptions};
use xpan_api::retry::RetryOptions;
use xpan_api::{NullProgress, OverwritePolicy, StaticTokenProvider, XpanClient, XpanClientOptions};

use crate::{SyncOptions, Syncer};

fn test_syncer(stub: &StubXpan, state_dir: &Path) -> Syncer {
    let options = XpanClientOptions {
        base_url: stub.base_url(),
        data_url: stub.base_url(),
        app_root: "/apps/test".to_owned(),
        request_timeout: Duration::from_secs(5),
        retry: RetryOptions {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(10),
        },
    };
    let client = XpanClient::new(
        options,
        Arc::new(StaticTokenProvider::new("test-token")),
    )
    .unwrap();
    let transfers = Transfers::new(
        client,
        HashCache::open(&state_dir.join("cache")).unwrap(),
        ResumeStore::open(state_dir).unwrap(),
        Executor::new(),
        Arc::new(NullProgress),
        CancellationToken::new(),
    );
    Syncer::new(transfers)
}

fn small_sync_options() -> SyncOptions {
    SyncOptions {
        delete_extraneous: false,
        file_concurrency: 4,
        upload: UploadOptions {
            chunk_size: 1024,
            workers: 2,
            policy: OverwritePolicy::Overwrite,
            ..UploadOptions::default()
        },
        download: DownloadOptions {
            segment_size: 1024,
            workers: 4,
            small_file_threshold: 2048,
            idle_timeout: Duration::from_secs(5),
            ..DownloadOptions::default()
        },
    }
}

#[tokio::test]
async fn sync_up_then_incremental_change() {
    let stub = StubXpan::builder().directory("/apps/test/dest").spawn().await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());
    let options = small_sync_options();

    let local = TempDir::new().unwrap();
    write_file(&local.path().join("a.txt"), b"0123456789");
    write_file(&local.path().join("b.txt"), &patterned_bytes(3000, 41));
    write_file(&local.path().join("c/d.txt"), &patterned_bytes(5000, 42));

    let first = syncer
        .sync_up(local.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(first.failed(), 0);
    assert_eq!(first.transfers_attempted(), 3);
    assert_eq!(
        stub.file_bytes("/apps/test/dest/a.txt").unwrap(),
        bytes::Bytes::from_static(b"0123456789")
    );
    assert!(stub.contains("/apps/test/dest/c"));
    assert!(stub.contains("/apps/test/dest/c/d.txt"));

    // Append one byte to b.txt; the next pass transfers exactly that one file.
    let mut file = OpenOptions::new()
        .append(true)
        .open(local.path().join("b.txt"))
        .unwrap();
    file.write_all(b"!").unwrap();
    drop(file);

    let before_slices = stub.request_count(RequestType::UploadSlice);
    let second = syncer
        .sync_up(local.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(second.failed(), 0);
    assert_eq!(second.transfers_attempted(), 1);
    assert!(stub.request_count(RequestType::UploadSlice) > before_slices);
    assert_eq!(stub.request_count(RequestType::Delete), 0);
    assert_eq!(
        stub.file_bytes("/apps/test/dest/b.txt").unwrap().len(),
        3001
    );

    // And a third pass moves nothing at all: sync is idempotent.
    let before_slices = stub.request_count(RequestType::UploadSlice);
    let third = syncer
        .sync_up(local.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(third.transfers_attempted(), 0);
    assert_eq!(third.failed(), 0);
    assert_eq!(stub.request_count(RequestType::UploadSlice), before_slices);
}

#[tokio::test]
async fn sync_down_deletes_extraneous_and_transfers_nothing() {
    let x = patterned_bytes(1500, 51);
    let y = patterned_bytes(2500, 52);
    let stub = StubXpan::builder()
        .directory("/apps/test/dest")
        .file("/apps/test/dest/x.bin", x.clone())
        .file("/apps/test/dest/y.bin", y.clone())
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());
    let options = SyncOptions {
        delete_extraneous: true,
        ..small_sync_options()
    };

    // The local side already matches for x and y, and has an extra z.
    let local = TempDir::new().unwrap();
    write_file(&local.path().join("x.bin"), &x);
    write_file(&local.path().join("y.bin"), &y);
    write_file(&local.path().join("z.bin"), b"extraneous");

    let report = syncer
        .sync_down("/apps/test/dest", local.path(), &options)
        .await
        .unwrap();

    assert_eq!(report.failed(), 0);
    assert_eq!(report.transfers_attempted(), 0);
    assert_eq!(stub.request_count(RequestType::DataRead), 0);
    assert!(!local.path().join("z.bin").exists());
    assert!(local.path().join("x.bin").exists());
    assert!(local.path().join("y.bin").exists());
}

#[tokio::test]
async fn sync_up_delete_extraneous_removes_remote_orphans() {
    let stub = StubXpan::builder()
        .directory("/apps/test/dest")
        .file("/apps/test/dest/orphan.bin", patterned_bytes(100, 53))
        .directory("/apps/test/dest/old")
        .file("/apps/test/dest/old/nested.bin", patterned_bytes(100, 54))
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());
    let options = SyncOptions {
        delete_extraneous: true,
        ..small_sync_options()
    };

    let local = TempDir::new().unwrap();
    write_file(&local.path().join("kept.txt"), b"kept");

    let report = syncer
        .sync_up(local.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(report.failed(), 0);
    assert!(stub.contains("/apps/test/dest/kept.txt"));
    assert!(!stub.contains("/apps/test/dest/orphan.bin"));
    assert!(!stub.contains("/apps/test/dest/old"));
    assert!(!stub.contains("/apps/test/dest/old/nested.bin"));
}

#[tokio::test]
async fn sync_round_trip_reproduces_the_tree() {
    let stub = StubXpan::builder().directory("/apps/test/dest").spawn().await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());
    let options = small_sync_options();

    let source = TempDir::new().unwrap();
    let contents: Vec<(&str, bytes::Bytes)> = vec![
        ("top.txt", patterned_bytes(10, 61)),
        ("nested/mid.bin", patterned_bytes(3000, 62)),
        ("nested/deeper/leaf.bin", patterned_bytes(4500, 63)),
    ];
    for (rel, content) in &contents {
        write_file(&source.path().join(rel), content);
    }

    let up = syncer
        .sync_up(source.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(up.failed(), 0);

    let mirror = TempDir::new().unwrap();
    let mirror_dir = mirror.path().join("copy");
    let down = syncer
        .sync_down("/apps/test/dest", &mirror_dir, &options)
        .await
        .unwrap();
    assert_eq!(down.failed(), 0);

    for (rel, content) in &contents {
        assert_eq!(
            std::fs::read(mirror_dir.join(rel)).unwrap(),
            content.as_ref(),
            "mismatch for {rel}"
        );
    }
}

#[tokio::test]
async fn unicode_paths_survive_sync() {
    let stub = StubXpan::builder().directory("/apps/test/dest").spawn().await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());
    let options = small_sync_options();

    // Spaces, emoji, and a combining mark.
    let name = "caf\u{65}\u{301} \u{1F389} note.txt";
    let local = TempDir::new().unwrap();
    write_file(&local.path().join(name), b"unicode!");

    let report = syncer
        .sync_up(local.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(report.failed(), 0);
    assert_eq!(
        stub.file_bytes(&format!("/apps/test/dest/{name}")).unwrap(),
        bytes::Bytes::from_static(b"unicode!")
    );

    let mirror = TempDir::new().unwrap();
    let mirror_dir = mirror.path().join("copy");
    syncer
        .sync_down("/apps/test/dest", &mirror_dir, &options)
        .await
        .unwrap();
    assert_eq!(
        std::fs::read(mirror_dir.join(name)).unwrap(),
        b"unicode!"
    );
}

#[tokio::test]
async fn compare_reports_all_four_buckets() {
    let shared = patterned_bytes(1200, 71);
    let stub = StubXpan::builder()
        .directory("/apps/test/dest")
        .file("/apps/test/dest/same.bin", shared.clone())
        .file("/apps/test/dest/changed.bin", patterned_bytes(1200, 72))
        .file("/apps/test/dest/remote-only.bin", patterned_bytes(64, 73))
        .spawn()
        .await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());
    let options = small_sync_options();

    let local = TempDir::new().unwrap();
    write_file(&local.path().join("same.bin"), &shared);
    // Same size, different content: size alone must not count as equal.
    write_file(&local.path().join("changed.bin"), &patterned_bytes(1200, 74));
    write_file(&local.path().join("local-only.bin"), b"local");

    let report = syncer
        .compare(local.path(), "/apps/test/dest", &options)
        .await
        .unwrap();
    assert_eq!(report.matching, vec!["same.bin".to_owned()]);
    assert_eq!(report.differing, vec!["changed.bin".to_owned()]);
    assert_eq!(report.local_only, vec!["local-only.bin".to_owned()]);
    assert_eq!(report.remote_only, vec!["remote-only.bin".to_owned()]);
}

#[tokio::test]
async fn symlinks_escaping_the_root_are_skipped() {
    let stub = StubXpan::builder().directory("/apps/test/dest").spawn().await;
    let state = TempDir::new().unwrap();
    let syncer = test_syncer(&stub, state.path());

    let outside = TempDir::new().unwrap();
    write_file(&outside.path().join("secret.txt"), b"outside");

    let local = TempDir::new().unwrap();
    write_file(&local.path().join("inside.txt"), b"inside");
    std::os::unix::fs::symlink(
        outside.path().join("secret.txt"),
        local.path().join("escape.txt"),
    )
    .unwrap();

    let report = syncer
        .sync_up(local.path(), "/apps/test/dest", &small_sync_options())
        .await
        .unwrap();
    assert_eq!(report.failed(), 0);
    assert!(stub.contains("/apps/test/dest/inside.txt"));
    assert!(!stub.contains("/apps/test/dest/escape.txt"));
}
