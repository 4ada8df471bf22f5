// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use hashing::{ContentDigest, Fingerprint, DEFAULT_SLICE_SIZE};
use testutil::{patterned_bytes, RequestType, StubXpan};

use crate::retry::RetryOptions;
use crate::{
    Error, OverwritePolicy, StaticTokenProvider, TokenProvider, XpanClient, XpanClientOptions,
};

fn test_options(stub: &StubXpan) -> XpanClientOptions {
    XpanClientOptions {
        base_url: stub.base_url(),
        data_url: stub.base_url(),
        app_root: "/apps/test".to_owned(),
        request_timeout: Duration::from_secs(5),
        retry: RetryOptions {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(10),
        },
    }
}

fn test_client(stub: &StubXpan) -> XpanClient {
    XpanClient::new(
        test_options(stub),
        Arc::new(StaticTokenProvider::new("test-token")),
    )
    .unwrap()
}

#[tokio::test]
async fn meta_hit_and_miss() {
    let stub = StubXpan::builder()
        .file("/apps/test/a.txt", Bytes::from_static(b"hello world"))
        .spawn()
        .await;
    let client = test_client(&stub);

    let file = client.meta("/apps/test/a.txt").await.unwrap().unwrap();
    assert_eq!(file.path, "/apps/test/a.txt");
    assert_eq!(file.size, 11);
    assert!(!file.is_dir);
    assert_eq!(
        file.md5,
        Some(Fingerprint::of_bytes(b"hello world"))
    );

    assert_eq!(client.meta("/apps/test/missing.txt").await.unwrap(), None);
}

#[tokio::test]
async fn rapid_upload_hit_and_miss() {
    let content = patterned_bytes(4096, 7);
    let stub = StubXpan::builder()
        .file("/apps/test/existing.bin", content.clone())
        .spawn()
        .await;
    let client = test_client(&stub);
    let digest = ContentDigest::of_bytes(&content, DEFAULT_SLICE_SIZE);

    let file = client
        .rapid_upload("/apps/test/copy.bin", &digest, OverwritePolicy::Overwrite)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(file.path, "/apps/test/copy.bin");
    assert_eq!(stub.file_bytes("/apps/test/copy.bin").unwrap(), content);

    let unknown = ContentDigest::of_bytes(b"never uploaded", DEFAULT_SLICE_SIZE);
    let result = client
        .rapid_upload("/apps/test/other.bin", &unknown, OverwritePolicy::Overwrite)
        .await
        .unwrap();
    assert_eq!(result, None);
}

#[tokio::test]
async fn chunked_upload_round_trip() {
    let stub = StubXpan::spawn().await;
    let client = test_client(&stub);

    let content = patterned_bytes(1000, 3);
    let chunks = [&content[0..400], &content[400..800], &content[800..1000]];
    let block_md5s: Vec<Fingerprint> =
        chunks.iter().map(|chunk| Fingerprint::of_bytes(chunk)).collect();

    let precreated = client
        .precreate(
            "/apps/test/chunked.bin",
            content.len() as u64,
            &block_md5s,
            OverwritePolicy::FailIfExists,
        )
        .await
        .unwrap();
    assert_eq!(precreated.needed, vec![0, 1, 2]);

    for (index, chunk) in chunks.iter().enumerate() {
        let echoed = client
            .upload_slice(
                &precreated.upload_id,
                "/apps/test/chunked.bin",
                index,
                Bytes::copy_from_slice(chunk),
            )
            .await
            .unwrap();
        assert_eq!(echoed, block_md5s[index]);
    }

    let file = client
        .create(
            &precreated.upload_id,
            "/apps/test/chunked.bin",
            content.len() as u64,
            &block_md5s,
            OverwritePolicy::FailIfExists,
        )
        .await
        .unwrap();
    assert_eq!(file.size, 1000);
    assert_eq!(file.md5, Some(Fingerprint::of_bytes(&content)));
    assert_eq!(stub.file_bytes("/apps/test/chunked.bin").unwrap(), content);
}

#[tokio::test]
async fn create_conflict_with_fail_if_exists() {
    let stub = StubXpan::builder()
        .file("/apps/test/taken.bin", Bytes::from_static(b"old"))
        .spawn()
        .await;
    let client = test_client(&stub);

    let content = b"new content";
    let block_md5s = vec![Fingerprint::of_bytes(content)];
    let precreated = client
        .precreate(
            "/apps/test/taken.bin",
            content.len() as u64,
            &block_md5s,
            OverwritePolicy::FailIfExists,
        )
        .await
        .unwrap();
    client
        .upload_slice(
            &precreated.upload_id,
            "/apps/test/taken.bin",
            0,
            Bytes::from_static(content),
        )
        .await
        .unwrap();
    let result = client
        .create(
            &precreated.upload_id,
            "/apps/test/taken.bin",
            content.len() as u64,
            &block_md5s,
            OverwritePolicy::FailIfExists,
        )
        .await;
    assert!(matches!(result, Err(Error::Conflict(_))));
    // The original content is untouched.
    assert_eq!(
        stub.file_bytes("/apps/test/taken.bin").unwrap(),
        Bytes::from_static(b"old")
    );
}

#[tokio::test]
async fn stale_upload_id_is_reported_expired() {
    let stub = StubXpan::spawn().await;
    let client = test_client(&stub);

    let result = client
        .upload_slice(
            "upid-unknown",
            "/apps/test/gone.bin",
            0,
            Bytes::from_static(b"bytes"),
        )
        .await;
    assert!(matches!(result, Err(Error::Expired(_))));
}

#[tokio::test]
async fn list_exhausts_pagination() {
    let stub = StubXpan::builder().directory("/apps/test/dir").spawn().await;
    for i in 0..1005 {
        stub.insert_file(
            &format!("/apps/test/dir/file-{i:04}.txt"),
            Bytes::from_static(b"x"),
        );
    }
    let client = test_client(&stub);

    let (first, next) = client.list("/apps/test/dir", true, 0).await.unwrap();
    assert_eq!(first.len(), 1000);
    let next = next.expect("expected a second page");
    let (second, done) = client.list("/apps/test/dir", true, next).await.unwrap();
    assert_eq!(second.len(), 5);
    assert_eq!(done, None);
}

#[tokio::test]
async fn dlink_read_with_range() {
    let content = patterned_bytes(1024, 11);
    let stub = StubXpan::builder()
        .file("/apps/test/data.bin", content.clone())
        .spawn()
        .await;
    let client = test_client(&stub);

    let file = client.meta("/apps/test/data.bin").await.unwrap().unwrap();
    let link = client.dlink(file.fsid).await.unwrap();
    let response = client.read_dlink(&link, Some(100..200)).await.unwrap();
    let body = response.bytes().await.unwrap();
    assert_eq!(body, content.slice(100..200));
}

#[tokio::test]
async fn expired_dlink_is_distinguishable() {
    let stub = StubXpan::builder()
        .file("/apps/test/data.bin", patterned_bytes(64, 2))
        .spawn()
        .await;
    let client = test_client(&stub);
    let file = client.meta("/apps/test/data.bin").await.unwrap().unwrap();

    stub.expire_next_dlinks(1);
    let stale = client.dlink(file.fsid).await.unwrap();
    let result = client.read_dlink(&stale, None).await;
    assert!(matches!(result, Err(Error::Expired(_))));

    // A fresh link works.
    let fresh = client.dlink(file.fsid).await.unwrap();
    let body = client
        .read_dlink(&fresh, None)
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.len(), 64);
}

struct RefreshingTokenProvider {
    refreshes: AtomicUsize,
}

#[async_trait]
impl TokenProvider for RefreshingTokenProvider {
    async fn current_token(&self) -> Result<String, Error> {
        Ok("test-token".to_owned())
    }

    async fn refresh(&self) -> Result<String, Error> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok("test-token".to_owned())
    }
}

#[tokio::test]
async fn token_expiry_triggers_one_refresh() {
    let stub = StubXpan::builder()
        .file("/apps/test/a.txt", Bytes::from_static(b"hi"))
        .spawn()
        .await;
    let tokens = Arc::new(RefreshingTokenProvider {
        refreshes: AtomicUsize::new(0),
    });
    let client = XpanClient::new(test_options(&stub), tokens.clone()).unwrap();

    stub.expire_token_for_requests(1);
    let file = client.meta("/apps/test/a.txt").await.unwrap().unwrap();
    assert_eq!(file.size, 2);
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(stub.request_count(RequestType::Meta), 2);
}

#[tokio::test]
async fn mkdir_and_delete() {
    let stub = StubXpan::spawn().await;
    let client = test_client(&stub);

    client.mkdir("/apps/test/newdir").await.unwrap();
    // mkdir -p semantics: repeating is fine.
    client.mkdir("/apps/test/newdir").await.unwrap();
    assert!(stub.contains("/apps/test/newdir"));

    stub.insert_file("/apps/test/newdir/a.txt", Bytes::from_static(b"a"));
    client.delete("/apps/test/newdir").await.unwrap();
    assert!(!stub.contains("/apps/test/newdir"));
    assert!(!stub.contains("/apps/test/newdir/a.txt"));
}
