// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::io::Write;

use crate::{ContentDigest, MultiHasher, sync_digest};

#[test]
fn single_pass_matches_of_bytes() {
    let input = b"The quick brown fox jumps over the lazy dog";
    let mut hasher = MultiHasher::new(16);
    // Feed in uneven pieces to exercise the slice boundary straddling a buffer.
    hasher.update(&input[0..10]);
    hasher.update(&input[10..17]);
    hasher.update(&input[17..]);
    let digest = hasher.finish();

    assert_eq!(digest, ContentDigest::of_bytes(input, 16));
    assert_eq!(digest.md5.to_hex(), "9e107d9d372bb6826bd81d3542a419d6");
    assert_eq!(digest.crc32, 0x414f_a339);
    assert_eq!(digest.size_bytes, input.len() as u64);
}

#[test]
fn reader_digest() {
    let mut src = &b"hello world"[..];
    let digest = sync_digest(&mut src, 5).unwrap();
    assert_eq!(digest.md5.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    assert_eq!(digest.slice_md5.to_hex(), "5d41402abc4b2a76b9719d911017c592");
}

#[tokio::test]
async fn file_digest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("blob");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"hello world").unwrap();
    drop(file);

    let digest = crate::digest_file(&path, 5).await.unwrap();
    assert_eq!(digest, ContentDigest::of_bytes(b"hello world", 5));
}

#[tokio::test]
async fn empty_file_digest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty");
    std::fs::File::create(&path).unwrap();

    let digest = crate::digest_file(&path, crate::DEFAULT_SLICE_SIZE).await.unwrap();
    assert_eq!(digest, crate::EMPTY_CONTENT_DIGEST);
}
