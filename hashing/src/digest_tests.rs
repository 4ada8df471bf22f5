// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use serde_test::{assert_tokens, Token};

use crate::{ContentDigest, EMPTY_CONTENT_DIGEST, EMPTY_FINGERPRINT};

#[test]
fn empty_input() {
    assert_eq!(ContentDigest::of_bytes(b"", 256 * 1024), EMPTY_CONTENT_DIGEST);
    assert_eq!(EMPTY_FINGERPRINT.to_hex(), "d41d8cd98f00b204e9800998ecf8427e");
}

#[test]
fn known_values() {
    let digest = ContentDigest::of_bytes(b"hello world", 256 * 1024);
    assert_eq!(digest.md5.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    // Input shorter than the slice limit: the slice MD5 covers the whole input.
    assert_eq!(digest.slice_md5, digest.md5);
    assert_eq!(digest.crc32, 0x0d4a_1185);
    assert_eq!(digest.size_bytes, 11);
}

#[test]
fn slice_md5_caps_at_slice_limit() {
    let digest = ContentDigest::of_bytes(b"hello world", 5);
    assert_eq!(digest.md5.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    // MD5 of "hello" only.
    assert_eq!(
        digest.slice_md5.to_hex(),
        "5d41402abc4b2a76b9719d911017c592"
    );
    assert_eq!(digest.size_bytes, 11);
}

#[test]
fn serialize_and_deserialize() {
    let digest = ContentDigest::of_bytes(b"abc", 256 * 1024);
    assert_tokens(
        &digest,
        &[
            Token::Struct {
                name: "ContentDigest",
                len: 4,
            },
            Token::Str("md5"),
            Token::Str("900150983cd24fb0d6963f7d28e17f72"),
            Token::Str("slice_md5"),
            Token::Str("900150983cd24fb0d6963f7d28e17f72"),
            Token::Str("crc32"),
            Token::U32(0x352441c2),
            Token::Str("size_bytes"),
            Token::U64(3),
            Token::StructEnd,
        ],
    );
}
