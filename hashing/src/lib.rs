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

use std::fmt;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

use digest::consts::U16;
use generic_array::GenericArray;
use md5::{Digest as Md5Digest, Md5};
use serde::de::Visitor;
use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde::{Deserialize, Deserializer};
use tokio::io::AsyncReadExt;

/// MD5 of the empty input.
pub const EMPTY_FINGERPRINT: Fingerprint = Fingerprint([
    0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8, 0x42,
    0x7e,
]);

pub const EMPTY_CONTENT_DIGEST: ContentDigest = ContentDigest {
    md5: EMPTY_FINGERPRINT,
    slice_md5: EMPTY_FINGERPRINT,
    crc32: 0,
    size_bytes: 0,
};

pub const FINGERPRINT_SIZE: usize = 16;

/// The provider-mandated slice size: `slice_md5` covers at most this many leading bytes.
pub const DEFAULT_SLICE_SIZE: u64 = 256 * 1024;

const BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Clone, Copy, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn from_bytes_unsafe(bytes: &[u8]) -> Fingerprint {
        if bytes.len() != FINGERPRINT_SIZE {
            panic!(
                "Input value was not a fingerprint; had length: {}",
                bytes.len()
            );
        }

        let mut fingerprint = [0; FINGERPRINT_SIZE];
        fingerprint.clone_from_slice(&bytes[0..FINGERPRINT_SIZE]);
        Fingerprint(fingerprint)
    }

    pub fn from_bytes(bytes: GenericArray<u8, U16>) -> Fingerprint {
        Fingerprint(bytes.into())
    }

    pub fn from_hex_string(hex_string: &str) -> Result<Fingerprint, String> {
        <[u8; FINGERPRINT_SIZE] as hex::FromHex>::from_hex(hex_string)
            .map(Fingerprint)
            .map_err(|e| format!("{e:?}"))
    }

    /// The MD5 of `bytes`. Per-chunk block MD5s are produced with this.
    pub fn of_bytes(bytes: &[u8]) -> Fingerprint {
        let mut hasher = Md5::new();
        hasher.update(bytes);
        Fingerprint::from_bytes(hasher.finalize())
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    #[allow(clippy::wrong_self_convention)]
    pub fn to_hex(&self) -> String {
        let mut s = String::new();
        for &byte in &self.0 {
            fmt::Write::write_fmt(&mut s, format_args!("{byte:02x}")).unwrap();
        }
        s
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint<{}>", self.to_hex())
    }
}

impl AsRef<[u8]> for Fingerprint {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl Serialize for Fingerprint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.to_hex().as_str())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FingerprintVisitor;

        impl<'de> Visitor<'de> for FingerprintVisitor {
            type Value = Fingerprint;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> Result<(), fmt::Error> {
                formatter.write_str("struct Fingerprint")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Fingerprint::from_hex_string(v).map_err(|err| {
                    serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(&format!("{v:?}: {err}")),
                        &format!("A hex representation of a {FINGERPRINT_SIZE} byte value")
                            .as_str(),
                    )
                })
            }
        }

        deserializer.deserialize_string(FingerprintVisitor)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Fingerprint::from_hex_string(s)
    }
}

impl TryFrom<&str> for Fingerprint {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Fingerprint::from_hex_string(s)
    }
}

///
/// The content address of one file, as the provider defines it: the whole-file MD5, the MD5 of
/// the leading slice (at most `DEFAULT_SLICE_SIZE` bytes, used only for rapid-upload matching),
/// the IEEE CRC32 of the whole file, and the byte length.
///
/// Per-chunk block MD5s are a distinct quantity: see `Fingerprint::of_bytes`.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Deserialize)]
pub struct ContentDigest {
    pub md5: Fingerprint,
    pub slice_md5: Fingerprint,
    pub crc32: u32,
    pub size_bytes: u64,
}

impl Serialize for ContentDigest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut obj = serializer.serialize_struct("ContentDigest", 4)?;
        obj.serialize_field("md5", &self.md5)?;
        obj.serialize_field("slice_md5", &self.slice_md5)?;
        obj.serialize_field("crc32", &self.crc32)?;
        obj.serialize_field("size_bytes", &self.size_bytes)?;
        obj.end()
    }
}

impl ContentDigest {
    pub fn of_bytes(bytes: &[u8], slice_limit: u64) -> ContentDigest {
        let mut hasher = MultiHasher::new(slice_limit);
        hasher.update(bytes);
        hasher.finish()
    }
}

///
/// Feeds one stream of bytes to all of the digesters the provider requires, in a single pass.
/// The input is never re-read: callers hand each read buffer to `update` exactly once.
///
pub struct MultiHasher {
    md5: Md5,
    slice_md5: Md5,
    crc32: crc32fast::Hasher,
    slice_limit: u64,
    byte_count: u64,
}

impl MultiHasher {
    pub fn new(slice_limit: u64) -> MultiHasher {
        MultiHasher {
            md5: Md5::new(),
            slice_md5: Md5::new(),
            crc32: crc32fast::Hasher::new(),
            slice_limit: slice_limit,
            byte_count: 0,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        if self.byte_count < self.slice_limit {
            let remaining = (self.slice_limit - self.byte_count) as usize;
            let take = remaining.min(bytes.len());
            self.slice_md5.update(&bytes[0..take]);
        }
        self.md5.update(bytes);
        self.crc32.update(bytes);
        self.byte_count += bytes.len() as u64;
    }

    pub fn finish(self) -> ContentDigest {
        ContentDigest {
            md5: Fingerprint::from_bytes(self.md5.finalize()),
            slice_md5: Fingerprint::from_bytes(self.slice_md5.finalize()),
            crc32: self.crc32.finalize(),
            size_bytes: self.byte_count,
        }
    }
}

///
/// Digest a reader to completion in one sequential pass.
///
pub fn sync_digest<R: ?Sized>(reader: &mut R, slice_limit: u64) -> io::Result<ContentDigest>
where
    R: Read,
{
    let mut hasher = MultiHasher::new(slice_limit);
    let mut buf = vec![0_u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[0..n]);
    }
    Ok(hasher.finish())
}

///
/// Digest the file at `path` in one sequential pass, without loading it into memory.
///
pub async fn digest_file<P: AsRef<Path>>(path: P, slice_limit: u64) -> io::Result<ContentDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = MultiHasher::new(slice_limit);
    let mut buf = vec![0_u8; BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[0..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod fingerprint_tests;

#[cfg(test)]
mod digest_tests;

#[cfg(test)]
mod hasher_tests;
