// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{fmt, str::FromStr};

use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use sodiumoxide::crypto::generichash;
use thiserror::Error;

use crate::keys::ensure_initialised;

/// Size in bytes of a [`Digest`] (BLAKE2b-512).
pub const DIGESTBYTES: usize = 64;

/// A 512-bit BLAKE2b content digest.
///
/// Release descriptors carry the expected digest of an artifact; the download
/// path computes the actual one incrementally via [`Hasher`].
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Digest([u8; DIGESTBYTES]);

#[derive(Debug, Error)]
pub enum ParseDigestError {
    #[error("invalid hex encoding")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid length for BLAKE2b-512 digest")]
    InvalidSliceLength,
}

impl Digest {
    pub fn from_slice(bs: &[u8]) -> Option<Self> {
        if bs.len() != DIGESTBYTES {
            return None;
        }
        let mut data = [0u8; DIGESTBYTES];
        data.copy_from_slice(bs);
        Some(Self(data))
    }

    /// Digest `data` in one go.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finish()
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0[..]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Digest {
    type Err = ParseDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(ParseDigestError::InvalidSliceLength)
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        hex::encode(self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct DigestVisitor;

        impl<'de> Visitor<'de> for DigestVisitor {
            type Value = Digest;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a hex-encoded BLAKE2b-512 digest")
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                s.parse().map_err(serde::de::Error::custom)
            }
        }

        deserializer.deserialize_str(DigestVisitor)
    }
}

/// Incremental BLAKE2b-512 hashing state.
///
/// Feed bytes as they arrive off the wire, then [`Hasher::finish`].
pub struct Hasher(generichash::State);

#[allow(clippy::new_without_default)]
impl Hasher {
    pub fn new() -> Self {
        ensure_initialised();
        // out_len within libsodium's [BYTES_MIN, BYTES_MAX]
        let state = generichash::State::new(Some(DIGESTBYTES), None)
            .expect("BLAKE2b output length out of range");
        Self(state)
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0
            .update(data)
            .expect("BLAKE2b state used after finalisation")
    }

    pub fn finish(self) -> Digest {
        let digest = self
            .0
            .finalize()
            .expect("BLAKE2b state used after finalisation");
        Digest::from_slice(digest.as_ref()).expect("libsodium returned digest of requested length")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7693 appendix A vectors
    const EMPTY_HEX: &str = "786a02f742015903c6c6fd852552d272912f4740e15847618a86e217f71f5419\
                             d25e1031afee585313896444934eb04b903a685b1448b755d56f701afe9be2ce";
    const ABC_HEX: &str = "ba80a53f981c4d0d6a2797b69f12f6e94c212f14685ac4b74b12bb6fdbffa2d1\
                           7d87c5392aab792dc252d5de4533cc9518d38aa8dbf1925ab92386edd4009923";

    #[test]
    fn test_empty_input_vector() {
        assert_eq!(Digest::digest(b"").to_string(), EMPTY_HEX)
    }

    #[test]
    fn test_abc_vector() {
        assert_eq!(Digest::digest(b"abc").to_string(), ABC_HEX)
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Hasher::new();
        hasher.update(b"hello,");
        hasher.update(b" ");
        hasher.update(b"world");
        assert_eq!(hasher.finish(), Digest::digest(b"hello, world"))
    }

    #[test]
    fn test_hex_roundtrip() {
        let digest = Digest::digest(b"roundtrip");
        assert_eq!(digest, digest.to_string().parse().unwrap())
    }

    #[test]
    fn test_json_roundtrip() {
        let digest = Digest::digest(b"json");
        let ser = serde_json::to_string(&digest).unwrap();
        let de: Digest = serde_json::from_str(&ser).unwrap();
        assert_eq!(digest, de)
    }

    #[test]
    fn test_rejects_short_input() {
        assert!("deadbeef".parse::<Digest>().is_err())
    }
}
