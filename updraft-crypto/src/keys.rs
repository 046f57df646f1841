// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::{fmt, iter, ops::Deref, str::FromStr};

use multibase::Base;
use serde::{de::Visitor, Deserialize, Deserializer, Serialize, Serializer};
use sodiumoxide::crypto::sign::ed25519;
use thiserror::Error;

pub use ed25519::{Seed, PUBLICKEYBYTES};

/// Version of the signature scheme in use
///
/// This is used for future-proofing serialisation. For ergonomics reasons, we
/// avoid introducing single-variant enums just now, and just serialize a
/// version tag alongside the data.
const VERSION: u8 = 0;

lazy_static! {
    static ref SODIUMOXIDE_INITIALISED: bool = sodiumoxide::init().map(|()| true).unwrap_or(false);
}

/// Lazily trigger sodiumoxide initialisation.
///
/// Panics if `sodiumoxide::init()` fails.
///
/// **This function must be called from all places within this crate which
/// could be called with an unitialized `sodiumoxide`.**
pub(crate) fn ensure_initialised() {
    if !SODIUMOXIDE_INITIALISED.deref() {
        panic!("Failed to initialise sodiumoxide")
    }
}

/// A supplier- or channel-operated Ed25519 signing key
#[derive(Clone, Eq, PartialEq)]
#[cfg_attr(test, derive(Debug))]
pub struct SecretKey(ed25519::SecretKey);

/// The public part of a [`SecretKey`]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct PublicKey(ed25519::PublicKey);

/// A signature produced by [`SecretKey::sign`]
#[derive(Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct Signature(ed25519::Signature);

// SecretKey

#[allow(clippy::new_without_default)]
impl SecretKey {
    pub fn new() -> Self {
        ensure_initialised();
        let (_, sk) = ed25519::gen_keypair();
        Self(sk)
    }

    /// Deterministic key derivation, used to obtain stable key material in
    /// tests and tooling.
    pub fn from_seed(seed: &ed25519::Seed) -> Self {
        ensure_initialised();
        let (_, sk) = ed25519::keypair_from_seed(seed);
        Self(sk)
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature(ed25519::sign_detached(data, &self.0))
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.public().fmt(f)
    }
}

impl AsRef<[u8]> for SecretKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

// PublicKey

#[derive(Debug, Error)]
pub enum ParsePublicKeyError {
    #[error("invalid hex encoding")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid length for ed25519 public key")]
    InvalidSliceLength,
}

impl PublicKey {
    pub fn verify(&self, sig: &Signature, data: &[u8]) -> bool {
        ed25519::verify_detached(sig, data, self)
    }

    pub fn from_slice(bs: &[u8]) -> Option<PublicKey> {
        ensure_initialised();
        ed25519::PublicKey::from_slice(bs).map(PublicKey)
    }

    /// Parse a hex-encoded public key, as found in channel and peer
    /// configuration.
    pub fn from_hex(s: &str) -> Result<Self, ParsePublicKeyError> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(ParsePublicKeyError::InvalidSliceLength)
    }
}

impl From<ed25519::PublicKey> for PublicKey {
    fn from(pk: ed25519::PublicKey) -> Self {
        ensure_initialised();
        Self(pk)
    }
}

impl From<SecretKey> for PublicKey {
    fn from(k: SecretKey) -> Self {
        k.public()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_versioned(self.as_ref()))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Deref for PublicKey {
    type Target = ed25519::PublicKey;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        encode_versioned(self.as_ref()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PublicKeyVisitor;

        impl<'de> Visitor<'de> for PublicKeyVisitor {
            type Value = PublicKey;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a PublicKey, version {}", VERSION)
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let data = decode_versioned(s).map_err(serde::de::Error::custom)?;
                ed25519::PublicKey::from_slice(&data).map(PublicKey).ok_or({
                    serde::de::Error::custom("Invalid length for ed25519 public key")
                })
            }
        }

        deserializer.deserialize_str(PublicKeyVisitor)
    }
}

impl FromStr for PublicKey {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = decode_versioned(s)?;
        ed25519::PublicKey::from_slice(&data)
            .map(PublicKey)
            .ok_or(DecodeError::InvalidSliceLength)
    }
}

// Signature

impl Signature {
    pub fn verify(&self, data: &[u8], pk: &PublicKey) -> bool {
        ed25519::verify_detached(self, data, pk)
    }

    pub fn from_slice(bs: &[u8]) -> Option<Signature> {
        ensure_initialised();
        ed25519::Signature::from_slice(bs).map(Signature)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&encode_versioned(self.as_ref()))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Deref for Signature {
    type Target = ed25519::Signature;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        encode_versioned(self.as_ref()).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct SignatureVisitor;

        impl<'de> Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a Signature, version {}", VERSION)
            }

            fn visit_str<E>(self, s: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let data = decode_versioned(s).map_err(serde::de::Error::custom)?;
                ed25519::Signature::from_slice(&data).map(Signature).ok_or({
                    serde::de::Error::custom("Invalid length for ed25519 signature")
                })
            }
        }

        deserializer.deserialize_str(SignatureVisitor)
    }
}

impl FromStr for Signature {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = decode_versioned(s)?;
        ed25519::Signature::from_slice(&data)
            .map(Signature)
            .ok_or(DecodeError::InvalidSliceLength)
    }
}

fn encode_versioned(data: &[u8]) -> String {
    multibase::encode(
        Base::Base32Z,
        iter::once(&VERSION).chain(data).cloned().collect::<Vec<u8>>(),
    )
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Multibase(#[from] multibase::Error),

    #[error("empty input")]
    Empty,

    #[error("unknown version {0}")]
    UnknownVersion(u8),

    #[error("invalid length for ed25519 data")]
    InvalidSliceLength,
}

fn decode_versioned(s: &str) -> Result<Vec<u8>, DecodeError> {
    let (_, bytes) = multibase::decode(s)?;
    match bytes.split_first() {
        None => Err(DecodeError::Empty),
        Some((version, data)) => {
            if version != &VERSION {
                return Err(DecodeError::UnknownVersion(*version));
            }
            Ok(data.to_vec())
        },
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    const DATA_TO_SIGN: &[u8] = b"alors monsieur";

    #[test]
    fn test_sign_verify_via_signature() {
        let key = SecretKey::new();
        let sig = key.sign(DATA_TO_SIGN);
        assert!(sig.verify(DATA_TO_SIGN, &key.public()))
    }

    #[test]
    fn test_sign_verify_via_pubkey() {
        let key = SecretKey::new();
        let sig = key.sign(DATA_TO_SIGN);
        assert!(key.public().verify(&sig, DATA_TO_SIGN))
    }

    #[test]
    fn test_tampered_data_does_not_verify() {
        let key = SecretKey::new();
        let sig = key.sign(DATA_TO_SIGN);
        assert!(!sig.verify(b"alors madame", &key.public()))
    }

    #[test]
    fn test_public_key_json() {
        let pk = SecretKey::new().public();
        let ser = serde_json::to_string(&pk).unwrap();
        let de: PublicKey = serde_json::from_str(&ser).unwrap();
        assert_eq!(pk, de)
    }

    #[test]
    fn test_public_key_deserialize_wrong_version() {
        let pk = SecretKey::new().public();
        let ser = multibase::encode(
            Base::Base32Z,
            iter::once(&1u8)
                .chain(pk.as_ref())
                .cloned()
                .collect::<Vec<u8>>(),
        );
        assert!(serde_json::from_str::<PublicKey>(&format!("\"{}\"", ser)).is_err())
    }

    #[test]
    fn test_signature_json() {
        let sig = SecretKey::new().sign(DATA_TO_SIGN);
        let ser = serde_json::to_string(&sig).unwrap();
        let de: Signature = serde_json::from_str(&ser).unwrap();
        assert_eq!(sig, de)
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let pk = SecretKey::new().public();
        assert_eq!(pk, pk.to_string().parse().unwrap())
    }

    #[test]
    fn test_public_key_hex() {
        let pk = SecretKey::new().public();
        let hexed = hex::encode(pk.as_ref());
        assert_eq!(pk, PublicKey::from_hex(&hexed).unwrap())
    }

    #[test]
    fn test_public_key_bad_hex() {
        assert!(PublicKey::from_hex("not hex at all").is_err());
        assert!(PublicKey::from_hex("deadbeef").is_err())
    }
}
