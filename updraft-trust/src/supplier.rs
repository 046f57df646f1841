// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use updraft_crypto::{PublicKey, Signature};

/// Role of a supplier key.
///
/// Master keys only ever authorise other keys; signing keys only ever sign
/// installable artifacts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Master,
    Signing,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => f.write_str("master"),
            Self::Signing => f.write_str("signing"),
        }
    }
}

/// Which master key, via which signature, authorised a key.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub master: PublicKey,
    pub signature: Signature,
}

/// One currently-trusted key of a [`Supplier`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_type: KeyType,
    pub public_key: PublicKey,
    pub authorized_by: Option<Provenance>,
}

pub mod error {
    use super::*;

    #[derive(Debug, Error, Eq, PartialEq)]
    #[non_exhaustive]
    pub enum Insert {
        #[error("key {key} is already trusted for supplier {supplier}")]
        Duplicate { supplier: String, key: PublicKey },

        #[error("signing key {key} for supplier {supplier} carries no provenance")]
        MissingProvenance { supplier: String, key: PublicKey },
    }

    #[derive(Debug, Error, Eq, PartialEq)]
    #[non_exhaustive]
    pub enum Revoke {
        #[error("key {key} is not trusted for supplier {supplier}")]
        UnknownKey { supplier: String, key: PublicKey },
    }
}

/// The unit of trust: a supplier name plus its currently-trusted keys.
///
/// Mutated only through the trust log replayer; every mutation goes through
/// [`Supplier::insert`] or [`Supplier::revoke`], which uphold the invariant
/// that a signing key always carries the provenance that authorised it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Supplier {
    pub name: String,
    keys: Vec<KeyRecord>,
}

impl Supplier {
    /// Trust-on-first-use bootstrap: a brand-new supplier with its first
    /// master key and no signature chain.
    pub fn bootstrap(name: impl Into<String>, master: PublicKey) -> Self {
        Self {
            name: name.into(),
            keys: vec![KeyRecord {
                key_type: KeyType::Master,
                public_key: master,
                authorized_by: None,
            }],
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyRecord> {
        self.keys.iter()
    }

    pub fn master_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.keys
            .iter()
            .filter(|record| record.key_type == KeyType::Master)
            .map(|record| &record.public_key)
    }

    pub fn signing_keys(&self) -> impl Iterator<Item = &PublicKey> {
        self.keys
            .iter()
            .filter(|record| record.key_type == KeyType::Signing)
            .map(|record| &record.public_key)
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|record| &record.public_key == key)
    }

    pub fn insert(&mut self, record: KeyRecord) -> Result<(), error::Insert> {
        if self.contains(&record.public_key) {
            return Err(error::Insert::Duplicate {
                supplier: self.name.clone(),
                key: record.public_key,
            });
        }
        if record.key_type == KeyType::Signing && record.authorized_by.is_none() {
            return Err(error::Insert::MissingProvenance {
                supplier: self.name.clone(),
                key: record.public_key,
            });
        }
        self.keys.push(record);
        Ok(())
    }

    /// Remove `key` from the trusted set.
    ///
    /// A revoked key is gone for good: it can neither validate subsequent
    /// events nor artifact signatures.
    pub fn revoke(&mut self, key: &PublicKey) -> Result<KeyRecord, error::Revoke> {
        match self.keys.iter().position(|record| &record.public_key == key) {
            Some(at) => Ok(self.keys.remove(at)),
            None => Err(error::Revoke::UnknownKey {
                supplier: self.name.clone(),
                key: *key,
            }),
        }
    }
}
