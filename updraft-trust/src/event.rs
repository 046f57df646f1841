// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! One signed event retrieved from a channel.
//!
//! The wire shape mirrors what channel servers publish: a sequence id, the
//! content root commitment, a `stored` block describing the action, and the
//! action-specific material. Exact field names are a deployment concern; the
//! shapes here are the reference ones.

use std::{convert::TryFrom, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use updraft_crypto::{Digest, PublicKey, Signature};

use crate::supplier::{KeyType, Provenance, Supplier};

/// Action carried by an update event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    InsertKey,
    RevokeKey,
    CoreUpdate,
    PackageUpdate,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsertKey => f.write_str("insert-key"),
            Self::RevokeKey => f.write_str("revoke-key"),
            Self::CoreUpdate => f.write_str("core-update"),
            Self::PackageUpdate => f.write_str("package-update"),
        }
    }
}

/// What a release installs as.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kind {
    Core,
    Extension,
    Plugin,
    Theme,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Core => f.write_str("core"),
            Self::Extension => f.write_str("extension"),
            Self::Plugin => f.write_str("plugin"),
            Self::Theme => f.write_str("theme"),
        }
    }
}

/// The `stored` block of an envelope: action classification and the metadata
/// that is covered by the master signature for key events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stored {
    pub action: Action,
    pub supplier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyType>,
    /// Unix seconds; second precision is part of the canonical message.
    pub date_generated: i64,
}

/// Raw update envelope as fetched from a channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub root: String,
    pub stored: Stored,
    /// JSON-string payload; carries the release descriptor for
    /// core/package updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_signature: Option<Signature>,
}

/// Release descriptor carried by core and package updates.
///
/// No signature chain is required at this layer; authenticity is established
/// at artifact-verification time, against the supplier key store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReleaseDescriptor {
    pub kind: Kind,
    pub name: String,
    pub version: String,
    pub size: u64,
    pub digest: Digest,
    pub signature: Signature,
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ReleaseWire {
    #[serde(default)]
    kind: Option<Kind>,
    name: String,
    version: String,
    size: u64,
    digest: Digest,
    signature: Signature,
    url: String,
}

/// Direction of a key-management event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Change {
    Insert,
    Revoke,
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("insert-key"),
            Self::Revoke => f.write_str("revoke-key"),
        }
    }
}

/// A parsed key-management event.
#[derive(Clone, Debug)]
pub struct KeyChange {
    pub change: Change,
    pub key_type: KeyType,
    pub public_key: PublicKey,
    /// Claimed authorising master key and signature, as sent. Which trusted
    /// master actually validates is decided in [`KeyChange::verify`].
    pub master: Option<(PublicKey, Signature)>,
    pub date_generated: i64,
}

/// Payload of an [`UpdateRecord`].
#[derive(Clone, Debug)]
pub enum Payload {
    KeyChange(KeyChange),
    Release(ReleaseDescriptor),
}

/// A single classified event from the update log of a channel.
#[derive(Clone, Debug)]
pub struct UpdateRecord {
    pub channel_id: u64,
    pub content_root: String,
    pub supplier: String,
    pub payload: Payload,
}

pub mod error {
    use super::*;

    /// Malformed update data. The offending event is discarded and logged;
    /// it never aborts the rest of a batch.
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Parse {
        #[error("malformed update envelope")]
        Envelope(#[source] serde_json::Error),

        #[error("malformed release descriptor")]
        Descriptor(#[source] serde_json::Error),

        #[error("missing field `{0}`")]
        Missing(&'static str),

        #[error("invalid supplier name `{0}`")]
        SupplierName(String),

        #[error("invalid package name `{0}`")]
        PackageName(String),

        #[error("release kind `{kind}` does not match action `{action}`")]
        KindMismatch { action: Action, kind: Kind },
    }

    /// Trust errors. Always fail closed: the event is discarded, never
    /// partially trusted, never retried with relaxed checks.
    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Verify {
        #[error("unknown supplier `{name}`")]
        UnknownSupplier { name: String },

        #[error("no trusted master key of `{supplier}` signed the change to key {key}")]
        InvalidKeySignature { supplier: String, key: PublicKey },
    }
}

/// Supplier names become persistence file names and registry keys, so the
/// wire boundary only admits a conservative character set.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

impl UpdateRecord {
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, error::Parse> {
        let envelope: Envelope =
            serde_json::from_value(raw.clone()).map_err(error::Parse::Envelope)?;
        Self::try_from(envelope)
    }
}

impl TryFrom<Envelope> for UpdateRecord {
    type Error = error::Parse;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let Envelope {
            id,
            root,
            stored,
            data,
            new_key,
            master_key,
            master_signature,
        } = envelope;

        if !is_valid_name(&stored.supplier) {
            return Err(error::Parse::SupplierName(stored.supplier));
        }

        let payload = match stored.action {
            Action::InsertKey | Action::RevokeKey => {
                let change = match stored.action {
                    Action::InsertKey => Change::Insert,
                    _ => Change::Revoke,
                };
                let key_type = stored.key_type.ok_or(error::Parse::Missing("key_type"))?;
                let public_key = new_key.ok_or(error::Parse::Missing("new_key"))?;
                let master = match (master_key, master_signature) {
                    (Some(key), Some(sig)) => Some((key, sig)),
                    (None, None) => None,
                    (None, Some(_)) => return Err(error::Parse::Missing("master_key")),
                    (Some(_), None) => return Err(error::Parse::Missing("master_signature")),
                };
                Payload::KeyChange(KeyChange {
                    change,
                    key_type,
                    public_key,
                    master,
                    date_generated: stored.date_generated,
                })
            },
            Action::CoreUpdate | Action::PackageUpdate => {
                let data = data.ok_or(error::Parse::Missing("data"))?;
                let wire: ReleaseWire =
                    serde_json::from_str(&data).map_err(error::Parse::Descriptor)?;
                if !is_valid_name(&wire.name) {
                    return Err(error::Parse::PackageName(wire.name));
                }
                let kind = match (stored.action, wire.kind) {
                    (Action::CoreUpdate, None) | (Action::CoreUpdate, Some(Kind::Core)) => {
                        Kind::Core
                    },
                    (Action::PackageUpdate, Some(kind)) if kind != Kind::Core => kind,
                    (Action::PackageUpdate, None) => return Err(error::Parse::Missing("kind")),
                    (action, Some(kind)) => return Err(error::Parse::KindMismatch { action, kind }),
                };
                Payload::Release(ReleaseDescriptor {
                    kind,
                    name: wire.name,
                    version: wire.version,
                    size: wire.size,
                    digest: wire.digest,
                    signature: wire.signature,
                    url: wire.url,
                })
            },
        };

        Ok(Self {
            channel_id: id,
            content_root: root,
            supplier: stored.supplier,
            payload,
        })
    }
}

/// How a verified key change is admitted into the store.
#[derive(Clone, Debug)]
pub enum Admitted {
    /// First contact with a brand-new supplier: its first master key is
    /// trusted without a signature chain.
    Bootstrap,
    /// Chain back to a currently-trusted master key validated; `Provenance`
    /// names the master that actually signed.
    Chained(Provenance),
}

impl KeyChange {
    /// The exact canonical message the authorising master is supposed to have
    /// signed: action, generation time (second precision), new public key,
    /// supplier name, key type.
    pub fn canonical_message(&self, supplier: &str) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{}",
            self.change, self.date_generated, self.public_key, supplier, self.key_type
        )
        .into_bytes()
    }

    /// Decide whether this change may mutate the key store of `supplier`.
    ///
    /// `current` is the supplier as currently trusted, or `None` on first
    /// contact. Every currently-trusted master key is attempted, succeeding
    /// on the first one that validates; not all masters need to co-sign.
    pub fn verify(
        &self,
        supplier: &str,
        current: Option<&Supplier>,
    ) -> Result<Admitted, error::Verify> {
        let current = match current {
            None => {
                return if self.change == Change::Insert && self.key_type == KeyType::Master {
                    Ok(Admitted::Bootstrap)
                } else {
                    Err(error::Verify::UnknownSupplier {
                        name: supplier.to_string(),
                    })
                };
            },
            Some(current) => current,
        };

        let invalid = || error::Verify::InvalidKeySignature {
            supplier: supplier.to_string(),
            key: self.public_key,
        };

        let (claimed, signature) = self.master.as_ref().ok_or_else(invalid)?;
        let message = self.canonical_message(supplier);

        tracing::debug!(
            supplier,
            claimed = %claimed,
            "verifying key change against trusted masters"
        );

        current
            .master_keys()
            .find(|master| signature.verify(&message, master))
            .map(|master| {
                Admitted::Chained(Provenance {
                    master: *master,
                    signature: signature.clone(),
                })
            })
            .ok_or_else(invalid)
    }
}
