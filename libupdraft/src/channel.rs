// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Channels and their peers.
//!
//! A channel is a named trust root: its long-term public key signs every
//! batch of update events, no matter which peer served it. Peers are plain
//! mirrors and are never trusted individually.

use std::time::Duration;

use rand::{rngs::OsRng, seq::SliceRandom as _};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use updraft_crypto::{PublicKey, SecretKey, Signature};
use updraft_trust::replay::RawEvent;

use crate::fetch::{self, Fetch};

const ONION_TLD: &str = ".onion";

/// One network mirror for a channel.
#[derive(Clone, Debug)]
pub struct Peer {
    pub name: String,
    pub public_key: PublicKey,
    urls: Vec<Url>,
    has_hidden_service: bool,
}

impl Peer {
    pub fn new(name: impl Into<String>, public_key: PublicKey, urls: Vec<Url>) -> Self {
        let has_hidden_service = urls.iter().any(is_hidden_service);
        Self {
            name: name.into(),
            public_key,
            urls,
            has_hidden_service,
        }
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn has_hidden_service(&self) -> bool {
        self.has_hidden_service
    }

    /// The peer's URLs with `suffix` appended, in the order they should be
    /// tried.
    ///
    /// With `prefer_hidden_service`, onion URLs come first. Within each
    /// partition the order is randomised from the OS CSPRNG, spreading load
    /// across mirrors without handing observers a predictable probe order.
    pub fn candidate_urls(&self, suffix: &str, prefer_hidden_service: bool) -> Vec<Url> {
        let mut onion = Vec::new();
        let mut clearnet = Vec::new();
        for base in &self.urls {
            if let Some(url) = join_suffix(base, suffix) {
                if is_hidden_service(&url) {
                    onion.push(url)
                } else {
                    clearnet.push(url)
                }
            }
        }

        if prefer_hidden_service {
            onion.shuffle(&mut OsRng);
            clearnet.shuffle(&mut OsRng);
            onion.extend(clearnet);
            onion
        } else {
            onion.extend(clearnet);
            onion.shuffle(&mut OsRng);
            onion
        }
    }
}

fn is_hidden_service(url: &Url) -> bool {
    url.host_str()
        .map(|host| host.ends_with(ONION_TLD))
        .unwrap_or(false)
}

fn join_suffix(base: &Url, suffix: &str) -> Option<Url> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        segments.extend(suffix.split('/'));
    }
    Some(url)
}

/// A batch of update events as served by a peer, signed by the channel key.
///
/// The signature covers the exact bytes of `payload`, which keeps the
/// signature input canonical without canonicalising JSON.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedBatch {
    pub payload: String,
    pub signature: Signature,
}

impl SignedBatch {
    /// Publisher-side helper: wrap `events` and sign with the channel key.
    pub fn sign(events: &[RawEvent], key: &SecretKey) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(events)?;
        let signature = key.sign(payload.as_bytes());
        Ok(Self { payload, signature })
    }
}

pub mod error {
    use super::*;

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Envelope {
        #[error(transparent)]
        Json(#[from] serde_json::Error),

        #[error("batch signature does not verify under the channel key")]
        BadSignature,
    }

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Fetch {
        #[error("all peers of channel `{channel}` failed")]
        AllPeersFailed { channel: String },
    }
}

/// A named trust root, reachable through one or more peers.
#[derive(Clone, Debug)]
pub struct Channel {
    pub name: String,
    pub public_key: PublicKey,
    pub peers: Vec<Peer>,
}

impl Channel {
    /// Fetch the update events starting at sequence number `since`.
    ///
    /// Candidate URLs of each peer are tried in order until one yields a
    /// well-formed, channel-key-signed batch. A timed-out or misbehaving
    /// peer is just a failed peer; only the exhaustion of all peers fails
    /// the channel.
    #[tracing::instrument(skip(self, fetcher), fields(channel = %self.name))]
    pub async fn fetch_updates<F>(
        &self,
        fetcher: &F,
        since: u64,
        prefer_hidden_service: bool,
        timeout: Duration,
    ) -> Result<Vec<RawEvent>, error::Fetch>
    where
        F: Fetch + ?Sized,
    {
        let suffix = format!("updates/{}", since);
        for peer in &self.peers {
            for url in peer.candidate_urls(&suffix, prefer_hidden_service) {
                let body = match tokio::time::timeout(timeout, fetcher.get(&url)).await {
                    Err(_) => Err(fetch::Error::Timeout),
                    Ok(result) => result,
                };
                let body = match body {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::debug!(peer = %peer.name, %url, error = %e, "peer failed");
                        continue;
                    },
                };
                match self.open_batch(&body) {
                    Ok(events) => {
                        tracing::debug!(peer = %peer.name, events = events.len(), "batch accepted");
                        return Ok(events);
                    },
                    Err(e) => {
                        tracing::warn!(peer = %peer.name, error = %e, "discarding response");
                        continue;
                    },
                }
            }
        }
        Err(error::Fetch::AllPeersFailed {
            channel: self.name.clone(),
        })
    }

    /// Check the channel signature on a response body and unwrap the events.
    fn open_batch(&self, body: &[u8]) -> Result<Vec<RawEvent>, error::Envelope> {
        let batch: SignedBatch = serde_json::from_slice(body)?;
        if !batch.signature.verify(batch.payload.as_bytes(), &self.public_key) {
            return Err(error::Envelope::BadSignature);
        }
        Ok(serde_json::from_str(&batch.payload)?)
    }
}
