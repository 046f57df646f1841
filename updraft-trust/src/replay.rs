// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Sequence-ordered application of channel events to the supplier key store.
//!
//! Events are applied in strictly increasing, contiguous id order. A gap
//! means the log is incomplete: nothing past the gap is applied, ever —
//! skipping ahead would silently drop key revocations.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::{
    event::{Admitted, Change, KeyChange, Payload, ReleaseDescriptor, UpdateRecord},
    store::{self, Store},
    supplier::{KeyRecord, Supplier},
};

/// An update event as handed over by a channel, not yet parsed.
pub type RawEvent = serde_json::Value;

/// A core or package update observed during replay, waiting for the
/// orchestrator to fetch and verify its artifact.
#[derive(Clone, Debug)]
pub struct PendingUpdate {
    pub channel: String,
    pub channel_id: u64,
    pub content_root: String,
    pub supplier: String,
    pub descriptor: ReleaseDescriptor,
}

/// A hole in the event sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Gap {
    pub expected: u64,
    pub found: u64,
}

/// What one replay pass did.
#[derive(Debug)]
pub struct Outcome {
    /// Highest contiguous id processed; the next fetch starts after it.
    pub last_applied: u64,
    /// Key-management events that mutated the store.
    pub applied: usize,
    /// Malformed or trust-rejected events, discarded without halting.
    pub discarded: usize,
    /// Core/package updates queued for the orchestrator.
    pub pending: Vec<PendingUpdate>,
    /// Set when the batch did not line up with the cursor, or had a hole.
    pub gap: Option<Gap>,
}

pub mod error {
    use super::*;

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Replay {
        #[error(transparent)]
        Commit(#[from] store::error::Commit),
    }
}

/// Replays the update log of one channel.
pub struct Replayer {
    channel: String,
    last_applied: u64,
}

enum Slot {
    Record(Box<UpdateRecord>),
    Malformed,
}

impl Replayer {
    pub fn new(channel: impl Into<String>, last_applied: u64) -> Self {
        Self {
            channel: channel.into(),
            last_applied,
        }
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    /// Apply one fetched batch.
    ///
    /// Key mutations commit transactionally: a persistence failure rolls the
    /// whole batch back (and the cursor with it). Malformed events and
    /// trust-rejected events are discarded individually, fail closed, and do
    /// not abort the rest of the batch.
    #[tracing::instrument(skip(self, store, events), fields(channel = %self.channel))]
    pub fn replay(&mut self, store: &Store, events: Vec<RawEvent>) -> Result<Outcome, error::Replay> {
        let mut with_ids: Vec<(u64, RawEvent)> = Vec::with_capacity(events.len());
        let mut discarded = 0;
        for event in events {
            match event.get("id").and_then(serde_json::Value::as_u64) {
                Some(id) => with_ids.push((id, event)),
                None => {
                    tracing::warn!("discarding event without sequence id");
                    discarded += 1;
                },
            }
        }
        with_ids.sort_by_key(|(id, _)| *id);

        // Walk the contiguous prefix starting at the cursor.
        let mut slots: Vec<Slot> = Vec::new();
        let mut gap = None;
        let mut next = self.last_applied + 1;
        for (id, event) in with_ids {
            if id < next {
                tracing::debug!(id, "ignoring stale or duplicate event");
                continue;
            }
            if id > next {
                gap = Some(Gap {
                    expected: next,
                    found: id,
                });
                tracing::warn!(expected = next, found = id, "sequence gap, not applying past it");
                break;
            }
            match UpdateRecord::from_raw(&event) {
                Ok(record) => slots.push(Slot::Record(Box::new(record))),
                Err(e) => {
                    tracing::warn!(id, error = %e, "discarding malformed update");
                    slots.push(Slot::Malformed);
                },
            }
            next += 1;
        }

        let suppliers: BTreeSet<String> = slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Record(record) => match record.payload {
                    Payload::KeyChange(_) => Some(record.supplier.clone()),
                    Payload::Release(_) => None,
                },
                Slot::Malformed => None,
            })
            .collect();

        let channel = self.channel.clone();
        let (applied, discarded, pending) = store.apply_batch(suppliers, move |txn| {
            let mut applied = 0;
            let mut discarded = discarded;
            let mut pending = Vec::new();
            for slot in slots {
                let record = match slot {
                    Slot::Record(record) => record,
                    Slot::Malformed => {
                        discarded += 1;
                        continue;
                    },
                };
                match record.payload {
                    Payload::KeyChange(ref change) => {
                        if apply_key_change(txn, &record.supplier, change) {
                            applied += 1;
                        } else {
                            discarded += 1;
                        }
                    },
                    Payload::Release(descriptor) => pending.push(PendingUpdate {
                        channel: channel.clone(),
                        channel_id: record.channel_id,
                        content_root: record.content_root,
                        supplier: record.supplier,
                        descriptor,
                    }),
                }
            }
            (applied, discarded, pending)
        })?;

        self.last_applied = next - 1;

        Ok(Outcome {
            last_applied: self.last_applied,
            applied,
            discarded,
            pending,
            gap,
        })
    }
}

/// Returns `false` if the change was rejected (and discarded).
fn apply_key_change(txn: &mut store::Txn, supplier: &str, change: &KeyChange) -> bool {
    let admitted = change.verify(supplier, txn.get(supplier));
    match admitted {
        Err(e) => {
            tracing::warn!(supplier, error = %e, "rejecting key change");
            false
        },
        Ok(Admitted::Bootstrap) => {
            tracing::info!(
                supplier,
                key = %change.public_key,
                "trust-on-first-use: bootstrapping new supplier with master key"
            );
            txn.create(Supplier::bootstrap(supplier, change.public_key));
            true
        },
        Ok(Admitted::Chained(provenance)) => {
            let existing = match txn.get_mut(supplier) {
                Some(existing) => existing,
                // verify only admits a chain for a known supplier
                None => return false,
            };
            let result = match change.change {
                Change::Insert => existing
                    .insert(KeyRecord {
                        key_type: change.key_type,
                        public_key: change.public_key,
                        authorized_by: Some(provenance),
                    })
                    .map_err(|e| e.to_string()),
                Change::Revoke => existing
                    .revoke(&change.public_key)
                    .map(|_| ())
                    .map_err(|e| e.to_string()),
            };
            match result {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(supplier, error = %e, "rejecting key change");
                    false
                },
            }
        },
    }
}
