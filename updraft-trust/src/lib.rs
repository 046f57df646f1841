// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Supplier trust state and the verifiable update log.
//!
//! Suppliers publish key-management events through channels; replaying those
//! events in sequence order is the only way the per-supplier set of trusted
//! keys may change. Core and package updates observed during replay are
//! queued for the update orchestrator, which authenticates the downloaded
//! artifacts against the key state maintained here.

#![warn(clippy::extra_unused_lifetimes)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod event;
pub mod replay;
pub mod store;
pub mod supplier;

pub use event::{Action, Kind, ReleaseDescriptor, UpdateRecord};
pub use replay::{PendingUpdate, Replayer};
pub use store::Store;
pub use supplier::{KeyRecord, KeyType, Provenance, Supplier};
