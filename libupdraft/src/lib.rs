// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The secure-update pipeline: channels publish signed update events through
//! redundant peers; replaying those events maintains per-supplier trusted
//! keys; downloaded artifacts are installed only after content-hash and
//! detached-signature verification against that key state.
//!
//! Transport is injected through [`fetch::Fetch`]; transport security is
//! never a substitute for artifact authenticity.

#![warn(clippy::extra_unused_lifetimes)]
#![deny(rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate async_trait;
#[macro_use]
extern crate lazy_static;

pub extern crate updraft_crypto as crypto;
pub extern crate updraft_trust as trust;

pub mod artifact;
pub mod channel;
pub mod config;
pub mod fetch;
pub mod install;
pub mod orchestrator;

pub use artifact::{Artifact, AuthenticArtifact, Verdict};
pub use channel::{Channel, Peer};
pub use config::Config;
pub use fetch::{Fetch, FileFetcher};
pub use install::{Install, SomeInstaller};
pub use orchestrator::{Orchestrator, Report};
