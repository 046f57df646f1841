// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

#![warn(clippy::extra_unused_lifetimes)]
#![deny(rustdoc::broken_intra_doc_links)]

#[macro_use]
extern crate lazy_static;

mod keys;
pub use keys::{
    DecodeError,
    ParsePublicKeyError,
    PublicKey,
    SecretKey,
    Seed,
    Signature,
    PUBLICKEYBYTES,
};

mod hash;
pub use hash::{Digest, Hasher, ParseDigestError, DIGESTBYTES};
