// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Downloaded artifacts and their verification.
//!
//! Authenticity is a value, not an exception: [`verify`] yields a
//! [`Verdict`], and the only way to obtain an [`AuthenticArtifact`] — the
//! only thing installers accept — is a verdict of [`Verdict::Authentic`].
//! Verification consults nothing but the supplier snapshot it is handed; in
//! particular, transport security (TLS, Tor) never stands in for a detached
//! signature.

use std::{
    fmt,
    fs,
    io::Write as _,
    path::Path,
    time::Duration,
};

use tempfile::NamedTempFile;
use thiserror::Error;
use url::Url;

use updraft_crypto::{Digest, Hasher};
use updraft_trust::{event::ReleaseDescriptor, replay::PendingUpdate, supplier::Supplier};

use crate::fetch::{self, Fetch};

const HASH_CHUNK: usize = 64 * 1024;

/// A downloaded file plus the metadata needed to authenticate it.
///
/// Ephemeral: constructed per fetch cycle, consumed exactly once by
/// [`verify`], and the backing temp file is removed on drop unless an
/// installer published it.
#[derive(Debug)]
pub struct Artifact {
    pub file: NamedTempFile,
    pub declared_size: u64,
    pub actual_hash: Digest,
    pub version: String,
    pub content_root: String,
    pub supplier: String,
    pub descriptor: ReleaseDescriptor,
}

impl Artifact {
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub mod error {
    use super::*;

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Fetch {
        #[error("invalid artifact url `{url}`")]
        Url {
            url: String,
            #[source]
            source: url::ParseError,
        },

        #[error(transparent)]
        Transport(#[from] fetch::Error),

        #[error("transfer was {actual} bytes, release descriptor declares {declared}")]
        SizeMismatch { declared: u64, actual: u64 },

        #[error(transparent)]
        Io(#[from] std::io::Error),
    }

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Verify {
        #[error(transparent)]
        Io(#[from] std::io::Error),
    }
}

/// Download the artifact a pending update describes into `scratch`.
///
/// The content hash is computed incrementally while the bytes are written
/// out; nothing ever exists at an installable path before verification.
#[tracing::instrument(skip(fetcher, pending, scratch), fields(name = %pending.descriptor.name, version = %pending.descriptor.version))]
pub async fn fetch_artifact<F>(
    fetcher: &F,
    pending: &PendingUpdate,
    scratch: &Path,
    timeout: Duration,
) -> Result<Artifact, error::Fetch>
where
    F: Fetch + ?Sized,
{
    let descriptor = &pending.descriptor;
    let url = Url::parse(&descriptor.url).map_err(|source| error::Fetch::Url {
        url: descriptor.url.clone(),
        source,
    })?;

    let body = match tokio::time::timeout(timeout, fetcher.get(&url)).await {
        Err(_) => return Err(fetch::Error::Timeout.into()),
        Ok(result) => result?,
    };

    let declared_size = body.len() as u64;
    if declared_size != descriptor.size {
        return Err(error::Fetch::SizeMismatch {
            declared: descriptor.size,
            actual: declared_size,
        });
    }

    let mut hasher = Hasher::new();
    let mut file = NamedTempFile::new_in(scratch)?;
    for chunk in body.chunks(HASH_CHUNK) {
        hasher.update(chunk);
        file.write_all(chunk)?;
    }
    file.flush()?;

    Ok(Artifact {
        file,
        declared_size,
        actual_hash: hasher.finish(),
        version: descriptor.version.clone(),
        content_root: pending.content_root.clone(),
        supplier: pending.supplier.clone(),
        descriptor: descriptor.clone(),
    })
}

/// Why an artifact was found inauthentic.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum Reason {
    #[error("content hash does not match the release descriptor")]
    HashMismatch,

    #[error("no currently trusted signing key validates the detached signature")]
    NoValidSignature,
}

/// An artifact that passed verification.
///
/// There is no way to construct one outside this module: holding a value of
/// this type *is* the proof that [`verify`] returned authentic.
pub struct AuthenticArtifact {
    artifact: Artifact,
}

impl AuthenticArtifact {
    pub fn path(&self) -> &Path {
        self.artifact.path()
    }

    pub fn descriptor(&self) -> &ReleaseDescriptor {
        &self.artifact.descriptor
    }

    pub fn supplier(&self) -> &str {
        &self.artifact.supplier
    }

    pub fn content_root(&self) -> &str {
        &self.artifact.content_root
    }
}

impl fmt::Debug for AuthenticArtifact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AuthenticArtifact")
            .field("name", &self.artifact.descriptor.name)
            .field("version", &self.artifact.version)
            .finish()
    }
}

/// The verifier's answer.
#[derive(Debug)]
pub enum Verdict {
    Authentic(AuthenticArtifact),
    Inauthentic(Reason),
}

/// Decide authenticity of `artifact` against a supplier snapshot.
///
/// Pure over its inputs: content hash equality first, then the detached
/// signature is tried against every currently trusted signing key of the
/// supplier, short-circuiting on the first match. An unknown supplier has no
/// trusted signing keys, so it falls out as [`Reason::NoValidSignature`].
pub fn verify(
    artifact: Artifact,
    supplier: Option<&Supplier>,
) -> Result<Verdict, error::Verify> {
    match evaluate(&artifact, supplier)? {
        None => Ok(Verdict::Authentic(AuthenticArtifact { artifact })),
        Some(reason) => {
            tracing::warn!(
                name = %artifact.descriptor.name,
                version = %artifact.version,
                supplier = %artifact.supplier,
                %reason,
                "artifact failed verification"
            );
            Ok(Verdict::Inauthentic(reason))
        },
    }
}

fn evaluate(artifact: &Artifact, supplier: Option<&Supplier>) -> Result<Option<Reason>, error::Verify> {
    if artifact.actual_hash != artifact.descriptor.digest {
        return Ok(Some(Reason::HashMismatch));
    }

    let supplier = match supplier {
        Some(supplier) => supplier,
        None => return Ok(Some(Reason::NoValidSignature)),
    };

    let bytes = fs::read(artifact.path())?;
    let authentic = supplier
        .signing_keys()
        .any(|key| artifact.descriptor.signature.verify(&bytes, key));

    Ok(if authentic {
        None
    } else {
        Some(Reason::NoValidSignature)
    })
}
