// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Installers for the closed set of installable kinds.
//!
//! [`Install::install`] only accepts an [`AuthenticArtifact`], which nothing
//! but the verifier can construct; there is no runtime "was it checked?"
//! flag to forget. Installs stage, hook, and then publish atomically — a
//! crash mid-install leaves the previous version live.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use thiserror::Error;

use updraft_trust::event::{is_valid_name, Kind};

use crate::artifact::AuthenticArtifact;

pub mod hook;

const STAGING_DIR: &str = ".staging";
const CACHE_DIR: &str = "cache";
const REGISTRY_FILE: &str = "versions.json";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("another install for `{identity}` is in flight")]
    Busy { identity: String },

    #[error("artifact is a {actual}, this installer handles {expected}")]
    KindMismatch { expected: Kind, actual: Kind },

    #[error("package name `{0}` is not installable")]
    PackageName(String),

    #[error("archive entry `{path}` escapes the staging directory")]
    UnsafePath { path: PathBuf },

    #[error(transparent)]
    Hook(#[from] hook::Error),

    #[error("failed to update the version registry")]
    Registry(#[source] serde_json::Error),

    #[error("failed to publish `{identity}`")]
    Publish {
        identity: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What an installer reports back on success.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Installed {
    pub kind: Kind,
    pub name: String,
    pub version: String,
}

/// The capability surface of an installer.
pub trait Install {
    fn install(&self, artifact: AuthenticArtifact) -> Result<Installed, Error>;
    fn clear_cache(&self) -> Result<(), Error>;
}

// At-most-one concurrent install per installable identity, across all
// installer values in the process.
lazy_static! {
    static ref INSTALL_LOCKS: Mutex<BTreeMap<String, Arc<Mutex<()>>>> =
        Mutex::new(BTreeMap::new());
}

fn install_lock_for(identity: &str) -> Arc<Mutex<()>> {
    INSTALL_LOCKS
        .lock()
        .entry(identity.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// Shared mechanics of all installer variants: a kind, and the filesystem
/// root the installer may write under.
#[derive(Clone, Debug)]
struct Site {
    kind: Kind,
    root: PathBuf,
}

fn kind_dir(kind: Kind) -> &'static str {
    match kind {
        Kind::Core => "core",
        Kind::Extension => "extensions",
        Kind::Plugin => "plugins",
        Kind::Theme => "themes",
    }
}

impl Site {
    fn new(kind: Kind, root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            root: root.into(),
        }
    }

    fn live_path(&self, name: &str) -> PathBuf {
        self.root.join(kind_dir(self.kind)).join(name)
    }

    fn cache_path(&self) -> PathBuf {
        self.root.join(CACHE_DIR).join(kind_dir(self.kind))
    }

    #[tracing::instrument(skip(self, artifact), fields(kind = %self.kind, name = %artifact.descriptor().name))]
    fn install(&self, artifact: AuthenticArtifact) -> Result<Installed, Error> {
        let descriptor = artifact.descriptor();
        if descriptor.kind != self.kind {
            return Err(Error::KindMismatch {
                expected: self.kind,
                actual: descriptor.kind,
            });
        }
        let name = descriptor.name.clone();
        let version = descriptor.version.clone();
        if !is_valid_name(&name) {
            return Err(Error::PackageName(name));
        }

        let live = self.live_path(&name);
        let identity = live.to_string_lossy().into_owned();
        let lock = install_lock_for(&identity);
        let _guard = lock.try_lock().ok_or(Error::Busy {
            identity: identity.clone(),
        })?;

        // stage under the same root so the final publish is a rename, never
        // a copy across filesystems
        let staging_parent = self.root.join(STAGING_DIR);
        fs::create_dir_all(&staging_parent)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}-", name))
            .tempdir_in(&staging_parent)?;

        extract(artifact.path(), staging.path())?;

        let steps = hook::run(staging.path())?;
        if steps > 0 {
            tracing::debug!(steps, "migration hook completed");
        }

        self.register_version(&name, &version)?;
        self.invalidate_cache(&name)?;
        self.publish(staging, &live, &identity)?;

        tracing::info!(version = %version, "published");
        Ok(Installed {
            kind: self.kind,
            name,
            version,
        })
    }

    fn register_version(&self, name: &str, version: &str) -> Result<(), Error> {
        let path = self.root.join(REGISTRY_FILE);
        let mut registry: BTreeMap<String, String> = match fs::File::open(&path) {
            Ok(file) => {
                serde_json::from_reader(io::BufReader::new(file)).map_err(Error::Registry)?
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        registry.insert(format!("{}/{}", kind_dir(self.kind), name), version.to_string());

        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer_pretty(&tmp, &registry).map_err(Error::Registry)?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    fn invalidate_cache(&self, name: &str) -> Result<(), Error> {
        match fs::remove_dir_all(self.cache_path().join(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Swap the staged tree into place. The previous version is moved aside
    /// first and restored if the swap fails.
    fn publish(
        &self,
        staging: tempfile::TempDir,
        live: &Path,
        identity: &str,
    ) -> Result<(), Error> {
        let publish_err = |source: io::Error| Error::Publish {
            identity: identity.to_string(),
            source,
        };

        if let Some(parent) = live.parent() {
            fs::create_dir_all(parent).map_err(publish_err)?;
        }

        let retired = staging.path().with_extension("retired");
        let had_previous = live.exists();
        if had_previous {
            fs::rename(live, &retired).map_err(publish_err)?;
        }

        let staged = staging.into_path();
        if let Err(e) = fs::rename(&staged, live) {
            // put the previous version back before reporting
            if had_previous {
                let _ = fs::rename(&retired, live);
            }
            let _ = fs::remove_dir_all(&staged);
            return Err(publish_err(e));
        }

        if had_previous {
            if let Err(e) = fs::remove_dir_all(&retired) {
                tracing::debug!(error = %e, "could not remove retired version");
            }
        }
        Ok(())
    }
}

fn extract(archive: &Path, dest: &Path) -> Result<(), Error> {
    let file = fs::File::open(archive)?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(io::BufReader::new(file)));
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let unsafe_component = path.components().any(|component| {
            !matches!(component, Component::Normal(_) | Component::CurDir)
        });
        if unsafe_component || !entry.unpack_in(dest)? {
            return Err(Error::UnsafePath { path });
        }
    }
    Ok(())
}

macro_rules! installer {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug)]
        pub struct $name(Site);

        impl $name {
            pub fn new(root: impl Into<PathBuf>) -> Self {
                Self(Site::new($kind, root))
            }
        }

        impl Install for $name {
            fn install(&self, artifact: AuthenticArtifact) -> Result<Installed, Error> {
                self.0.install(artifact)
            }

            fn clear_cache(&self) -> Result<(), Error> {
                match fs::remove_dir_all(self.0.cache_path()) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    };
}

installer! {
    /// Installs extension packages under `<root>/extensions`.
    Extensions, Kind::Extension
}
installer! {
    /// Installs plugin packages under `<root>/plugins`.
    Plugins, Kind::Plugin
}
installer! {
    /// Installs theme packages under `<root>/themes`.
    Themes, Kind::Theme
}
installer! {
    /// Applies core updates under `<root>/core`, through the same staging
    /// pipeline as the package kinds.
    CoreTree, Kind::Core
}

/// "Existentialised" installers: the set of kinds is small and stable, so a
/// closed enum beats an open installer hierarchy.
#[derive(Clone, Debug)]
pub enum SomeInstaller {
    Core(CoreTree),
    Extensions(Extensions),
    Plugins(Plugins),
    Themes(Themes),
}

impl SomeInstaller {
    pub fn for_kind(kind: Kind, root: impl Into<PathBuf>) -> Self {
        match kind {
            Kind::Core => Self::Core(CoreTree::new(root)),
            Kind::Extension => Self::Extensions(Extensions::new(root)),
            Kind::Plugin => Self::Plugins(Plugins::new(root)),
            Kind::Theme => Self::Themes(Themes::new(root)),
        }
    }
}

impl Install for SomeInstaller {
    fn install(&self, artifact: AuthenticArtifact) -> Result<Installed, Error> {
        match self {
            Self::Core(installer) => installer.install(artifact),
            Self::Extensions(installer) => installer.install(artifact),
            Self::Plugins(installer) => installer.install(artifact),
            Self::Themes(installer) => installer.install(artifact),
        }
    }

    fn clear_cache(&self) -> Result<(), Error> {
        match self {
            Self::Core(installer) => installer.clear_cache(),
            Self::Extensions(installer) => installer.clear_cache(),
            Self::Plugins(installer) => installer.clear_cache(),
            Self::Themes(installer) => installer.clear_cache(),
        }
    }
}
