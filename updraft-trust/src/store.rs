// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The supplier key store: the only durable shared mutable state of the
//! pipeline.
//!
//! Reads hand out clones of the last committed state. Mutations go through
//! [`Store::apply_batch`], which serialises writers per supplier name and
//! commits a batch either wholly or not at all.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io,
    path::PathBuf,
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::{event::is_valid_name, supplier::Supplier};

pub mod error {
    use super::*;

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Persist {
        #[error(transparent)]
        Io(#[from] io::Error),

        #[error(transparent)]
        Json(#[from] serde_json::Error),

        #[error("supplier name `{0}` is not a valid file name")]
        InvalidName(String),
    }

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Commit {
        #[error("failed to persist supplier `{name}`")]
        Persist {
            name: String,
            #[source]
            source: Persist,
        },
    }
}

/// Where supplier records live between runs.
///
/// One record per supplier, JSON-equivalent. The store reads everything at
/// open and writes a record back only after a batch of key-management events
/// fully validates.
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<Vec<Supplier>, error::Persist>;
    fn save(&self, supplier: &Supplier) -> Result<(), error::Persist>;
}

/// One `<name>.json` document per supplier under a root directory.
///
/// Writes go to a temporary file in the same directory, renamed into place.
pub struct FsPersistence {
    root: PathBuf,
}

impl FsPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, error::Persist> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }
}

impl Persistence for FsPersistence {
    fn load(&self) -> Result<Vec<Supplier>, error::Persist> {
        let mut suppliers = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                let file = fs::File::open(&path)?;
                suppliers.push(serde_json::from_reader(io::BufReader::new(file))?);
            }
        }
        Ok(suppliers)
    }

    fn save(&self, supplier: &Supplier) -> Result<(), error::Persist> {
        if !is_valid_name(&supplier.name) {
            return Err(error::Persist::InvalidName(supplier.name.clone()));
        }
        let tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer_pretty(&tmp, supplier)?;
        tmp.persist(self.root.join(format!("{}.json", supplier.name)))
            .map_err(|e| error::Persist::Io(e.error))?;
        Ok(())
    }
}

/// Working view of the suppliers touched by one batch.
///
/// Only the names the batch was opened with are visible; everything else
/// reads as unknown. Mutations stay private to the view until the batch
/// commits.
pub struct Txn {
    working: BTreeMap<String, Supplier>,
    dirty: BTreeSet<String>,
}

impl Txn {
    pub fn get(&self, name: &str) -> Option<&Supplier> {
        self.working.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Supplier> {
        match self.working.get_mut(name) {
            Some(supplier) => {
                self.dirty.insert(name.to_string());
                Some(supplier)
            },
            None => None,
        }
    }

    /// Admit a new supplier into the view (first-contact bootstrap).
    pub fn create(&mut self, supplier: Supplier) {
        self.dirty.insert(supplier.name.clone());
        self.working.insert(supplier.name.clone(), supplier);
    }
}

pub struct Store {
    persistence: Box<dyn Persistence>,
    inner: RwLock<BTreeMap<String, Supplier>>,
    write_locks: Mutex<BTreeMap<String, Arc<Mutex<()>>>>,
}

impl Store {
    /// Open the store, reading all persisted supplier records.
    pub fn open<P>(persistence: P) -> Result<Self, error::Persist>
    where
        P: Persistence + 'static,
    {
        let suppliers = persistence
            .load()?
            .into_iter()
            .map(|supplier| (supplier.name.clone(), supplier))
            .collect();
        Ok(Self {
            persistence: Box::new(persistence),
            inner: RwLock::new(suppliers),
            write_locks: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    /// Clone of the last committed state of `name`, for the verifier.
    pub fn snapshot(&self, name: &str) -> Option<Supplier> {
        self.inner.read().get(name).cloned()
    }

    fn write_lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` over a working copy of the named suppliers and commit the
    /// result.
    ///
    /// Writers are serialised per supplier name: the batch holds the
    /// exclusive lock of every named supplier for the in-memory apply and the
    /// commit, and nothing else. `f` must not block on I/O.
    ///
    /// Dirty suppliers are persisted first and only then swapped into the
    /// in-memory map, so a persistence failure leaves the store at the last
    /// fully-committed state.
    pub fn apply_batch<T, F>(&self, names: BTreeSet<String>, f: F) -> Result<T, error::Commit>
    where
        F: FnOnce(&mut Txn) -> T,
    {
        // BTreeSet iteration is sorted, which makes multi-supplier lock
        // acquisition deadlock-free across concurrent batches.
        let mutexes: Vec<Arc<Mutex<()>>> = names
            .iter()
            .map(|name| self.write_lock_for(name))
            .collect();
        let _guards: Vec<_> = mutexes.iter().map(|mutex| mutex.lock()).collect();

        let working = {
            let inner = self.inner.read();
            names
                .iter()
                .filter_map(|name| inner.get(name).map(|s| (name.clone(), s.clone())))
                .collect()
        };
        let mut txn = Txn {
            working,
            dirty: BTreeSet::new(),
        };

        let out = f(&mut txn);

        for name in &txn.dirty {
            if let Some(supplier) = txn.working.get(name) {
                self.persistence
                    .save(supplier)
                    .map_err(|source| error::Commit::Persist {
                        name: name.clone(),
                        source,
                    })?;
            }
        }

        let mut inner = self.inner.write();
        for name in &txn.dirty {
            if let Some(supplier) = txn.working.get(name) {
                inner.insert(name.clone(), supplier.clone());
            }
        }

        Ok(out)
    }
}
