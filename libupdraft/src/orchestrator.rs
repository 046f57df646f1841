// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The auto-update cycle.
//!
//! One run: fetch every configured channel (concurrently — this phase is
//! network-bound), replay each channel's events into the supplier key store,
//! then drain the pending updates single-threaded: fetch the artifact,
//! verify it against the current key state, and hand it to the installer of
//! its kind. The outcome of everything is a [`Report`] value; nothing is
//! printed here.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::PathBuf,
    time::Duration,
};

use thiserror::Error;

use updraft_trust::{
    event::Kind,
    replay::{PendingUpdate, Replayer},
    store::Store,
};

use crate::{
    artifact,
    channel::Channel,
    config::{self, Config},
    fetch::Fetch,
    install::{Install as _, SomeInstaller},
};

const CURSOR_FILE: &str = "cursors.json";
const SCRATCH_DIR: &str = "scratch";

/// Per-run orchestrator configuration.
#[derive(Clone, Debug)]
pub struct Options {
    pub hidden_service_only: bool,
    pub fetch_timeout: Duration,
    /// Root the installers may write under.
    pub install_root: PathBuf,
    /// Where replay cursors and download scratch space live.
    pub state_dir: PathBuf,
}

pub mod error {
    use super::*;

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Orchestrate {
        #[error(transparent)]
        Io(#[from] io::Error),

        #[error(transparent)]
        Json(#[from] serde_json::Error),

        #[error(transparent)]
        Config(#[from] config::error::Config),
    }
}

/// How one channel fared this run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelOutcome {
    Applied {
        events: usize,
        discarded: usize,
    },
    SequenceGap {
        expected: u64,
        found: u64,
        applied: usize,
    },
    TransportFailed {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct ChannelReport {
    pub channel: String,
    pub outcome: ChannelOutcome,
}

/// How one pending update fared this run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    Applied,
    Skipped { reason: String },
    Failed { reason: String },
}

#[derive(Clone, Debug)]
pub struct UpdateReport {
    pub supplier: String,
    pub kind: Kind,
    pub name: String,
    pub version: String,
    pub outcome: UpdateOutcome,
}

/// Structured result of one orchestrator run, surfaced to the caller (a
/// scheduler or CLI).
#[derive(Clone, Debug, Default)]
pub struct Report {
    pub channels: Vec<ChannelReport>,
    pub updates: Vec<UpdateReport>,
}

pub struct Orchestrator<F> {
    channels: Vec<Channel>,
    store: Store,
    fetcher: F,
    options: Options,
    cursors: BTreeMap<String, u64>,
}

impl<F> Orchestrator<F>
where
    F: Fetch,
{
    pub fn new(
        channels: Vec<Channel>,
        store: Store,
        fetcher: F,
        options: Options,
    ) -> Result<Self, error::Orchestrate> {
        fs::create_dir_all(&options.state_dir)?;
        let cursors = load_cursors(&options.state_dir)?;
        Ok(Self {
            channels,
            store,
            fetcher,
            options,
            cursors,
        })
    }

    /// Build the orchestrator straight from channel configuration. The
    /// configuration decides whether hidden-service mirrors are preferred.
    pub fn from_config(
        config: &Config,
        store: Store,
        fetcher: F,
        mut options: Options,
    ) -> Result<Self, error::Orchestrate> {
        let channels = config.channels()?;
        options.hidden_service_only = config.hidden_service_only;
        Self::new(channels, store, fetcher, options)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Drive one full cycle.
    #[tracing::instrument(skip(self))]
    pub async fn run(&mut self) -> Result<Report, error::Orchestrate> {
        let mut report = Report::default();

        // network-bound: all channels fetch concurrently
        let fetches = self.channels.iter().map(|channel| {
            let since = self.cursors.get(&channel.name).copied().unwrap_or(0) + 1;
            let fetcher = &self.fetcher;
            let hidden = self.options.hidden_service_only;
            let timeout = self.options.fetch_timeout;
            async move {
                let fetched = channel
                    .fetch_updates(fetcher, since, hidden, timeout)
                    .await;
                (channel.name.clone(), fetched)
            }
        });
        let fetched = futures::future::join_all(fetches).await;

        // store-bound: replay sequentially, one channel at a time
        let mut pending: Vec<PendingUpdate> = Vec::new();
        for (channel, fetched) in fetched {
            let events = match fetched {
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "channel fetch failed");
                    report.channels.push(ChannelReport {
                        channel,
                        outcome: ChannelOutcome::TransportFailed {
                            reason: e.to_string(),
                        },
                    });
                    continue;
                },
                Ok(events) => events,
            };

            let cursor = self.cursors.get(&channel).copied().unwrap_or(0);
            let mut replayer = Replayer::new(channel.clone(), cursor);
            let outcome = match replayer.replay(&self.store, events) {
                Err(e) => {
                    tracing::warn!(%channel, error = %e, "replay failed");
                    report.channels.push(ChannelReport {
                        channel,
                        outcome: ChannelOutcome::Failed {
                            reason: e.to_string(),
                        },
                    });
                    continue;
                },
                Ok(outcome) => outcome,
            };

            self.cursors.insert(channel.clone(), outcome.last_applied);
            pending.extend(outcome.pending);
            report.channels.push(ChannelReport {
                channel,
                outcome: match outcome.gap {
                    Some(gap) => ChannelOutcome::SequenceGap {
                        expected: gap.expected,
                        found: gap.found,
                        applied: outcome.applied,
                    },
                    None => ChannelOutcome::Applied {
                        events: outcome.applied,
                        discarded: outcome.discarded,
                    },
                },
            });
        }

        save_cursors(&self.options.state_dir, &self.cursors)?;

        // drain the queue single-threaded; installs for one identity never
        // overlap
        let scratch = self.options.state_dir.join(SCRATCH_DIR);
        fs::create_dir_all(&scratch)?;
        for update in pending {
            let outcome = self.process_update(&update, &scratch).await;
            report.updates.push(UpdateReport {
                supplier: update.supplier,
                kind: update.descriptor.kind,
                name: update.descriptor.name,
                version: update.descriptor.version,
                outcome,
            });
        }

        Ok(report)
    }

    async fn process_update(
        &self,
        update: &PendingUpdate,
        scratch: &std::path::Path,
    ) -> UpdateOutcome {
        let fetched = artifact::fetch_artifact(
            &self.fetcher,
            update,
            scratch,
            self.options.fetch_timeout,
        )
        .await;
        let downloaded = match fetched {
            Err(e) => {
                return UpdateOutcome::Failed {
                    reason: e.to_string(),
                }
            },
            Ok(downloaded) => downloaded,
        };

        let snapshot = self.store.snapshot(&update.supplier);
        match artifact::verify(downloaded, snapshot.as_ref()) {
            Err(e) => UpdateOutcome::Failed {
                reason: e.to_string(),
            },
            // inauthentic updates are dropped for good: an operator has to
            // work out why a signature failed before anything is retried
            Ok(artifact::Verdict::Inauthentic(reason)) => UpdateOutcome::Skipped {
                reason: reason.to_string(),
            },
            Ok(artifact::Verdict::Authentic(authentic)) => {
                let installer =
                    SomeInstaller::for_kind(update.descriptor.kind, &self.options.install_root);
                match installer.install(authentic) {
                    Ok(installed) => {
                        tracing::info!(
                            kind = %installed.kind,
                            name = %installed.name,
                            version = %installed.version,
                            "update applied"
                        );
                        UpdateOutcome::Applied
                    },
                    Err(e) => UpdateOutcome::Failed {
                        reason: e.to_string(),
                    },
                }
            },
        }
    }
}

fn load_cursors(state_dir: &std::path::Path) -> Result<BTreeMap<String, u64>, error::Orchestrate> {
    match fs::File::open(state_dir.join(CURSOR_FILE)) {
        Ok(file) => Ok(serde_json::from_reader(io::BufReader::new(file))?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

fn save_cursors(
    state_dir: &std::path::Path,
    cursors: &BTreeMap<String, u64>,
) -> Result<(), error::Orchestrate> {
    let tmp = tempfile::NamedTempFile::new_in(state_dir)?;
    serde_json::to_writer_pretty(&tmp, cursors)?;
    tmp.persist(state_dir.join(CURSOR_FILE))
        .map_err(|e| error::Orchestrate::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use serde_json::json;
    use url::Url;

    use updraft_crypto::{Digest, PublicKey, SecretKey, Seed, Signature};
    use updraft_trust::{
        event::{Action, Change, Envelope, KeyChange, Stored},
        replay::RawEvent,
        store::FsPersistence,
        supplier::KeyType,
    };

    use crate::{
        channel::{Peer, SignedBatch},
        fetch::FileFetcher,
    };

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_seed(&Seed::from_slice(&[seed; 32]).unwrap())
    }

    fn bootstrap_event(id: u64, supplier: &str, master: &PublicKey) -> RawEvent {
        serde_json::to_value(Envelope {
            id,
            root: format!("root-{}", id),
            stored: Stored {
                action: Action::InsertKey,
                supplier: supplier.into(),
                key_type: Some(KeyType::Master),
                date_generated: 1_638_316_800,
            },
            data: None,
            new_key: Some(*master),
            master_key: None,
            master_signature: None,
        })
        .unwrap()
    }

    fn delegate_event(
        id: u64,
        supplier: &str,
        signing: &PublicKey,
        master: &SecretKey,
    ) -> RawEvent {
        let change = KeyChange {
            change: Change::Insert,
            key_type: KeyType::Signing,
            public_key: *signing,
            master: None,
            date_generated: 1_638_316_800,
        };
        let signature: Signature = master.sign(&change.canonical_message(supplier));
        serde_json::to_value(Envelope {
            id,
            root: format!("root-{}", id),
            stored: Stored {
                action: Action::InsertKey,
                supplier: supplier.into(),
                key_type: Some(KeyType::Signing),
                date_generated: 1_638_316_800,
            },
            data: None,
            new_key: Some(*signing),
            master_key: Some(master.public()),
            master_signature: Some(signature),
        })
        .unwrap()
    }

    fn tarball(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn package_event(
        id: u64,
        supplier: &str,
        mirror: &Path,
        name: &str,
        version: &str,
        bytes: &[u8],
        signer: &SecretKey,
    ) -> RawEvent {
        let artifact_path = mirror.join(format!("{}-{}.tar.gz", name, version));
        fs::write(&artifact_path, bytes).unwrap();
        let descriptor = json!({
            "kind": "extension",
            "name": name,
            "version": version,
            "size": bytes.len(),
            "digest": Digest::digest(bytes),
            "signature": signer.sign(bytes),
            "url": Url::from_file_path(&artifact_path).unwrap().to_string(),
        });
        serde_json::to_value(Envelope {
            id,
            root: format!("root-{}", id),
            stored: Stored {
                action: Action::PackageUpdate,
                supplier: supplier.into(),
                key_type: None,
                date_generated: 1_638_316_800,
            },
            data: Some(descriptor.to_string()),
            new_key: None,
            master_key: None,
            master_signature: None,
        })
        .unwrap()
    }

    fn write_batch(mirror: &Path, since: u64, events: &[RawEvent], channel_key: &SecretKey) {
        let path = mirror.join("updates").join(since.to_string());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let batch = SignedBatch::sign(events, channel_key).unwrap();
        fs::write(path, serde_json::to_vec(&batch).unwrap()).unwrap();
    }

    fn channel_over(mirror: &Path, name: &str, channel_key: &SecretKey) -> Channel {
        Channel {
            name: name.into(),
            public_key: channel_key.public(),
            peers: vec![Peer::new(
                "local-mirror",
                key(99).public(),
                vec![Url::from_directory_path(mirror).unwrap()],
            )],
        }
    }

    fn orchestrator(
        channels: Vec<Channel>,
        base: &Path,
    ) -> Orchestrator<FileFetcher> {
        let store =
            Store::open(FsPersistence::new(base.join("suppliers")).unwrap()).unwrap();
        Orchestrator::new(
            channels,
            store,
            FileFetcher,
            Options {
                hidden_service_only: false,
                fetch_timeout: Duration::from_secs(5),
                install_root: base.join("deploy"),
                state_dir: base.join("state"),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_cycle_applies_verified_update() {
        let mirror = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let channel_key = key(1);
        let master = key(2);
        let signing = key(3);

        let bytes = tarball(&[("index.php", b"<?php /* widget */")]);
        write_batch(
            mirror.path(),
            1,
            &[
                bootstrap_event(1, "acme", &master.public()),
                delegate_event(2, "acme", &signing.public(), &master),
                package_event(3, "acme", mirror.path(), "widget", "0.2.0", &bytes, &signing),
            ],
            &channel_key,
        );

        let mut orchestrator = orchestrator(
            vec![channel_over(mirror.path(), "stable", &channel_key)],
            base.path(),
        );
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.channels.len(), 1);
        assert_eq!(
            report.channels[0].outcome,
            ChannelOutcome::Applied {
                events: 2,
                discarded: 0
            }
        );
        assert_eq!(report.updates.len(), 1);
        assert_eq!(report.updates[0].outcome, UpdateOutcome::Applied);
        assert!(base
            .path()
            .join("deploy/extensions/widget/index.php")
            .exists());

        // the cursor advanced past the whole batch and survives a restart
        let cursors = load_cursors(&base.path().join("state")).unwrap();
        assert_eq!(cursors.get("stable"), Some(&3));

        write_batch(mirror.path(), 4, &[], &channel_key);
        let mut next = orchestrator(
            vec![channel_over(mirror.path(), "stable", &channel_key)],
            base.path(),
        );
        let report = next.run().await.unwrap();
        assert_eq!(
            report.channels[0].outcome,
            ChannelOutcome::Applied {
                events: 0,
                discarded: 0
            }
        );
        assert!(report.updates.is_empty());
    }

    #[tokio::test]
    async fn test_inauthentic_update_is_skipped_and_dropped() {
        let mirror = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let channel_key = key(1);
        let master = key(2);
        let rogue = key(4);

        let bytes = tarball(&[("index.php", b"<?php")]);
        write_batch(
            mirror.path(),
            1,
            &[
                bootstrap_event(1, "acme", &master.public()),
                // signed by a key the supplier never delegated to
                package_event(2, "acme", mirror.path(), "widget", "0.1.0", &bytes, &rogue),
            ],
            &channel_key,
        );

        let mut orchestrator = orchestrator(
            vec![channel_over(mirror.path(), "stable", &channel_key)],
            base.path(),
        );
        let report = orchestrator.run().await.unwrap();

        assert!(matches!(
            report.updates[0].outcome,
            UpdateOutcome::Skipped { .. }
        ));
        assert!(!base.path().join("deploy/extensions/widget").exists());

        // dropped, not retried: the cursor moved past the update anyway
        let cursors = load_cursors(&base.path().join("state")).unwrap();
        assert_eq!(cursors.get("stable"), Some(&2));
    }

    #[tokio::test]
    async fn test_sequence_gap_is_reported_and_holds_the_cursor() {
        let mirror = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let channel_key = key(1);
        let master = key(2);

        write_batch(
            mirror.path(),
            1,
            &[
                bootstrap_event(1, "acme", &master.public()),
                // id 2 missing
                bootstrap_event(3, "globex", &key(5).public()),
            ],
            &channel_key,
        );

        let mut orchestrator = orchestrator(
            vec![channel_over(mirror.path(), "stable", &channel_key)],
            base.path(),
        );
        let report = orchestrator.run().await.unwrap();

        assert_eq!(
            report.channels[0].outcome,
            ChannelOutcome::SequenceGap {
                expected: 2,
                found: 3,
                applied: 1
            }
        );
        assert!(orchestrator.store().snapshot("acme").is_some());
        assert!(orchestrator.store().snapshot("globex").is_none());

        let cursors = load_cursors(&base.path().join("state")).unwrap();
        assert_eq!(cursors.get("stable"), Some(&1));
    }

    #[tokio::test]
    async fn test_from_config_builds_channels() {
        let mirror = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let channel_key = key(1);
        write_batch(
            mirror.path(),
            1,
            &[bootstrap_event(1, "acme", &key(2).public())],
            &channel_key,
        );

        let raw = format!(
            r#"{{
                "channels": [
                    {{
                        "name": "stable",
                        "public_key": "{}",
                        "peers": [
                            {{
                                "name": "local-mirror",
                                "public_key": "{}",
                                "urls": ["{}"]
                            }}
                        ]
                    }}
                ]
            }}"#,
            hex::encode(channel_key.public().as_ref()),
            hex::encode(key(99).public().as_ref()),
            Url::from_directory_path(mirror.path()).unwrap(),
        );
        let config = Config::from_reader(raw.as_bytes()).unwrap();

        let store =
            Store::open(FsPersistence::new(base.path().join("suppliers")).unwrap()).unwrap();
        let mut orchestrator = Orchestrator::from_config(
            &config,
            store,
            FileFetcher,
            Options {
                hidden_service_only: true, // overridden by the configuration
                fetch_timeout: Duration::from_secs(5),
                install_root: base.path().join("deploy"),
                state_dir: base.path().join("state"),
            },
        )
        .unwrap();

        let report = orchestrator.run().await.unwrap();
        assert_eq!(
            report.channels[0].outcome,
            ChannelOutcome::Applied {
                events: 1,
                discarded: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_stop_the_others() {
        let mirror = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let good_key = key(1);
        let master = key(2);

        write_batch(
            mirror.path(),
            1,
            &[bootstrap_event(1, "acme", &master.public())],
            &good_key,
        );

        let dead = tempfile::tempdir().unwrap();
        let channels = vec![
            channel_over(&dead.path().join("missing"), "unreachable", &key(6)),
            channel_over(mirror.path(), "stable", &good_key),
        ];

        let mut orchestrator = orchestrator(channels, base.path());
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.channels.len(), 2);
        assert!(matches!(
            report.channels[0].outcome,
            ChannelOutcome::TransportFailed { .. }
        ));
        assert_eq!(
            report.channels[1].outcome,
            ChannelOutcome::Applied {
                events: 1,
                discarded: 0
            }
        );
        assert!(orchestrator.store().snapshot("acme").is_some());
    }
}
