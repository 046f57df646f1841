// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! Channel configuration, read once at startup and never mutated here.

use std::{fs, io, path::Path};

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use updraft_crypto::PublicKey;

use crate::channel::{Channel, Peer};

#[derive(Clone, Debug, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    /// Hex or base64 encoded Ed25519 public key.
    pub public_key: String,
    pub urls: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// Hex or base64 encoded Ed25519 public key.
    pub public_key: String,
    pub peers: Vec<PeerConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hidden_service_only: bool,
    pub channels: Vec<ChannelConfig>,
}

pub mod error {
    use super::*;

    #[derive(Debug, Error)]
    #[non_exhaustive]
    pub enum Config {
        #[error(transparent)]
        Io(#[from] io::Error),

        #[error(transparent)]
        Json(#[from] serde_json::Error),

        #[error("invalid public key for `{owner}`")]
        Key { owner: String },

        #[error("invalid url `{url}` for peer `{peer}`")]
        Url {
            peer: String,
            url: String,
            #[source]
            source: url::ParseError,
        },
    }
}

impl Config {
    pub fn from_reader(reader: impl io::Read) -> Result<Self, error::Config> {
        Ok(serde_json::from_reader(io::BufReader::new(reader))?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, error::Config> {
        Self::from_reader(fs::File::open(path)?)
    }

    /// Validate the configuration into channel values.
    pub fn channels(&self) -> Result<Vec<Channel>, error::Config> {
        self.channels
            .iter()
            .map(|channel| {
                let public_key = parse_key(&channel.public_key).ok_or(error::Config::Key {
                    owner: channel.name.clone(),
                })?;
                let peers = channel
                    .peers
                    .iter()
                    .map(|peer| {
                        let key = parse_key(&peer.public_key).ok_or(error::Config::Key {
                            owner: peer.name.clone(),
                        })?;
                        let urls = peer
                            .urls
                            .iter()
                            .map(|url| {
                                Url::parse(url).map_err(|source| error::Config::Url {
                                    peer: peer.name.clone(),
                                    url: url.clone(),
                                    source,
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?;
                        Ok(Peer::new(peer.name.clone(), key, urls))
                    })
                    .collect::<Result<Vec<_>, error::Config>>()?;
                Ok(Channel {
                    name: channel.name.clone(),
                    public_key,
                    peers,
                })
            })
            .collect()
    }
}

fn parse_key(s: &str) -> Option<PublicKey> {
    PublicKey::from_hex(s)
        .ok()
        .or_else(|| base64::decode(s).ok().and_then(|b| PublicKey::from_slice(&b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use updraft_crypto::{SecretKey, Seed};

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_seed(&Seed::from_slice(&[seed; 32]).unwrap())
    }

    fn config_json(channel_key: &str, peer_key: &str) -> String {
        format!(
            r#"{{
                "hidden_service_only": true,
                "channels": [
                    {{
                        "name": "stable",
                        "public_key": "{}",
                        "peers": [
                            {{
                                "name": "mirror-a",
                                "public_key": "{}",
                                "urls": ["https://mirror.example/pub", "http://expyuzz4wqqyqhjn.onion/pub"]
                            }}
                        ]
                    }}
                ]
            }}"#,
            channel_key, peer_key
        )
    }

    #[test]
    fn test_hex_keys_parse() {
        let raw = config_json(
            &hex::encode(key(1).public().as_ref()),
            &hex::encode(key(2).public().as_ref()),
        );
        let config = Config::from_reader(raw.as_bytes()).unwrap();
        assert!(config.hidden_service_only);
        let channels = config.channels().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "stable");
        assert_eq!(channels[0].public_key, key(1).public());
        assert!(channels[0].peers[0].has_hidden_service());
    }

    #[test]
    fn test_base64_keys_parse() {
        let raw = config_json(
            &base64::encode(key(1).public().as_ref()),
            &base64::encode(key(2).public().as_ref()),
        );
        let channels = Config::from_reader(raw.as_bytes()).unwrap().channels().unwrap();
        assert_eq!(channels[0].public_key, key(1).public());
        assert_eq!(channels[0].peers[0].public_key, key(2).public());
    }

    #[test]
    fn test_garbage_key_is_rejected() {
        let raw = config_json("certainly-not-a-key", "also-not-a-key");
        let config = Config::from_reader(raw.as_bytes()).unwrap();
        assert!(matches!(
            config.channels(),
            Err(error::Config::Key { .. })
        ));
    }

    #[test]
    fn test_bad_url_is_rejected() {
        let raw = format!(
            r#"{{
                "channels": [
                    {{
                        "name": "stable",
                        "public_key": "{}",
                        "peers": [
                            {{ "name": "broken", "public_key": "{}", "urls": ["::not a url::"] }}
                        ]
                    }}
                ]
            }}"#,
            hex::encode(key(1).public().as_ref()),
            hex::encode(key(2).public().as_ref()),
        );
        let config = Config::from_reader(raw.as_bytes()).unwrap();
        assert!(matches!(config.channels(), Err(error::Config::Url { .. })));
    }
}
