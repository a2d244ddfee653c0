// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Loads the same `key=value` grammar the control plane's uapi accepts (see
//! [`crate::device::api`]) from a file or a string built from CLI flags, so
//! a device can be brought up non-interactively instead of only through a
//! live `set=1` transaction.
//!
//! Reuses the control plane's own field parsers (`KeyBytes`, `AllowedIP`)
//! rather than duplicating them, and surfaces malformed input as a typed
//! error instead of panicking.

use std::io::BufRead;
use std::net::SocketAddr;

use thiserror::Error as ThisError;

use crate::device::AllowedIP;
use crate::serialization::KeyBytes;
use crate::x25519;

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("i/o error reading configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),
    #[error("malformed line (expected key=value): {0}")]
    MalformedLine(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("{0} is only valid inside a peer block (after public_key)")]
    NoCurrentPeer(String),
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    }
}

/// The device-level fields of a loaded configuration.
#[derive(Clone, Default)]
pub struct DeviceConfig {
    pub private_key: Option<x25519::StaticSecret>,
    pub listen_port: u16,
    pub fwmark: Option<u32>,
}

/// One peer block, equivalent to a `public_key=...` section on the uapi
/// control stream.
#[derive(Clone)]
pub struct PeerConfig {
    pub public_key: x25519::PublicKey,
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive_interval: Option<u16>,
    pub allowed_ips: Vec<AllowedIP>,
}

impl PeerConfig {
    fn new(public_key: x25519::PublicKey) -> Self {
        PeerConfig {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive_interval: None,
            allowed_ips: Vec::new(),
        }
    }
}

/// A fully parsed configuration: one device identity plus zero or more
/// peers, ready to seed a freshly created [`crate::device::Device`] through
/// `set_key` and `update_peer` at process start.
#[derive(Clone, Default)]
pub struct Config {
    pub device: DeviceConfig,
    pub peers: Vec<PeerConfig>,
}

impl Config {
    /// Parses the `key=value`, blank-line-separated grammar from any
    /// buffered source: a file opened by the caller, or a `Cursor` built
    /// from command-line flags joined with newlines. Unlike the live
    /// control plane, a blank line here is just a separator between peer
    /// blocks rather than a transaction commit — the whole source is parsed
    /// before anything is returned, so a malformed line anywhere discards
    /// the entire attempt rather than applying a partial configuration.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Config, ConfigError> {
        let mut config = Config::default();
        let mut current_peer: Option<PeerConfig> = None;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.splitn(2, '=');
            let (key, value) = match (parts.next(), parts.next()) {
                (Some(key), Some(value)) => (key.trim(), value.trim()),
                _ => return Err(ConfigError::MalformedLine(line.to_owned())),
            };

            match key {
                "private_key" => {
                    let key_bytes = value.parse::<KeyBytes>().map_err(|_| invalid(key, value))?;
                    config.device.private_key = Some(x25519::StaticSecret::from(key_bytes.0));
                }
                "listen_port" => {
                    config.device.listen_port = value.parse().map_err(|_| invalid(key, value))?;
                }
                "fwmark" => {
                    config.device.fwmark = Some(value.parse().map_err(|_| invalid(key, value))?);
                }
                "public_key" => {
                    if let Some(peer) = current_peer.take() {
                        config.peers.push(peer);
                    }
                    let key_bytes = value.parse::<KeyBytes>().map_err(|_| invalid(key, value))?;
                    current_peer = Some(PeerConfig::new(x25519::PublicKey::from(key_bytes.0)));
                }
                "preshared_key" => {
                    let peer = current_peer
                        .as_mut()
                        .ok_or_else(|| ConfigError::NoCurrentPeer(key.to_owned()))?;
                    let key_bytes = value.parse::<KeyBytes>().map_err(|_| invalid(key, value))?;
                    peer.preshared_key = Some(key_bytes.0);
                }
                "endpoint" => {
                    let peer = current_peer
                        .as_mut()
                        .ok_or_else(|| ConfigError::NoCurrentPeer(key.to_owned()))?;
                    peer.endpoint = Some(value.parse().map_err(|_| invalid(key, value))?);
                }
                "persistent_keepalive_interval" => {
                    let peer = current_peer
                        .as_mut()
                        .ok_or_else(|| ConfigError::NoCurrentPeer(key.to_owned()))?;
                    peer.persistent_keepalive_interval =
                        Some(value.parse().map_err(|_| invalid(key, value))?);
                }
                "allowed_ip" => {
                    let peer = current_peer
                        .as_mut()
                        .ok_or_else(|| ConfigError::NoCurrentPeer(key.to_owned()))?;
                    peer.allowed_ips
                        .push(value.parse::<AllowedIP>().map_err(|_| invalid(key, value))?);
                }
                // Meaningful only to the live control plane's incremental
                // transactions (§6); a configuration loaded fresh has
                // nothing queued to replace or remove.
                "replace_peers" | "replace_allowed_ips" | "remove" | "protocol_version" => {}
                _ => return Err(ConfigError::UnknownKey(key.to_owned())),
            }
        }

        if let Some(peer) = current_peer.take() {
            config.peers.push(peer);
        }

        Ok(config)
    }

    /// Parses from an in-memory string, e.g. one assembled from CLI flags.
    pub fn parse_str(s: &str) -> Result<Config, ConfigError> {
        Config::from_reader(std::io::Cursor::new(s.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const KEY_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    const KEY_C: &str = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

    #[test]
    fn parses_device_and_single_peer() {
        let text = format!(
            "private_key={}\nlisten_port=51820\npublic_key={}\nallowed_ip=1.0.0.2/32\nendpoint=127.0.0.1:51821\n",
            KEY_A, KEY_B
        );
        let config = Config::parse_str(&text).unwrap();

        assert!(config.device.private_key.is_some());
        assert_eq!(config.device.listen_port, 51820);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.peers[0].allowed_ips.len(), 1);
        assert_eq!(config.peers[0].allowed_ips[0].cidr, 32);
        assert_eq!(
            config.peers[0].endpoint,
            Some("127.0.0.1:51821".parse().unwrap())
        );
    }

    #[test]
    fn parses_multiple_peer_blocks() {
        let text = format!(
            "public_key={}\nallowed_ip=10.0.0.1/32\npublic_key={}\nallowed_ip=10.0.0.2/32\npersistent_keepalive_interval=25\n",
            KEY_B, KEY_C
        );
        let config = Config::parse_str(&text).unwrap();

        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers[1].persistent_keepalive_interval, Some(25));
    }

    #[test]
    fn rejects_unknown_key() {
        let err = Config::parse_str("bogus=1\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "bogus"));
    }

    #[test]
    fn rejects_malformed_line() {
        let err = Config::parse_str("not-a-key-value-pair\n").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedLine(_)));
    }

    #[test]
    fn rejects_peer_field_before_any_public_key() {
        let err = Config::parse_str("allowed_ip=10.0.0.1/32\n").unwrap_err();
        assert!(matches!(err, ConfigError::NoCurrentPeer(k) if k == "allowed_ip"));
    }

    #[test]
    fn ignores_control_plane_only_keys() {
        let text = format!("replace_peers=true\npublic_key={}\nremove=false\n", KEY_B);
        let config = Config::parse_str(&text).unwrap();
        assert_eq!(config.peers.len(), 1);
    }
}
