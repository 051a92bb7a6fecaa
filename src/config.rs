// Shoal - Centralized-directory peer-to-peer file sharing over a length-prefixed JSON protocol
// Copyright (C) 2021  rumblefrog

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::env::var;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::ShoalResult;

/// Directory server configuration, loaded from the TOML file named by
/// `SHOAL_SERVER_CONFIG` (default `server.toml`). A missing file yields the
/// defaults.
#[derive(Deserialize, Debug)]
pub struct ServerConfig {
    #[serde(rename(deserialize = "General"), default)]
    pub general: ServerGeneral,
}

#[derive(Deserialize, Debug)]
pub struct ServerGeneral {
    /// Socket address the control listener binds.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Path of the persistent file index.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

/// Peer node configuration, loaded from the TOML file named by
/// `SHOAL_PEER_CONFIG` (default `peer.toml`).
#[derive(Deserialize, Debug)]
pub struct PeerConfig {
    #[serde(rename(deserialize = "General"), default)]
    pub general: PeerGeneral,
}

#[derive(Deserialize, Debug)]
pub struct PeerGeneral {
    /// Socket address of the directory server.
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Path of the auto-identity counter file.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Overrides the auto-assigned data-listener port.
    #[serde(default)]
    pub p2p_port: Option<u16>,

    /// Overrides the auto-assigned client name.
    #[serde(default)]
    pub client_name: Option<String>,
}

impl ServerConfig {
    pub fn load() -> ShoalResult<Self> {
        read_config(&var("SHOAL_SERVER_CONFIG").unwrap_or_else(|_| "server.toml".into()))
    }
}

impl PeerConfig {
    pub fn load() -> ShoalResult<Self> {
        read_config(&var("SHOAL_PEER_CONFIG").unwrap_or_else(|_| "peer.toml".into()))
    }
}

fn read_config<T: for<'de> Deserialize<'de> + Default>(path: &str) -> ShoalResult<T> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(toml::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Config file {} not found, using defaults", path);
            Ok(T::default())
        }
        Err(e) => Err(e.into()),
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            general: ServerGeneral::default(),
        }
    }
}

impl Default for ServerGeneral {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_path: default_database_path(),
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            general: PeerGeneral::default(),
        }
    }
}

impl Default for PeerGeneral {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            state_file: default_state_file(),
            p2p_port: None,
            client_name: None,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:9999".into()
}

fn default_database_path() -> PathBuf {
    "shoal_index.db".into()
}

fn default_server_address() -> String {
    "127.0.0.1:9999".into()
}

fn default_state_file() -> PathBuf {
    "peer_launch_state.json".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_parses_with_overrides() {
        let config: ServerConfig = toml::from_slice(
            br#"
            [General]
            bind_address = "127.0.0.1:8888"
            database_path = "/var/lib/shoal/index.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.general.bind_address, "127.0.0.1:8888");
        assert_eq!(
            config.general.database_path,
            PathBuf::from("/var/lib/shoal/index.db"),
        );
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: PeerConfig = toml::from_slice(b"").unwrap();
        assert_eq!(config.general.server_address, "127.0.0.1:9999");
        assert_eq!(config.general.p2p_port, None);

        let config: ServerConfig = toml::from_slice(b"[General]\n").unwrap();
        assert_eq!(config.general.bind_address, "0.0.0.0:9999");
    }
}
