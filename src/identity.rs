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

//! Auto-assigned peer identities for the node launcher.
//!
//! A persisted counter hands out one slot per launch: slot `N` maps to
//! `p2p_port = 1111 + 1111·(N-1)` and a base-26 spreadsheet-column name
//! (1 → "a", 26 → "z", 27 → "aa").

use std::convert::TryFrom;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ShoalError, ShoalResult};

const AUTO_PORT_START: u32 = 1111;
const AUTO_PORT_STEP: u32 = 1111;

#[derive(Debug, Serialize, Deserialize)]
struct LaunchState {
    next_index: u32,
}

/// Identity handed out for one peer launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub index: u32,
    pub p2p_port: u16,
    pub client_name: String,
}

/// Hands out launch identities from a persisted counter file.
pub struct IdentityAllocator {
    state_path: PathBuf,
}

impl IdentityAllocator {
    pub fn new<P: Into<PathBuf>>(state_path: P) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    /// Claims the next slot and advances the counter on disk.
    pub fn next(&self) -> ShoalResult<Identity> {
        let index = self.load_next_index();
        self.store_next_index(index + 1)?;

        let identity = Identity {
            index,
            p2p_port: index_to_port(index)?,
            client_name: index_to_name(index),
        };

        info!(
            "Auto-selected client slot #{} -> port={}, name={}",
            identity.index, identity.p2p_port, identity.client_name,
        );

        Ok(identity)
    }

    /// Removes the persisted counter so the sequence starts over.
    pub fn reset(&self) -> ShoalResult<()> {
        match std::fs::remove_file(&self.state_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_next_index(&self) -> u32 {
        let bytes = match std::fs::read(&self.state_path) {
            Ok(bytes) => bytes,
            Err(_) => return 1,
        };

        match serde_json::from_slice::<LaunchState>(&bytes) {
            Ok(state) if state.next_index >= 1 => state.next_index,
            _ => {
                warn!(
                    "State file {} is corrupt, resetting auto-increment sequence",
                    self.state_path.display(),
                );
                1
            }
        }
    }

    /// Writes through a temp file and renames it into place so a crash never
    /// leaves a half-written counter behind.
    fn store_next_index(&self, next_index: u32) -> ShoalResult<()> {
        let payload = serde_json::to_vec_pretty(&LaunchState { next_index })?;

        let tmp_path = self.state_path.with_extension("tmp");
        std::fs::write(&tmp_path, payload)?;
        std::fs::rename(&tmp_path, &self.state_path)?;

        Ok(())
    }
}

fn index_to_port(index: u32) -> ShoalResult<u16> {
    let port = AUTO_PORT_START + AUTO_PORT_STEP * (index - 1);

    u16::try_from(port).map_err(|_| ShoalError::IdentityExhausted(index))
}

fn index_to_name(index: u32) -> String {
    let mut value = index;
    let mut chars = Vec::new();

    while value > 0 {
        let remainder = (value - 1) % 26;
        value = (value - 1) / 26;
        chars.push((b'a' + remainder as u8) as char);
    }

    chars.iter().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_maps_to_port_sequence() {
        assert_eq!(index_to_port(1).unwrap(), 1111);
        assert_eq!(index_to_port(2).unwrap(), 2222);
        assert_eq!(index_to_port(9).unwrap(), 9999);
    }

    #[test]
    fn index_past_port_range_is_rejected() {
        // 1111 + 1111 * 58 = 65549 > 65535.
        assert!(index_to_port(59).is_err());
        assert!(index_to_port(58).is_ok());
    }

    #[test]
    fn index_maps_to_spreadsheet_names() {
        assert_eq!(index_to_name(1), "a");
        assert_eq!(index_to_name(2), "b");
        assert_eq!(index_to_name(26), "z");
        assert_eq!(index_to_name(27), "aa");
        assert_eq!(index_to_name(52), "az");
        assert_eq!(index_to_name(53), "ba");
        assert_eq!(index_to_name(703), "aaa");
    }

    #[test]
    fn counter_advances_across_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IdentityAllocator::new(dir.path().join("state.json"));

        let first = allocator.next().unwrap();
        assert_eq!(first.index, 1);
        assert_eq!(first.p2p_port, 1111);
        assert_eq!(first.client_name, "a");

        let second = allocator.next().unwrap();
        assert_eq!(second.index, 2);
        assert_eq!(second.p2p_port, 2222);
        assert_eq!(second.client_name, "b");
    }

    #[test]
    fn corrupt_state_restarts_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        std::fs::write(&path, b"{ not json").unwrap();

        let allocator = IdentityAllocator::new(&path);
        assert_eq!(allocator.next().unwrap().index, 1);
        assert_eq!(allocator.next().unwrap().index, 2);
    }

    #[test]
    fn reset_forgets_the_counter() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = IdentityAllocator::new(dir.path().join("state.json"));

        allocator.next().unwrap();
        allocator.next().unwrap();
        allocator.reset().unwrap();

        assert_eq!(allocator.next().unwrap().index, 1);
    }
}
