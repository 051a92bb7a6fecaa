// Shoal - Centralized-directory peer-to-peer file sharing over a length-prefixed JSON protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Centralized-directory peer-to-peer file sharing.
//!
//! A [`server::Directory`] tracks which peers advertise which logical files;
//! [`peer::PeerNode`]s publish files, fetch peer lists and transfer the
//! bytes directly between each other over transient data streams. The
//! directory never touches file data.

#[macro_use]
extern crate log;

pub mod config;
pub mod error;
pub mod identity;
pub mod peer;
pub mod protocol;
pub mod server;
pub mod store;

pub use error::{ShoalError, ShoalResult};
