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

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShoalError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("Message body is not a JSON object")]
    NonObjectMessage,

    #[error("Metadata store error {0}")]
    StoreError(#[from] rusqlite::Error),

    #[error("Config error {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Timed out: {0}")]
    TimedOut(#[from] tokio::time::error::Elapsed),

    #[error("Connection closed by remote")]
    ConnectionClosed,

    #[error("Server replied with an error: {0}")]
    ServerError(String),

    #[error("Unexpected reply from server: {0}")]
    UnexpectedReply(String),

    #[error("Client already connected")]
    AlreadyConnected,

    #[error("Client is not connected")]
    NotConnected,

    #[error("Local file {0} does not exist")]
    MissingLocalFile(PathBuf),

    #[error("Auto-identity counter {0} maps outside the TCP port range")]
    IdentityExhausted(u32),
}

impl ShoalError {
    /// Whether the failure left the stream usable.
    ///
    /// The codec consumes a frame before parsing it, so a body that fails to
    /// parse does not poison the connection; the session may answer with an
    /// error reply and keep reading. Transport failures never qualify.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ShoalError::MalformedMessage(_) | ShoalError::NonObjectMessage
        )
    }
}

pub type ShoalResult<T> = std::result::Result<T, ShoalError>;
