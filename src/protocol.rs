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

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ShoalError;

/// Length prefix carried in front of every message body.
pub const HEADER_LENGTH: usize = 4;

/// Chunk size used when moving raw file bytes on a data stream.
pub const TRANSFER_CHUNK: usize = 4096;

/// Codec for the framed message layer shared by control and data streams.
///
/// Every message is a 4-byte big-endian unsigned length followed by exactly
/// that many bytes of UTF-8 JSON encoding an object. The decoder yields the
/// raw JSON object so callers can keep serving after a body they cannot
/// interpret; the typed [`Request`]/[`Reply`] layer sits on top.
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Value;
    type Error = ShoalError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ShoalError> {
        if src.len() < HEADER_LENGTH {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LENGTH];
        header.copy_from_slice(&src[..HEADER_LENGTH]);
        let body_length = u32::from_be_bytes(header) as usize;

        if src.len() < HEADER_LENGTH + body_length {
            src.reserve(HEADER_LENGTH + body_length - src.len());
            return Ok(None);
        }

        // Consume the frame before parsing so a bad body never wedges the
        // stream on the same bytes.
        src.advance(HEADER_LENGTH);
        let body = src.split_to(body_length);

        let value: Value = serde_json::from_slice(&body)?;

        if !value.is_object() {
            return Err(ShoalError::NonObjectMessage);
        }

        Ok(Some(value))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ShoalError> {
        if src.is_empty() {
            // Clean end-of-stream between frames.
            return Ok(None);
        }

        Err(ShoalError::IoError(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "stream closed mid-frame",
        )))
    }
}

impl<T: Serialize> Encoder<T> for MessageCodec {
    type Error = ShoalError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), ShoalError> {
        let body = serde_json::to_vec(&item)?;

        dst.reserve(HEADER_LENGTH + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);

        Ok(())
    }
}

/// Inbound message variants, dispatched on the `action` field.
///
/// Payload fields stay optional so that a request with a recognized action
/// but missing fields still parses; the handler owns the presence checks and
/// the wording of the resulting error reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Session handshake carrying the peer's self-reported identity.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hostname: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        p2p_port: Option<u16>,
    },

    /// Advertise a local file under a logical alias.
    Publish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lname: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        fname: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_size: Option<u64>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_modified: Option<String>,

        #[serde(default)]
        allow_overwrite: bool,
    },

    /// Ask for the peers currently advertising an alias.
    Fetch {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fname: Option<String>,
    },

    /// Ask for the alias summary across all peers.
    ListSharedFiles,

    /// Liveness probe on the control stream.
    Ping,

    /// Data-stream request for the raw bytes of a peer-local path.
    GetFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lname: Option<String>,
    },
}

impl Request {
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Reply variants on the control stream, dispatched on the `status` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_list: Option<Vec<FileEntry>>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<Vec<SharedFile>>,
    },

    Created {
        message: String,
        result: RegisterOutcome,
    },

    Updated {
        message: String,
        result: RegisterOutcome,
    },

    Unchanged {
        message: String,
    },

    Conflict {
        message: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        existing_lname: Option<String>,
    },

    Error {
        message: String,
    },
}

impl Reply {
    pub fn message<S: Into<String>>(message: S) -> Self {
        Reply::Success {
            message: Some(message.into()),
            peer_list: None,
            files: None,
        }
    }

    pub fn peer_list(peer_list: Vec<FileEntry>) -> Self {
        Reply::Success {
            message: None,
            peer_list: Some(peer_list),
            files: None,
        }
    }

    pub fn files(files: Vec<SharedFile>) -> Self {
        Reply::Success {
            message: None,
            peer_list: None,
            files: Some(files),
        }
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        Reply::Error {
            message: message.into(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Result of registering an entry in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterOutcome {
    Inserted,
    Updated,
}

/// One row of the file index, also the `peer_list` wire item.
///
/// `fname` is the logical alias, `lname` the path the serving peer opens
/// locally. `file_size` and `last_modified` are self-reported by the
/// publisher and never validated against the transferred bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub fname: String,

    pub hostname: String,

    pub ip: String,

    pub port: u16,

    pub lname: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

/// Per-alias summary used by the shared-files listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFile {
    pub fname: String,

    pub peer_count: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

mod tests {
    #[allow(unused_imports)]
    use super::*;
    #[allow(unused_imports)]
    use serde_json::json;

    #[test]
    fn roundtrip_request_frame() {
        let request = Request::Publish {
            lname: Some("/tmp/report.pdf".into()),
            fname: Some("report.pdf".into()),
            file_size: Some(1024),
            last_modified: Some("2024-11-04T00:00:00Z".into()),
            allow_overwrite: false,
        };

        let mut buf = BytesMut::new();
        MessageCodec.encode(&request, &mut buf).unwrap();

        assert_eq!(
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
            buf.len() - HEADER_LENGTH,
        );

        let value = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(Request::from_value(value).unwrap(), request);
    }

    #[test]
    fn roundtrip_reply_frame() {
        let reply = Reply::Conflict {
            message: "Alias 'report.pdf' is already published for this client.".into(),
            existing_lname: Some("/a/report.pdf".into()),
        };

        let mut buf = BytesMut::new();
        MessageCodec.encode(&reply, &mut buf).unwrap();

        let value = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(value["status"], "conflict");
        assert_eq!(Reply::from_value(value).unwrap(), reply);
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut full = BytesMut::new();
        MessageCodec.encode(json!({"action": "ping"}), &mut full).unwrap();

        // Header alone, then header plus a partial body.
        let mut partial = BytesMut::from(&full[..HEADER_LENGTH]);
        assert!(MessageCodec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(MessageCodec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn decode_eof_between_frames_is_clean() {
        let mut buf = BytesMut::new();
        assert!(MessageCodec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_eof_mid_frame_is_error() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, b'{'][..]);
        assert!(MessageCodec.decode_eof(&mut buf).is_err());
    }

    #[test]
    fn decode_rejects_non_object_body() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(json!(["not", "an", "object"]), &mut buf).unwrap();

        match MessageCodec.decode(&mut buf) {
            Err(ShoalError::NonObjectMessage) => (),
            other => panic!("expected NonObjectMessage, got {:?}", other.map(|_| ())),
        }
        // The offending frame is consumed; the stream stays usable.
        assert!(buf.is_empty());
    }

    #[test]
    fn bad_frame_does_not_poison_stream() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(json!("nope"), &mut buf).unwrap();
        MessageCodec.encode(json!({"action": "ping"}), &mut buf).unwrap();

        assert!(MessageCodec.decode(&mut buf).is_err());
        let value = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Request::from_value(value).unwrap(), Request::Ping);
    }

    #[test]
    fn parse_hello_with_missing_fields() {
        let value = json!({"action": "hello", "hostname": "alpha"});
        match Request::from_value(value).unwrap() {
            Request::Hello { hostname, p2p_port } => {
                assert_eq!(hostname.as_deref(), Some("alpha"));
                assert_eq!(p2p_port, None);
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn parse_unknown_action_fails() {
        assert!(Request::from_value(json!({"action": "frobnicate"})).is_err());
        assert!(Request::from_value(json!({"no_action": true})).is_err());
    }

    #[test]
    fn allow_overwrite_defaults_to_false() {
        let value = json!({"action": "publish", "lname": "/a", "fname": "a"});
        match Request::from_value(value).unwrap() {
            Request::Publish { allow_overwrite, .. } => assert!(!allow_overwrite),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn success_reply_omits_empty_fields() {
        let encoded = serde_json::to_value(&Reply::message("pong")).unwrap();
        assert_eq!(encoded, json!({"status": "success", "message": "pong"}));
    }
}
