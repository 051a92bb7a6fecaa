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

use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use futures::sink::SinkExt;

use crate::error::{ShoalError, ShoalResult};
use crate::protocol::{FileEntry, MessageCodec, Reply, Request, SharedFile};

use super::transfer;

/// Cadence of liveness pings on the control stream.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on joining the data listener during disconnect.
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const ACCEPT_BACKLOG: u32 = 64;

/// One connected peer instance.
///
/// Owns the control stream to the directory server, the data listener
/// serving other peers, and the heartbeat task watching server liveness.
/// Created by a successful [`PeerNode::connect`]; a node that loses its
/// server never reconnects itself, it flags `needs_reconnect` and lets the
/// controller dial again with the same identity.
pub struct PeerNode {
    /// Name this node introduced itself with.
    hostname: String,

    /// Port the data listener actually bound (relevant when configured as 0).
    p2p_port: u16,

    /// Control stream to the directory server.
    ///
    /// Every send and its paired receive run under this lock, so replies
    /// strictly alternate with requests; the heartbeat shares the lock with
    /// user operations.
    control: Mutex<Framed<TcpStream, MessageCodec>>,

    /// Cleared once the control stream is known dead.
    connected: AtomicBool,

    /// Node stop flag observed by the data listener and the heartbeat.
    stop: watch::Sender<bool>,

    /// Data listener task, joined (with a bound) on disconnect.
    listener: StdMutex<Option<JoinHandle<()>>>,

    /// Raised by the heartbeat on failure; owned by the controller.
    needs_reconnect: Arc<AtomicBool>,
}

impl PeerNode {
    /// Starts the data listener, performs the hello handshake and spawns the
    /// heartbeat. On any failure the listener is stopped before the error
    /// propagates.
    pub async fn connect(
        server_address: &str,
        p2p_port: u16,
        hostname: String,
        needs_reconnect: Arc<AtomicBool>,
    ) -> ShoalResult<Arc<Self>> {
        let (stop, stop_rx) = watch::channel(false);

        let listener = bind_data_listener(p2p_port)?;
        let bound_port = listener.local_addr()?.port();
        info!("Data listener started on port {}", bound_port);

        let listener_task = tokio::spawn(transfer::serve(listener, stop_rx));

        let handshake = Self::handshake(server_address, &hostname, bound_port).await;

        let control = match handshake {
            Ok(control) => control,
            Err(e) => {
                let _ = stop.send(true);
                let _ = timeout(LISTENER_JOIN_TIMEOUT, listener_task).await;
                return Err(e);
            }
        };

        let node = Arc::new(Self {
            hostname,
            p2p_port: bound_port,
            control: Mutex::new(control),
            connected: AtomicBool::new(true),
            stop,
            listener: StdMutex::new(Some(listener_task)),
            needs_reconnect,
        });

        node.spawn_heartbeat();

        Ok(node)
    }

    async fn handshake(
        server_address: &str,
        hostname: &str,
        p2p_port: u16,
    ) -> ShoalResult<Framed<TcpStream, MessageCodec>> {
        info!("Connecting to server at {}...", server_address);
        let stream = TcpStream::connect(server_address).await?;

        let mut control = Framed::new(stream, MessageCodec);

        control
            .send(&Request::Hello {
                hostname: Some(hostname.to_string()),
                p2p_port: Some(p2p_port),
            })
            .await?;

        let value = control
            .next()
            .await
            .ok_or(ShoalError::ConnectionClosed)??;

        match Reply::from_value(value)? {
            Reply::Success { message, .. } => {
                info!(
                    "Received response from server: {}",
                    message.unwrap_or_default(),
                );
                Ok(control)
            }
            Reply::Error { message } => Err(ShoalError::ServerError(message)),
            other => Err(ShoalError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// One request, one reply, under the control-socket lock.
    async fn request(&self, request: &Request) -> ShoalResult<Reply> {
        if !self.is_connected() {
            return Err(ShoalError::NotConnected);
        }

        let mut control = self.control.lock().await;

        control.send(request).await?;

        let value = control
            .next()
            .await
            .ok_or(ShoalError::ConnectionClosed)??;

        Ok(Reply::from_value(value)?)
    }

    /// Advertises a local file under an alias.
    ///
    /// The alias is coerced to carry the source file's extension, and the
    /// self-reported metadata (byte length, mtime as ISO-8601 UTC) rides
    /// along. The server's verdict comes back as-is so the caller can react
    /// to a conflict.
    pub async fn publish(
        &self,
        local_path: &Path,
        alias: &str,
        allow_overwrite: bool,
    ) -> ShoalResult<Reply> {
        let metadata = fs::metadata(local_path)
            .await
            .map_err(|_| ShoalError::MissingLocalFile(local_path.to_path_buf()))?;

        let last_modified = metadata.modified().ok().map(|mtime| {
            DateTime::<Utc>::from(mtime).to_rfc3339_opts(SecondsFormat::Secs, true)
        });

        let request = Request::Publish {
            lname: Some(local_path.to_string_lossy().into_owned()),
            fname: Some(alias_with_source_extension(alias, local_path)),
            file_size: Some(metadata.len()),
            last_modified,
            allow_overwrite,
        };

        self.request(&request).await
    }

    /// Peers currently advertising the alias.
    pub async fn fetch_peer_list(&self, fname: &str) -> ShoalResult<Vec<FileEntry>> {
        let request = Request::Fetch {
            fname: Some(fname.to_string()),
        };

        match self.request(&request).await? {
            Reply::Success {
                peer_list: Some(peer_list),
                ..
            } => Ok(peer_list),
            Reply::Success { .. } => Err(ShoalError::UnexpectedReply(
                "fetch reply is missing peer_list".into(),
            )),
            Reply::Error { message } => Err(ShoalError::ServerError(message)),
            other => Err(ShoalError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Alias summary across all peers.
    pub async fn list_shared_files(&self) -> ShoalResult<Vec<SharedFile>> {
        match self.request(&Request::ListSharedFiles).await? {
            Reply::Success {
                files: Some(files), ..
            } => Ok(files),
            Reply::Success { .. } => Err(ShoalError::UnexpectedReply(
                "shared files reply is missing files".into(),
            )),
            Reply::Error { message } => Err(ShoalError::ServerError(message)),
            other => Err(ShoalError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    /// Stops the node: flags the listener and heartbeat down, closes the
    /// control socket and joins the listener with a bounded wait.
    pub async fn disconnect(&self) {
        self.teardown().await;

        let handle = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(handle) = handle {
            if timeout(LISTENER_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Data listener did not stop within {:?}", LISTENER_JOIN_TIMEOUT);
            }
        }
    }

    async fn teardown(&self) {
        self.connected.store(false, Ordering::SeqCst);

        // Also stops the data listener, freeing the port for the next
        // connect with the same identity.
        let _ = self.stop.send(true);

        let mut control = self.control.lock().await;
        if let Err(e) = control.get_mut().shutdown().await {
            debug!("Control socket shutdown: {}", e);
        }
    }

    fn spawn_heartbeat(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            debug!("Heartbeat task started");

            loop {
                select! {
                    _ = stop.changed() => break,
                    _ = sleep(HEARTBEAT_INTERVAL) => {}
                }

                match node.request(&Request::Ping).await {
                    Ok(_) => debug!("Heartbeat ping successful"),
                    Err(e) => {
                        if *stop.borrow() {
                            // The failure came from a deliberate disconnect.
                            break;
                        }

                        warn!(
                            "Heartbeat failed: {}. Server is down, triggering auto-reconnect",
                            e,
                        );

                        node.needs_reconnect.store(true, Ordering::SeqCst);
                        node.teardown().await;
                        break;
                    }
                }
            }

            debug!("Heartbeat task stopped");
        });
    }
}

fn bind_data_listener(port: u16) -> ShoalResult<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    Ok(socket.listen(ACCEPT_BACKLOG)?)
}

/// Replaces the alias extension with the published file's, if it has one.
fn alias_with_source_extension(alias: &str, local_path: &Path) -> String {
    match local_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let stem = Path::new(alias)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(alias);
            format!("{}.{}", stem, ext)
        }
        None => alias.to_string(),
    }
}
