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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use futures::sink::SinkExt;

use crate::config::ServerConfig;
use crate::error::ShoalResult;
use crate::protocol::{FileEntry, MessageCodec, Reply, Request};
use crate::store::Store;

const ACCEPT_BACKLOG: u32 = 64;

/// The directory server.
///
/// Tracks which peers advertise which logical files and answers peer-list
/// queries; file bytes never pass through it. One detached session worker
/// runs per accepted control connection.
pub struct Directory {
    /// TCP listener bind for the control protocol.
    listener: TcpListener,

    /// State shared between the accept loop, session workers and admin
    /// handles.
    shared: Arc<Shared>,

    /// Observes the shutdown flag so the accept loop can wind down.
    shutdown_rx: watch::Receiver<bool>,
}

/// Data structures shared between sessions and the server.
struct Shared {
    /// Persistent peer×file index.
    store: Store,

    /// Hostname to currently connected `(ip, p2p_port)` instances.
    ///
    /// Multiple simultaneous sessions of one hostname are permitted; the key
    /// is dropped once its last instance disconnects. Every read and
    /// mutation runs under this lock, and session teardown holds it across
    /// both the table removal and the index deregistration so the two are
    /// observable together.
    sessions: Mutex<HashMap<String, Vec<(String, u16)>>>,

    /// Shutdown flag; flipping it to true stops the accept loop and drains
    /// the session workers.
    shutdown: watch::Sender<bool>,
}

/// Cloneable administrative handle onto a running [`Directory`].
#[derive(Clone)]
pub struct DirectoryHandle {
    shared: Arc<Shared>,
}

impl Directory {
    /// Binds the control listener (with address reuse) and opens the store.
    pub fn bind(config: &ServerConfig) -> ShoalResult<Self> {
        let addr: SocketAddr = config.general.bind_address.parse()?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(ACCEPT_BACKLOG)?;

        let store = Store::open(&config.general.database_path)?;

        let (shutdown, shutdown_rx) = watch::channel(false);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                store,
                sessions: Mutex::new(HashMap::new()),
                shutdown,
            }),
            shutdown_rx,
        })
    }

    /// Address the control listener is bound to.
    pub fn local_addr(&self) -> ShoalResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> DirectoryHandle {
        DirectoryHandle {
            shared: self.shared.clone(),
        }
    }

    /// Runs the accept loop until shutdown; the listening socket closes when
    /// this returns.
    pub async fn up(mut self) -> ShoalResult<()> {
        info!("Directory listening on {}", self.listener.local_addr()?);

        loop {
            select! {
                _ = self.shutdown_rx.changed() => {
                    info!("Shutdown signal received, closing listener");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            debug!("Accepted control connection from {}", addr);

                            let session = Session {
                                shared: self.shared.clone(),
                                frame: Framed::new(stream, MessageCodec),
                                addr,
                                shutdown: self.shared.shutdown.subscribe(),
                            };

                            tokio::spawn(session.run());
                        }
                        Err(e) => {
                            if *self.shutdown_rx.borrow() {
                                break;
                            }
                            error!("Accept failure: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

impl DirectoryHandle {
    /// Aliases published by a hostname, across all of its sessions.
    pub fn discover(&self, hostname: &str) -> ShoalResult<Vec<String>> {
        self.shared.store.list_files_by_hostname(hostname)
    }

    /// Currently connected `(ip, p2p_port)` instances of a hostname.
    pub fn ping(&self, hostname: &str) -> Vec<(String, u16)> {
        self.shared
            .sessions_lock()
            .get(hostname)
            .cloned()
            .unwrap_or_default()
    }

    /// Every connected session as `(hostname, ip, p2p_port)`, sorted.
    pub fn list_active(&self) -> Vec<(String, String, u16)> {
        let mut active: Vec<(String, String, u16)> = self
            .shared
            .sessions_lock()
            .iter()
            .flat_map(|(hostname, instances)| {
                instances
                    .iter()
                    .map(move |(ip, port)| (hostname.clone(), ip.clone(), *port))
            })
            .collect();

        active.sort();
        active
    }

    /// Flags the server to stop. Idempotent; session workers drain on their
    /// own and run deregistration as they exit.
    pub fn shutdown(&self) {
        if !*self.shared.shutdown.borrow() {
            info!("Shutdown signal sent");
        }
        let _ = self.shared.shutdown.send(true);
    }
}

impl Shared {
    fn sessions_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<(String, u16)>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Identity of one connected session: hello-supplied hostname and data port,
/// accept-time remote address.
#[derive(Debug, Clone)]
struct SessionIdentity {
    hostname: String,
    ip: String,
    port: u16,
}

/// One control connection being served.
///
/// State machine: await hello, then answer requests one reply per request
/// until the stream closes or the server shuts down.
struct Session {
    shared: Arc<Shared>,
    frame: Framed<TcpStream, MessageCodec>,
    addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
}

/// Runs session teardown on every exit path.
///
/// Removes the session's active entry (dropping the hostname key if it was
/// the last instance) and deregisters everything the identity advertised,
/// holding the session lock across both so concurrent queries never observe
/// one effect without the other.
struct DeregisterGuard {
    shared: Arc<Shared>,
    identity: SessionIdentity,
}

impl Drop for DeregisterGuard {
    fn drop(&mut self) {
        let SessionIdentity { hostname, ip, port } = &self.identity;

        let mut sessions = self.shared.sessions_lock();

        if let Some(instances) = sessions.get_mut(hostname) {
            if let Some(pos) = instances.iter().position(|i| &i.0 == ip && i.1 == *port) {
                instances.remove(pos);
            }
            if instances.is_empty() {
                sessions.remove(hostname);
                info!("Hostname {} removed from active clients, all instances disconnected", hostname);
            }
        }

        match self.shared.store.delete_entries_for_peer(hostname, ip, *port) {
            Ok(removed) => {
                let count: u64 = removed.values().sum();
                if count > 0 {
                    info!(
                        "Deregistered {} file entries for disconnected client {} ({:?})",
                        count,
                        hostname,
                        removed.keys().collect::<Vec<_>>(),
                    );
                }
            }
            Err(e) => error!("Deregistration failed for {}: {}", hostname, e),
        }
    }
}

impl Session {
    async fn run(mut self) {
        let identity = match self.await_hello().await {
            Some(identity) => identity,
            None => return,
        };

        self.shared
            .sessions_lock()
            .entry(identity.hostname.clone())
            .or_insert_with(Vec::new)
            .push((identity.ip.clone(), identity.port));

        info!(
            "Client {} identified as {} with P2P port {}",
            self.addr, identity.hostname, identity.port,
        );

        let _guard = DeregisterGuard {
            shared: self.shared.clone(),
            identity: identity.clone(),
        };

        if let Err(e) = self.frame.send(&Reply::message("Hello from server!")).await {
            warn!("Unable to acknowledge hello from {}: {}", self.addr, e);
            return;
        }

        if let Err(e) = self.serve(&identity).await {
            warn!("Error handling client {}: {}", self.addr, e);
        }

        info!("Closed connection with {}", self.addr);
    }

    /// Receives exactly one message and requires it to be a well-formed
    /// hello. Anything else is answered with an error and ends the session.
    async fn await_hello(&mut self) -> Option<SessionIdentity> {
        let received = match self.frame.next().await {
            Some(Ok(value)) => Request::from_value(value).ok(),
            Some(Err(e)) if e.is_protocol() => None,
            Some(Err(e)) => {
                debug!("Transport error from {} before hello: {}", self.addr, e);
                return None;
            }
            None => return None,
        };

        match received {
            Some(Request::Hello {
                hostname: Some(hostname),
                p2p_port: Some(port),
            }) if !hostname.is_empty() => Some(SessionIdentity {
                hostname,
                ip: self.addr.ip().to_string(),
                port,
            }),
            _ => {
                warn!("Must receive a valid hello message from {} first", self.addr);
                let _ = self
                    .frame
                    .send(&Reply::error("Expected hello message"))
                    .await;
                None
            }
        }
    }

    /// Request loop for the READY state.
    ///
    /// Protocol failures answer with an error reply and keep the session;
    /// transport failures end it.
    async fn serve(&mut self, identity: &SessionIdentity) -> ShoalResult<()> {
        loop {
            let received = select! {
                _ = self.shutdown.changed() => break,
                received = self.frame.next() => received,
            };

            let value = match received {
                Some(Ok(value)) => value,
                Some(Err(e)) if e.is_protocol() => {
                    self.frame.send(&Reply::error(e.to_string())).await?;
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => {
                    info!("Connection closed by {}", self.addr);
                    break;
                }
            };

            if value.get("action").and_then(|a| a.as_str()) != Some("ping") {
                info!("Received message from {}: {}", self.addr, value);
            }

            let reply = self.dispatch(value, identity);
            self.frame.send(&reply).await?;
        }

        Ok(())
    }

    fn dispatch(&self, value: serde_json::Value, identity: &SessionIdentity) -> Reply {
        let request = match Request::from_value(value) {
            Ok(request) => request,
            Err(_) => return Reply::error("Invalid action"),
        };

        match request {
            Request::Publish {
                lname,
                fname,
                file_size,
                last_modified,
                allow_overwrite,
            } => self.handle_publish(identity, lname, fname, file_size, last_modified, allow_overwrite),

            Request::Fetch { fname } => self.handle_fetch(fname),

            Request::ListSharedFiles => match self.shared.store.list_all_shared() {
                Ok(files) => Reply::files(files),
                Err(e) => {
                    error!("Failed to load shared files: {}", e);
                    Reply::error("Unable to load shared files")
                }
            },

            Request::Ping => Reply::message("pong"),

            // A second hello or a data-stream action on the control stream.
            Request::Hello { .. } | Request::GetFile { .. } => Reply::error("Invalid action"),
        }
    }

    fn handle_publish(
        &self,
        identity: &SessionIdentity,
        lname: Option<String>,
        fname: Option<String>,
        file_size: Option<u64>,
        last_modified: Option<String>,
        allow_overwrite: bool,
    ) -> Reply {
        let (lname, fname) = match (non_empty(lname), non_empty(fname)) {
            (Some(lname), Some(fname)) => (lname, fname),
            _ => return Reply::error("Missing lname or fname"),
        };

        let entry = FileEntry {
            fname,
            hostname: identity.hostname.clone(),
            ip: identity.ip.clone(),
            port: identity.port,
            lname,
            file_size,
            last_modified,
        };

        let existing = match self
            .shared
            .store
            .get(&entry.fname, &entry.hostname, &entry.ip, entry.port)
        {
            Ok(existing) => existing,
            Err(e) => {
                error!("Publish lookup failed for {}: {}", entry.fname, e);
                return Reply::error(e.to_string());
            }
        };

        match existing {
            None => match self.shared.store.register(&entry) {
                Ok(result) => {
                    info!(
                        "Client {} publishing new file {}",
                        self.addr, entry.fname,
                    );
                    Reply::Created {
                        message: format!("File {} published successfully", entry.fname),
                        result,
                    }
                }
                Err(e) => {
                    error!("Publish failed for {}: {}", entry.fname, e);
                    Reply::error(e.to_string())
                }
            },

            Some(previous) => {
                let same_path = previous.lname == entry.lname;
                let unchanged = same_path
                    && previous.file_size == entry.file_size
                    && previous.last_modified == entry.last_modified;

                if unchanged {
                    info!(
                        "Client {} republished {} with unchanged metadata",
                        self.addr, entry.fname,
                    );
                    Reply::Unchanged {
                        message: format!(
                            "File {} is already up to date for this client.",
                            entry.fname,
                        ),
                    }
                } else if !same_path && !allow_overwrite {
                    info!(
                        "Client {} publish conflict on alias {} (existing path {}, new path {})",
                        self.addr, entry.fname, previous.lname, entry.lname,
                    );
                    Reply::Conflict {
                        message: format!(
                            "Alias '{}' is already published for this client.",
                            entry.fname,
                        ),
                        existing_lname: Some(previous.lname),
                    }
                } else {
                    match self.shared.store.register(&entry) {
                        Ok(result) => {
                            info!(
                                "Client {} overwrote alias {} with path {}",
                                self.addr, entry.fname, entry.lname,
                            );
                            Reply::Updated {
                                message: format!("File {} metadata updated.", entry.fname),
                                result,
                            }
                        }
                        Err(e) => {
                            error!("Publish failed for {}: {}", entry.fname, e);
                            Reply::error(e.to_string())
                        }
                    }
                }
            }
        }
    }

    fn handle_fetch(&self, fname: Option<String>) -> Reply {
        let fname = match non_empty(fname) {
            Some(fname) => fname,
            None => return Reply::error("Missing fname"),
        };

        // No liveness filter on purpose: session teardown already removes
        // the rows of a departed peer.
        match self.shared.store.list_peers_for(&fname) {
            Ok(peer_list) => Reply::peer_list(peer_list),
            Err(e) => {
                error!("Fetch failed for {}: {}", fname, e);
                Reply::error(e.to_string())
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
