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

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::error::{ShoalError, ShoalResult};
use crate::protocol::{FileEntry, Reply, SharedFile};

use super::node::PeerNode;
use super::transfer;

/// Cadence of the `needs_reconnect` poll.
const RECONNECT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the shared-files refresh while connected.
const SHARED_FILES_REFRESH: Duration = Duration::from_secs(5);

/// Arguments of a connect attempt, kept around for auto-reconnect.
#[derive(Debug, Clone)]
pub struct ConnectArgs {
    pub server_address: String,
    pub p2p_port: u16,
    pub client_name: String,
}

/// Outcome of a multi-peer download batch.
///
/// Failures carry the destination path they were headed for; a failed
/// download never aborts the remaining ones.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub successes: Vec<PathBuf>,
    pub failures: Vec<(PathBuf, String)>,
}

/// Owns the peer node lifecycle on behalf of a front-end.
///
/// The controller connects and disconnects the node, replays the stored
/// identity when the heartbeat flags `needs_reconnect`, and funnels every
/// user operation through the node's public surface. Front-ends hold the
/// controller, never the node.
pub struct Controller {
    node: Mutex<Option<Arc<PeerNode>>>,

    /// Raised by the node's heartbeat on failure, observed by the reconnect
    /// poller, cleared on successful connect and on deliberate disconnect.
    needs_reconnect: Arc<AtomicBool>,

    last_connect: StdMutex<Option<ConnectArgs>>,

    /// Latest shared-files listing for observers.
    shared_files: watch::Sender<Vec<SharedFile>>,
    shared_files_rx: watch::Receiver<Vec<SharedFile>>,
}

impl Controller {
    pub fn new() -> Self {
        let (shared_files, shared_files_rx) = watch::channel(Vec::new());

        Self {
            node: Mutex::new(None),
            needs_reconnect: Arc::new(AtomicBool::new(false)),
            last_connect: StdMutex::new(None),
            shared_files,
            shared_files_rx,
        }
    }

    /// Connects with the given identity, remembering it for auto-reconnect
    /// even if this attempt fails.
    pub async fn connect(&self, args: ConnectArgs) -> ShoalResult<()> {
        let mut slot = self.node.lock().await;

        if slot.as_ref().map_or(false, |node| node.is_connected()) {
            return Err(ShoalError::AlreadyConnected);
        }

        *self.last_connect_lock() = Some(args.clone());

        let node = PeerNode::connect(
            &args.server_address,
            args.p2p_port,
            args.client_name.clone(),
            self.needs_reconnect.clone(),
        )
        .await?;

        *slot = Some(node);
        self.needs_reconnect.store(false, Ordering::SeqCst);

        info!("Client connected and ready as {}", args.client_name);

        Ok(())
    }

    pub async fn disconnect(&self) {
        self.needs_reconnect.store(false, Ordering::SeqCst);

        let node = self.node.lock().await.take();
        if let Some(node) = node {
            node.disconnect().await;
            info!("Client disconnected");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.node
            .lock()
            .await
            .as_ref()
            .map_or(false, |node| node.is_connected())
    }

    pub fn needs_reconnect(&self) -> bool {
        self.needs_reconnect.load(Ordering::SeqCst)
    }

    pub async fn publish(
        &self,
        local_path: &Path,
        alias: &str,
        allow_overwrite: bool,
    ) -> ShoalResult<Reply> {
        self.node().await?.publish(local_path, alias, allow_overwrite).await
    }

    pub async fn fetch_peer_list(&self, fname: &str) -> ShoalResult<Vec<FileEntry>> {
        self.node().await?.fetch_peer_list(fname).await
    }

    pub async fn list_shared_files(&self) -> ShoalResult<Vec<SharedFile>> {
        self.node().await?.list_shared_files().await
    }

    pub async fn download_from_peer(
        &self,
        peer: &FileEntry,
        destination: &Path,
    ) -> ShoalResult<u64> {
        self.node().await?;
        transfer::download(peer, destination).await
    }

    /// Downloads from each selected peer sequentially, giving every download
    /// its own free destination inside `directory`.
    pub async fn download_many(
        &self,
        peers: &[FileEntry],
        directory: &Path,
    ) -> ShoalResult<DownloadReport> {
        self.node().await?;

        let mut report = DownloadReport::default();

        for peer in peers {
            let destination = unique_destination(directory, &preferred_filename(peer));

            match transfer::download(peer, &destination).await {
                Ok(_) => report.successes.push(destination),
                Err(e) => {
                    error!("Download failed for {}: {}", destination.display(), e);
                    report.failures.push((destination, e.to_string()));
                }
            }
        }

        Ok(report)
    }

    /// Observer seam for the shared-files listing refreshed by
    /// [`Controller::spawn_shared_files_poller`].
    pub fn shared_files(&self) -> watch::Receiver<Vec<SharedFile>> {
        self.shared_files_rx.clone()
    }

    /// Retries the stored identity every 5 seconds while the heartbeat has
    /// flagged a lost server. Failures stay at INFO; a dead server is the
    /// expected state here.
    pub fn spawn_reconnect_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                sleep(RECONNECT_POLL_INTERVAL).await;

                if !controller.needs_reconnect() || controller.is_connected().await {
                    continue;
                }

                let args = match controller.last_connect_lock().clone() {
                    Some(args) => args,
                    None => {
                        warn!("Auto-reconnect: no connection args saved");
                        controller.needs_reconnect.store(false, Ordering::SeqCst);
                        continue;
                    }
                };

                info!("Auto-reconnect: server is down, attempting to reconnect...");

                match controller.connect(args).await {
                    Ok(()) => info!("Auto-reconnect succeeded"),
                    Err(e) => info!("Auto-reconnect: server is still down ({})", e),
                }
            }
        })
    }

    /// Refreshes the shared-files listing every 5 seconds while connected.
    ///
    /// A single task does the polling, so at most one request is in flight.
    pub fn spawn_shared_files_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let controller = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                if controller.is_connected().await {
                    match controller.list_shared_files().await {
                        Ok(files) => {
                            let _ = controller.shared_files.send(files);
                        }
                        Err(e) => debug!("Failed to refresh shared files: {}", e),
                    }
                }

                sleep(SHARED_FILES_REFRESH).await;
            }
        })
    }

    async fn node(&self) -> ShoalResult<Arc<PeerNode>> {
        self.node
            .lock()
            .await
            .as_ref()
            .filter(|node| node.is_connected())
            .cloned()
            .ok_or(ShoalError::NotConnected)
    }

    fn last_connect_lock(&self) -> MutexGuard<'_, Option<ConnectArgs>> {
        self.last_connect.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

/// Filename a download should land under: the serving peer's basename,
/// falling back to the alias.
fn preferred_filename(peer: &FileEntry) -> String {
    Path::new(&peer.lname)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(&peer.fname)
        .to_string()
}

/// First free path for `filename` inside `directory`, suffixing `_1`, `_2`,
/// … to the stem until nothing is in the way.
fn unique_destination(directory: &Path, filename: &str) -> PathBuf {
    let candidate = directory.join(filename);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(filename);
    let stem = name
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);
    let extension = name.extension().and_then(|e| e.to_str());

    let mut counter = 1u32;
    loop {
        let attempt = match extension {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };

        let candidate = directory.join(attempt);
        if !candidate.exists() {
            return candidate;
        }

        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(lname: &str, fname: &str) -> FileEntry {
        FileEntry {
            fname: fname.into(),
            hostname: "alpha".into(),
            ip: "127.0.0.1".into(),
            port: 4000,
            lname: lname.into(),
            file_size: None,
            last_modified: None,
        }
    }

    #[test]
    fn preferred_filename_uses_lname_basename() {
        assert_eq!(preferred_filename(&entry("/srv/files/a.txt", "alias.txt")), "a.txt");
        assert_eq!(preferred_filename(&entry("", "alias.txt")), "alias.txt");
    }

    #[test]
    fn unique_destination_suffixes_until_free() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(
            unique_destination(dir.path(), "a.txt"),
            dir.path().join("a.txt"),
        );

        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "a.txt"),
            dir.path().join("a_1.txt"),
        );

        std::fs::write(dir.path().join("a_1.txt"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "a.txt"),
            dir.path().join("a_2.txt"),
        );
    }

    #[test]
    fn unique_destination_without_extension() {
        let dir = tempfile::tempdir().unwrap();

        std::fs::write(dir.path().join("blob"), b"x").unwrap();
        assert_eq!(
            unique_destination(dir.path(), "blob"),
            dir.path().join("blob_1"),
        );
    }
}
