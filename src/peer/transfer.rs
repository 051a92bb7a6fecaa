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

//! Both ends of the data stream.
//!
//! A data stream carries exactly one `get_file` request and then raw file
//! bytes until the serving side closes. There is no length prefix and no
//! status for the payload; end-of-stream is the only end-of-file signal, so
//! the serving side closes without writing anything when it cannot satisfy
//! the request.

use std::net::SocketAddr;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};
use tokio_stream::StreamExt;
use tokio_util::codec::{Framed, FramedRead};

use futures::sink::SinkExt;

use crate::error::ShoalResult;
use crate::protocol::{FileEntry, MessageCodec, Request, TRANSFER_CHUNK};

/// Bound on establishing the TCP connection to a serving peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop of the serving side; one detached worker per inbound peer.
pub(super) async fn serve(listener: TcpListener, mut stop: watch::Receiver<bool>) {
    loop {
        select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted data connection from {}", addr);
                    tokio::spawn(handle_transfer(stream, addr));
                }
                Err(e) => {
                    if *stop.borrow() {
                        break;
                    }
                    warn!("Data listener accept failure: {}", e);
                }
            }
        }
    }

    debug!("Data listener stopped");
}

async fn handle_transfer(stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = try_transfer(stream, addr).await {
        debug!("Transfer to {} aborted: {}", addr, e);
    }
}

async fn try_transfer(stream: TcpStream, addr: SocketAddr) -> ShoalResult<()> {
    let mut frame = FramedRead::new(stream, MessageCodec);

    let request = match frame.next().await {
        Some(Ok(value)) => Request::from_value(value).ok(),
        _ => None,
    };

    let lname = match request {
        Some(Request::GetFile { lname: Some(lname) }) if !lname.is_empty() => lname,
        _ => {
            warn!("Invalid request from peer {}", addr);
            return Ok(());
        }
    };

    if !Path::new(&lname).exists() {
        warn!("Requested file {} does not exist", lname);
        return Ok(());
    }

    info!("Start sending file {} to {}", lname, addr);

    let mut file = File::open(&lname).await?;
    let mut socket = frame.into_inner();

    let mut buf = vec![0u8; TRANSFER_CHUNK];

    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        socket.write_all(&buf[..read]).await?;
    }

    socket.shutdown().await?;

    info!("Finished sending file {} to {}", lname, addr);

    Ok(())
}

/// Downloads one file from a peer into `destination`.
///
/// A partially written destination is left in place on error; the caller
/// decides what to do with it.
pub async fn download(peer: &FileEntry, destination: &Path) -> ShoalResult<u64> {
    let addr = format!("{}:{}", peer.ip, peer.port);

    info!("Connecting to peer at {}...", addr);
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr.as_str())).await??;

    let mut frame = Framed::new(stream, MessageCodec);
    frame
        .send(&Request::GetFile {
            lname: Some(peer.lname.clone()),
        })
        .await?;

    let mut socket = frame.into_inner();
    let mut file = File::create(destination).await?;

    let mut buf = vec![0u8; TRANSFER_CHUNK];
    let mut received = 0u64;

    loop {
        let read = socket.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read]).await?;
        received += read as u64;
    }

    file.flush().await?;

    info!(
        "Download completed, {} bytes written to {}",
        received,
        destination.display(),
    );

    Ok(received)
}
