#[macro_use]
extern crate log;

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{stdin, AsyncBufReadExt, BufReader, Lines, Stdin};

use shoal::config::PeerConfig;
use shoal::identity::IdentityAllocator;
use shoal::peer::{ConnectArgs, Controller};
use shoal::protocol::Reply;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = PeerConfig::load()?;

    // Config overrides bypass the auto-identity counter.
    let (p2p_port, client_name) = match (
        config.general.p2p_port,
        config.general.client_name.clone(),
    ) {
        (Some(port), Some(name)) => (port, name),
        (port, name) => {
            let identity = IdentityAllocator::new(&config.general.state_file).next()?;
            (
                port.unwrap_or(identity.p2p_port),
                name.unwrap_or(identity.client_name),
            )
        }
    };

    let controller = Arc::new(Controller::new());
    controller.spawn_reconnect_poller();
    controller.spawn_shared_files_poller();

    controller
        .connect(ConnectArgs {
            server_address: config.general.server_address.clone(),
            p2p_port,
            client_name: client_name.clone(),
        })
        .await?;

    let mut lines = BufReader::new(stdin()).lines();

    loop {
        print!("Enter publish <lname> <fname>/ fetch <fname>/ shared/ exit: ");
        std::io::stdout().flush()?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };

        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            ["publish", lname, fname] => publish(&controller, lname, fname, &mut lines).await,

            ["fetch", fname] => fetch(&controller, fname, &mut lines).await,

            ["shared"] => match controller.list_shared_files().await {
                Ok(files) => {
                    for file in files {
                        info!(
                            "{} ({} peer(s), {} bytes)",
                            file.fname,
                            file.peer_count,
                            file.file_size.unwrap_or(0),
                        );
                    }
                }
                Err(e) => error!("Shared files request failed: {}", e),
            },

            ["exit"] => {
                info!("Exiting client.");
                break;
            }

            [] => continue,

            _ => warn!("Invalid command: {}", line),
        }
    }

    controller.disconnect().await;

    Ok(())
}

async fn publish(
    controller: &Controller,
    lname: &str,
    fname: &str,
    lines: &mut Lines<BufReader<Stdin>>,
) {
    match controller.publish(Path::new(lname), fname, false).await {
        Ok(Reply::Conflict {
            message,
            existing_lname,
        }) => {
            warn!(
                "{} (existing path: {})",
                message,
                existing_lname.unwrap_or_default(),
            );

            print!("Overwrite the previous file entry? (y/n): ");
            if std::io::stdout().flush().is_err() {
                return;
            }

            let confirmed = matches!(
                lines.next_line().await,
                Ok(Some(ref answer)) if answer.trim().eq_ignore_ascii_case("y")
            );

            if !confirmed {
                info!("Publish cancelled for alias '{}'.", fname);
                return;
            }

            match controller.publish(Path::new(lname), fname, true).await {
                Ok(reply) => info!("Publish response: {:?}", reply),
                Err(e) => error!("Publish failed: {}", e),
            }
        }
        Ok(reply) => info!("Publish response: {:?}", reply),
        Err(e) => error!("Publish failed: {}", e),
    }
}

async fn fetch(controller: &Controller, fname: &str, lines: &mut Lines<BufReader<Stdin>>) {
    let peer_list = match controller.fetch_peer_list(fname).await {
        Ok(peer_list) => peer_list,
        Err(e) => {
            error!("Fetch failed: {}", e);
            return;
        }
    };

    if peer_list.is_empty() {
        info!("File '{}' not found on any peer.", fname);
        return;
    }

    info!("File {} is available from the following peer(s):", fname);
    for (i, peer) in peer_list.iter().enumerate() {
        info!(
            " [{}] Hostname: {}, IP: {}, Port: {}",
            i + 1,
            peer.hostname,
            peer.ip,
            peer.port,
        );
    }

    let mut chosen = 0usize;
    if peer_list.len() > 1 {
        print!(
            "Enter 1 number from 1 to {} to choose a peer (default = 1): ",
            peer_list.len(),
        );
        if std::io::stdout().flush().is_err() {
            return;
        }

        if let Ok(Some(choice)) = lines.next_line().await {
            match choice.trim().parse::<usize>() {
                Ok(n) if (1..=peer_list.len()).contains(&n) => chosen = n - 1,
                Ok(_) => warn!("Invalid choice, defaulting to 1."),
                Err(_) if choice.trim().is_empty() => {}
                Err(_) => warn!("Invalid input, defaulting to 1."),
            }
        }
    }

    let peer = peer_list[chosen].clone();
    info!(
        "Decided to download from peer: Hostname: {}, IP: {}, Port: {}",
        peer.hostname, peer.ip, peer.port,
    );

    match controller.download_many(&peer_list[chosen..chosen + 1], Path::new(".")).await {
        Ok(report) => {
            for path in report.successes {
                info!("Download completed: {}", path.display());
            }
            for (path, error) in report.failures {
                error!("Download failed for {}: {}", path.display(), error);
            }
        }
        Err(e) => error!("Download failed: {}", e),
    }
}
