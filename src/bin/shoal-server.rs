#[macro_use]
extern crate log;

use std::io::Write;

use tokio::io::{stdin, AsyncBufReadExt, BufReader};

use shoal::config::ServerConfig;
use shoal::server::{Directory, DirectoryHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = ServerConfig::load()?;

    let directory = Directory::bind(&config)?;
    let handle = directory.handle();

    let server = tokio::spawn(directory.up());

    admin_loop(&handle).await?;

    handle.shutdown();
    server.await??;

    Ok(())
}

/// Interactive admin prompt: `discover <hostname>`, `ping <hostname>`,
/// `exit`.
async fn admin_loop(handle: &DirectoryHandle) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(stdin()).lines();

    loop {
        print!("Enter discover <hostname>/ ping <hostname>/ exit: ");
        std::io::stdout().flush()?;

        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };

        let parts: Vec<&str> = line.split_whitespace().collect();

        match parts.as_slice() {
            ["discover", hostname] => match handle.discover(hostname) {
                Ok(files) if !files.is_empty() => {
                    info!("Files published by {}: {:?}", hostname, files);
                }
                Ok(_) => info!("No files found for client {}", hostname),
                Err(e) => error!("Discover failed for {}: {}", hostname, e),
            },

            ["ping", hostname] => {
                let online = handle.ping(hostname);

                if online.is_empty() {
                    info!("PING: Client {} is OFFLINE", hostname);
                } else {
                    info!("PING: Client {} is ONLINE", hostname);
                    info!("There are {} client(s) online:", online.len());
                    for (ip, port) in online {
                        info!("- {}: {}", ip, port);
                    }
                }
            }

            ["exit"] => {
                info!("Shutting down server.");
                break;
            }

            [] => continue,

            _ => warn!("Invalid command: {}", line),
        }
    }

    Ok(())
}
