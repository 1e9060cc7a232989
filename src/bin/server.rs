//! SOCKS proxy server binary

use anyhow::{Context, Result};
use socksd_rs::server::{ServerOptions, SocksServer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let mut args = std::env::args().skip(1);
    let mut listen_addr = "0.0.0.0:1080".to_string();
    let mut options = ServerOptions::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-l" | "--listen" => {
                listen_addr = args.next().context("Expected listen address after -l")?;
            }
            "--bind-addr" => {
                options.bind_addr = args
                    .next()
                    .context("Expected interface address after --bind-addr")?;
            }
            "--user" => {
                options.username = args.next().context("Expected username after --user")?;
            }
            "--pass" => {
                options.password = args.next().context("Expected password after --pass")?;
            }
            "-h" | "--help" => {
                println!("Usage: socksd-server [OPTIONS]");
                println!("Options:");
                println!("  -l, --listen HOST:PORT    Listen address (default: 0.0.0.0:1080)");
                println!("  --bind-addr IP            Local interface for outbound connections");
                println!("  --user USER               Username (enables authentication)");
                println!("  --pass PASS               Password");
                println!("  -h, --help                Show this help message");
                return Ok(());
            }
            _ => {
                return Err(anyhow::anyhow!("Unknown argument: {}", arg));
            }
        }
    }

    if !options.bind_addr.is_empty() && options.bind_ip().is_none() {
        return Err(anyhow::anyhow!(
            "--bind-addr is not an IP literal: {}",
            options.bind_addr
        ));
    }

    info!("[Server] socksd-rs v{}", env!("CARGO_PKG_VERSION"));
    if !options.username.is_empty() {
        info!("[Server] Authentication enabled for user {:?}", options.username);
    }

    let server = SocksServer::bind(&listen_addr, options)
        .await
        .with_context(|| format!("Failed to listen on {}", listen_addr))?;
    server.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for ctrl-c")?;
    info!("[Server] Interrupt received, shutting down");
    server.close();

    Ok(())
}
