//! Demo client: fetch an HTTP resource through a SOCKS5 proxy.

use anyhow::{Context, Result};
use socksd_rs::client::socks5_handshake;
use socksd_rs::util::{ProxyUrl, SocksError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
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
    let mut socks_url = "socks5://127.0.0.1:1080".to_string();
    let mut target = "example.com".to_string();
    let mut path = "/".to_string();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--socks" => {
                socks_url = args.next().context("Expected proxy URL after --socks")?;
            }
            "--target" => {
                target = args.next().context("Expected host after --target")?;
            }
            "--path" => {
                path = args.next().context("Expected path after --path")?;
            }
            "-h" | "--help" => {
                println!("Usage: socksd-client [OPTIONS]");
                println!("Options:");
                println!("  --socks URL     Proxy URL, socks5://[user[:pass]@]host[:port]");
                println!("                  (default: socks5://127.0.0.1:1080)");
                println!("  --target HOST   HTTP server to fetch from (default: example.com)");
                println!("  --path PATH     HTTP path to fetch (default: /)");
                println!("  -h, --help      Show this help message");
                return Ok(());
            }
            _ => {
                return Err(anyhow::anyhow!("Unknown argument: {}", arg));
            }
        }
    }

    let proxy = ProxyUrl::parse(&socks_url).context("Invalid proxy URL")?;
    match proxy.scheme.as_str() {
        "socks5" => {}
        // The URL form is understood, but only SOCKS5 is spoken.
        "socks4" => return Err(SocksError::UnsupportedVersion(4).into()),
        other => {
            return Err(anyhow::anyhow!("Unsupported proxy scheme: {}", other));
        }
    }

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .with_context(|| format!("Failed to connect to proxy {}:{}", proxy.host, proxy.port))?;

    socks5_handshake(&mut stream, &target, 80, proxy.credentials())
        .await
        .context("SOCKS5 handshake failed")?;
    info!("[Client] Tunnel established, requesting http://{}{}", target, path);

    let request = format!(
        "GET {} HTTP/1.0\r\nHost: {}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        path, target
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    print!("{}", String::from_utf8_lossy(&response));

    Ok(())
}
