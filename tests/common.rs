//! Common test utilities and helpers

use anyhow::Result;
use socksd_rs::server::{ServerOptions, SocksServer};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// Start a SOCKS server with `options` on an ephemeral loopback port.
#[allow(dead_code)]
pub async fn spawn_socks_server(options: ServerOptions) -> Result<(SocketAddr, Arc<SocksServer>)> {
    let server = SocksServer::bind("127.0.0.1:0", options).await?;
    let addr = server.local_addr()?;
    server.start();
    Ok((addr, server))
}

/// Options for an open proxy (no authentication, no outbound binding).
#[allow(dead_code)]
pub fn open_options() -> ServerOptions {
    ServerOptions::default()
}

/// Options requiring username/password authentication.
#[allow(dead_code)]
pub fn auth_options(user: &str, pass: &str) -> ServerOptions {
    ServerOptions {
        username: user.to_string(),
        password: pass.to_string(),
        ..Default::default()
    }
}

/// Spawn a simple TCP echo server for tests, returning its address and join handle.
#[allow(dead_code)]
pub async fn spawn_tcp_echo_server() -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _peer)) => {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 4096];
                        loop {
                            match stream.read(&mut buf).await {
                                Ok(0) => break,
                                Ok(n) => {
                                    if stream.write_all(&buf[..n]).await.is_err() {
                                        break;
                                    }
                                }
                                Err(_) => break,
                            }
                        }
                    });
                }
                Err(e) => {
                    eprintln!("[Test Echo] Accept error: {e}");
                    break;
                }
            }
        }
    });

    Ok((addr, handle))
}

/// Wait for a condition to become true (with timeout).
#[allow(dead_code)]
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// A port that had no listener at probe time (for connect-refused cases).
#[allow(dead_code)]
pub async fn closed_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
