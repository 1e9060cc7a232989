//! The client handshake against a live server: both sides either succeed
//! and produce a working tunnel, or fail together without deadlocking.

mod common;

use anyhow::Result;
use common::{
    auth_options, closed_port, open_options, spawn_socks_server, spawn_tcp_echo_server, wait_for,
};
use socksd_rs::client::socks5_handshake;
use socksd_rs::protocol::ReplyCode;
use socksd_rs::util::SocksError;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};

const IO_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_handshake_and_tunnel() -> Result<()> {
    let (echo_addr, _echo) = spawn_tcp_echo_server().await?;
    let (proxy_addr, _server) = spawn_socks_server(open_options()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    socks5_handshake(&mut stream, "127.0.0.1", echo_addr.port(), None).await?;

    stream.write_all(b"tunneled").await?;
    let mut buf = [0u8; 8];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"tunneled");
    Ok(())
}

#[tokio::test]
async fn test_authenticated_handshake() -> Result<()> {
    let (echo_addr, _echo) = spawn_tcp_echo_server().await?;
    let (proxy_addr, _server) = spawn_socks_server(auth_options("alice", "secret")).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    socks5_handshake(
        &mut stream,
        "127.0.0.1",
        echo_addr.port(),
        Some(("alice", "secret")),
    )
    .await?;

    stream.write_all(b"authed").await?;
    let mut buf = [0u8; 6];
    timeout(IO_TIMEOUT, stream.read_exact(&mut buf)).await??;
    assert_eq!(&buf, b"authed");
    Ok(())
}

#[tokio::test]
async fn test_bad_credentials_fail_cleanly() -> Result<()> {
    let (proxy_addr, _server) = spawn_socks_server(auth_options("alice", "secret")).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let err = socks5_handshake(&mut stream, "127.0.0.1", 80, Some(("alice", "wrong")))
        .await
        .unwrap_err();
    assert!(matches!(err, SocksError::AuthFailed));
    Ok(())
}

#[tokio::test]
async fn test_refused_target_fails_both_sides() -> Result<()> {
    let (proxy_addr, _server) = spawn_socks_server(open_options()).await?;
    let port = closed_port().await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    let err = timeout(
        IO_TIMEOUT,
        socks5_handshake(&mut stream, "127.0.0.1", port, None),
    )
    .await?
    .unwrap_err();
    assert!(matches!(
        err,
        SocksError::Rejected(ReplyCode::ConnectionRefused)
    ));
    Ok(())
}

#[tokio::test]
async fn test_large_transfer_preserves_bytes() -> Result<()> {
    let (echo_addr, _echo) = spawn_tcp_echo_server().await?;
    let (proxy_addr, _server) = spawn_socks_server(open_options()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    socks5_handshake(&mut stream, "127.0.0.1", echo_addr.port(), None).await?;

    // Larger than one relay buffer, so the copy loop iterates.
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let (mut read_half, mut write_half) = stream.into_split();
    let writer = tokio::spawn(async move {
        write_half.write_all(&payload).await?;
        write_half.shutdown().await?;
        Ok::<_, std::io::Error>(())
    });

    let mut received = vec![0u8; expected.len()];
    timeout(IO_TIMEOUT, read_half.read_exact(&mut received)).await??;
    writer.await??;

    assert_eq!(received, expected);
    Ok(())
}

#[tokio::test]
async fn test_registry_drains_after_sessions_end() -> Result<()> {
    let (echo_addr, _echo) = spawn_tcp_echo_server().await?;
    let (proxy_addr, server) = spawn_socks_server(open_options()).await?;

    let mut streams = Vec::new();
    for _ in 0..3 {
        let mut stream = TcpStream::connect(proxy_addr).await?;
        socks5_handshake(&mut stream, "127.0.0.1", echo_addr.port(), None).await?;
        streams.push(stream);
    }

    let server_probe = Arc::clone(&server);
    assert!(
        wait_for(move || server_probe.session_count() == 3, IO_TIMEOUT).await,
        "sessions did not all register"
    );

    drop(streams);

    let server_probe = Arc::clone(&server);
    assert!(
        wait_for(move || server_probe.session_count() == 0, IO_TIMEOUT).await,
        "registry did not drain after sessions ended"
    );
    Ok(())
}

#[tokio::test]
async fn test_server_close_tears_down_live_sessions() -> Result<()> {
    let (echo_addr, _echo) = spawn_tcp_echo_server().await?;
    let (proxy_addr, server) = spawn_socks_server(open_options()).await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    socks5_handshake(&mut stream, "127.0.0.1", echo_addr.port(), None).await?;

    server.close();

    // The relay is unblocked by the abort and both endpoints close.
    let mut buf = Vec::new();
    let n = timeout(IO_TIMEOUT, stream.read_to_end(&mut buf)).await??;
    assert_eq!(n, 0);

    let server_probe = Arc::clone(&server);
    assert!(
        wait_for(move || server_probe.session_count() == 0, IO_TIMEOUT).await,
        "registry did not drain after close"
    );
    Ok(())
}
