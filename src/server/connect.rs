//! Outbound connection establishment.

use crate::protocol::{ReplyCode, TargetAddr};
use crate::util::dns::resolve_target;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::{Duration, timeout};
use tracing::debug;

/// Timeout for a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Why an outbound connect failed, shaped for reply-code mapping.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("name resolution failed for {0}")]
    Resolve(String),

    #[error("connection refused")]
    Refused,

    #[error("network unreachable")]
    NetworkUnreachable,

    #[error("host unreachable")]
    HostUnreachable,

    #[error("connect timed out")]
    TimedOut,

    #[error("connect failed: {0}")]
    General(io::Error),
}

impl ConnectError {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            io::ErrorKind::NetworkUnreachable => ConnectError::NetworkUnreachable,
            io::ErrorKind::HostUnreachable => ConnectError::HostUnreachable,
            io::ErrorKind::TimedOut => ConnectError::TimedOut,
            _ => ConnectError::General(err),
        }
    }

    /// SOCKS5 REP byte for this failure.
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ConnectError::Refused => ReplyCode::ConnectionRefused,
            ConnectError::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            ConnectError::HostUnreachable => ReplyCode::HostUnreachable,
            ConnectError::TimedOut => ReplyCode::TtlExpired,
            ConnectError::Resolve(_) | ConnectError::General(_) => ReplyCode::GeneralFailure,
        }
    }
}

/// Connect to `target`, optionally binding each attempt to a local
/// interface address first.
///
/// Domain targets are resolved and the candidates tried in resolver order;
/// the first success wins and is returned together with the endpoint that
/// was actually reached. A failed local bind skips that candidate rather
/// than failing the whole connect. When every candidate fails, the last
/// error decides the reply code.
pub async fn connect_target(
    target: &TargetAddr,
    bind_addr: Option<IpAddr>,
) -> Result<(TcpStream, SocketAddr), ConnectError> {
    let candidates: Vec<SocketAddr> = match target {
        TargetAddr::Ipv4(ip, port) => vec![SocketAddr::new(IpAddr::V4(*ip), *port)],
        TargetAddr::Ipv6(ip, port) => vec![SocketAddr::new(IpAddr::V6(*ip), *port)],
        TargetAddr::Domain(domain, port) => resolve_target(domain, *port)
            .await
            .map_err(|_| ConnectError::Resolve(domain.clone()))?,
    };

    let mut last_err = ConnectError::General(io::Error::other("no candidate endpoints"));
    for candidate in candidates {
        let attempt = if let Some(local) = bind_addr {
            let socket = match open_bound_socket(candidate, local) {
                Ok(socket) => socket,
                Err(err) => {
                    debug!(
                        "[Connect] Skipping {} (bind to {} failed: {})",
                        candidate, local, err
                    );
                    continue;
                }
            };
            timeout(CONNECT_TIMEOUT, socket.connect(candidate)).await
        } else {
            timeout(CONNECT_TIMEOUT, TcpStream::connect(candidate)).await
        };

        match attempt {
            Ok(Ok(stream)) => return Ok((stream, candidate)),
            Ok(Err(err)) => {
                debug!("[Connect] {} failed: {}", candidate, err);
                last_err = ConnectError::from_io(err);
            }
            Err(_) => {
                debug!(
                    "[Connect] {} timed out after {}s",
                    candidate,
                    CONNECT_TIMEOUT.as_secs()
                );
                last_err = ConnectError::TimedOut;
            }
        }
    }

    Err(last_err)
}

/// Open a socket matching the candidate's family, bound to `local` with an
/// ephemeral port.
fn open_bound_socket(candidate: SocketAddr, local: IpAddr) -> io::Result<TcpSocket> {
    let socket = if candidate.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(local, 0))?;
    Ok(socket)
}
