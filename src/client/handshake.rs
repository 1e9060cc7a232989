//! Client-side SOCKS5 handshake.

use crate::protocol::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_NO_AUTHENTICATION, AUTH_SUBNEGOTIATION_VERSION,
    AUTH_USERNAME_PASSWORD, CMD_CONNECT, ReplyCode, SOCKS5_VERSION,
};
use crate::util::{Result, SocksError};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Negotiate a SOCKS5 tunnel to `(host, port)` over an already-connected
/// proxy stream.
///
/// The target is always sent in domain form (atyp 0x03), leaving resolution
/// to the proxy. When `credentials` are given, both no-auth and
/// username/password are offered and the sub-negotiation runs if the proxy
/// picks the latter. On success the stream is positioned exactly at the
/// start of the tunneled payload and belongs to the caller again.
pub async fn socks5_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<(&str, &str)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if host.len() > 255 {
        return Err(SocksError::TooLong);
    }

    // Method selection.
    let mut greeting = BytesMut::with_capacity(4);
    greeting.put_u8(SOCKS5_VERSION);
    if credentials.is_some() {
        greeting.put_u8(2);
        greeting.put_u8(AUTH_NO_AUTHENTICATION);
        greeting.put_u8(AUTH_USERNAME_PASSWORD);
    } else {
        greeting.put_u8(1);
        greeting.put_u8(AUTH_NO_AUTHENTICATION);
    }
    stream.write_all(&greeting).await?;

    let mut chosen = [0u8; 2];
    stream.read_exact(&mut chosen).await?;
    if chosen[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(chosen[0]));
    }
    match chosen[1] {
        AUTH_NO_AUTHENTICATION => {}
        AUTH_USERNAME_PASSWORD => {
            let Some((username, password)) = credentials else {
                return Err(SocksError::UsernameRequired);
            };
            subnegotiate(stream, username, password).await?;
        }
        other => {
            return Err(SocksError::Protocol(format!(
                "proxy accepted none of our methods (0x{:02x})",
                other
            )));
        }
    }

    // CONNECT request in domain form.
    let mut request = BytesMut::with_capacity(7 + host.len());
    request.put_u8(SOCKS5_VERSION);
    request.put_u8(CMD_CONNECT);
    request.put_u8(0x00);
    request.put_u8(ATYP_DOMAIN);
    request.put_u8(host.len() as u8);
    request.put_slice(host.as_bytes());
    request.put_u16(port);
    stream.write_all(&request).await?;

    // Reply prefix is 10 bytes for every address type; whatever the atyp
    // implies beyond that is drained so the caller starts at the payload.
    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS5_VERSION {
        return Err(SocksError::UnsupportedVersion(reply[0]));
    }
    if reply[1] != 0x00 {
        return Err(SocksError::Rejected(ReplyCode::from_byte(reply[1])));
    }

    let remainder = match reply[3] {
        ATYP_IPV4 => 0,
        ATYP_DOMAIN => (reply[4] as usize).saturating_sub(3),
        ATYP_IPV6 => 12,
        other => {
            return Err(SocksError::Protocol(format!(
                "unsupported address type in reply: 0x{:02x}",
                other
            )));
        }
    };
    if remainder > 0 {
        let mut drain = [0u8; 256];
        stream.read_exact(&mut drain[..remainder]).await?;
    }

    debug!("[Client] Tunnel to {}:{} established", host, port);
    Ok(())
}

/// RFC 1929 username/password sub-negotiation, client side.
async fn subnegotiate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if username.len() > 255 || password.len() > 255 {
        return Err(SocksError::TooLong);
    }

    let mut msg = BytesMut::with_capacity(3 + username.len() + password.len());
    msg.put_u8(AUTH_SUBNEGOTIATION_VERSION);
    msg.put_u8(username.len() as u8);
    msg.put_slice(username.as_bytes());
    msg.put_u8(password.len() as u8);
    msg.put_slice(password.as_bytes());
    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[0] != AUTH_SUBNEGOTIATION_VERSION {
        return Err(SocksError::UnsupportedAuthVersion(status[0]));
    }
    if status[1] != 0x00 {
        return Err(SocksError::AuthFailed);
    }
    Ok(())
}
