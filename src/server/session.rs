//! Per-connection SOCKS protocol state machine.
//!
//! A session owns the accepted client stream, negotiates SOCKS4 or SOCKS5,
//! connects outbound, writes the reply, and then relays bytes until both
//! directions finish. The whole handshake runs under one timeout; expiry
//! behaves exactly like an aborted session.

use crate::protocol::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_NO_AUTHENTICATION, AUTH_NOT_ACCEPTABLE,
    AUTH_SUBNEGOTIATION_VERSION, AUTH_USERNAME_PASSWORD, CMD_CONNECT, Reader, ReplyCode,
    SOCKS4_CANNOT_CONNECT, SOCKS4_MAX_USERID, SOCKS4_REQUEST_GRANTED,
    SOCKS4_REQUEST_REJECTED_OR_FAILED, SOCKS4_USERID_NOT_ALLOWED, SOCKS4_VERSION, SOCKS5_VERSION,
    SocksVersion, TargetAddr, Writer, codec,
};
use crate::server::connect::connect_target;
use crate::server::relay;
use crate::server::server::SocksServer;
use crate::util::{Result, SocksError, configure_tcp_stream};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Time budget for the whole handshake, from first byte to reply written.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared part of a live session: its id plus the abort machinery the
/// acceptor reaches through the registry.
pub(crate) struct SessionHandle {
    id: u64,
    abort: AtomicBool,
    wake: Notify,
}

impl SessionHandle {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            abort: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Flag the session as aborted and unblock any outstanding I/O.
    pub(crate) fn close(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Drive one accepted connection to completion and drop it from the
/// registry afterwards. The strong reference to the handle lives here, on
/// the task; the acceptor only ever holds a weak one.
pub(crate) async fn run_session<S>(server: Weak<SocksServer>, handle: Arc<SessionHandle>, local: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(err) = drive(&server, &handle, local).await {
        // Handshake failures are routine: port scanners, impatient peers.
        debug!("[Session] id {}: ended with error: {}", handle.id(), err);
    }

    if let Some(server) = server.upgrade() {
        server.remove_session(handle.id());
    }
}

async fn drive<S>(server: &Weak<SocksServer>, handle: &Arc<SessionHandle>, mut local: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = handle.id();

    // Register for the wakeup before checking the flag, so a close() racing
    // with session startup is never missed.
    let notified = handle.wake.notified();
    tokio::pin!(notified);
    notified.as_mut().enable();
    if handle.aborted() {
        return Ok(());
    }

    let negotiated = tokio::select! {
        _ = &mut notified => {
            debug!("[Session] id {}: aborted during handshake", id);
            return Ok(());
        }
        res = timeout(HANDSHAKE_TIMEOUT, handshake(server, handle, &mut local)) => match res {
            Ok(res) => res?,
            Err(_) => {
                debug!("[Session] id {}: handshake timed out", id);
                return Ok(());
            }
        }
    };
    if handle.aborted() {
        return Ok(());
    }

    let Some(remote) = negotiated else {
        // Terminal reply already written (or none possible).
        return Ok(());
    };

    debug!("[Session] id {}: connected, starting transfer", id);
    let (up, down) = relay::run_relay(local, remote, &handle.abort, &handle.wake).await;
    debug!(
        "[Session] id {}: transfer completed ({} bytes up, {} bytes down)",
        id, up, down
    );
    Ok(())
}

/// Read the two-byte prelude and dispatch on the protocol version.
///
/// Returns the connected remote stream once a success reply was written,
/// or `None` when the session ends at the handshake (refusal, failure
/// reply, unsupported version).
async fn handshake<S>(
    server: &Weak<SocksServer>,
    handle: &Arc<SessionHandle>,
    local: &mut S,
) -> Result<Option<TcpStream>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 512];
    codec::read_exact(local, &mut buf[..2]).await?;
    let version = buf[0];
    let second = buf[1];

    match version {
        SOCKS5_VERSION => socks5(server, handle, local, second).await,
        SOCKS4_VERSION => socks4(server, handle, local, second).await,
        other => {
            debug!(
                "[Session] id {}: unsupported SOCKS version {}",
                handle.id(),
                other
            );
            Ok(None)
        }
    }
}

async fn socks5<S>(
    server: &Weak<SocksServer>,
    handle: &Arc<SessionHandle>,
    local: &mut S,
    nmethods: u8,
) -> Result<Option<TcpStream>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = handle.id();
    if nmethods == 0 {
        return Err(SocksError::Protocol(
            "no authentication methods offered".to_string(),
        ));
    }

    let mut buf = [0u8; 512];
    let n = nmethods as usize;
    codec::read_exact(local, &mut buf[..n]).await?;

    let Some(server) = server.upgrade() else {
        return Ok(None);
    };
    let auth_required = server.auth_required();

    // Pick the first offered method the server accepts.
    let mut method = AUTH_NOT_ACCEPTABLE;
    for &offered in &buf[..n] {
        let acceptable = if auth_required {
            offered == AUTH_USERNAME_PASSWORD
        } else {
            offered == AUTH_NO_AUTHENTICATION || offered == AUTH_USERNAME_PASSWORD
        };
        if acceptable {
            method = offered;
            break;
        }
    }

    local.write_all(&[SOCKS5_VERSION, method]).await?;
    if method == AUTH_NOT_ACCEPTABLE {
        debug!("[Session] id {}: no acceptable authentication method", id);
        return Ok(None);
    }

    if method == AUTH_USERNAME_PASSWORD && !subnegotiate(&server, handle, local).await? {
        return Ok(None);
    }

    // Request header: VER CMD RSV ATYP plus the first address byte.
    codec::read_exact(local, &mut buf[..5]).await?;
    let ver = buf[0];
    if ver != SOCKS5_VERSION {
        return Err(SocksError::Protocol(format!(
            "bad request version: {}",
            ver
        )));
    }
    let cmd = buf[1];
    if buf[2] != 0x00 {
        return Err(SocksError::Protocol("nonzero reserved byte".to_string()));
    }
    let atyp = buf[3];
    let first = buf[4];

    // Read the rest of DST.ADDR + DST.PORT. The first address byte is kept
    // at the front of the parse buffer, so for domains it is the length
    // prefix the decoder expects.
    let rest = match atyp {
        ATYP_IPV4 => 5,
        ATYP_IPV6 => 17,
        ATYP_DOMAIN => {
            let len = first as usize;
            if len == 0 {
                return Err(SocksError::Protocol("empty domain name".to_string()));
            }
            len + 2
        }
        other => {
            warn!("[Session] id {}: unsupported address type 0x{:02x}", id, other);
            let bnd = TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED, 0);
            write_reply5(local, ReplyCode::AddressTypeNotSupported, &bnd).await?;
            return Ok(None);
        }
    };
    buf[0] = first;
    codec::read_exact(local, &mut buf[1..1 + rest]).await?;

    let mut r = Reader::new(&buf[..1 + rest]);
    let target = TargetAddr::read_with_atyp(atyp, &mut r)?;

    if cmd != CMD_CONNECT {
        warn!(
            "[Session] id {}: unsupported command {} for {}",
            id, cmd, target
        );
        write_reply5(local, ReplyCode::CommandNotSupported, &target).await?;
        return Ok(None);
    }

    debug!("[Session] id {}: CONNECT {}", id, target);
    match connect_target(&target, server.options().bind_ip()).await {
        Ok((remote, endpoint)) => {
            configure_tcp_stream(&remote, &endpoint.to_string());
            // The reply names the endpoint actually reached, which for a
            // domain target is the resolved address.
            write_reply5(local, ReplyCode::Succeeded, &TargetAddr::from(endpoint)).await?;
            info!("[Session] id {}: connected to {}", id, endpoint);
            Ok(Some(remote))
        }
        Err(err) => {
            warn!("[Session] id {}: connect to {} failed: {}", id, target, err);
            // A target that never connected is echoed back as requested.
            write_reply5(local, err.reply_code(), &target).await?;
            Ok(None)
        }
    }
}

/// RFC 1929 username/password sub-negotiation.
///
/// Protocol violations (bad version, zero-length fields) close the
/// connection without a status byte; only a parsed credential pair gets a
/// verdict written back.
async fn subnegotiate<S>(
    server: &Arc<SocksServer>,
    handle: &Arc<SessionHandle>,
    local: &mut S,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 512];
    codec::read_exact(local, &mut buf[..2]).await?;
    let ver = buf[0];
    if ver != AUTH_SUBNEGOTIATION_VERSION {
        return Err(SocksError::Protocol(format!(
            "bad auth sub-negotiation version: {}",
            ver
        )));
    }
    let ulen = buf[1] as usize;
    if ulen == 0 {
        return Err(SocksError::Protocol("zero username length".to_string()));
    }

    // Username plus the password length prefix in one read.
    codec::read_exact(local, &mut buf[..ulen + 1]).await?;
    let username = buf[..ulen].to_vec();
    let plen = buf[ulen] as usize;
    if plen == 0 {
        return Err(SocksError::Protocol("zero password length".to_string()));
    }
    codec::read_exact(local, &mut buf[..plen]).await?;

    let ok = server.authenticate(&username, &buf[..plen], SocksVersion::V5);
    local
        .write_all(&[AUTH_SUBNEGOTIATION_VERSION, if ok { 0x00 } else { 0x01 }])
        .await?;

    if !ok {
        info!(
            "[Session] id {}: authentication failed for {:?}",
            handle.id(),
            String::from_utf8_lossy(&username)
        );
    }
    Ok(ok)
}

async fn socks4<S>(
    server: &Weak<SocksServer>,
    handle: &Arc<SessionHandle>,
    local: &mut S,
    command: u8,
) -> Result<Option<TcpStream>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = handle.id();
    let mut buf = [0u8; 512];

    // DSTPORT + DSTIP, then the NUL-terminated USERID.
    codec::read_exact(local, &mut buf[..6]).await?;
    let mut r = Reader::new(&buf[..6]);
    let port = r.read_u16()?;
    let ip = Ipv4Addr::from(r.read_u32()?);
    let userid = codec::read_until_nul(local, SOCKS4_MAX_USERID).await?;

    let Some(server) = server.upgrade() else {
        return Ok(None);
    };

    if !server.authenticate(&userid, b"", SocksVersion::V4) {
        info!(
            "[Session] id {}: SOCKS4 userid {:?} rejected",
            id,
            String::from_utf8_lossy(&userid)
        );
        write_reply4(local, SOCKS4_USERID_NOT_ALLOWED, ip, port).await?;
        return Ok(None);
    }

    if command != CMD_CONNECT {
        warn!("[Session] id {}: unsupported SOCKS4 command {}", id, command);
        write_reply4(local, SOCKS4_REQUEST_REJECTED_OR_FAILED, ip, port).await?;
        return Ok(None);
    }

    debug!("[Session] id {}: SOCKS4 CONNECT {}:{}", id, ip, port);
    match connect_target(&TargetAddr::Ipv4(ip, port), server.options().bind_ip()).await {
        Ok((remote, endpoint)) => {
            configure_tcp_stream(&remote, &endpoint.to_string());
            write_reply4(local, SOCKS4_REQUEST_GRANTED, ip, port).await?;
            info!("[Session] id {}: connected to {}", id, endpoint);
            Ok(Some(remote))
        }
        Err(err) => {
            warn!(
                "[Session] id {}: connect to {}:{} failed: {}",
                id, ip, port, err
            );
            write_reply4(local, SOCKS4_CANNOT_CONNECT, ip, port).await?;
            Ok(None)
        }
    }
}

/// Write a SOCKS5 reply sized to its address type (10 bytes for IPv4, 22
/// for IPv6, 7+len for domains). Some servers emit a fixed 10-byte reply
/// for every type and truncate the rest; this one follows the RFC layout.
async fn write_reply5<S>(local: &mut S, code: ReplyCode, bnd: &TargetAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 512];
    let mut w = Writer::new(&mut buf);
    w.write_u8(SOCKS5_VERSION)?;
    w.write_u8(code.as_byte())?;
    w.write_u8(0x00)?;
    bnd.write(&mut w)?;
    let n = w.position();
    local.write_all(&buf[..n]).await?;
    Ok(())
}

/// Write the 8-byte SOCKS4 reply, echoing the request's DSTPORT/DSTIP.
async fn write_reply4<S>(local: &mut S, code: u8, ip: Ipv4Addr, port: u16) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8];
    let mut w = Writer::new(&mut buf);
    w.write_u8(0x00)?;
    w.write_u8(code)?;
    w.write_u16(port)?;
    w.write_u32(ip.into())?;
    local.write_all(&buf).await?;
    Ok(())
}
