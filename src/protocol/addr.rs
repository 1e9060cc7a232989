//! SOCKS target addresses.

use crate::protocol::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, Reader, Writer};
use crate::util::{Result, SocksError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Destination requested by a SOCKS client.
///
/// On the wire this is the ATYP byte followed by the address body and the
/// two-byte big-endian port. Domain names carry a one-byte length prefix and
/// are handed to the resolver exactly as received (no case folding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) => *port,
            TargetAddr::Ipv6(_, port) => *port,
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn atyp(&self) -> u8 {
        match self {
            TargetAddr::Ipv4(..) => ATYP_IPV4,
            TargetAddr::Ipv6(..) => ATYP_IPV6,
            TargetAddr::Domain(..) => ATYP_DOMAIN,
        }
    }

    /// Encoded length of ATYP + ADDR + PORT.
    pub fn encoded_len(&self) -> usize {
        match self {
            TargetAddr::Ipv4(..) => 1 + 4 + 2,
            TargetAddr::Ipv6(..) => 1 + 16 + 2,
            TargetAddr::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// Decode ATYP + ADDR + PORT from a message buffer.
    pub fn read(r: &mut Reader<'_>) -> Result<Self> {
        let atyp = r.read_u8()?;
        Self::read_with_atyp(atyp, r)
    }

    /// Decode ADDR + PORT when the ATYP byte was already consumed.
    pub fn read_with_atyp(atyp: u8, r: &mut Reader<'_>) -> Result<Self> {
        match atyp {
            ATYP_IPV4 => {
                let ip = Ipv4Addr::from(r.read_u32()?);
                let port = r.read_u16()?;
                Ok(TargetAddr::Ipv4(ip, port))
            }
            ATYP_DOMAIN => {
                let len = r.read_u8()? as usize;
                if len == 0 {
                    return Err(SocksError::Protocol("empty domain name".to_string()));
                }
                let domain = String::from_utf8(r.read_bytes(len)?.to_vec())
                    .map_err(|e| SocksError::Protocol(format!("invalid domain name: {}", e)))?;
                let port = r.read_u16()?;
                Ok(TargetAddr::Domain(domain, port))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(r.read_bytes(16)?);
                let port = r.read_u16()?;
                Ok(TargetAddr::Ipv6(Ipv6Addr::from(octets), port))
            }
            other => Err(SocksError::Protocol(format!(
                "unsupported address type: 0x{:02x}",
                other
            ))),
        }
    }

    /// Encode ATYP + ADDR + PORT.
    pub fn write(&self, w: &mut Writer<'_>) -> Result<()> {
        w.write_u8(self.atyp())?;
        match self {
            TargetAddr::Ipv4(ip, port) => {
                w.write_u32((*ip).into())?;
                w.write_u16(*port)?;
            }
            TargetAddr::Ipv6(ip, port) => {
                w.write_bytes(&ip.octets())?;
                w.write_u16(*port)?;
            }
            TargetAddr::Domain(domain, port) => {
                debug_assert!(domain.len() <= 255);
                w.write_u8(domain.len() as u8)?;
                w.write_bytes(domain.as_bytes())?;
                w.write_u16(*port)?;
            }
        }
        Ok(())
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr.ip() {
            IpAddr::V4(ip) => TargetAddr::Ipv4(ip, addr.port()),
            IpAddr::V6(ip) => TargetAddr::Ipv6(ip, addr.port()),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            TargetAddr::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}
