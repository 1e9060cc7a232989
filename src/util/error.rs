use crate::protocol::ReplyCode;
use thiserror::Error;

/// SOCKS protocol errors
#[derive(Error, Debug)]
pub enum SocksError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The buffer ended before all required bytes were decoded.
    #[error("truncated message")]
    Truncated,

    /// The buffer ended before all bytes were encoded.
    #[error("buffer full")]
    BufferFull,

    /// A delimited field exceeded its bound before the delimiter arrived.
    #[error("field too long")]
    TooLong,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("name resolution failed for {0}")]
    Resolve(String),

    #[error("unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("proxy requires a username but none was configured")]
    UsernameRequired,

    #[error("unsupported auth sub-negotiation version: {0}")]
    UnsupportedAuthVersion(u8),

    /// The proxy answered the CONNECT request with a nonzero reply code.
    #[error("proxy rejected request: {0}")]
    Rejected(ReplyCode),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, SocksError>;
