//! SOCKS4/SOCKS5 proxy implementation in Rust
//!
//! An async SOCKS proxy server plus a client-side SOCKS5 handshake,
//! tunneling TCP connections through a local listener.

pub mod protocol;
pub mod util;
pub mod client;
pub mod server;

pub use protocol::*;
pub use util::*;
pub use client::*;

// Re-export commonly used types
pub use util::error::{SocksError, Result};
pub use server::{ServerOptions, SocksServer};
