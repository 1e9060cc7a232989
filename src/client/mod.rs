//! Client-side SOCKS5 handshake

pub mod handshake;

pub use handshake::*;
