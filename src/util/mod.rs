/// Error types and Result alias
pub mod error;
/// Async name resolution with a small TTL cache
pub mod dns;
pub mod net;
pub mod url;

pub use error::*;
pub use dns::*;
pub use net::*;
pub use url::*;
