//! SSH transport layer for outpost.
//!
//! Wraps an `ssh2` session behind one mutex so every libssh2 call is
//! serialized, and drives the blocking API from `tokio::task::spawn_blocking`.
//! Exposes command execution, direct-tcpip channels for the port forwarder,
//! keepalive supervision, and a bounded connection pool.

pub mod auth;
pub mod channel;
pub mod error;
pub mod pool;
pub mod transport;

pub use channel::{SshChannel, SshRemoteListener};
pub use error::{TransportError, TransportResult};
pub use pool::{ConnectionPool, PoolOptions};
pub use transport::{ExecOutput, SshTransport, TransportEvent, TransportOptions};
