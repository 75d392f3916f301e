//! TCP forwarding over SSH channels.
//!
//! A [`LocalForwarder`] listens on a local port and proxies every accepted
//! socket through a channel obtained from a [`ChannelOpener`]; the
//! [`RemoteForwarder`] is the symmetric variant fed by a remote listener.
//! Both sides of a pair run as blocking copy tasks; a per-connection failure
//! is an event, never a listener crash.

pub mod error;
pub mod forwarder;
pub mod remote;
pub mod stream;

pub use error::{ForwardError, ForwardResult};
pub use forwarder::{ForwardEvent, ForwardRuleSnapshot, LocalForwarder, RuleState};
pub use remote::RemoteForwarder;
pub use stream::{ChannelOpener, ForwardStream, RemoteAcceptor, RemoteListenProvider};
