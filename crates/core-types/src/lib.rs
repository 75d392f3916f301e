//! Shared vocabulary for the outpost crates.
//!
//! Connection descriptors, session state axes, and the event payloads that
//! cross crate boundaries live here so the transport, forwarder, browser,
//! CDP, and kernel crates agree on one set of types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a stored SSH connection descriptor.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a port-forward rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a connection authenticates. Exactly one secret accompanies each kind;
/// the enum makes the invariant structural instead of documented.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "authKind", rename_all = "camelCase")]
pub enum AuthMethod {
    #[serde(rename_all = "camelCase")]
    Password { password: String },
    #[serde(rename_all = "camelCase")]
    PrivateKey {
        key_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::PrivateKey { .. } => "privateKey",
        }
    }
}

/// Stable identity of a remote host the tool can open sessions against.
/// Created by the config store, consumed by the transport, never mutated by
/// the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub id: ConnectionId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(flatten)]
    pub auth: AuthMethod,
}

/// SSH transport axis.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SshState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Port-forward axis.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardState {
    #[default]
    Inactive,
    Active,
}

/// Remote browser axis.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserState {
    #[default]
    Stopped,
    Starting,
    Running,
}

/// CDP connection axis.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdpState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// The four independent axes a session is judged by. Every mutation of any
/// axis is broadcast as a full tuple; there is no partial-delta contract.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub ssh: SshState,
    pub port_forward: ForwardState,
    pub browser: BrowserState,
    pub cdp: CdpState,
}

impl SessionState {
    /// A session is ready iff every axis sits at its terminal positive value.
    pub fn is_ready(&self) -> bool {
        self.ssh == SshState::Connected
            && self.port_forward == ForwardState::Active
            && self.browser == BrowserState::Running
            && self.cdp == CdpState::Connected
    }
}

/// Events the session kernel broadcasts to subscribers (GUI websocket, CLI).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum SessionEvent {
    #[serde(rename = "state:change")]
    StateChange(SessionState),
    Ready,
    Closed,
    Error { code: String, message: String },
    #[serde(rename = "forward:error")]
    ForwardError { rule: RuleId, message: String },
}

/// Browser defaults persisted by the config store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_path: Option<String>,
    pub headless: bool,
    pub remote_debug_port: u16,
    pub user_data_dir: String,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: true,
            remote_debug_port: 9222,
            user_data_dir: "/tmp/outpost-profile".to_string(),
        }
    }
}

/// Port-forward defaults persisted by the config store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForwardDefaults {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl Default for PortForwardDefaults {
    fn default() -> Self {
        Self {
            local_host: "127.0.0.1".to_string(),
            local_port: 9222,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 9222,
        }
    }
}
