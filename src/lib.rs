//! outpost: drive a headless Chromium on a remote host over SSH.
//!
//! The heavy lifting lives in the workspace crates; this crate is the
//! application shell: config store, JSON API server, and CLI.

pub mod cli;
pub mod config;
pub mod errors;
pub mod secrets;
pub mod server;

/// Single-page console served at `/`.
pub const CONSOLE_HTML: &str = include_str!("console.html");

pub use config::{ConfigStore, ConnectionPatch};
pub use errors::{ApiError, ApiResult};
