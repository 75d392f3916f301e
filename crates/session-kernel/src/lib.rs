//! Session kernel: the coupled state machine that turns four external
//! resources (SSH transport, remote process, TCP forward, CDP WebSocket)
//! into one atomic session with ordered startup, reverse-order teardown,
//! and live state broadcast.

pub mod error;
pub mod orchestrator;
pub mod state;
pub mod undo;

pub use error::{SessionError, SessionResult};
pub use orchestrator::{ActiveSession, SessionConfig, SessionOrchestrator};
pub use state::StateTracker;
pub use undo::UndoStack;
