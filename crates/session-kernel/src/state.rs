//! Four-axis state with full-tuple broadcast.

use parking_lot::Mutex;
use tokio::sync::broadcast;

use outpost_core_types::{
    BrowserState, CdpState, ForwardState, RuleId, SessionEvent, SessionState, SshState,
};

/// Holds the session tuple and publishes every mutation. Mutation and
/// emission happen under one lock, so subscribers observe `state:change`
/// events in mutation order and each carries the tuple exactly as it stood
/// after that mutation.
pub struct StateTracker {
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(128);
        Self {
            state: Mutex::new(SessionState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    pub fn set_ssh(&self, value: SshState) {
        let mut state = self.state.lock();
        state.ssh = value;
        let _ = self.events.send(SessionEvent::StateChange(*state));
    }

    pub fn set_forward(&self, value: ForwardState) {
        let mut state = self.state.lock();
        state.port_forward = value;
        let _ = self.events.send(SessionEvent::StateChange(*state));
    }

    pub fn set_browser(&self, value: BrowserState) {
        let mut state = self.state.lock();
        state.browser = value;
        let _ = self.events.send(SessionEvent::StateChange(*state));
    }

    pub fn set_cdp(&self, value: CdpState) {
        let mut state = self.state.lock();
        state.cdp = value;
        let _ = self.events.send(SessionEvent::StateChange(*state));
    }

    /// Revert every axis to its initial value in one emission.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = SessionState::default();
        let _ = self.events.send(SessionEvent::StateChange(*state));
    }

    pub fn emit_ready(&self) {
        let _ = self.events.send(SessionEvent::Ready);
    }

    pub fn emit_closed(&self) {
        let _ = self.events.send(SessionEvent::Closed);
    }

    pub fn emit_error(&self, code: impl Into<String>, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::Error {
            code: code.into(),
            message: message.into(),
        });
    }

    pub fn emit_forward_error(&self, rule: RuleId, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::ForwardError {
            rule,
            message: message.into(),
        });
    }
}
