//! The session orchestrator: strictly ordered start, reverse-order stop.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use outpost_cdp_client::{
    discover_ws_url, CdpMux, CdpMuxOptions, NetworkRecorder, PageAdapter,
};
use outpost_core_types::{
    BrowserSettings, BrowserState, CdpState, ConnectionDescriptor, ForwardState, RuleId,
    SessionState, SshState,
};
use outpost_port_forward::{ChannelOpener, ForwardEvent, LocalForwarder};
use outpost_remote_browser::RemoteBrowser;
use outpost_ssh_transport::SshTransport;

use crate::error::{SessionError, SessionResult};
use crate::state::StateTracker;
use crate::undo::UndoStack;

/// Everything a start needs: who to dial, what to launch, where to tunnel.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub descriptor: ConnectionDescriptor,
    pub browser: BrowserSettings,
    pub local_host: String,
    pub local_port: u16,
    pub remote_port: u16,
}

impl SessionConfig {
    pub fn new(descriptor: ConnectionDescriptor, browser: BrowserSettings) -> Self {
        let remote_port = browser.remote_debug_port;
        Self {
            descriptor,
            browser,
            local_host: "127.0.0.1".to_string(),
            local_port: remote_port,
            remote_port,
        }
    }
}

/// The composed resources of a running session. Cheap to clone; every field
/// is shared.
#[derive(Clone)]
pub struct ActiveSession {
    pub transport: Arc<SshTransport>,
    pub browser: Arc<RemoteBrowser>,
    pub forwarder: Arc<LocalForwarder>,
    pub mux: Arc<CdpMux>,
    pub page: Arc<PageAdapter>,
    pub recorder: Arc<NetworkRecorder>,
    pub rule: RuleId,
    pub local_port: u16,
}

pub struct SessionOrchestrator {
    tracker: Arc<StateTracker>,
    /// Serializes start/stop; at most one lifecycle transition in flight.
    lifecycle: tokio::sync::Mutex<()>,
    active: RwLock<Option<ActiveSession>>,
    forward_bridge: Mutex<Option<JoinHandle<()>>>,
}

impl Default for SessionOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionOrchestrator {
    pub fn new() -> Self {
        Self {
            tracker: Arc::new(StateTracker::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            active: RwLock::new(None),
            forward_bridge: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        self.tracker.state()
    }

    pub fn is_ready(&self) -> bool {
        self.tracker.is_ready()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<outpost_core_types::SessionEvent> {
        self.tracker.subscribe()
    }

    pub fn active(&self) -> Option<ActiveSession> {
        self.active.read().clone()
    }

    pub fn page(&self) -> Option<Arc<PageAdapter>> {
        self.active.read().as_ref().map(|s| s.page.clone())
    }

    pub fn recorder(&self) -> Option<Arc<NetworkRecorder>> {
        self.active.read().as_ref().map(|s| s.recorder.clone())
    }

    /// Bring the session up: SSH, browser spawn, forward, readiness, CDP.
    /// Any failure unwinds everything acquired so far and surfaces a
    /// `session/start-failed` wrapping the original error.
    pub async fn start(&self, config: SessionConfig) -> SessionResult<SessionState> {
        let _guard = self.lifecycle.lock().await;
        if self.active.read().is_some() {
            return Err(SessionError::AlreadyActive);
        }

        let mut undo = UndoStack::new();

        // 1. ssh
        self.tracker.set_ssh(SshState::Connecting);
        let transport = SshTransport::new(config.descriptor.clone());
        if let Err(err) = transport.connect().await {
            return self.fail("ssh", err.code(), err.to_string(), undo).await;
        }
        self.tracker.set_ssh(SshState::Connected);
        {
            let transport = transport.clone();
            undo.push("ssh-disconnect", move || async move {
                transport.disconnect().await;
            });
        }

        // 2. browser spawn (the endpoint only becomes observable through the
        // forward, so readiness is checked after step 3)
        self.tracker.set_browser(BrowserState::Starting);
        let browser = Arc::new(RemoteBrowser::new(transport.clone()));
        if let Err(err) = browser.launch(&config.browser).await {
            return self.fail("browser", err.code(), err.to_string(), undo).await;
        }
        {
            let browser = browser.clone();
            undo.push("browser-cleanup", move || async move {
                browser.cleanup().await;
            });
        }

        // 3. forward, then readiness poll through it
        let opener: Arc<dyn ChannelOpener> = transport.clone();
        let forwarder = LocalForwarder::new(opener);
        let rule = match forwarder
            .start_local(
                &config.local_host,
                config.local_port,
                "127.0.0.1",
                config.remote_port,
            )
            .await
        {
            Ok(rule) => rule,
            Err(err) => {
                return self.fail("port-forward", err.code(), err.to_string(), undo).await;
            }
        };
        {
            let forwarder = forwarder.clone();
            undo.push("forward-stop", move || async move {
                forwarder.stop_all();
            });
        }
        self.tracker.set_forward(ForwardState::Active);

        let local_base = format!("http://127.0.0.1:{}", rule.local_port);
        let browser_info = match browser.wait_ready(&local_base).await {
            Ok(info) => info,
            Err(err) => {
                return self.fail("browser", err.code(), err.to_string(), undo).await;
            }
        };
        self.tracker.set_browser(BrowserState::Running);
        info!(version = %browser_info.version, "remote browser is up");

        // 4. cdp
        self.tracker.set_cdp(CdpState::Connecting);
        let ws_url = match discover_ws_url(&local_base, "127.0.0.1").await {
            Ok(url) => url,
            Err(err) => {
                return self.fail("cdp", err.code(), err.to_string(), undo).await;
            }
        };
        let mux = CdpMux::new(CdpMuxOptions::default());
        if let Err(err) = mux.connect(&ws_url).await {
            return self.fail("cdp", err.code(), err.to_string(), undo).await;
        }
        {
            let mux = mux.clone();
            undo.push("cdp-disconnect", move || async move {
                mux.disconnect().await;
            });
        }
        let page = match PageAdapter::attach(mux.clone()).await {
            Ok(page) => Arc::new(page),
            Err(err) => {
                return self.fail("cdp", err.code(), err.to_string(), undo).await;
            }
        };
        let recorder = NetworkRecorder::new(mux.clone());
        self.tracker.set_cdp(CdpState::Connected);

        // 5. commit: the undo stack is dropped, stop() owns teardown now
        let session = ActiveSession {
            transport,
            browser,
            forwarder: forwarder.clone(),
            mux,
            page,
            recorder,
            rule: rule.id,
            local_port: rule.local_port,
        };
        *self.active.write() = Some(session);
        self.spawn_forward_bridge(&forwarder);
        self.tracker.emit_ready();
        Ok(self.tracker.state())
    }

    /// Tear the session down in strict reverse order. Every step swallows
    /// its own errors; afterwards all axes are back at their initial values
    /// and `closed` is emitted.
    pub async fn stop(&self) -> SessionResult<()> {
        let _guard = self.lifecycle.lock().await;
        let taken = self.active.write().take();
        let Some(session) = taken else {
            return Err(SessionError::NotActive);
        };

        if let Some(bridge) = self.forward_bridge.lock().take() {
            bridge.abort();
        }

        session.recorder.stop_pump();
        session.mux.disconnect().await;
        session.forwarder.stop_all();
        session.browser.cleanup().await;
        session.transport.disconnect().await;

        self.tracker.reset();
        self.tracker.emit_closed();
        info!("session stopped");
        Ok(())
    }

    async fn fail(
        &self,
        phase: &'static str,
        cause_code: &str,
        detail: String,
        undo: UndoStack,
    ) -> SessionResult<SessionState> {
        warn!(phase, code = cause_code, %detail, "session start failed; unwinding");
        self.tracker.emit_error(cause_code, detail.clone());
        undo.unwind().await;
        self.tracker.reset();
        Err(SessionError::StartFailed {
            phase,
            cause_code: cause_code.to_string(),
            detail,
        })
    }

    fn spawn_forward_bridge(&self, forwarder: &Arc<LocalForwarder>) {
        let mut events = forwarder.subscribe();
        let tracker = self.tracker.clone();
        let task = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if let ForwardEvent::Error { rule, detail } = event {
                    tracker.emit_forward_error(rule, detail);
                }
            }
        });
        *self.forward_bridge.lock() = Some(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core_types::{AuthMethod, ConnectionId, SessionEvent};

    fn dead_config() -> SessionConfig {
        SessionConfig::new(
            ConnectionDescriptor {
                id: ConnectionId::new(),
                name: "dead".into(),
                host: "127.0.0.1".into(),
                // nothing listens on port 1
                port: 1,
                username: "nobody".into(),
                auth: AuthMethod::Password {
                    password: "x".into(),
                },
            },
            BrowserSettings::default(),
        )
    }

    #[tokio::test]
    async fn stop_without_a_session_is_not_active() {
        let orchestrator = SessionOrchestrator::new();
        let err = orchestrator.stop().await.unwrap_err();
        assert!(matches!(err, SessionError::NotActive));
        assert_eq!(err.code(), "session/not-active");
    }

    #[tokio::test]
    async fn failed_start_resets_state_and_reports_the_cause() {
        let orchestrator = SessionOrchestrator::new();
        let mut events = orchestrator.subscribe();

        let err = orchestrator.start(dead_config()).await.unwrap_err();
        match &err {
            SessionError::StartFailed { phase, cause_code, .. } => {
                assert_eq!(*phase, "ssh");
                assert!(cause_code == "connection" || cause_code == "timeout");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.code(), "session/start-failed");
        assert_eq!(orchestrator.state(), SessionState::default());
        assert!(!orchestrator.is_ready());
        assert!(orchestrator.active().is_none());

        // connecting → error → reset tuple
        let mut saw_error = false;
        let mut last_tuple = None;
        while let Ok(event) = events.try_recv() {
            match event {
                SessionEvent::Error { .. } => saw_error = true,
                SessionEvent::StateChange(tuple) => last_tuple = Some(tuple),
                _ => {}
            }
        }
        assert!(saw_error);
        assert_eq!(last_tuple, Some(SessionState::default()));
    }

    #[tokio::test]
    async fn a_second_stop_still_reports_not_active() {
        let orchestrator = SessionOrchestrator::new();
        let _ = orchestrator.stop().await;
        let err = orchestrator.stop().await.unwrap_err();
        assert_eq!(err.code(), "session/not-active");
    }
}
