use std::sync::Arc;

use outpost_session_kernel::SessionOrchestrator;
use outpost_ssh_transport::ConnectionPool;

use crate::config::ConfigStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub orchestrator: Arc<SessionOrchestrator>,
    pub pool: Arc<ConnectionPool>,
}

impl AppState {
    pub fn new(
        config: Arc<ConfigStore>,
        orchestrator: Arc<SessionOrchestrator>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            pool,
        }
    }
}
