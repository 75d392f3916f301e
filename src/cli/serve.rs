use std::sync::Arc;

use clap::Args;

use outpost_session_kernel::SessionOrchestrator;
use outpost_ssh_transport::{ConnectionPool, PoolOptions};

use crate::config::ConfigStore;
use crate::server::{self, AppState};

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to bind.
    #[arg(long, default_value_t = 8090)]
    pub port: u16,
}

pub async fn cmd_serve(config: Arc<ConfigStore>, args: ServeArgs) -> anyhow::Result<()> {
    let state = AppState::new(
        config,
        Arc::new(SessionOrchestrator::new()),
        ConnectionPool::new(PoolOptions::default()),
    );
    server::serve(state, &args.host, args.port).await
}
