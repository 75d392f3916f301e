pub mod connections;
pub mod serve;
pub mod start;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "outpost", version, about = "Drive a headless browser on a remote host over SSH")]
pub struct Cli {
    /// Override the config directory (default ~/.ssh-command-tool3).
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the JSON API server and console page.
    Serve(serve::ServeArgs),
    /// Manage stored connections.
    Connections(connections::ConnectionsArgs),
    /// Start a one-shot session against a stored connection.
    Start(start::StartArgs),
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = std::sync::Arc::new(crate::config::ConfigStore::open(cli.config_dir.clone())?);
    match cli.command {
        Command::Serve(args) => serve::cmd_serve(config, args).await,
        Command::Connections(args) => connections::cmd_connections(config, args).await,
        Command::Start(args) => start::cmd_start(config, args).await,
    }
}
