use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use clap::{Args, Subcommand};

use outpost_core_types::{AuthMethod, ConnectionDescriptor, ConnectionId};
use outpost_ssh_transport::SshTransport;

use crate::config::ConfigStore;

#[derive(Debug, Args)]
pub struct ConnectionsArgs {
    #[command(subcommand)]
    pub command: ConnectionsCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConnectionsCommand {
    /// List stored connections.
    List,
    /// Add a connection.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 22)]
        port: u16,
        #[arg(long)]
        username: String,
        /// Password authentication.
        #[arg(long, conflicts_with = "key")]
        password: Option<String>,
        /// Private key path (`~` is expanded on use).
        #[arg(long)]
        key: Option<String>,
        #[arg(long, requires = "key")]
        passphrase: Option<String>,
    },
    /// Remove a connection by name or id.
    Remove { reference: String },
    /// Connect and run a probe command.
    Test { reference: String },
}

pub async fn cmd_connections(config: Arc<ConfigStore>, args: ConnectionsArgs) -> anyhow::Result<()> {
    match args.command {
        ConnectionsCommand::List => {
            let connections = config.list();
            if connections.is_empty() {
                println!("no connections configured");
                return Ok(());
            }
            for descriptor in connections {
                println!(
                    "{}  {}  {}@{}:{}  ({})",
                    descriptor.id,
                    descriptor.name,
                    descriptor.username,
                    descriptor.host,
                    descriptor.port,
                    descriptor.auth.kind(),
                );
            }
            Ok(())
        }
        ConnectionsCommand::Add {
            name,
            host,
            port,
            username,
            password,
            key,
            passphrase,
        } => {
            let auth = match (password, key) {
                (Some(password), None) => AuthMethod::Password { password },
                (None, Some(key_path)) => AuthMethod::PrivateKey {
                    key_path,
                    passphrase,
                },
                _ => bail!("exactly one of --password or --key is required"),
            };
            let id = config.add(ConnectionDescriptor {
                id: ConnectionId::new(),
                name,
                host,
                port,
                username,
                auth,
            })?;
            println!("✓ added {id}");
            Ok(())
        }
        ConnectionsCommand::Remove { reference } => {
            let descriptor = config.resolve(&reference)?;
            config.remove(&descriptor.id)?;
            println!("✓ removed {}", descriptor.name);
            Ok(())
        }
        ConnectionsCommand::Test { reference } => {
            let descriptor = config.resolve(&reference)?;
            let transport = SshTransport::new(descriptor);
            transport.connect().await?;
            transport
                .exec_checked("echo ok", Duration::from_secs(10))
                .await?;
            transport.disconnect().await;
            println!("✓ connection ok");
            Ok(())
        }
    }
}
