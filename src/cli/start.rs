use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::info;

use outpost_cdp_client::{NavigateOptions, ScreenshotFormat, ScreenshotOptions, WaitUntil};
use outpost_session_kernel::{SessionConfig, SessionOrchestrator};

use crate::config::ConfigStore;

#[derive(Debug, Args)]
pub struct StartArgs {
    /// Connection name or id.
    pub connection: String,

    /// Navigate here once the session is ready.
    #[arg(long)]
    pub url: Option<String>,

    /// Load state to wait for (load, domcontentloaded, networkidle).
    #[arg(long, default_value = "load")]
    pub wait_until: String,

    /// Write a full-page PNG screenshot here after navigating.
    #[arg(long)]
    pub screenshot: Option<PathBuf>,

    /// Run headful instead of headless.
    #[arg(long)]
    pub headful: bool,

    /// Local port for the DevTools forward (defaults to the config value).
    #[arg(long)]
    pub local_port: Option<u16>,

    /// Tear the session down immediately instead of holding until ctrl-c.
    #[arg(long)]
    pub one_shot: bool,
}

pub async fn cmd_start(config: Arc<ConfigStore>, args: StartArgs) -> anyhow::Result<()> {
    let descriptor = config.resolve(&args.connection)?;
    let wait_until = WaitUntil::parse(&args.wait_until)
        .ok_or_else(|| anyhow::anyhow!("unknown wait state `{}`", args.wait_until))?;

    let mut browser = config.browser_settings();
    browser.headless = !args.headful;
    let defaults = config.port_forward_defaults();

    let orchestrator = SessionOrchestrator::new();
    let session_config = SessionConfig {
        local_host: defaults.local_host.clone(),
        local_port: args.local_port.unwrap_or(defaults.local_port),
        remote_port: browser.remote_debug_port,
        descriptor: descriptor.clone(),
        browser,
    };

    let state = orchestrator.start(session_config).await?;
    config.set_last_connection_id(&descriptor.id)?;
    println!(
        "✓ session ready (ssh {:?}, forward {:?}, browser {:?}, cdp {:?})",
        state.ssh, state.port_forward, state.browser, state.cdp
    );

    if let Some(url) = &args.url {
        let page = orchestrator
            .page()
            .ok_or_else(|| anyhow::anyhow!("session has no page adapter"))?;
        page.navigate(
            url,
            NavigateOptions {
                wait_until,
                ..NavigateOptions::default()
            },
        )
        .await?;
        let (current, title) = page.current_entry().await?;
        println!("✓ {title} ({current})");

        if let Some(path) = &args.screenshot {
            let bytes = page
                .screenshot(ScreenshotOptions {
                    format: ScreenshotFormat::Png,
                    quality: None,
                    full_page: true,
                })
                .await?;
            std::fs::write(path, bytes)?;
            println!("✓ screenshot written to {}", path.display());
        }
    }

    if !args.one_shot {
        info!("holding session; ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
    }

    orchestrator.stop().await?;
    println!("✓ session stopped");
    Ok(())
}
