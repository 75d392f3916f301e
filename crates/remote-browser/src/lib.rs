//! Remote Chromium lifecycle, driven entirely over SSH exec.
//!
//! Detection probes well-known install paths on the peer, launch spawns a
//! detached headless instance with the DevTools port open, and readiness is
//! observed by polling `/json/version` through the local forward.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use outpost_core_types::BrowserSettings;
use outpost_ssh_transport::{SshTransport, TransportError};

const EXEC_TIMEOUT: Duration = Duration::from_secs(15);
const KILL_GRACE: Duration = Duration::from_millis(500);
const STRAGGLER_GRACE: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(200);
const READY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Error)]
pub enum BrowserError {
    #[error("no chromium-family binary found on the remote host")]
    NotFound,

    #[error("browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("browser did not expose its DevTools endpoint in time")]
    LaunchTimeout,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl BrowserError {
    pub fn code(&self) -> &'static str {
        match self {
            BrowserError::NotFound => "browser/not-found",
            BrowserError::LaunchFailed(_) => "browser/launch-failed",
            BrowserError::LaunchTimeout => "browser/launch-timeout",
            BrowserError::Transport(err) => err.code(),
        }
    }
}

pub type BrowserResult<T> = Result<T, BrowserError>;

/// Result of a successful spawn. The DevTools endpoint is not yet reachable
/// at this point; [`RemoteBrowser::wait_ready`] observes that separately once
/// the forward is up.
#[derive(Clone, Debug)]
pub struct LaunchHandle {
    pub pid: u32,
    pub executable: String,
}

/// `/json/version` payload subset.
#[derive(Clone, Debug, Deserialize)]
pub struct BrowserInfo {
    #[serde(rename = "Browser")]
    pub version: String,
    #[serde(rename = "webSocketDebuggerUrl", default)]
    pub ws_url: Option<String>,
}

/// A process found by [`RemoteBrowser::find_running`].
#[derive(Clone, Debug)]
pub struct RunningBrowser {
    pub pid: u32,
    pub command: String,
}

pub struct RemoteBrowser {
    transport: Arc<SshTransport>,
    pid: Mutex<Option<u32>>,
}

impl RemoteBrowser {
    pub fn new(transport: Arc<SshTransport>) -> Self {
        Self {
            transport,
            pid: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Locate a browser binary on the peer: `uname` picks the candidate list,
    /// each candidate is probed with `test -x`, and `which` is the fallback.
    pub async fn detect_path(&self) -> BrowserResult<String> {
        let uname = self.transport.exec("uname -s", EXEC_TIMEOUT).await?;
        let os = uname.stdout.trim();

        for candidate in candidates_for(os) {
            let probe = self
                .transport
                .exec(&format!("test -x \"{candidate}\""), EXEC_TIMEOUT)
                .await?;
            if probe.exit_code == 0 {
                debug!(candidate, "remote browser binary found");
                return Ok(candidate.to_string());
            }
        }

        let which = self
            .transport
            .exec(
                "which google-chrome chromium chromium-browser 2>/dev/null | head -n 1",
                EXEC_TIMEOUT,
            )
            .await?;
        let path = which.stdout.trim();
        if !path.is_empty() {
            return Ok(path.to_string());
        }

        Err(BrowserError::NotFound)
    }

    /// Spawn a detached headless instance. Kills stragglers already bound to
    /// the chosen debug port first.
    pub async fn launch(&self, settings: &BrowserSettings) -> BrowserResult<LaunchHandle> {
        let executable = match &settings.executable_path {
            Some(path) => path.clone(),
            None => self.detect_path().await?,
        };

        self.transport
            .exec_checked(
                &format!("mkdir -p \"{}\"", settings.user_data_dir),
                EXEC_TIMEOUT,
            )
            .await
            .map_err(|err| BrowserError::LaunchFailed(err.to_string()))?;

        // stale instances keep the port; nonzero pkill exit just means none
        let _ = self
            .transport
            .exec(
                &format!(
                    "pkill -f \"remote-debugging-port={}\"",
                    settings.remote_debug_port
                ),
                EXEC_TIMEOUT,
            )
            .await;
        tokio::time::sleep(STRAGGLER_GRACE).await;

        let command = build_launch_command(&executable, settings);
        let spawned = self.transport.exec(&command, EXEC_TIMEOUT).await?;
        let pid: u32 = spawned
            .stdout
            .trim()
            .parse()
            .map_err(|_| BrowserError::LaunchFailed(format!(
                "no pid captured (stdout: {:?}, stderr: {:?})",
                spawned.stdout.trim(),
                spawned.stderr.trim()
            )))?;

        *self.pid.lock() = Some(pid);
        info!(pid, executable, "remote browser spawned");
        Ok(LaunchHandle { pid, executable })
    }

    /// Poll `GET {base_url}/json/version` until it answers 200 or the budget
    /// runs out. `base_url` points at the local end of the forward.
    pub async fn wait_ready(&self, base_url: &str) -> BrowserResult<BrowserInfo> {
        self.wait_ready_with_timeout(base_url, READY_TIMEOUT).await
    }

    pub async fn wait_ready_with_timeout(
        &self,
        base_url: &str,
        timeout: Duration,
    ) -> BrowserResult<BrowserInfo> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|err| BrowserError::LaunchFailed(err.to_string()))?;
        let url = format!("{}/json/version", base_url.trim_end_matches('/'));

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let info: BrowserInfo = response
                        .json()
                        .await
                        .map_err(|err| BrowserError::LaunchFailed(err.to_string()))?;
                    info!(version = %info.version, "remote browser ready");
                    return Ok(info);
                }
                Ok(response) => {
                    debug!(status = %response.status(), "devtools endpoint not ready");
                }
                Err(err) => {
                    debug!(%err, "devtools endpoint poll failed");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BrowserError::LaunchTimeout);
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }

    /// List processes that look like debug-enabled browsers on the peer.
    pub async fn find_running(&self) -> BrowserResult<Vec<RunningBrowser>> {
        let listed = self
            .transport
            .exec(
                "pgrep -af \"remote-debugging-port\" 2>/dev/null || true",
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(parse_running(&listed.stdout))
    }

    /// Graceful kill, short grace period, then SIGKILL. Idempotent.
    pub async fn kill(&self, pid: Option<u32>) -> BrowserResult<()> {
        let target = pid.or_else(|| self.pid.lock().take());
        let Some(target) = target else {
            return Ok(());
        };

        let _ = self
            .transport
            .exec(&format!("kill {target}"), EXEC_TIMEOUT)
            .await;
        tokio::time::sleep(KILL_GRACE).await;
        let _ = self
            .transport
            .exec(&format!("kill -9 {target} 2>/dev/null || true"), EXEC_TIMEOUT)
            .await;

        info!(pid = target, "remote browser reaped");
        Ok(())
    }

    /// Teardown path: reap the known pid, swallowing failures.
    pub async fn cleanup(&self) {
        if let Err(err) = self.kill(None).await {
            warn!(%err, "browser cleanup failed");
        }
    }
}

fn candidates_for(os: &str) -> &'static [&'static str] {
    match os {
        "Darwin" => &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ],
        _ => &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ],
    }
}

fn build_launch_command(executable: &str, settings: &BrowserSettings) -> String {
    let mut flags = vec![
        format!("--remote-debugging-port={}", settings.remote_debug_port),
        "--remote-debugging-address=127.0.0.1".to_string(),
        format!("--user-data-dir=\"{}\"", settings.user_data_dir),
    ];
    if settings.headless {
        flags.push("--headless=new".to_string());
    }
    flags.extend(
        [
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-background-networking",
            "--disable-client-side-phishing-detection",
            "--disable-default-apps",
            "--disable-extensions",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-prompt-on-repost",
            "--disable-sync",
            "--disable-translate",
            "--metrics-recording-only",
            "--safebrowsing-disable-auto-update",
        ]
        .iter()
        .map(|flag| flag.to_string()),
    );

    format!(
        "nohup \"{executable}\" {} >/dev/null 2>&1 & echo $!",
        flags.join(" ")
    )
}

fn parse_running(stdout: &str) -> Vec<RunningBrowser> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (pid, command) = line.split_once(' ')?;
            Some(RunningBrowser {
                pid: pid.parse().ok()?,
                command: command.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BrowserSettings {
        BrowserSettings {
            executable_path: None,
            headless: true,
            remote_debug_port: 9222,
            user_data_dir: "/tmp/profile".into(),
        }
    }

    #[test]
    fn launch_command_detaches_and_captures_pid() {
        let cmd = build_launch_command("/usr/bin/chromium", &settings());
        assert!(cmd.starts_with("nohup \"/usr/bin/chromium\""));
        assert!(cmd.ends_with("& echo $!"));
        assert!(cmd.contains(">/dev/null 2>&1"));
    }

    #[test]
    fn launch_command_carries_required_flags() {
        let cmd = build_launch_command("/usr/bin/chromium", &settings());
        for flag in [
            "--remote-debugging-port=9222",
            "--remote-debugging-address=127.0.0.1",
            "--user-data-dir=\"/tmp/profile\"",
            "--headless=new",
            "--no-first-run",
            "--no-default-browser-check",
            "--disable-background-networking",
            "--disable-client-side-phishing-detection",
            "--disable-default-apps",
            "--disable-extensions",
            "--disable-hang-monitor",
            "--disable-popup-blocking",
            "--disable-prompt-on-repost",
            "--disable-sync",
            "--disable-translate",
            "--metrics-recording-only",
            "--safebrowsing-disable-auto-update",
        ] {
            assert!(cmd.contains(flag), "missing {flag}");
        }
    }

    #[test]
    fn headful_launch_omits_headless_flag() {
        let mut s = settings();
        s.headless = false;
        let cmd = build_launch_command("/usr/bin/chromium", &s);
        assert!(!cmd.contains("--headless"));
    }

    #[test]
    fn darwin_candidates_are_app_bundles() {
        let darwin = candidates_for("Darwin");
        assert_eq!(darwin.len(), 2);
        assert!(darwin.iter().all(|c| c.contains(".app/")));

        let linux = candidates_for("Linux");
        assert!(linux.contains(&"/snap/bin/chromium"));
    }

    #[test]
    fn pgrep_output_parses_into_processes() {
        let out = "1234 /usr/bin/chromium --remote-debugging-port=9222\n9876 chrome --remote-debugging-port=9333\n";
        let running = parse_running(out);
        assert_eq!(running.len(), 2);
        assert_eq!(running[0].pid, 1234);
        assert!(running[1].command.contains("9333"));
    }

    #[test]
    fn version_payload_deserializes() {
        let info: BrowserInfo = serde_json::from_str(
            r#"{"Browser":"Chrome/126.0.6478.55","Protocol-Version":"1.3","webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/browser/abc"}"#,
        )
        .unwrap();
        assert_eq!(info.version, "Chrome/126.0.6478.55");
        assert!(info.ws_url.unwrap().starts_with("ws://"));
    }
}
