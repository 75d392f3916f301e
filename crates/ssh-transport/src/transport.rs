//! The transport proper: one authenticated `ssh2::Session` per instance.
//!
//! libssh2 sessions are not safe for concurrent use, so every call goes
//! through a single mutex; callers contend on it and are thereby serialized,
//! which is the contract the rest of the stack relies on.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use outpost_core_types::{AuthMethod, ConnectionDescriptor, SshState};

use crate::auth::inspect_private_key;
use crate::channel::{LockedSession, SshChannel, SshRemoteListener};
use crate::error::{classify, TransportError, TransportResult};

/// Tunables with the documented defaults: 10 s connect, 5 s keepalive
/// interval, 3 missed keepalives before the transport counts as lost.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_count_max: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(5),
            keepalive_count_max: 3,
        }
    }
}

/// Lifecycle notifications fanned out to subscribers.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Ready,
    Close,
    Error { code: &'static str, detail: String },
    Timeout,
}

/// Result of a remote command execution. A nonzero exit code is data, not an
/// error; callers that require success use [`SshTransport::exec_checked`].
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

pub struct SshTransport {
    descriptor: ConnectionDescriptor,
    opts: TransportOptions,
    weak: std::sync::Weak<Self>,
    state: Mutex<SshState>,
    inner: Mutex<Option<Arc<LockedSession>>>,
    events: broadcast::Sender<TransportEvent>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    missed_keepalives: AtomicU32,
}

impl SshTransport {
    pub fn new(descriptor: ConnectionDescriptor) -> Arc<Self> {
        Self::with_options(descriptor, TransportOptions::default())
    }

    pub fn with_options(descriptor: ConnectionDescriptor, opts: TransportOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak| Self {
            descriptor,
            opts,
            weak: weak.clone(),
            state: Mutex::new(SshState::Disconnected),
            inner: Mutex::new(None),
            events,
            keepalive_task: Mutex::new(None),
            missed_keepalives: AtomicU32::new(0),
        })
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SshState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.lock() == SshState::Connected
            && self
                .inner
                .lock()
                .as_ref()
                .map(|locked| locked.alive.load(Ordering::Relaxed))
                .unwrap_or(false)
    }

    /// Establish the session. A no-op when already connected. Key material is
    /// inspected before any network traffic so an encrypted key without a
    /// passphrase fails without touching the host.
    pub async fn connect(&self) -> TransportResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let auth = self.descriptor.auth.clone();
        if let AuthMethod::PrivateKey {
            key_path,
            passphrase,
        } = &auth
        {
            inspect_private_key(key_path, passphrase.is_some())?;
        }

        *self.state.lock() = SshState::Connecting;

        let host = self.descriptor.host.clone();
        let port = self.descriptor.port;
        let username = self.descriptor.username.clone();
        let connect_timeout = self.opts.connect_timeout;
        let keepalive_secs = self.opts.keepalive_interval.as_secs() as u32;

        let handshake = tokio::task::spawn_blocking(move || {
            establish(&host, port, &username, &auth, connect_timeout, keepalive_secs)
        });

        let locked = match tokio::time::timeout(self.opts.connect_timeout * 2, handshake).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TransportError::Connection(join_err.to_string())),
            Err(_) => Err(TransportError::Timeout("ssh connect".into())),
        };

        match locked {
            Ok(locked) => {
                let locked = Arc::new(locked);
                *self.inner.lock() = Some(locked);
                *self.state.lock() = SshState::Connected;
                self.missed_keepalives.store(0, Ordering::Relaxed);
                self.spawn_keepalive();
                info!(host = %self.descriptor.host, "ssh transport connected");
                let _ = self.events.send(TransportEvent::Ready);
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = SshState::Disconnected;
                let _ = self.events.send(TransportEvent::Error {
                    code: err.code(),
                    detail: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Tear the session down. A no-op when not connected. Closing the
    /// underlying transport cascades to every channel opened through it.
    pub async fn disconnect(&self) {
        if let Some(task) = self.keepalive_task.lock().take() {
            task.abort();
        }

        let taken = self.inner.lock().take();
        let Some(locked) = taken else {
            *self.state.lock() = SshState::Disconnected;
            return;
        };

        locked.alive.store(false, Ordering::Relaxed);
        let result = tokio::task::spawn_blocking(move || {
            let session = locked.session.lock();
            let _ = session.disconnect(None, "closing", None);
            if let Ok(tcp) = locked.tcp.try_clone() {
                let _ = tcp.shutdown(std::net::Shutdown::Both);
            }
        })
        .await;
        if let Err(err) = result {
            warn!(?err, "ssh disconnect task failed");
        }

        *self.state.lock() = SshState::Disconnected;
        let _ = self.events.send(TransportEvent::Close);
    }

    /// Run a command on the remote host, capturing stdout, stderr, and the
    /// exit code. The timeout bounds the whole round trip.
    pub async fn exec(&self, cmd: &str, timeout: Duration) -> TransportResult<ExecOutput> {
        let locked = self.locked()?;
        let command = cmd.to_string();

        let work = tokio::task::spawn_blocking(move || exec_blocking(&locked, &command, timeout));
        match tokio::time::timeout(timeout + Duration::from_secs(1), work).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TransportError::Connection(join_err.to_string())),
            Err(_) => Err(TransportError::Timeout(format!("exec `{cmd}`"))),
        }
    }

    /// Like [`exec`](Self::exec) but a nonzero exit code becomes an error.
    pub async fn exec_checked(&self, cmd: &str, timeout: Duration) -> TransportResult<ExecOutput> {
        let output = self.exec(cmd, timeout).await?;
        if output.exit_code != 0 {
            return Err(TransportError::Exec {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Open a direct-tcpip channel to `host:port` reachable from the SSH
    /// peer. `src` is reported to the server as the originating tuple.
    pub async fn open_channel(
        &self,
        host: &str,
        port: u16,
        src: Option<(String, u16)>,
    ) -> TransportResult<SshChannel> {
        let locked = self.locked()?;
        let host = host.to_string();

        let work = tokio::task::spawn_blocking(move || {
            let session = locked.session.lock();
            session.set_blocking(true);
            let src_ref = src.as_ref().map(|(ip, port)| (ip.as_str(), *port));
            session
                .channel_direct_tcpip(&host, port, src_ref)
                .map_err(|err| classify(err.to_string()))
                .map(|channel| SshChannel::new(locked.clone(), channel))
        });

        work.await
            .map_err(|err| TransportError::Connection(err.to_string()))?
    }

    /// Request a remote listener for the remote-forward variant.
    pub async fn listen_remote(
        &self,
        bind_host: &str,
        bind_port: u16,
    ) -> TransportResult<SshRemoteListener> {
        let locked = self.locked()?;
        let host = bind_host.to_string();

        let work = tokio::task::spawn_blocking(move || {
            let session = locked.session.lock();
            session.set_blocking(true);
            session
                .channel_forward_listen(bind_port, Some(&host), None)
                .map_err(|err| classify(err.to_string()))
                .map(|(listener, bound)| SshRemoteListener::new(locked.clone(), listener, bound))
        });

        work.await
            .map_err(|err| TransportError::Connection(err.to_string()))?
    }

    fn locked(&self) -> TransportResult<Arc<LockedSession>> {
        self.inner
            .lock()
            .as_ref()
            .filter(|locked| locked.alive.load(Ordering::Relaxed))
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    fn spawn_keepalive(&self) {
        if self.opts.keepalive_interval.is_zero() {
            return;
        }
        let weak = self.weak.clone();
        let interval = self.opts.keepalive_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(transport) = weak.upgrade() else {
                    break;
                };
                if !transport.keepalive_tick().await {
                    break;
                }
            }
        });
        *self.keepalive_task.lock() = Some(task);
    }

    /// One keepalive probe; returns false when supervision should stop.
    async fn keepalive_tick(&self) -> bool {
        let Ok(locked) = self.locked() else {
            return false;
        };

        let sent = tokio::task::spawn_blocking(move || {
            let session = locked.session.lock();
            session.keepalive_send().is_ok()
        })
        .await
        .unwrap_or(false);

        if sent {
            self.missed_keepalives.store(0, Ordering::Relaxed);
            return true;
        }

        let missed = self.missed_keepalives.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(missed, "ssh keepalive probe failed");
        if missed < self.opts.keepalive_count_max {
            return true;
        }

        warn!(
            host = %self.descriptor.host,
            "ssh transport lost after {missed} missed keepalives"
        );
        let _ = self.events.send(TransportEvent::Timeout);
        let _ = self.events.send(TransportEvent::Error {
            code: "timeout",
            detail: "keepalive window exhausted".into(),
        });
        self.disconnect().await;
        false
    }
}

fn establish(
    host: &str,
    port: u16,
    username: &str,
    auth: &AuthMethod,
    connect_timeout: Duration,
    keepalive_secs: u32,
) -> TransportResult<LockedSession> {
    use std::net::ToSocketAddrs;

    let addr = format!("{host}:{port}")
        .to_socket_addrs()
        .map_err(|err| TransportError::Connection(err.to_string()))?
        .next()
        .ok_or_else(|| TransportError::Connection(format!("no address for {host}:{port}")))?;

    let tcp = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|err| {
        if err.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Timeout(format!("connect to {host}:{port}"))
        } else {
            TransportError::Connection(err.to_string())
        }
    })?;
    let tcp_clone = tcp
        .try_clone()
        .map_err(|err| TransportError::Connection(err.to_string()))?;

    let mut session =
        ssh2::Session::new().map_err(|err| TransportError::Connection(err.to_string()))?;
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|err| classify(err.to_string()))?;

    match auth {
        AuthMethod::Password { password } => session
            .userauth_password(username, password)
            .map_err(|err| classify(err.to_string()))?,
        AuthMethod::PrivateKey {
            key_path,
            passphrase,
        } => {
            let path = crate::auth::expand_key_path(key_path);
            session
                .userauth_pubkey_file(username, None, &path, passphrase.as_deref())
                .map_err(|err| classify(err.to_string()))?
        }
    }

    if !session.authenticated() {
        return Err(TransportError::Auth("authentication rejected".into()));
    }

    session.set_keepalive(true, keepalive_secs);

    Ok(LockedSession {
        session: Mutex::new(session),
        tcp: tcp_clone,
        alive: AtomicBool::new(true),
    })
}

fn exec_blocking(
    locked: &Arc<LockedSession>,
    command: &str,
    timeout: Duration,
) -> TransportResult<ExecOutput> {
    use std::io::Read;

    let session = locked.session.lock();
    session.set_blocking(true);
    session.set_timeout(timeout.as_millis() as u32);

    let run = (|| -> Result<ExecOutput, ssh2::Error> {
        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        // read errors here usually mean the timeout fired mid-stream
        let _ = channel.read_to_string(&mut stdout);
        let _ = channel.stderr().read_to_string(&mut stderr);

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    })();

    session.set_timeout(0);
    run.map_err(|err| classify(err.to_string()))
}
