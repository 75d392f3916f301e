//! Local listener + per-connection copy pairs.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use outpost_core_types::RuleId;

use crate::error::{ForwardError, ForwardResult};
use crate::stream::{ChannelOpener, ForwardStream};

const COPY_BUF: usize = 16 * 1024;
const TCP_POLL: Duration = Duration::from_millis(100);
const STREAM_POLL: Duration = Duration::from_millis(10);

/// Rule lifecycle. `Error` is terminal for the rule's listener.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleState {
    Inactive,
    Active,
    Error,
}

/// Point-in-time view of one forward rule.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardRuleSnapshot {
    pub id: RuleId,
    pub local_addr: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub state: RuleState,
    pub active_conns: usize,
}

/// Notifications published by the forwarder. Per-connection failures land
/// here rather than killing the listener.
#[derive(Clone, Debug)]
pub enum ForwardEvent {
    Error { rule: RuleId, detail: String },
    PairOpened { rule: RuleId, pair: u64 },
    PairClosed { rule: RuleId, pair: u64 },
}

pub(crate) struct RuleHandle {
    pub(crate) id: RuleId,
    local_addr: String,
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    state: Mutex<RuleState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) pairs: DashMap<u64, Arc<PairHandle>>,
    next_pair: AtomicU64,
}

impl RuleHandle {
    pub(crate) fn new(
        id: RuleId,
        local_addr: String,
        local_port: u16,
        remote_host: String,
        remote_port: u16,
    ) -> Self {
        Self {
            id,
            local_addr,
            local_port,
            remote_host,
            remote_port,
            state: Mutex::new(RuleState::Active),
            accept_task: Mutex::new(None),
            pairs: DashMap::new(),
            next_pair: AtomicU64::new(1),
        }
    }

    pub(crate) fn snapshot(&self) -> ForwardRuleSnapshot {
        ForwardRuleSnapshot {
            id: self.id,
            local_addr: self.local_addr.clone(),
            local_port: self.local_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            state: *self.state.lock(),
            active_conns: self.pairs.len(),
        }
    }

    pub(crate) fn set_accept_task(&self, task: JoinHandle<()>) {
        *self.accept_task.lock() = Some(task);
    }

    /// Destroy every active pair, stop the accept loop, mark inactive.
    pub(crate) fn shut_down(&self) {
        *self.state.lock() = RuleState::Inactive;
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let handles: Vec<Arc<PairHandle>> =
            self.pairs.iter().map(|entry| entry.value().clone()).collect();
        for pair in handles {
            pair.destroy();
        }
        self.pairs.clear();
    }
}

/// One accepted socket glued to one channel. Destroying the handle unblocks
/// both copy directions.
pub(crate) struct PairHandle {
    stop: AtomicBool,
    tcp: std::net::TcpStream,
    stream: Arc<dyn ForwardStream>,
}

impl PairHandle {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub(crate) fn destroy(&self) {
        self.stop.store(true, Ordering::Relaxed);
        let _ = self.tcp.shutdown(std::net::Shutdown::Both);
        self.stream.close();
    }
}

/// Listens locally and proxies each accepted socket through a channel from
/// the opener.
pub struct LocalForwarder {
    opener: Arc<dyn ChannelOpener>,
    weak: std::sync::Weak<Self>,
    rules: DashMap<RuleId, Arc<RuleHandle>>,
    events: broadcast::Sender<ForwardEvent>,
}

impl LocalForwarder {
    pub fn new(opener: Arc<dyn ChannelOpener>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new_cyclic(|weak| Self {
            opener,
            weak: weak.clone(),
            rules: DashMap::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    /// Bind `local_host:local_port` and start accepting. Returns the rule
    /// snapshot with the actually bound port (useful when asking for port 0).
    pub async fn start_local(
        &self,
        local_host: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> ForwardResult<ForwardRuleSnapshot> {
        let listener = TcpListener::bind((local_host, local_port))
            .await
            .map_err(|err| {
                ForwardError::Setup(format!("bind {local_host}:{local_port}: {err}"))
            })?;
        let bound = listener
            .local_addr()
            .map_err(|err| ForwardError::Setup(err.to_string()))?;

        let rule = Arc::new(RuleHandle::new(
            RuleId::new(),
            local_host.to_string(),
            bound.port(),
            remote_host.to_string(),
            remote_port,
        ));
        self.rules.insert(rule.id, rule.clone());

        let forwarder = self
            .weak
            .upgrade()
            .ok_or_else(|| ForwardError::Setup("forwarder dropped".into()))?;
        let accept_rule = rule.clone();
        let task = tokio::spawn(async move {
            forwarder.accept_loop(listener, accept_rule).await;
        });
        rule.set_accept_task(task);

        info!(rule = %rule.id, addr = %bound, "local forward listening");
        Ok(rule.snapshot())
    }

    /// Stop one rule: destroy every pair, close the listener, drop the rule.
    /// Idempotent; stopping an unknown rule is a no-op.
    pub fn stop(&self, id: RuleId) {
        if let Some((_, rule)) = self.rules.remove(&id) {
            rule.shut_down();
            info!(rule = %id, "local forward stopped");
        }
    }

    pub fn stop_all(&self) {
        let ids: Vec<RuleId> = self.rules.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.stop(id);
        }
    }

    pub fn list(&self) -> Vec<ForwardRuleSnapshot> {
        self.rules
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, rule: Arc<RuleHandle>) {
        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!(rule = %rule.id, %err, "accept failed; listener closing");
                    *rule.state.lock() = RuleState::Error;
                    let _ = self.events.send(ForwardEvent::Error {
                        rule: rule.id,
                        detail: err.to_string(),
                    });
                    return;
                }
            };

            let opened = self
                .opener
                .open_forward(
                    &rule.remote_host,
                    rule.remote_port,
                    (peer.ip().to_string(), peer.port()),
                )
                .await;

            let stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    // destroy the socket, keep the listener alive
                    debug!(rule = %rule.id, %err, "channel open failed for accepted socket");
                    let _ = self.events.send(ForwardEvent::Error {
                        rule: rule.id,
                        detail: err.to_string(),
                    });
                    drop(socket);
                    continue;
                }
            };

            let tcp = match socket.into_std() {
                Ok(tcp) => tcp,
                Err(err) => {
                    let _ = self.events.send(ForwardEvent::Error {
                        rule: rule.id,
                        detail: err.to_string(),
                    });
                    continue;
                }
            };
            // tokio hands the fd back in nonblocking mode; the copy loops
            // want blocking reads bounded by a read timeout
            if tcp.set_nonblocking(false).is_err() {
                continue;
            }

            spawn_pair(rule.clone(), self.events.clone(), tcp, stream.into());
        }
    }
}

/// Wire one socket to one stream: two blocking copy directions plus a
/// supervisor that removes the pair only after both have finished, so no
/// byte can be delivered once the pair has left `active_conns`.
pub(crate) fn spawn_pair(
    rule: Arc<RuleHandle>,
    events: broadcast::Sender<ForwardEvent>,
    tcp: std::net::TcpStream,
    stream: Arc<dyn ForwardStream>,
) {
    let pair_id = rule.next_pair.fetch_add(1, Ordering::Relaxed);

    let Ok(tcp_clone) = tcp.try_clone() else {
        let _ = events.send(ForwardEvent::Error {
            rule: rule.id,
            detail: "failed to clone accepted socket".into(),
        });
        return;
    };
    let handle = Arc::new(PairHandle {
        stop: AtomicBool::new(false),
        tcp: tcp_clone,
        stream: stream.clone(),
    });
    rule.pairs.insert(pair_id, handle.clone());
    let _ = events.send(ForwardEvent::PairOpened {
        rule: rule.id,
        pair: pair_id,
    });

    let uplink = {
        let handle = handle.clone();
        let tcp = tcp.try_clone();
        tokio::task::spawn_blocking(move || {
            let Ok(tcp) = tcp else { return };
            copy_tcp_to_stream(&tcp, &handle);
        })
    };
    let downlink = {
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || {
            copy_stream_to_tcp(&tcp, &handle);
        })
    };

    let events = events.clone();
    tokio::spawn(async move {
        let _ = uplink.await;
        let _ = downlink.await;
        handle.destroy();
        rule.pairs.remove(&pair_id);
        let _ = events.send(ForwardEvent::PairClosed {
            rule: rule.id,
            pair: pair_id,
        });
        debug!(rule = %rule.id, pair = pair_id, "forward pair closed");
    });
}

fn copy_tcp_to_stream(tcp: &std::net::TcpStream, pair: &PairHandle) {
    let _ = tcp.set_read_timeout(Some(TCP_POLL));
    let mut tcp = tcp;
    let mut buf = [0u8; COPY_BUF];
    loop {
        if pair.stopped() {
            return;
        }
        match tcp.read(&mut buf) {
            Ok(0) => {
                pair.destroy();
                return;
            }
            Ok(n) => {
                if pair.stream.write_all(&buf[..n]).is_err() {
                    pair.destroy();
                    return;
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => {
                pair.destroy();
                return;
            }
        }
    }
}

fn copy_stream_to_tcp(tcp: &std::net::TcpStream, pair: &PairHandle) {
    let mut tcp = tcp;
    let mut buf = [0u8; COPY_BUF];
    loop {
        if pair.stopped() {
            return;
        }
        match pair.stream.try_read(&mut buf) {
            Ok(Some(0)) => {
                pair.destroy();
                return;
            }
            Ok(Some(n)) => {
                if tcp.write_all(&buf[..n]).is_err() {
                    pair.destroy();
                    return;
                }
            }
            Ok(None) => std::thread::sleep(STREAM_POLL),
            Err(_) => {
                pair.destroy();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ChannelOpener;
    use async_trait::async_trait;
    use std::io;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Far end backed by a plain TCP connection; stands in for the SSH
    /// channel in tests.
    struct TcpForwardStream {
        inner: std::net::TcpStream,
    }

    impl ForwardStream for TcpForwardStream {
        fn write_all(&self, data: &[u8]) -> io::Result<()> {
            self.inner.set_nonblocking(false)?;
            (&self.inner).write_all(data)
        }

        fn try_read(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
            self.inner.set_nonblocking(true)?;
            match (&self.inner).read(buf) {
                Ok(n) => Ok(Some(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            }
        }

        fn close(&self) {
            let _ = self.inner.shutdown(std::net::Shutdown::Both);
        }
    }

    struct TcpOpener {
        target: std::net::SocketAddr,
    }

    #[async_trait]
    impl ChannelOpener for TcpOpener {
        async fn open_forward(
            &self,
            _host: &str,
            _port: u16,
            _src: (String, u16),
        ) -> Result<Box<dyn ForwardStream>, ForwardError> {
            let inner = std::net::TcpStream::connect(self.target)
                .map_err(|err| ForwardError::Setup(err.to_string()))?;
            Ok(Box::new(TcpForwardStream { inner }))
        }
    }

    struct FailingOpener;

    #[async_trait]
    impl ChannelOpener for FailingOpener {
        async fn open_forward(
            &self,
            _host: &str,
            _port: u16,
            _src: (String, u16),
        ) -> Result<Box<dyn ForwardStream>, ForwardError> {
            Err(ForwardError::Setup("no channel for you".into()))
        }
    }

    async fn spawn_echo() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut rd, mut wr) = socket.split();
                    let _ = tokio::io::copy(&mut rd, &mut wr).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn bytes_round_trip_through_a_pair() {
        let echo = spawn_echo().await;
        let forwarder = LocalForwarder::new(Arc::new(TcpOpener { target: echo }));
        let rule = forwarder
            .start_local("127.0.0.1", 0, "127.0.0.1", echo.port())
            .await
            .unwrap();

        let mut client =
            tokio::net::TcpStream::connect(("127.0.0.1", rule.local_port)).await.unwrap();
        client.write_all(b"ten bytes!").await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ten bytes!");

        assert_eq!(forwarder.list().len(), 1);
        forwarder.stop(rule.id);
        assert!(forwarder.list().is_empty());
    }

    #[tokio::test]
    async fn stop_closes_the_listener() {
        let echo = spawn_echo().await;
        let forwarder = LocalForwarder::new(Arc::new(TcpOpener { target: echo }));
        let rule = forwarder
            .start_local("127.0.0.1", 0, "127.0.0.1", echo.port())
            .await
            .unwrap();

        forwarder.stop(rule.id);
        // double stop is a no-op
        forwarder.stop(rule.id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let refused = tokio::net::TcpStream::connect(("127.0.0.1", rule.local_port)).await;
        assert!(refused.is_err());
    }

    #[tokio::test]
    async fn channel_open_failure_reports_event_and_keeps_listening() {
        let forwarder = LocalForwarder::new(Arc::new(FailingOpener));
        let mut events = forwarder.subscribe();
        let rule = forwarder
            .start_local("127.0.0.1", 0, "127.0.0.1", 1)
            .await
            .unwrap();

        let _ = tokio::net::TcpStream::connect(("127.0.0.1", rule.local_port))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .unwrap();
        assert!(matches!(event, ForwardEvent::Error { .. }));

        // the listener survived the failed open
        let again = tokio::net::TcpStream::connect(("127.0.0.1", rule.local_port)).await;
        assert!(again.is_ok());
        assert_eq!(forwarder.list()[0].state, RuleState::Active);
    }
}
