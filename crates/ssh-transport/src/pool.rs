//! Bounded registry of live transports with idle sweeping and reconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use outpost_core_types::{ConnectionDescriptor, ConnectionId};

use crate::error::{TransportError, TransportResult};
use crate::transport::SshTransport;

/// Pool tunables: at most `max_connections` entries, idle entries dropped
/// after `idle_timeout`, reconnects retried `reconnect_attempts` times with a
/// linearly growing delay (`reconnect_delay × attempt`).
#[derive(Clone, Debug)]
pub struct PoolOptions {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(5 * 60),
            reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

struct PoolEntry {
    transport: Arc<SshTransport>,
    last_used: Mutex<Instant>,
}

pub struct ConnectionPool {
    opts: PoolOptions,
    weak: std::sync::Weak<Self>,
    entries: DashMap<ConnectionId, Arc<PoolEntry>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(opts: PoolOptions) -> Arc<Self> {
        let pool = Arc::new_cyclic(|weak| Self {
            opts,
            weak: weak.clone(),
            entries: DashMap::new(),
            sweeper: Mutex::new(None),
        });
        pool.spawn_sweeper();
        pool
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fetch a connected transport for the descriptor, reconnecting a stale
    /// entry or creating a fresh one under the pool bound.
    pub async fn acquire(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> TransportResult<Arc<SshTransport>> {
        if let Some(entry) = self.entries.get(&descriptor.id).map(|e| e.value().clone()) {
            *entry.last_used.lock() = Instant::now();
            if !entry.transport.is_connected() {
                self.connect_with_retry(&entry.transport).await?;
            }
            return Ok(entry.transport.clone());
        }

        if self.entries.len() >= self.opts.max_connections {
            return Err(TransportError::Connection(format!(
                "connection pool limit of {} reached",
                self.opts.max_connections
            )));
        }

        let transport = SshTransport::new(descriptor.clone());
        self.connect_with_retry(&transport).await?;
        self.entries.insert(
            descriptor.id.clone(),
            Arc::new(PoolEntry {
                transport: transport.clone(),
                last_used: Mutex::new(Instant::now()),
            }),
        );
        Ok(transport)
    }

    /// Disconnect and drop one entry.
    pub async fn remove(&self, id: &ConnectionId) {
        if let Some((_, entry)) = self.entries.remove(id) {
            entry.transport.disconnect().await;
        }
    }

    /// Disconnect everything and stop the sweeper.
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweeper.lock().take() {
            task.abort();
        }
        let ids: Vec<ConnectionId> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }

    async fn connect_with_retry(&self, transport: &Arc<SshTransport>) -> TransportResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.opts.reconnect_attempts.max(1) {
            match transport.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, %err, "pool connect attempt failed");
                    last_err = Some(err);
                    if attempt < self.opts.reconnect_attempts {
                        tokio::time::sleep(self.opts.reconnect_delay * attempt).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(TransportError::NotConnected))
    }

    fn spawn_sweeper(&self) {
        if self.opts.idle_timeout.is_zero() {
            return;
        }
        let weak = self.weak.clone();
        let period = (self.opts.idle_timeout / 4).max(Duration::from_secs(5));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                pool.sweep_idle().await;
            }
        });
        *self.sweeper.lock() = Some(task);
    }

    async fn sweep_idle(&self) {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = self
            .entries
            .iter()
            .filter(|entry| now.duration_since(*entry.value().last_used.lock()) >= self.opts.idle_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        for id in expired {
            info!(connection = %id, "dropping idle pooled connection");
            self.remove(&id).await;
        }
        debug!(remaining = self.entries.len(), "idle sweep complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core_types::AuthMethod;

    fn descriptor(name: &str) -> ConnectionDescriptor {
        ConnectionDescriptor {
            id: ConnectionId::new(),
            name: name.into(),
            host: "127.0.0.1".into(),
            // nothing listens here; connect attempts fail fast
            port: 1,
            username: "nobody".into(),
            auth: AuthMethod::Password {
                password: "x".into(),
            },
        }
    }

    #[tokio::test]
    async fn failed_acquire_does_not_leak_an_entry() {
        let pool = ConnectionPool::new(PoolOptions {
            reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(1),
            ..PoolOptions::default()
        });

        let err = pool.acquire(&descriptor("dead")).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connection(_) | TransportError::Timeout(_)
        ));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let pool = ConnectionPool::new(PoolOptions {
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(5),
            ..PoolOptions::default()
        });

        let started = Instant::now();
        let _ = pool.acquire(&descriptor("dead")).await;
        // one inter-attempt delay of 5ms, not an unbounded loop
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
