//! Remote-forward variant: a listener on the SSH peer, matched to a local
//! destination.
//!
//! The argument order is deliberate and strict: the first pair names where
//! the *remote* side listens, the second names the destination the accepted
//! streams are proxied to. Callers that conflate the two get a validation
//! error instead of silently swapped semantics.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use outpost_core_types::RuleId;

use crate::error::{ForwardError, ForwardResult};
use crate::forwarder::{spawn_pair, ForwardEvent, ForwardRuleSnapshot, RuleHandle};
use crate::stream::RemoteListenProvider;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

pub struct RemoteForwarder {
    provider: Arc<dyn RemoteListenProvider>,
    rules: DashMap<RuleId, Arc<RuleHandle>>,
    events: broadcast::Sender<ForwardEvent>,
}

impl RemoteForwarder {
    pub fn new(provider: Arc<dyn RemoteListenProvider>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            provider,
            rules: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.events.subscribe()
    }

    /// Ask the SSH peer to listen on `remote_listen_host:remote_listen_port`;
    /// every inbound channel is proxied to `dest_host:dest_port` reachable
    /// from this process.
    pub async fn start_remote(
        &self,
        remote_listen_host: &str,
        remote_listen_port: u16,
        dest_host: &str,
        dest_port: u16,
    ) -> ForwardResult<ForwardRuleSnapshot> {
        if remote_listen_port == 0 {
            return Err(ForwardError::Setup(
                "remote listen port must be explicit".into(),
            ));
        }

        let acceptor = self
            .provider
            .listen_remote(remote_listen_host, remote_listen_port)
            .await?;

        let rule = Arc::new(RuleHandle::new(
            RuleId::new(),
            remote_listen_host.to_string(),
            remote_listen_port,
            dest_host.to_string(),
            dest_port,
        ));
        self.rules.insert(rule.id, rule.clone());

        let events = self.events.clone();
        let accept_rule = rule.clone();
        let dest = (dest_host.to_string(), dest_port);
        let task = tokio::spawn(async move {
            loop {
                let acceptor = acceptor.clone();
                let polled = tokio::task::spawn_blocking(move || acceptor.try_accept()).await;
                match polled {
                    Ok(Ok(Some(stream))) => {
                        let target = dest.clone();
                        let connected = tokio::task::spawn_blocking(move || {
                            std::net::TcpStream::connect((target.0.as_str(), target.1))
                        })
                        .await;
                        match connected {
                            Ok(Ok(tcp)) => {
                                spawn_pair(accept_rule.clone(), events.clone(), tcp, stream.into());
                            }
                            Ok(Err(err)) => {
                                warn!(rule = %accept_rule.id, %err, "destination connect failed");
                                stream.close();
                                let _ = events.send(ForwardEvent::Error {
                                    rule: accept_rule.id,
                                    detail: err.to_string(),
                                });
                            }
                            Err(_) => return,
                        }
                    }
                    Ok(Ok(None)) => tokio::time::sleep(ACCEPT_POLL).await,
                    Ok(Err(err)) => {
                        let _ = events.send(ForwardEvent::Error {
                            rule: accept_rule.id,
                            detail: err.to_string(),
                        });
                        return;
                    }
                    Err(_) => return,
                }
            }
        });
        rule.set_accept_task(task);

        info!(rule = %rule.id, "remote forward listening");
        Ok(rule.snapshot())
    }

    pub fn stop(&self, id: RuleId) {
        if let Some((_, rule)) = self.rules.remove(&id) {
            rule.shut_down();
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
}
