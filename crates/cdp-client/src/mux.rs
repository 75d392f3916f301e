//! Request/response + event demultiplexer over one WebSocket.
//!
//! Every `send` gets a monotonically increasing id and a one-shot waiter;
//! the reader task routes response frames to waiters and fans unsolicited
//! events out on a broadcast channel. Transport loss fails every
//! outstanding waiter exactly once and poisons subsequent sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{CdpError, CdpResult};

/// Unsolicited protocol event.
#[derive(Clone, Debug)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

#[derive(Clone, Debug)]
pub struct CdpMuxOptions {
    pub connect_timeout: Duration,
    /// Upper bound on one command round trip; commands with longer natural
    /// waits (navigation) are bounded by their own adapters.
    pub command_timeout: Duration,
}

impl Default for CdpMuxOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// One ticket per in-flight request: the originating method plus the sink
/// its result is routed to.
type Waiters = Arc<Mutex<HashMap<u64, (String, oneshot::Sender<CdpResult<Value>>)>>>;

pub struct CdpMux {
    opts: CdpMuxOptions,
    weak: std::sync::Weak<Self>,
    next_id: AtomicU64,
    waiters: Waiters,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    events: broadcast::Sender<CdpEvent>,
    connected: AtomicBool,
    closed_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CdpMux {
    pub fn new(opts: CdpMuxOptions) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (closed_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            opts,
            weak: weak.clone(),
            next_id: AtomicU64::new(0),
            waiters: Arc::new(Mutex::new(HashMap::new())),
            outbound: Mutex::new(None),
            events,
            connected: AtomicBool::new(false),
            closed_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    /// Signalled once when the transport goes away.
    pub fn closed_watch(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Dial the WebSocket and start the reader/writer tasks. A no-op when
    /// already connected.
    pub async fn connect(&self, ws_url: &str) -> CdpResult<()> {
        if self.is_connected() {
            return Ok(());
        }

        let dialed = tokio::time::timeout(self.opts.connect_timeout, connect_async(ws_url)).await;
        let (stream, _) = match dialed {
            Ok(Ok(ok)) => ok,
            Ok(Err(err)) => {
                debug!(%err, "cdp websocket dial failed");
                return Err(CdpError::Timeout("connect".into()));
            }
            Err(_) => return Err(CdpError::Timeout("connect".into())),
        };

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(128);

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mux = self
            .weak
            .upgrade()
            .ok_or_else(|| CdpError::Timeout("connect".into()))?;
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => mux.handle_frame(&text),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            mux.mark_closed();
        });

        *self.outbound.lock() = Some(out_tx);
        {
            let mut tasks = self.tasks.lock();
            tasks.push(writer);
            tasks.push(reader);
        }
        self.connected.store(true, Ordering::Relaxed);
        info!(url = %ws_url, "cdp websocket connected");
        Ok(())
    }

    /// Issue one protocol command and await its result.
    pub async fn send(&self, method: &str, params: Value) -> CdpResult<Value> {
        if !self.is_connected() {
            return Err(CdpError::TransportClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, (method.to_string(), tx));

        let frame = json!({ "id": id, "method": method, "params": params });
        let sender = self.outbound.lock().clone();
        let sent = match sender {
            Some(sender) => sender.send(Message::Text(frame.to_string())).await.is_ok(),
            None => false,
        };
        if !sent {
            self.waiters.lock().remove(&id);
            return Err(CdpError::TransportClosed);
        }

        match tokio::time::timeout(self.opts.command_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::TransportClosed),
            Err(_) => {
                self.waiters.lock().remove(&id);
                Err(CdpError::Timeout(method.to_string()))
            }
        }
    }

    /// Close the socket and fail everything in flight.
    pub async fn disconnect(&self) {
        let sender = self.outbound.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(Message::Close(None)).await;
        }
        self.mark_closed();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }

    fn handle_frame(&self, text: &str) {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            warn!("undecodable cdp frame dropped");
            return;
        };

        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            let waiter = self.waiters.lock().remove(&id);
            let Some((method, waiter)) = waiter else {
                debug!(id, "response for unknown request id");
                return;
            };
            let outcome = if let Some(error) = value.get("error") {
                // error frames carry no method; the ticket remembers it
                Err(CdpError::Protocol {
                    method,
                    code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .to_string(),
                })
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = waiter.send(outcome);
            return;
        }

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let event = CdpEvent {
                method: method.to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            };
            let _ = self.events.send(event);
        }
    }

    /// Idempotent: the first call drains the waiter map, later calls see it
    /// empty.
    fn mark_closed(&self) {
        if !self.connected.swap(false, Ordering::Relaxed) {
            return;
        }
        *self.outbound.lock() = None;
        let drained: Vec<oneshot::Sender<CdpResult<Value>>> = {
            let mut waiters = self.waiters.lock();
            waiters.drain().map(|(_, (_, tx))| tx).collect()
        };
        for waiter in drained {
            let _ = waiter.send(Err(CdpError::TransportClosed));
        }
        let _ = self.closed_tx.send(true);
        info!("cdp websocket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal in-process DevTools stand-in: answers every command with
    /// `{echo: <method>}` and pushes one event after each response.
    async fn spawn_fake_browser() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(socket).await.unwrap();
                    while let Some(Ok(frame)) = ws.next().await {
                        let Message::Text(text) = frame else { continue };
                        let req: Value = serde_json::from_str(&text).unwrap();
                        let id = req["id"].as_u64().unwrap();
                        let method = req["method"].as_str().unwrap().to_string();

                        if method == "Fail.me" {
                            let frame = json!({
                                "id": id,
                                "error": { "code": -32000, "message": "boom" }
                            });
                            ws.send(Message::Text(frame.to_string())).await.unwrap();
                            continue;
                        }
                        if method == "Hang.up" {
                            let _ = ws.close(None).await;
                            return;
                        }

                        let response = json!({ "id": id, "result": { "echo": method } });
                        ws.send(Message::Text(response.to_string())).await.unwrap();
                        let event = json!({
                            "method": "Test.pulse",
                            "params": { "after": method }
                        });
                        ws.send(Message::Text(event.to_string())).await.unwrap();
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn responses_route_to_their_waiters() {
        let url = spawn_fake_browser().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();

        let first = mux.send("Page.enable", json!({})).await.unwrap();
        let second = mux.send("DOM.enable", json!({})).await.unwrap();
        assert_eq!(first["echo"], "Page.enable");
        assert_eq!(second["echo"], "DOM.enable");
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let url = spawn_fake_browser().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();

        let mut events = mux.subscribe();
        mux.send("Runtime.enable", json!({})).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.method, "Test.pulse");
        assert_eq!(event.params["after"], "Runtime.enable");
    }

    #[tokio::test]
    async fn protocol_errors_fail_the_waiter() {
        let url = spawn_fake_browser().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();

        let err = mux.send("Fail.me", json!({})).await.unwrap_err();
        match err {
            CdpError::Protocol {
                method,
                code,
                message,
            } => {
                // the error frame has no method field; it comes from the ticket
                assert_eq!(method, "Fail.me");
                assert_eq!(code, -32000);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err_code_of(&url).await, "cdp/protocol");
    }

    async fn err_code_of(url: &str) -> &'static str {
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(url).await.unwrap();
        mux.send("Fail.me", json!({})).await.unwrap_err().code()
    }

    #[tokio::test]
    async fn transport_loss_fails_in_flight_and_subsequent_sends() {
        let url = spawn_fake_browser().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();

        let err = mux.send("Hang.up", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::TransportClosed));

        // poisoned from here on
        let err = mux.send("Page.enable", json!({})).await.unwrap_err();
        assert!(matches!(err, CdpError::TransportClosed));
        assert!(!mux.is_connected());
    }

    #[tokio::test]
    async fn connect_to_dead_port_times_out() {
        let mux = CdpMux::new(CdpMuxOptions {
            connect_timeout: Duration::from_millis(500),
            ..CdpMuxOptions::default()
        });
        let err = mux.connect("ws://127.0.0.1:1/devtools").await.unwrap_err();
        assert_eq!(err.code(), "cdp/timeout");
    }

    #[tokio::test]
    async fn connect_twice_is_a_no_op() {
        let url = spawn_fake_browser().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();
        mux.connect(&url).await.unwrap();
        assert!(mux.is_connected());
    }

    #[tokio::test]
    async fn ids_are_monotonic() {
        let url = spawn_fake_browser().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();

        for _ in 0..3 {
            mux.send("Page.enable", json!({})).await.unwrap();
        }
        assert_eq!(mux.next_id.load(Ordering::Relaxed), 3);
    }
}
