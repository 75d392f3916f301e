//! Network-domain recorder: assembles per-request entries from `Network.*`
//! events and exports HAR.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::CdpResult;
use crate::har::{self, Har};
use crate::mux::CdpMux;

const MAX_TOTAL_BUFFER: u64 = 10_000_000;
const MAX_RESOURCE_BUFFER: u64 = 5_000_000;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    /// Monotonic protocol timestamp, milliseconds.
    pub ts: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseRecord {
    pub status: i64,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<Value>,
}

/// One request as observed on the wire. `response` or `error` is populated
/// before the entry counts as finished.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    pub request_id: String,
    pub request: RequestRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub body_base64: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl NetworkEntry {
    pub fn is_finished(&self) -> bool {
        self.response.is_some() || self.error.is_some()
    }
}

#[derive(Clone, Debug)]
pub enum RecorderEvent {
    RequestFinished { request_id: String },
    RequestFailed { request_id: String },
}

/// Insertion-ordered entry store keyed by request id.
#[derive(Default)]
struct EntryStore {
    order: Vec<String>,
    map: HashMap<String, NetworkEntry>,
}

impl EntryStore {
    fn insert(&mut self, entry: NetworkEntry) {
        if !self.map.contains_key(&entry.request_id) {
            self.order.push(entry.request_id.clone());
        }
        self.map.insert(entry.request_id.clone(), entry);
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut NetworkEntry> {
        self.map.get_mut(id)
    }

    fn snapshot(&self) -> Vec<NetworkEntry> {
        self.order
            .iter()
            .filter_map(|id| self.map.get(id).cloned())
            .collect()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.map.clear();
    }
}

struct RecorderShared {
    recording: AtomicBool,
    entries: Mutex<EntryStore>,
    events: broadcast::Sender<RecorderEvent>,
}

/// Side effect an ingest step asks the async pump to perform.
enum FollowUp {
    FetchBody(String),
}

impl RecorderShared {
    fn ingest(&self, method: &str, params: &Value) -> Option<FollowUp> {
        if !self.recording.load(Ordering::Relaxed) {
            return None;
        }
        let request_id = params["requestId"].as_str()?.to_string();

        match method {
            "Network.requestWillBeSent" => {
                let request = &params["request"];
                self.entries.lock().insert(NetworkEntry {
                    request_id: request_id.clone(),
                    request: RequestRecord {
                        method: request["method"].as_str().unwrap_or_default().to_string(),
                        url: request["url"].as_str().unwrap_or_default().to_string(),
                        headers: header_pairs(&request["headers"]),
                        post_data: request["postData"].as_str().map(str::to_string),
                        ts: params["timestamp"].as_f64().unwrap_or(0.0) * 1000.0,
                        wall_time: params["wallTime"].as_f64(),
                        resource_type: params["type"].as_str().map(str::to_string),
                    },
                    response: None,
                    response_body: None,
                    body_base64: false,
                    error: None,
                    duration_ms: None,
                });
                None
            }
            "Network.responseReceived" => {
                let response = &params["response"];
                let headers = header_pairs(&response["headers"]);
                let content_length = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.parse().ok());
                if let Some(entry) = self.entries.lock().get_mut(&request_id) {
                    entry.response = Some(ResponseRecord {
                        status: response["status"].as_i64().unwrap_or(0),
                        status_text: response["statusText"]
                            .as_str()
                            .unwrap_or_default()
                            .to_string(),
                        headers,
                        mime_type: response["mimeType"].as_str().unwrap_or_default().to_string(),
                        content_length,
                        timing: response.get("timing").cloned(),
                    });
                }
                None
            }
            "Network.loadingFinished" => {
                let finished_ts = params["timestamp"].as_f64().unwrap_or(0.0) * 1000.0;
                {
                    let mut store = self.entries.lock();
                    let entry = store.get_mut(&request_id)?;
                    entry.duration_ms = Some((finished_ts - entry.request.ts).max(0.0));
                }
                let _ = self.events.send(RecorderEvent::RequestFinished {
                    request_id: request_id.clone(),
                });
                Some(FollowUp::FetchBody(request_id))
            }
            "Network.loadingFailed" => {
                let finished_ts = params["timestamp"].as_f64().unwrap_or(0.0) * 1000.0;
                {
                    let mut store = self.entries.lock();
                    let entry = store.get_mut(&request_id)?;
                    entry.error = Some(
                        params["errorText"]
                            .as_str()
                            .unwrap_or("loading failed")
                            .to_string(),
                    );
                    entry.duration_ms = Some((finished_ts - entry.request.ts).max(0.0));
                }
                let _ = self.events.send(RecorderEvent::RequestFailed {
                    request_id: request_id.clone(),
                });
                let _ = self
                    .events
                    .send(RecorderEvent::RequestFinished { request_id });
                None
            }
            _ => None,
        }
    }

    fn attach_body(&self, request_id: &str, body: String, base64: bool) {
        if let Some(entry) = self.entries.lock().get_mut(request_id) {
            entry.response_body = Some(body);
            entry.body_base64 = base64;
        }
    }
}

pub struct NetworkRecorder {
    mux: Arc<CdpMux>,
    shared: Arc<RecorderShared>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkRecorder {
    /// Subscribe to the mux. The subscription is permanent; the `recording`
    /// flag decides whether events are ingested.
    pub fn new(mux: Arc<CdpMux>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(RecorderShared {
            recording: AtomicBool::new(false),
            entries: Mutex::new(EntryStore::default()),
            events,
        });

        let recorder = Arc::new(Self {
            mux: mux.clone(),
            shared: shared.clone(),
            pump: Mutex::new(None),
        });

        let mut rx = mux.subscribe();
        let pump_mux = mux;
        let pump_shared = shared;
        let task = tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "network recorder lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !event.method.starts_with("Network.") {
                    continue;
                }
                if let Some(FollowUp::FetchBody(id)) =
                    pump_shared.ingest(&event.method, &event.params)
                {
                    // bodies are unavailable for 204s and redirects; ignore
                    match pump_mux
                        .send("Network.getResponseBody", json!({ "requestId": id }))
                        .await
                    {
                        Ok(result) => {
                            if let Some(body) = result["body"].as_str() {
                                pump_shared.attach_body(
                                    &id,
                                    body.to_string(),
                                    result["base64Encoded"].as_bool().unwrap_or(false),
                                );
                            }
                        }
                        Err(err) => debug!(%err, request = %id, "response body unavailable"),
                    }
                }
            }
        });
        *recorder.pump.lock() = Some(task);
        recorder
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.shared.events.subscribe()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::Relaxed)
    }

    /// Enable the Network domain with generous buffers and start ingesting.
    pub async fn start(&self) -> CdpResult<()> {
        self.mux
            .send(
                "Network.enable",
                json!({
                    "maxTotalBufferSize": MAX_TOTAL_BUFFER,
                    "maxResourceBufferSize": MAX_RESOURCE_BUFFER,
                }),
            )
            .await?;
        self.shared.recording.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stop ingesting and disable the domain. Entries are retained.
    pub async fn stop(&self) -> CdpResult<()> {
        self.shared.recording.store(false, Ordering::Relaxed);
        self.mux.send("Network.disable", json!({})).await?;
        Ok(())
    }

    pub fn clear(&self) {
        self.shared.entries.lock().clear();
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> Vec<NetworkEntry> {
        self.shared.entries.lock().snapshot()
    }

    pub fn count(&self) -> usize {
        self.shared.entries.lock().order.len()
    }

    /// HAR v1.2 document; only entries with a response are emitted.
    pub fn export_har(&self) -> Har {
        har::export(&self.entries())
    }

    pub fn stop_pump(&self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }
}

fn header_pairs(headers: &Value) -> Vec<(String, String)> {
    headers
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(name, value)| {
                    let rendered = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (name.clone(), rendered)
                })
                .collect()
        })
        .unwrap_or_default()
}
