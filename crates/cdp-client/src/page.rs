//! Page/Runtime/DOM domain adapter: navigation with load-state waiters,
//! history, screenshots, evaluation, and element plumbing.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CdpError, CdpResult};
use crate::mux::{CdpEvent, CdpMux};

const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);
const SELECTOR_POLL: Duration = Duration::from_millis(100);

/// Load state a navigation waits for.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WaitUntil {
    DomContentLoaded,
    #[default]
    Load,
    NetworkIdle,
}

impl WaitUntil {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "domcontentloaded" => Some(Self::DomContentLoaded),
            "load" => Some(Self::Load),
            "networkidle" => Some(Self::NetworkIdle),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NavigateOptions {
    pub wait_until: WaitUntil,
    pub timeout: Duration,
}

impl Default for NavigateOptions {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::Load,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ScreenshotFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

impl ScreenshotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScreenshotFormat::Png => "png",
            ScreenshotFormat::Jpeg => "jpeg",
            ScreenshotFormat::Webp => "webp",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "png" => Some(Self::Png),
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ScreenshotOptions {
    pub format: ScreenshotFormat,
    /// Applies to jpeg and webp only.
    pub quality: Option<u8>,
    pub full_page: bool,
}

pub struct PageAdapter {
    mux: Arc<CdpMux>,
}

impl PageAdapter {
    /// Construct the adapter and run the enable step: `Page`, `Runtime`, and
    /// `DOM` domains all have to come up.
    pub async fn attach(mux: Arc<CdpMux>) -> CdpResult<Self> {
        let adapter = Self { mux };
        tokio::try_join!(
            adapter.mux.send("Page.enable", json!({})),
            adapter.mux.send("Runtime.enable", json!({})),
            adapter.mux.send("DOM.enable", json!({})),
        )?;
        Ok(adapter)
    }

    /// Navigate and wait for the requested load state. A waiter timeout does
    /// not cancel the in-flight navigation.
    pub async fn navigate(&self, url: &str, opts: NavigateOptions) -> CdpResult<()> {
        // subscribe before sending so a fast load event cannot be missed
        let events = self.mux.subscribe();

        let result = self.mux.send("Page.navigate", json!({ "url": url })).await?;
        if let Some(error_text) = result.get("errorText").and_then(Value::as_str) {
            if !error_text.is_empty() {
                return Err(CdpError::NavFailed(error_text.to_string()));
            }
        }

        self.wait_for_load_state(events, opts).await
    }

    /// Reload the current page; accepts the same wait options as `navigate`.
    pub async fn reload(&self, opts: NavigateOptions) -> CdpResult<()> {
        let events = self.mux.subscribe();
        self.mux.send("Page.reload", json!({})).await?;
        self.wait_for_load_state(events, opts).await
    }

    /// Step back in history; a no-op at the oldest entry. Returns the URL
    /// navigated to, if any.
    pub async fn back(&self) -> CdpResult<Option<String>> {
        self.history_step(-1).await
    }

    /// Step forward in history; a no-op at the newest entry.
    pub async fn forward(&self) -> CdpResult<Option<String>> {
        self.history_step(1).await
    }

    /// URL and title of the current history entry.
    pub async fn current_entry(&self) -> CdpResult<(String, String)> {
        let history = self
            .mux
            .send("Page.getNavigationHistory", json!({}))
            .await?;
        let index = history["currentIndex"].as_i64().unwrap_or(0);
        let entry = history["entries"].get(index as usize).cloned().unwrap_or(Value::Null);
        Ok((
            entry["url"].as_str().unwrap_or_default().to_string(),
            entry["title"].as_str().unwrap_or_default().to_string(),
        ))
    }

    /// Capture a screenshot; bytes are returned decoded.
    pub async fn screenshot(&self, opts: ScreenshotOptions) -> CdpResult<Vec<u8>> {
        let mut params = json!({ "format": opts.format.as_str() });
        if let Some(quality) = opts.quality {
            if matches!(opts.format, ScreenshotFormat::Jpeg | ScreenshotFormat::Webp) {
                params["quality"] = json!(quality);
            }
        }

        if opts.full_page {
            let metrics = self.mux.send("Page.getLayoutMetrics", json!({})).await?;
            let content = &metrics["contentSize"];
            params["clip"] = json!({
                "x": 0,
                "y": 0,
                "width": content["width"].as_f64().unwrap_or(0.0),
                "height": content["height"].as_f64().unwrap_or(0.0),
                "scale": 1,
            });
            params["captureBeyondViewport"] = json!(true);
        }

        let result = self.mux.send("Page.captureScreenshot", params).await?;
        let data = result["data"].as_str().unwrap_or_default();
        BASE64
            .decode(data)
            .map_err(|err| CdpError::Protocol {
                method: "Page.captureScreenshot".into(),
                code: 0,
                message: format!("undecodable screenshot payload: {err}"),
            })
    }

    /// Evaluate an expression in the page, awaiting promises and returning
    /// the value by copy.
    pub async fn evaluate(&self, expression: &str) -> CdpResult<Value> {
        let result = self
            .mux
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(details) = result.get("exceptionDetails") {
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("evaluation raised");
            return Err(CdpError::EvalFailed(text.to_string()));
        }
        Ok(result["result"]["value"].clone())
    }

    /// Resolve a selector to a node id; `None` when nothing matches.
    pub async fn query_selector(&self, selector: &str) -> CdpResult<Option<i64>> {
        let document = self.mux.send("DOM.getDocument", json!({ "depth": 0 })).await?;
        let root = document["root"]["nodeId"].as_i64().unwrap_or(0);
        let found = self
            .mux
            .send(
                "DOM.querySelector",
                json!({ "nodeId": root, "selector": selector }),
            )
            .await?;
        match found["nodeId"].as_i64() {
            Some(0) | None => Ok(None),
            Some(node_id) => Ok(Some(node_id)),
        }
    }

    /// Poll for a selector until it resolves or the timeout expires.
    pub async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> CdpResult<i64> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(node_id) = self.query_selector(selector).await? {
                return Ok(node_id);
            }
            if Instant::now() >= deadline {
                return Err(CdpError::Timeout(format!("waitForSelector {selector}")));
            }
            tokio::time::sleep(SELECTOR_POLL).await;
        }
    }

    /// Click the center of the first element matching the selector.
    pub async fn click(&self, selector: &str) -> CdpResult<()> {
        let node_id = self
            .query_selector(selector)
            .await?
            .ok_or_else(|| CdpError::EvalFailed(format!("no element matches {selector}")))?;

        let box_model = self
            .mux
            .send("DOM.getBoxModel", json!({ "nodeId": node_id }))
            .await?;
        let quad = box_model["model"]["content"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let (x, y) = quad_center(&quad);

        for kind in ["mousePressed", "mouseReleased"] {
            self.mux
                .send(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": kind,
                        "x": x,
                        "y": y,
                        "button": "left",
                        "clickCount": 1,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Type text into the focused element.
    pub async fn type_text(&self, text: &str) -> CdpResult<()> {
        self.mux
            .send("Input.insertText", json!({ "text": text }))
            .await?;
        Ok(())
    }

    /// Override the viewport dimensions.
    pub async fn set_viewport(&self, width: u32, height: u32) -> CdpResult<()> {
        self.mux
            .send(
                "Emulation.setDeviceMetricsOverride",
                json!({
                    "width": width,
                    "height": height,
                    "deviceScaleFactor": 1,
                    "mobile": false,
                }),
            )
            .await?;
        Ok(())
    }

    async fn history_step(&self, delta: i64) -> CdpResult<Option<String>> {
        let history = self
            .mux
            .send("Page.getNavigationHistory", json!({}))
            .await?;
        let index = history["currentIndex"].as_i64().unwrap_or(0);
        let entries = history["entries"].as_array().cloned().unwrap_or_default();

        let target = index + delta;
        if target < 0 || target as usize >= entries.len() {
            return Ok(None);
        }
        let entry = &entries[target as usize];
        let entry_id = entry["id"].as_i64().unwrap_or(0);
        let url = entry["url"].as_str().unwrap_or_default().to_string();

        let events = self.mux.subscribe();
        self.mux
            .send(
                "Page.navigateToHistoryEntry",
                json!({ "entryId": entry_id }),
            )
            .await?;
        self.wait_for_load_state(
            events,
            NavigateOptions {
                wait_until: WaitUntil::Load,
                ..NavigateOptions::default()
            },
        )
        .await?;
        Ok(Some(url))
    }

    async fn wait_for_load_state(
        &self,
        events: broadcast::Receiver<CdpEvent>,
        opts: NavigateOptions,
    ) -> CdpResult<()> {
        let deadline = Instant::now() + opts.timeout;
        match opts.wait_until {
            WaitUntil::DomContentLoaded => {
                wait_for_event(events, "Page.domContentEventFired", deadline).await
            }
            WaitUntil::Load => wait_for_event(events, "Page.loadEventFired", deadline).await,
            WaitUntil::NetworkIdle => wait_for_network_idle(events, deadline).await,
        }
    }
}

async fn wait_for_event(
    mut events: broadcast::Receiver<CdpEvent>,
    method: &str,
    deadline: Instant,
) -> CdpResult<()> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(CdpError::NavTimeout);
        }
        match tokio::time::timeout(deadline - now, events.recv()).await {
            Ok(Ok(event)) if event.method == method => return Ok(()),
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "event waiter lagged");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return Err(CdpError::TransportClosed),
            Err(_) => return Err(CdpError::NavTimeout),
        }
    }
}

/// Idle means half a second with no `Network.*` traffic. The receiver is
/// dropped on return, so nothing stays installed on the mux.
async fn wait_for_network_idle(
    mut events: broadcast::Receiver<CdpEvent>,
    deadline: Instant,
) -> CdpResult<()> {
    let mut last_activity = Instant::now();
    loop {
        let now = Instant::now();
        if now.duration_since(last_activity) >= NETWORK_IDLE_WINDOW {
            return Ok(());
        }
        if now >= deadline {
            return Err(CdpError::NavTimeout);
        }

        let slice = (last_activity + NETWORK_IDLE_WINDOW - now).min(deadline - now);
        match tokio::time::timeout(slice, events.recv()).await {
            Ok(Ok(event)) => {
                if event.method.starts_with("Network.") {
                    last_activity = Instant::now();
                }
            }
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                last_activity = Instant::now();
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => return Err(CdpError::TransportClosed),
            Err(_) => {}
        }
    }
}

fn quad_center(quad: &[Value]) -> (f64, f64) {
    let numbers: Vec<f64> = quad.iter().filter_map(Value::as_f64).collect();
    if numbers.len() < 8 {
        return (0.0, 0.0);
    }
    let xs = [numbers[0], numbers[2], numbers[4], numbers[6]];
    let ys = [numbers[1], numbers[3], numbers[5], numbers[7]];
    (
        xs.iter().sum::<f64>() / 4.0,
        ys.iter().sum::<f64>() / 4.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::CdpMuxOptions;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    /// Scripted DevTools double covering the Page/Runtime/DOM surface the
    /// adapter exercises.
    async fn spawn_fake_page() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(socket).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let req: Value = serde_json::from_str(&text).unwrap();
                        let id = req["id"].as_u64().unwrap();
                        let method = req["method"].as_str().unwrap();
                        let params = req["params"].clone();

                        let mut follow_ups: Vec<Value> = Vec::new();
                        let result = match method {
                            "Page.navigate" => {
                                let url = params["url"].as_str().unwrap_or_default();
                                if url.contains("bad-host") {
                                    json!({ "errorText": "net::ERR_NAME_NOT_RESOLVED" })
                                } else {
                                    follow_ups.push(json!({
                                        "method": "Page.domContentEventFired",
                                        "params": { "timestamp": 1.0 }
                                    }));
                                    follow_ups.push(json!({
                                        "method": "Page.loadEventFired",
                                        "params": { "timestamp": 1.1 }
                                    }));
                                    json!({ "frameId": "frame-1" })
                                }
                            }
                            "Page.navigateToHistoryEntry" => {
                                follow_ups.push(json!({
                                    "method": "Page.loadEventFired",
                                    "params": { "timestamp": 2.0 }
                                }));
                                json!({})
                            }
                            "Page.getNavigationHistory" => json!({
                                "currentIndex": 1,
                                "entries": [
                                    { "id": 11, "url": "https://one.test/", "title": "One" },
                                    { "id": 22, "url": "https://two.test/", "title": "Two" },
                                ],
                            }),
                            "Page.getLayoutMetrics" => json!({
                                "contentSize": { "x": 0, "y": 0, "width": 1200.0, "height": 3000.0 }
                            }),
                            "Page.captureScreenshot" => {
                                // remember the clip for the fullPage assertion
                                let tagged = params.get("clip").is_some()
                                    && params["captureBeyondViewport"] == json!(true);
                                let mut bytes = PNG_MAGIC.to_vec();
                                bytes.push(u8::from(tagged));
                                json!({ "data": BASE64.encode(bytes) })
                            }
                            "Runtime.evaluate" => {
                                let expr = params["expression"].as_str().unwrap_or_default();
                                if expr.contains("throw") {
                                    json!({
                                        "exceptionDetails": { "text": "Uncaught boom" },
                                        "result": { "type": "object" },
                                    })
                                } else {
                                    json!({ "result": { "type": "number", "value": 2 } })
                                }
                            }
                            "DOM.getDocument" => json!({ "root": { "nodeId": 1 } }),
                            "DOM.querySelector" => {
                                let hit = params["selector"].as_str() == Some("#hit");
                                json!({ "nodeId": if hit { 7 } else { 0 } })
                            }
                            "DOM.getBoxModel" => json!({
                                "model": { "content": [10.0, 20.0, 110.0, 20.0, 110.0, 70.0, 10.0, 70.0] }
                            }),
                            _ => json!({}),
                        };

                        let frame = json!({ "id": id, "result": result });
                        ws.send(Message::Text(frame.to_string())).await.unwrap();
                        for event in follow_ups {
                            ws.send(Message::Text(event.to_string())).await.unwrap();
                        }
                    }
                });
            }
        });
        format!("ws://{addr}")
    }

    async fn adapter() -> PageAdapter {
        let url = spawn_fake_page().await;
        let mux = CdpMux::new(CdpMuxOptions::default());
        mux.connect(&url).await.unwrap();
        PageAdapter::attach(mux).await.unwrap()
    }

    #[tokio::test]
    async fn navigate_waits_for_load() {
        let page = adapter().await;
        page.navigate("https://one.test/", NavigateOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn navigate_waits_for_domcontentloaded() {
        let page = adapter().await;
        page.navigate(
            "https://one.test/",
            NavigateOptions {
                wait_until: WaitUntil::DomContentLoaded,
                ..NavigateOptions::default()
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn navigate_error_text_surfaces_as_nav_failed() {
        let page = adapter().await;
        let err = page
            .navigate("https://bad-host.test/", NavigateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "page/nav-failed");
    }

    #[tokio::test]
    async fn network_idle_resolves_after_quiet_window() {
        let page = adapter().await;
        let started = Instant::now();
        page.navigate(
            "https://one.test/",
            NavigateOptions {
                wait_until: WaitUntil::NetworkIdle,
                timeout: Duration::from_secs(5),
            },
        )
        .await
        .unwrap();
        assert!(started.elapsed() >= NETWORK_IDLE_WINDOW);
    }

    #[tokio::test]
    async fn back_navigates_to_previous_entry() {
        let page = adapter().await;
        let url = page.back().await.unwrap();
        assert_eq!(url.as_deref(), Some("https://one.test/"));
    }

    #[tokio::test]
    async fn forward_at_newest_entry_is_a_no_op() {
        let page = adapter().await;
        assert!(page.forward().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn screenshot_decodes_to_png_bytes() {
        let page = adapter().await;
        let bytes = page
            .screenshot(ScreenshotOptions::default())
            .await
            .unwrap();
        assert_eq!(&bytes[..8], &PNG_MAGIC);
        // viewport capture: no clip applied
        assert_eq!(bytes[8], 0);
    }

    #[tokio::test]
    async fn full_page_screenshot_sends_content_clip() {
        let page = adapter().await;
        let bytes = page
            .screenshot(ScreenshotOptions {
                full_page: true,
                ..ScreenshotOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(bytes[8], 1);
    }

    #[tokio::test]
    async fn evaluate_returns_value_and_maps_exceptions() {
        let page = adapter().await;
        let value = page.evaluate("1+1").await.unwrap();
        assert_eq!(value, json!(2));

        let err = page.evaluate("throw new Error('boom')").await.unwrap_err();
        assert_eq!(err.code(), "page/eval-failed");
    }

    #[tokio::test]
    async fn selector_resolution_and_click() {
        let page = adapter().await;
        assert_eq!(page.query_selector("#hit").await.unwrap(), Some(7));
        assert_eq!(page.query_selector("#miss").await.unwrap(), None);
        page.click("#hit").await.unwrap();

        let err = page.click("#miss").await.unwrap_err();
        assert_eq!(err.code(), "page/eval-failed");
    }

    #[tokio::test]
    async fn wait_for_selector_times_out_on_absent_node() {
        let page = adapter().await;
        let err = page
            .wait_for_selector("#miss", Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cdp/timeout");
    }

    #[test]
    fn quad_center_averages_the_corners() {
        let quad: Vec<Value> = [10.0, 20.0, 110.0, 20.0, 110.0, 70.0, 10.0, 70.0]
            .iter()
            .map(|n| json!(n))
            .collect();
        assert_eq!(quad_center(&quad), (60.0, 45.0));
    }
}
