//! DevTools target discovery over the HTTP endpoint.

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::{CdpError, CdpResult};

/// Resolve the WebSocket debugger URL for the browser behind `base_url`.
///
/// `/json/version` is preferred when it advertises a
/// `webSocketDebuggerUrl`; otherwise the first `"page"` entry of
/// `/json/list` wins. `configured_host` is the host the caller actually
/// dials; when the browser reports `localhost` but we reach it through a
/// tunnel under another name, the hostname is rewritten.
pub async fn discover_ws_url(base_url: &str, configured_host: &str) -> CdpResult<String> {
    let client = reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(2))
        .timeout(std::time::Duration::from_secs(2))
        .build()
        .map_err(|err| CdpError::Http(err.to_string()))?;
    let base = base_url.trim_end_matches('/');

    let version: Value = client
        .get(format!("{base}/json/version"))
        .send()
        .await
        .map_err(|err| CdpError::Http(err.to_string()))?
        .json()
        .await
        .map_err(|err| CdpError::Http(err.to_string()))?;

    if let Some(ws) = version.get("webSocketDebuggerUrl").and_then(Value::as_str) {
        return Ok(rewrite_tunneled_host(ws, configured_host));
    }

    let list: Value = client
        .get(format!("{base}/json/list"))
        .send()
        .await
        .map_err(|err| CdpError::Http(err.to_string()))?
        .json()
        .await
        .map_err(|err| CdpError::Http(err.to_string()))?;

    let targets = list.as_array().cloned().unwrap_or_default();
    let page = targets.iter().find(|target| {
        target.get("type").and_then(Value::as_str) == Some("page")
            && target.get("webSocketDebuggerUrl").is_some()
    });

    match page.and_then(|t| t.get("webSocketDebuggerUrl")).and_then(Value::as_str) {
        Some(ws) => Ok(rewrite_tunneled_host(ws, configured_host)),
        None => Err(CdpError::NoTarget),
    }
}

/// The browser reports `localhost` in its own URLs; when the client dials a
/// different host (tunneled access) the hostname must follow suit.
pub fn rewrite_tunneled_host(ws_url: &str, configured_host: &str) -> String {
    if configured_host == "localhost" || configured_host == "127.0.0.1" {
        return ws_url.to_string();
    }
    let Ok(mut parsed) = Url::parse(ws_url) else {
        return ws_url.to_string();
    };
    if parsed.host_str() == Some("localhost") || parsed.host_str() == Some("127.0.0.1") {
        if parsed.set_host(Some(configured_host)).is_ok() {
            debug!(url = %parsed, "rewrote tunneled devtools host");
            return parsed.to_string();
        }
    }
    ws_url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localhost_client_keeps_url_untouched() {
        let ws = "ws://localhost:9222/devtools/browser/abc";
        assert_eq!(rewrite_tunneled_host(ws, "localhost"), ws);
        assert_eq!(rewrite_tunneled_host(ws, "127.0.0.1"), ws);
    }

    #[test]
    fn tunneled_client_rewrites_localhost() {
        let ws = "ws://localhost:9222/devtools/browser/abc";
        assert_eq!(
            rewrite_tunneled_host(ws, "jump.example.net"),
            "ws://jump.example.net:9222/devtools/browser/abc"
        );
    }

    #[test]
    fn non_localhost_urls_are_left_alone() {
        let ws = "ws://10.0.0.7:9222/devtools/browser/abc";
        assert_eq!(rewrite_tunneled_host(ws, "jump.example.net"), ws);
    }
}
