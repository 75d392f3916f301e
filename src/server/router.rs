//! JSON API routes.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use outpost_cdp_client::{NavigateOptions, ScreenshotFormat, ScreenshotOptions, WaitUntil};
use outpost_core_types::{AuthMethod, ConnectionDescriptor, ConnectionId};
use outpost_session_kernel::SessionConfig;

use crate::errors::{ApiError, ApiResult};
use crate::server::events::events_ws;
use crate::server::state::AppState;
use crate::CONSOLE_HTML;

const SECRET_SENTINEL: &str = "********";
const TEST_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { axum::response::Html(CONSOLE_HTML) }))
        .route("/api/connections", get(list_connections).post(add_connection))
        .route(
            "/api/connections/:id",
            put(update_connection).delete(delete_connection),
        )
        .route("/api/connections/:id/test", post(test_connection))
        .route("/api/session/start", post(session_start))
        .route("/api/session/stop", post(session_stop))
        .route("/api/session/status", get(session_status))
        .route("/api/browser/navigate", post(browser_navigate))
        .route("/api/browser/back", post(browser_back))
        .route("/api/browser/forward", post(browser_forward))
        .route("/api/browser/reload", post(browser_reload))
        .route("/api/browser/screenshot", post(browser_screenshot))
        .route("/api/browser/evaluate", post(browser_evaluate))
        .route("/api/network/start", post(network_start))
        .route("/api/network/stop", post(network_stop))
        .route("/api/network/clear", post(network_clear))
        .route("/api/network/entries", get(network_entries))
        .route("/api/network/export", get(network_export))
        .route("/api/events", get(events_ws))
        .layer(cors)
        .with_state(state)
}

/// Replace secret fields with the fixed sentinel before a descriptor leaves
/// the process.
pub fn redacted(descriptor: &ConnectionDescriptor) -> Value {
    let mut value = serde_json::to_value(descriptor).unwrap_or_else(|_| json!({}));
    if let Some(object) = value.as_object_mut() {
        for secret in ["password", "passphrase"] {
            if object.contains_key(secret) {
                object.insert(secret.to_string(), json!(SECRET_SENTINEL));
            }
        }
    }
    value
}

// ---- connections ----

async fn list_connections(State(state): State<AppState>) -> Json<Value> {
    let connections: Vec<Value> = state.config.list().iter().map(redacted).collect();
    Json(json!({ "connections": connections }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewConnection {
    name: String,
    host: String,
    port: Option<u16>,
    username: String,
    password: Option<String>,
    key_path: Option<String>,
    passphrase: Option<String>,
}

async fn add_connection(
    State(state): State<AppState>,
    Json(body): Json<NewConnection>,
) -> ApiResult<impl IntoResponse> {
    let auth = match (body.password, body.key_path) {
        (Some(password), None) => AuthMethod::Password { password },
        (None, Some(key_path)) => AuthMethod::PrivateKey {
            key_path,
            passphrase: body.passphrase,
        },
        _ => return Err(ApiError::validation("auth")),
    };
    let id = state.config.add(ConnectionDescriptor {
        id: ConnectionId::new(),
        name: body.name,
        host: body.host,
        port: body.port.unwrap_or(22),
        username: body.username,
        auth,
    })?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn update_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<crate::config::ConnectionPatch>,
) -> ApiResult<Json<Value>> {
    state.config.update(&ConnectionId(id), patch)?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.config.remove(&ConnectionId(id))?;
    Ok(Json(json!({ "success": true })))
}

async fn test_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let descriptor = state.config.get(&ConnectionId(id))?;
    let outcome = async {
        let transport = state.pool.acquire(&descriptor).await?;
        transport.exec_checked("echo ok", TEST_EXEC_TIMEOUT).await
    }
    .await;

    match outcome {
        Ok(_) => Ok(Json(json!({ "success": true, "message": "connection ok" }))),
        Err(err) => Ok(Json(json!({ "success": false, "message": err.to_string() }))),
    }
}

// ---- session ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    connection_id: String,
    headless: Option<bool>,
    local_port: Option<u16>,
    remote_port: Option<u16>,
}

async fn session_start(
    State(state): State<AppState>,
    Json(body): Json<StartBody>,
) -> ApiResult<Json<Value>> {
    let descriptor = state.config.get(&ConnectionId(body.connection_id))?;

    let mut browser = state.config.browser_settings();
    if let Some(headless) = body.headless {
        browser.headless = headless;
    }
    if let Some(remote_port) = body.remote_port {
        browser.remote_debug_port = remote_port;
    }
    let defaults = state.config.port_forward_defaults();

    let config = SessionConfig {
        local_host: defaults.local_host,
        local_port: body.local_port.unwrap_or(defaults.local_port),
        remote_port: body.remote_port.unwrap_or(browser.remote_debug_port),
        descriptor: descriptor.clone(),
        browser,
    };

    let session_state = state.orchestrator.start(config).await?;
    let _ = state.config.set_last_connection_id(&descriptor.id);
    Ok(Json(json!({ "success": true, "state": session_state })))
}

async fn session_stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.orchestrator.stop().await?;
    Ok(Json(json!({ "success": true })))
}

async fn session_status(State(state): State<AppState>) -> Json<Value> {
    let active = state.orchestrator.active().is_some();
    Json(json!({
        "active": active,
        "state": if active { json!(state.orchestrator.state()) } else { Value::Null },
    }))
}

// ---- browser ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NavigateBody {
    url: String,
    wait_until: Option<String>,
    /// Milliseconds.
    timeout: Option<u64>,
}

async fn browser_navigate(
    State(state): State<AppState>,
    Json(body): Json<NavigateBody>,
) -> ApiResult<Json<Value>> {
    let page = state.orchestrator.page().ok_or_else(ApiError::no_session)?;

    let mut opts = NavigateOptions::default();
    if let Some(raw) = body.wait_until.as_deref() {
        opts.wait_until = WaitUntil::parse(raw).ok_or_else(|| ApiError::validation("waitUntil"))?;
    }
    if let Some(ms) = body.timeout {
        opts.timeout = Duration::from_millis(ms);
    }

    page.navigate(&body.url, opts).await?;
    let (url, title) = page.current_entry().await?;
    Ok(Json(json!({ "url": url, "title": title })))
}

async fn browser_back(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let page = state.orchestrator.page().ok_or_else(ApiError::no_session)?;
    let url = page.back().await?;
    Ok(Json(json!({ "url": url })))
}

async fn browser_forward(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let page = state.orchestrator.page().ok_or_else(ApiError::no_session)?;
    let url = page.forward().await?;
    Ok(Json(json!({ "url": url })))
}

async fn browser_reload(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let page = state.orchestrator.page().ok_or_else(ApiError::no_session)?;
    page.reload(NavigateOptions::default()).await?;
    let (url, _) = page.current_entry().await?;
    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScreenshotBody {
    format: Option<String>,
    quality: Option<u8>,
    full_page: Option<bool>,
}

async fn browser_screenshot(
    State(state): State<AppState>,
    body: Option<Json<ScreenshotBody>>,
) -> ApiResult<Json<Value>> {
    let page = state.orchestrator.page().ok_or_else(ApiError::no_session)?;
    let body = body.map(|Json(body)| body).unwrap_or_default();

    let format = match body.format.as_deref() {
        Some(raw) => ScreenshotFormat::parse(raw).ok_or_else(|| ApiError::validation("format"))?,
        None => ScreenshotFormat::Png,
    };
    let bytes = page
        .screenshot(ScreenshotOptions {
            format,
            quality: body.quality,
            full_page: body.full_page.unwrap_or(false),
        })
        .await?;

    Ok(Json(json!({
        "data": BASE64.encode(bytes),
        "format": format.as_str(),
    })))
}

#[derive(Debug, Deserialize)]
struct EvaluateBody {
    expression: String,
}

async fn browser_evaluate(
    State(state): State<AppState>,
    Json(body): Json<EvaluateBody>,
) -> ApiResult<Json<Value>> {
    let page = state.orchestrator.page().ok_or_else(ApiError::no_session)?;
    let result = page.evaluate(&body.expression).await?;
    Ok(Json(json!({ "result": result })))
}

// ---- network ----

async fn network_start(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let recorder = state
        .orchestrator
        .recorder()
        .ok_or_else(ApiError::no_session)?;
    recorder.start().await?;
    Ok(Json(json!({ "success": true })))
}

async fn network_stop(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let recorder = state
        .orchestrator
        .recorder()
        .ok_or_else(ApiError::no_session)?;
    recorder.stop().await?;
    Ok(Json(json!({ "success": true, "count": recorder.count() })))
}

async fn network_clear(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let recorder = state
        .orchestrator
        .recorder()
        .ok_or_else(ApiError::no_session)?;
    let count = recorder.count();
    recorder.clear();
    Ok(Json(json!({ "success": true, "count": count })))
}

#[derive(Debug, Deserialize)]
struct EntriesQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    #[serde(rename = "type")]
    resource_type: Option<String>,
    status: Option<i64>,
}

async fn network_entries(
    State(state): State<AppState>,
    Query(query): Query<EntriesQuery>,
) -> ApiResult<Json<Value>> {
    let recorder = state
        .orchestrator
        .recorder()
        .ok_or_else(ApiError::no_session)?;

    let filtered: Vec<_> = recorder
        .entries()
        .into_iter()
        .filter(|entry| {
            query
                .resource_type
                .as_deref()
                .map(|wanted| entry.request.resource_type.as_deref() == Some(wanted))
                .unwrap_or(true)
        })
        .filter(|entry| {
            query
                .status
                .map(|wanted| {
                    entry
                        .response
                        .as_ref()
                        .map(|response| response.status == wanted)
                        .unwrap_or(false)
                })
                .unwrap_or(true)
        })
        .collect();

    let total = filtered.len();
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(50);
    let page: Vec<_> = filtered.into_iter().skip(offset).take(limit).collect();

    Ok(Json(json!({
        "entries": page,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    format: Option<String>,
}

async fn network_export(
    State(state): State<AppState>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let recorder = state
        .orchestrator
        .recorder()
        .ok_or_else(ApiError::no_session)?;

    let (body, filename) = match query.format.as_deref().unwrap_or("har") {
        "har" => (
            serde_json::to_string_pretty(&recorder.export_har())
                .map_err(|err| ApiError::new("config/invalid", err.to_string()))?,
            "capture.har",
        ),
        "json" => (
            serde_json::to_string_pretty(&recorder.entries())
                .map_err(|err| ApiError::new("config/invalid", err.to_string()))?,
            "capture.json",
        ),
        _ => return Err(ApiError::validation("format")),
    };

    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redaction_masks_every_secret_field() {
        let with_password = ConnectionDescriptor {
            id: ConnectionId::new(),
            name: "dev".into(),
            host: "h".into(),
            port: 22,
            username: "u".into(),
            auth: AuthMethod::Password {
                password: "s3cret".into(),
            },
        };
        let value = redacted(&with_password);
        assert_eq!(value["password"], SECRET_SENTINEL);
        assert!(!value.to_string().contains("s3cret"));

        let with_key = ConnectionDescriptor {
            auth: AuthMethod::PrivateKey {
                key_path: "~/.ssh/id_rsa".into(),
                passphrase: Some("hunter2".into()),
            },
            ..with_password
        };
        let value = redacted(&with_key);
        assert_eq!(value["passphrase"], SECRET_SENTINEL);
        assert_eq!(value["keyPath"], "~/.ssh/id_rsa");
        assert!(!value.to_string().contains("hunter2"));
    }
}
