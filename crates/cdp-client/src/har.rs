//! HTTP Archive v1.2 rendering of recorded network entries.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::recorder::NetworkEntry;

const HAR_VERSION: &str = "1.2";
const DEFAULT_POST_MIME: &str = "application/octet-stream";

#[derive(Clone, Debug, Serialize)]
pub struct Har {
    pub log: HarLog,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarLog {
    pub version: String,
    pub creator: HarCreator,
    pub entries: Vec<HarEntry>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarCreator {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    pub started_date_time: String,
    /// Total elapsed milliseconds.
    pub time: f64,
    pub request: HarRequest,
    pub response: HarResponse,
    pub cache: serde_json::Value,
    pub timings: HarTimings,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarRequest {
    pub method: String,
    pub url: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub query_string: Vec<HarHeader>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<HarPostData>,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarResponse {
    pub status: i64,
    pub status_text: String,
    pub http_version: String,
    pub headers: Vec<HarHeader>,
    pub content: HarContent,
    #[serde(rename = "redirectURL")]
    pub redirect_url: String,
    pub headers_size: i64,
    pub body_size: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarHeader {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarPostData {
    pub mime_type: String,
    pub text: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarContent {
    pub size: i64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HarTimings {
    pub send: f64,
    pub wait: f64,
    pub receive: f64,
}

/// Render entries into a HAR document. Entries without a response (failed or
/// still in flight) are skipped.
pub fn export(entries: &[NetworkEntry]) -> Har {
    let har_entries = entries
        .iter()
        .filter_map(|entry| {
            entry
                .response
                .as_ref()
                .map(|response| render_entry(entry, response))
        })
        .collect();

    Har {
        log: HarLog {
            version: HAR_VERSION.to_string(),
            creator: HarCreator {
                name: "outpost".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            entries: har_entries,
        },
    }
}

fn render_entry(entry: &NetworkEntry, response: &crate::recorder::ResponseRecord) -> HarEntry {
    let time = entry.duration_ms.unwrap_or(0.0);

    let post_data = entry.request.post_data.as_ref().map(|text| HarPostData {
        mime_type: entry
            .request
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone())
            .unwrap_or_else(|| DEFAULT_POST_MIME.to_string()),
        text: text.clone(),
    });

    let content_size = response
        .content_length
        .or_else(|| entry.response_body.as_ref().map(|body| body.len() as i64))
        .unwrap_or(0);

    HarEntry {
        started_date_time: started_at(entry),
        time,
        request: HarRequest {
            method: entry.request.method.clone(),
            url: entry.request.url.clone(),
            http_version: "HTTP/1.1".to_string(),
            headers: headers_of(&entry.request.headers),
            query_string: Vec::new(),
            post_data,
            headers_size: -1,
            body_size: entry
                .request
                .post_data
                .as_ref()
                .map(|data| data.len() as i64)
                .unwrap_or(0),
        },
        response: HarResponse {
            status: response.status,
            status_text: response.status_text.clone(),
            http_version: "HTTP/1.1".to_string(),
            headers: headers_of(&response.headers),
            content: HarContent {
                size: content_size,
                mime_type: response.mime_type.clone(),
                text: entry.response_body.clone(),
                encoding: entry.body_base64.then(|| "base64".to_string()),
            },
            redirect_url: String::new(),
            headers_size: -1,
            body_size: content_size,
        },
        cache: serde_json::json!({}),
        timings: HarTimings {
            send: 0.0,
            wait: time,
            receive: 0.0,
        },
    }
}

fn headers_of(pairs: &[(String, String)]) -> Vec<HarHeader> {
    pairs
        .iter()
        .map(|(name, value)| HarHeader {
            name: name.clone(),
            value: value.clone(),
        })
        .collect()
}

fn started_at(entry: &NetworkEntry) -> String {
    let stamp = entry
        .request
        .wall_time
        .and_then(|seconds| DateTime::<Utc>::from_timestamp_millis((seconds * 1000.0) as i64))
        .unwrap_or_else(Utc::now);
    stamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{RequestRecord, ResponseRecord};

    fn finished_entry(id: &str) -> NetworkEntry {
        NetworkEntry {
            request_id: id.to_string(),
            request: RequestRecord {
                method: "GET".into(),
                url: "https://example.com/data".into(),
                // deliberately not alphabetical, so an order test can tell
                // wire order from a sort
                headers: vec![
                    ("X-Trace".into(), "1".into()),
                    ("Accept".into(), "application/json".into()),
                ],
                post_data: None,
                ts: 1000.0,
                wall_time: Some(1_700_000_000.0),
                resource_type: Some("XHR".into()),
            },
            response: Some(ResponseRecord {
                status: 200,
                status_text: "OK".into(),
                headers: vec![("Content-Type".into(), "application/json".into())],
                mime_type: "application/json".into(),
                content_length: Some(13),
                timing: None,
            }),
            response_body: Some(r#"{"ok":true}"#.into()),
            body_base64: false,
            error: None,
            duration_ms: Some(120.0),
        }
    }

    fn failed_entry(id: &str) -> NetworkEntry {
        let mut entry = finished_entry(id);
        entry.response = None;
        entry.response_body = None;
        entry.error = Some("net::ERR_FAILED".into());
        entry
    }

    #[test]
    fn only_responded_entries_are_exported() {
        let har = export(&[finished_entry("a"), failed_entry("b"), finished_entry("c")]);
        assert_eq!(har.log.entries.len(), 2);
        assert_eq!(har.log.version, "1.2");
        assert_eq!(har.log.creator.name, "outpost");
    }

    #[test]
    fn headers_keep_their_order() {
        let har = export(&[finished_entry("a")]);
        let names: Vec<&str> = har.log.entries[0]
            .request
            .headers
            .iter()
            .map(|header| header.name.as_str())
            .collect();
        assert_eq!(names, ["X-Trace", "Accept"]);
    }

    #[test]
    fn post_mime_defaults_to_octet_stream() {
        let mut entry = finished_entry("a");
        entry.request.method = "POST".into();
        entry.request.post_data = Some("payload".into());
        let har = export(&[entry]);
        let post = har.log.entries[0].request.post_data.as_ref().unwrap();
        assert_eq!(post.mime_type, DEFAULT_POST_MIME);

        let mut entry = finished_entry("b");
        entry.request.post_data = Some("{}".into());
        entry
            .request
            .headers
            .push(("Content-Type".into(), "application/json".into()));
        let har = export(&[entry]);
        let post = har.log.entries[0].request.post_data.as_ref().unwrap();
        assert_eq!(post.mime_type, "application/json");
    }

    #[test]
    fn body_and_timing_are_carried() {
        let har = export(&[finished_entry("a")]);
        let rendered = &har.log.entries[0];
        assert_eq!(rendered.time, 120.0);
        assert_eq!(rendered.response.content.text.as_deref(), Some(r#"{"ok":true}"#));
        assert_eq!(rendered.response.status, 200);
        assert!(rendered.started_date_time.starts_with("2023-11-14T22:13:20"));
    }

    #[test]
    fn serialized_document_uses_har_field_names() {
        let har = export(&[finished_entry("a")]);
        let json = serde_json::to_value(&har).unwrap();
        assert!(json["log"]["entries"][0]["startedDateTime"].is_string());
        assert!(json["log"]["entries"][0]["response"]["content"]["mimeType"].is_string());
        assert_eq!(json["log"]["entries"][0]["response"]["redirectURL"], "");
    }
}
