//! Confluence Cloud REST client
//!
//! Maps HTTP status codes onto the engine's error taxonomy:
//! - 401/403: `Auth`
//! - 404: `NotFound`
//! - 409 on update: `VersionConflict`
//! - 429: `RateLimited` (with `Retry-After`)
//! - 5xx and connection failures: `Transient`
//!
//! No retries happen here; wrap the client in a `RetryingClient`.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::RemoteClient;
use crate::error::{Result, SyncError};
use crate::types::{RemoteBody, RemoteConfig, RemotePage};

const USER_AGENT: &str = concat!("vaultsync/", env!("CARGO_PKG_VERSION"));

/// Content as returned by `/rest/api/content` with `expand=version,ancestors`
#[derive(Debug, Deserialize)]
struct ContentResponse {
    id: String,
    title: String,
    #[serde(default)]
    version: Option<VersionInfo>,
    #[serde(default)]
    ancestors: Vec<AncestorRef>,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    number: i64,
    #[serde(default)]
    when: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AncestorRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ContentResponse>,
}

impl From<ContentResponse> for RemotePage {
    fn from(content: ContentResponse) -> Self {
        let (version, updated_at) = match content.version {
            Some(v) => (v.number, v.when),
            None => (1, None),
        };
        RemotePage {
            id: content.id,
            title: content.title,
            // The last ancestor is the direct parent
            parent_id: content.ancestors.last().map(|a| a.id.clone()),
            version,
            updated_at,
        }
    }
}

/// Confluence API client
pub struct ConfluenceClient {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl ConfluenceClient {
    /// Create a new client. The config is validated first.
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let config = config.validated()?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn space_key(&self) -> &str {
        &self.config.space_key
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .basic_auth(&self.config.email, Some(&self.config.api_token))
            .header(header::ACCEPT, "application/json")
    }

    /// Send a request and turn error statuses into `SyncError`
    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = self.authed(builder).send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(error_from_response(response).await)
    }

    fn page_payload(
        &self,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
        version: Option<i64>,
    ) -> Value {
        let mut payload = json!({
            "type": "page",
            "title": title,
            "space": { "key": self.config.space_key },
            "body": {
                "storage": { "value": body.as_str(), "representation": "storage" }
            },
        });
        if let Some(parent) = parent_id {
            payload["ancestors"] = json!([{ "id": parent }]);
        }
        if let Some(number) = version {
            payload["version"] = json!({ "number": number });
        }
        payload
    }
}

fn retry_after_secs(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Classify a non-success status
pub(crate) fn classify_status(status: StatusCode, retry_after: Option<u64>, message: String) -> SyncError {
    match status.as_u16() {
        401 | 403 => SyncError::Auth(format!("HTTP {}: {}", status.as_u16(), message)),
        404 => SyncError::NotFound(message),
        429 => SyncError::RateLimited { retry_after },
        500..=599 => SyncError::Transient(format!("HTTP {}: {}", status.as_u16(), message)),
        code => SyncError::Remote {
            status: code,
            message,
        },
    }
}

/// Pull the most useful message out of an error body
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(500).collect())
}

async fn error_from_response(response: Response) -> SyncError {
    let status = response.status();
    let retry_after = retry_after_secs(&response);
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    let message = error_message(&body);

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        tracing::warn!(
            status = status.as_u16(),
            retry_after = ?retry_after,
            url = %url,
            "Confluence request throttled or failed"
        );
    }

    classify_status(status, retry_after, message)
}

/// Labels worth sending: trimmed, non-empty, deduplicated
fn normalize_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[async_trait]
impl RemoteClient for ConfluenceClient {
    async fn get_page(&self, id: &str) -> Result<RemotePage> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("/rest/api/content/{}", id)))
                    .query(&[("expand", "version,ancestors")]),
            )
            .await?;
        let content: ContentResponse = response.json().await?;
        Ok(content.into())
    }

    async fn find_page(&self, title: &str, parent_id: Option<&str>) -> Result<Option<RemotePage>> {
        let response = self
            .send(self.client.get(self.url("/rest/api/content")).query(&[
                ("spaceKey", self.config.space_key.as_str()),
                ("title", title),
                ("expand", "version,ancestors"),
                ("limit", "25"),
            ]))
            .await?;
        let search: SearchResponse = response.json().await?;

        Ok(search
            .results
            .into_iter()
            .map(RemotePage::from)
            .find(|page| page.parent_id.as_deref() == parent_id))
    }

    async fn create_page(
        &self,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        let payload = self.page_payload(parent_id, title, body, None);
        let response = self
            .send(self.client.post(self.url("/rest/api/content")).json(&payload))
            .await?;
        let content: ContentResponse = response.json().await?;

        tracing::info!(page_id = %content.id, title = %title, "Created Confluence page");
        Ok(content.into())
    }

    async fn update_page(
        &self,
        id: &str,
        expected_version: i64,
        parent_id: Option<&str>,
        title: &str,
        body: &RemoteBody,
    ) -> Result<RemotePage> {
        let mut payload = self.page_payload(parent_id, title, body, Some(expected_version + 1));
        payload["id"] = json!(id);

        let result = self
            .send(
                self.client
                    .put(self.url(&format!("/rest/api/content/{}", id)))
                    .json(&payload),
            )
            .await;

        let response = match result {
            Ok(response) => response,
            // Confluence answers a stale version number with 409
            Err(SyncError::Remote { status: 409, .. }) => {
                return Err(SyncError::VersionConflict {
                    page_id: id.to_string(),
                    expected: expected_version,
                    actual: None,
                });
            }
            Err(e) => return Err(e),
        };

        let content: ContentResponse = response.json().await?;
        Ok(content.into())
    }

    async fn upload_attachment(&self, page_id: &str, filename: &str, bytes: &[u8]) -> Result<()> {
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        // PUT creates the attachment or adds a new version of it
        self.send(
            self.client
                .put(self.url(&format!(
                    "/rest/api/content/{}/child/attachment",
                    page_id
                )))
                .header("X-Atlassian-Token", "no-check")
                .multipart(form),
        )
        .await?;

        tracing::info!(page_id = %page_id, filename = %filename, "Uploaded attachment");
        Ok(())
    }

    async fn add_labels(&self, page_id: &str, labels: &[String]) -> Result<()> {
        let labels = normalize_labels(labels);
        if labels.is_empty() {
            return Ok(());
        }
        let payload: Vec<Value> = labels
            .iter()
            .map(|name| json!({ "prefix": "global", "name": name }))
            .collect();

        self.send(
            self.client
                .post(self.url(&format!("/rest/api/content/{}/label", page_id)))
                .json(&payload),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RemoteConfig {
        RemoteConfig {
            base_url: "https://example.atlassian.net/wiki/".to_string(),
            email: "user@example.com".to_string(),
            api_token: "token".to_string(),
            space_key: "KB".to_string(),
        }
    }

    #[test]
    fn test_parse_content_response() {
        let raw = r#"{
            "id": "12345",
            "type": "page",
            "title": "Example",
            "version": { "number": 4, "when": "2024-03-01T10:15:30.000Z" },
            "ancestors": [{ "id": "1" }, { "id": "99" }]
        }"#;
        let content: ContentResponse = serde_json::from_str(raw).unwrap();
        let page = RemotePage::from(content);

        assert_eq!(page.id, "12345");
        assert_eq!(page.version, 4);
        assert_eq!(page.parent_id.as_deref(), Some("99"));
        assert!(page.updated_at.is_some());
    }

    #[test]
    fn test_parse_content_without_version() {
        let raw = r#"{ "id": "7", "title": "Bare" }"#;
        let content: ContentResponse = serde_json::from_str(raw).unwrap();
        let page = RemotePage::from(content);
        assert_eq!(page.version, 1);
        assert!(page.parent_id.is_none());
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None, "no".into()),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None, "no".into()),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, "gone".into()),
            SyncError::NotFound(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(12), String::new()),
            SyncError::RateLimited {
                retry_after: Some(12)
            }
        ));
        assert!(classify_status(StatusCode::BAD_GATEWAY, None, String::new()).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None, "bad".into()),
            SyncError::Remote { status: 400, .. }
        ));
    }

    #[test]
    fn test_error_message_prefers_json_message() {
        assert_eq!(
            error_message(r#"{"statusCode":400,"message":"Title exists"}"#),
            "Title exists"
        );
        assert_eq!(error_message("plain failure"), "plain failure");
    }

    #[test]
    fn test_page_payload_shape() {
        let client = ConfluenceClient::new(config()).unwrap();
        let body = RemoteBody("<p>hi</p>".to_string());

        let payload = client.page_payload(Some("10"), "Title", &body, Some(3));
        assert_eq!(payload["space"]["key"], "KB");
        assert_eq!(payload["ancestors"][0]["id"], "10");
        assert_eq!(payload["version"]["number"], 3);
        assert_eq!(payload["body"]["storage"]["value"], "<p>hi</p>");

        let payload = client.page_payload(None, "Title", &body, None);
        assert!(payload.get("ancestors").is_none());
        assert!(payload.get("version").is_none());
    }

    #[test]
    fn test_normalize_labels() {
        let labels = vec![
            " docs ".to_string(),
            "docs".to_string(),
            String::new(),
            "example".to_string(),
        ];
        assert_eq!(normalize_labels(&labels), vec!["docs", "example"]);
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ConfluenceClient::new(config()).unwrap();
        assert_eq!(
            client.url("/rest/api/content"),
            "https://example.atlassian.net/wiki/rest/api/content"
        );
        assert_eq!(client.space_key(), "KB");
    }
}
