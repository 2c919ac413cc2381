//! Upload server API.
//!
//! `UploadApi` is the seam between the engine and the remote server;
//! `HttpUploadApi` talks to the JSON endpoints over reqwest.

use super::types::{ChunkMetadata, CompletedUploadResult, UploadCategory};
use crate::config::UploaderConfig;
use crate::error::UploadError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub category: UploadCategory,
    pub chunk_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch_id: Option<String>,
    #[serde(rename = "requireNDA", default)]
    pub require_nda: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub session_id: String,
    pub upload_id: String,
    pub file_key: String,
    pub total_chunks: u32,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resume_info: Option<ResumeInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    pub etag: String,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedChunk {
    pub chunk_index: u32,
    /// Absent when the chunk was confirmed by the server but its etag was never seen locally
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub session_id: String,
    pub chunks: Vec<CompletedChunk>,
}

/// Server's answer to `GET /resume/{sessionId}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeInfo {
    pub can_resume: bool,
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
    #[serde(default)]
    pub remaining_chunks: Vec<u32>,
    #[serde(default)]
    pub next_chunk_index: Option<u32>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortRequest {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of `POST /complete`, before the local session id is attached
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub url: String,
    pub key: String,
    pub size: u64,
    pub filename: String,
    pub content_type: String,
}

impl CompleteResponse {
    pub fn into_result(self, session_id: &str) -> CompletedUploadResult {
        CompletedUploadResult {
            session_id: session_id.to_string(),
            url: self.url,
            key: self.key,
            size: self.size,
            filename: self.filename,
            content_type: self.content_type,
        }
    }
}

/// `{success, data?, error?}` wrapper used by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<Value>,
}

#[async_trait]
pub trait UploadApi: Send + Sync {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, UploadError>;

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkMetadata,
        data: Vec<u8>,
    ) -> Result<ChunkReceipt, UploadError>;

    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError>;

    async fn resume_info(&self, session_id: &str) -> Result<ResumeInfo, UploadError>;

    async fn abort(&self, session_id: &str, reason: Option<&str>) -> Result<(), UploadError>;
}

/// reqwest-backed client for the upload server
#[derive(Debug, Clone)]
pub struct HttpUploadApi {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl HttpUploadApi {
    pub fn new(config: &UploaderConfig) -> Result<Self, UploadError> {
        let base_url = Url::parse(config.server_url.trim_end_matches('/')).map_err(|e| {
            UploadError::validation(format!("Invalid server URL '{}': {}", config.server_url, e))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| UploadError::network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, UploadError> {
        let joined = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined)
            .map_err(|e| UploadError::validation(format!("Invalid endpoint URL '{}': {}", joined, e)))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, UploadError> {
        let (status, data) = self.send_envelope(request, what).await?;
        data.ok_or_else(|| UploadError::server(status, format!("{} response has no data", what)))
    }

    /// Send a request and unwrap the envelope; `data` may legitimately be absent
    async fn send_envelope<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<(u16, Option<T>), UploadError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| UploadError::network(format!("{} request failed: {}", what, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UploadError::network(format!("Failed to read {} response: {}", what, e)))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<Envelope<Value>>(&body)
                .ok()
                .and_then(|envelope| envelope.error)
                .map(|error| error_message(&error))
                .unwrap_or(body);
            return Err(UploadError::server(
                status.as_u16(),
                format!("{} failed with status {}: {}", what, status, detail),
            ));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            UploadError::server(
                status.as_u16(),
                format!("Failed to parse {} response: {}", what, e),
            )
        })?;

        if !envelope.success {
            let detail = envelope
                .error
                .as_ref()
                .map(error_message)
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(UploadError::server(
                status.as_u16(),
                format!("{} rejected: {}", what, detail),
            ));
        }

        Ok((status.as_u16(), envelope.data))
    }
}

/// Server errors arrive either as a string or as `{ message }`
fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

#[async_trait]
impl UploadApi for HttpUploadApi {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, UploadError> {
        let url = self.endpoint("init")?;
        self.send(self.client.post(url).json(request), "Init").await
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        chunk: &ChunkMetadata,
        data: Vec<u8>,
    ) -> Result<ChunkReceipt, UploadError> {
        let mut url = self.endpoint("chunk")?;
        url.query_pairs_mut()
            .append_pair("sessionId", session_id)
            .append_pair("chunkIndex", &chunk.chunk_index.to_string())
            .append_pair("checksum", &chunk.checksum);

        let request = self
            .client
            .put(url)
            .header("Content-Type", "application/octet-stream")
            .body(data);
        self.send(request, "Chunk upload").await
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<CompleteResponse, UploadError> {
        let url = self.endpoint("complete")?;
        self.send(self.client.post(url).json(request), "Complete").await
    }

    async fn resume_info(&self, session_id: &str) -> Result<ResumeInfo, UploadError> {
        let url = self.endpoint(&format!("resume/{}", urlencoding::encode(session_id)))?;
        self.send(self.client.get(url), "Resume info").await
    }

    async fn abort(&self, session_id: &str, reason: Option<&str>) -> Result<(), UploadError> {
        let url = self.endpoint("abort")?;
        let body = AbortRequest {
            session_id: session_id.to_string(),
            reason: reason.map(str::to_string),
        };
        self.send_envelope::<Value>(self.client.post(url).json(&body), "Abort")
            .await?;
        Ok(())
    }
}
