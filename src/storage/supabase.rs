//! Supabase Storage client: signed URL resolution plus a plain streamed GET, and
//! non-overwriting uploads.

use super::{DocumentRef, DocumentUploader, FetchError, FetchPhase, ObjectStore, UploadError};
use crate::config::StorageSettings;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const UPLOAD_CACHE_CONTROL: &str = "max-age=3600";

/// HTTP client for a Supabase-compatible storage API.
pub struct SupabaseStorage {
    http: Client,
    base_url: String,
    api_key: String,
    signed_url_ttl_secs: u64,
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    #[serde(rename = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

impl SupabaseStorage {
    /// Build a client for the configured project.
    pub fn new(settings: &StorageSettings) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent("resume-intake/storage")
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|error| http_error(FetchPhase::Resolve, error))?;
        tracing::debug!(
            url = %settings.base_url,
            uses_service_key = settings.uses_service_key,
            "Initialized storage HTTP client"
        );
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            signed_url_ttl_secs: settings.signed_url_ttl.as_secs().max(1),
        })
    }

    /// `{base}/storage/v1/object/{route..}/{bucket}/{key}` with every segment escaped.
    fn object_endpoint(&self, route: &[&str], location: &DocumentRef) -> Result<Url, String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|error| format!("invalid storage URL {}: {error}", self.base_url))?;
        url.path_segments_mut()
            .map_err(|_| format!("storage URL {} cannot carry a path", self.base_url))?
            .pop_if_empty()
            .extend(["storage", "v1", "object"])
            .extend(route)
            .push(&location.bucket)
            .extend(location.key.split('/'));
        Ok(url)
    }

    fn download_endpoint(&self, handle: &str) -> String {
        if handle.starts_with("http://") || handle.starts_with("https://") {
            return handle.to_string();
        }
        let path = handle.trim_start_matches('/');
        format!("{}/storage/v1/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl ObjectStore for SupabaseStorage {
    async fn resolve(&self, location: &DocumentRef) -> Result<String, FetchError> {
        let url = self
            .object_endpoint(&["sign"], location)
            .map_err(|message| FetchError::Decode {
                phase: FetchPhase::Resolve,
                message,
            })?;
        let response = self
            .authorize(self.http.post(url))
            .json(&json!({ "expiresIn": self.signed_url_ttl_secs }))
            .send()
            .await
            .map_err(|error| http_error(FetchPhase::Resolve, error))?;
        let response = ensure_success(FetchPhase::Resolve, response).await?;

        let body: SignResponse = response.json().await.map_err(|error| FetchError::Decode {
            phase: FetchPhase::Resolve,
            message: error.to_string(),
        })?;
        if body.signed_url.trim().is_empty() {
            return Err(FetchError::Decode {
                phase: FetchPhase::Resolve,
                message: "signed URL is empty".into(),
            });
        }
        Ok(body.signed_url)
    }

    async fn transfer(&self, handle: &str, limit: usize) -> Result<Bytes, FetchError> {
        let response = self
            .authorize(self.http.get(self.download_endpoint(handle)))
            .send()
            .await
            .map_err(|error| http_error(FetchPhase::Transfer, error))?;
        let response = ensure_success(FetchPhase::Transfer, response).await?;

        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                return Err(FetchError::TooLarge { limit });
            }
        }

        let mut body = response.bytes_stream();
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|error| http_error(FetchPhase::Transfer, error))?;
            if buffer.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }
}

#[async_trait]
impl DocumentUploader for SupabaseStorage {
    async fn upload(
        &self,
        location: &DocumentRef,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> Result<(), UploadError> {
        let url = self
            .object_endpoint(&[], location)
            .map_err(UploadError::InvalidTarget)?;
        let size = bytes.len();
        let response = self
            .authorize(self.http.post(url))
            .header("x-upsert", "false")
            .header("cache-control", UPLOAD_CACHE_CONTROL)
            .header(
                "content-type",
                content_type.unwrap_or("application/octet-stream"),
            )
            .body(bytes)
            .send()
            .await
            .map_err(|error| UploadError::Http(error.without_url().to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::UnexpectedStatus { status, body });
        }
        tracing::info!(document = %location, size, "Stored uploaded document");
        Ok(())
    }
}

async fn ensure_success(phase: FetchPhase, response: Response) -> Result<Response, FetchError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(FetchError::UnexpectedStatus {
        phase,
        status,
        body,
    })
}

fn http_error(phase: FetchPhase, error: reqwest::Error) -> FetchError {
    FetchError::Http {
        phase,
        message: error.without_url().to_string(),
    }
}
