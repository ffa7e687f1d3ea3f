//! Binary fetcher: pull a stored document's bytes under a total time budget.
//!
//! Fetching is two phases, each with its own deadline: resolving a short-lived download
//! handle and transferring the bytes. Errors name the phase that failed. Dropping an
//! in-flight phase future on timeout aborts its HTTP request.

mod reference;
mod supabase;

use crate::config::StorageSettings;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use reference::DocumentRef;
pub use supabase::SupabaseStorage;

/// Extension used when an uploaded file name carries none.
const FALLBACK_EXTENSION: &str = "dat";

/// Phase of a fetch, reported with every fetch failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    /// Turning a bucket + key into a download handle (signed URL).
    Resolve,
    /// Streaming the bytes behind the handle.
    Transfer,
}

impl fmt::Display for FetchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolve => "handle resolution",
            Self::Transfer => "transfer",
        })
    }
}

/// Errors returned by the binary fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The document reference is malformed or unsafe.
    #[error("invalid document reference: {0}")]
    InvalidRef(String),
    /// A phase exceeded its deadline.
    #[error("fetch failed during {phase}: timed out after {elapsed_ms} ms")]
    Timeout {
        /// Phase that timed out.
        phase: FetchPhase,
        /// Time spent in the fetch when the deadline fired.
        elapsed_ms: u64,
    },
    /// Storage answered with a non-success status.
    #[error("fetch failed during {phase}: storage returned {status}: {body}")]
    UnexpectedStatus {
        /// Phase that received the response.
        phase: FetchPhase,
        /// HTTP status returned by storage.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Network failure before or while receiving a response.
    #[error("fetch failed during {phase}: {message}")]
    Http {
        /// Phase that failed.
        phase: FetchPhase,
        /// Transport error description.
        message: String,
    },
    /// A response arrived but could not be decoded.
    #[error("fetch failed during {phase}: malformed response: {message}")]
    Decode {
        /// Phase that failed.
        phase: FetchPhase,
        /// Decode error description.
        message: String,
    },
    /// The document is larger than the configured limit.
    #[error("fetch failed during transfer: document exceeds {limit} bytes")]
    TooLarge {
        /// Configured byte limit.
        limit: usize,
    },
}

impl FetchError {
    /// Phase the failure belongs to; `None` when the reference was rejected up front.
    pub fn phase(&self) -> Option<FetchPhase> {
        match self {
            Self::InvalidRef(_) => None,
            Self::Timeout { phase, .. }
            | Self::UnexpectedStatus { phase, .. }
            | Self::Http { phase, .. }
            | Self::Decode { phase, .. } => Some(*phase),
            Self::TooLarge { .. } => Some(FetchPhase::Transfer),
        }
    }
}

/// Capability: resolve a download handle and transfer the bytes behind it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve `location` into a handle accepted by [`ObjectStore::transfer`].
    async fn resolve(&self, location: &DocumentRef) -> Result<String, FetchError>;

    /// Download the bytes behind `handle`, failing once more than `limit` bytes arrive.
    async fn transfer(&self, handle: &str, limit: usize) -> Result<Bytes, FetchError>;
}

/// Errors returned while storing an uploaded document.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The target key could not be turned into a storage URL.
    #[error("invalid upload target: {0}")]
    InvalidTarget(String),
    /// Storage did not answer within the upload budget.
    #[error("upload timed out after {elapsed_ms} ms")]
    Timeout {
        /// Time spent before giving up.
        elapsed_ms: u64,
    },
    /// Storage answered with a non-success status.
    #[error("storage returned {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status returned by storage.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Network failure before or while receiving a response.
    #[error("upload failed: {0}")]
    Http(String),
}

/// Capability: store caller-supplied bytes at a location without overwriting.
#[async_trait]
pub trait DocumentUploader: Send + Sync {
    /// Write `bytes` to `location`; an existing object at that key is an error.
    async fn upload(
        &self,
        location: &DocumentRef,
        content_type: Option<&str>,
        bytes: Bytes,
    ) -> Result<(), UploadError>;
}

/// Object key for an uploaded resume: `resume_<unix millis>.<ext>`.
///
/// The extension is the lowercased text after the last `.` of `original_name`, kept only
/// when it is ASCII alphanumeric; anything else becomes `dat`.
pub fn upload_key(original_name: &str, unix_millis: i128) -> String {
    let extension = original_name
        .rsplit_once('.')
        .map(|(_, extension)| extension.to_ascii_lowercase())
        .filter(|extension| {
            !extension.is_empty() && extension.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string());
    format!("resume_{unix_millis}.{extension}")
}

/// Applies per-phase deadlines inside one total budget around an [`ObjectStore`].
pub struct BinaryFetcher {
    store: Arc<dyn ObjectStore>,
    settings: StorageSettings,
}

impl BinaryFetcher {
    /// Wrap `store` with the limits from `settings`.
    pub fn new(store: Arc<dyn ObjectStore>, settings: StorageSettings) -> Self {
        Self { store, settings }
    }

    /// Parse a raw document reference and fetch it.
    pub async fn fetch(&self, raw_ref: &str) -> Result<Bytes, FetchError> {
        let location = DocumentRef::parse(raw_ref, &self.settings)?;
        self.fetch_object(&location).await
    }

    /// Fetch the bytes stored at `location`.
    pub async fn fetch_object(&self, location: &DocumentRef) -> Result<Bytes, FetchError> {
        let started = Instant::now();
        let total = self.settings.fetch_timeout;
        let resolve_budget = self.settings.sign_timeout.min(total);

        tracing::debug!(document = %location, "Resolving download handle");
        let handle = tokio::time::timeout(resolve_budget, self.store.resolve(location))
            .await
            .map_err(|_| timeout_error(FetchPhase::Resolve, started))??;

        let remaining = total.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(timeout_error(FetchPhase::Transfer, started));
        }
        let bytes = tokio::time::timeout(
            remaining,
            self.store
                .transfer(&handle, self.settings.max_document_bytes),
        )
        .await
        .map_err(|_| timeout_error(FetchPhase::Transfer, started))??;

        tracing::info!(
            document = %location,
            size = bytes.len(),
            sha256 = %hex::encode(Sha256::digest(&bytes)),
            elapsed_ms = elapsed_ms(started),
            "Fetched document"
        );
        Ok(bytes)
    }
}

fn timeout_error(phase: FetchPhase, started: Instant) -> FetchError {
    FetchError::Timeout {
        phase,
        elapsed_ms: elapsed_ms(started),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Settings preset used by tests across the crate.
#[cfg(test)]
pub(crate) fn test_settings(base_url: String) -> StorageSettings {
    use std::time::Duration;
    StorageSettings {
        base_url,
        api_key: "service-key".into(),
        uses_service_key: true,
        default_bucket: "resumes".into(),
        allowed_buckets: Vec::new(),
        signed_url_ttl: Duration::from_secs(60),
        sign_timeout: Duration::from_secs(2),
        fetch_timeout: Duration::from_secs(5),
        max_document_bytes: 1024 * 1024,
    }
}
