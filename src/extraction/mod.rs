//! Extraction engine set: interchangeable PDF-to-text engines and the fallback policy.
//!
//! Every engine enforces its own per-call timeout, honours a [`CancellationToken`] and
//! releases its resources (child process, temp directory, worker thread) before it
//! returns. Output is always passed through [`normalize_text`].

mod external;
mod in_process;
mod normalize;
mod selector;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use external::PdftotextEngine;
pub use in_process::LopdfEngine;
pub use normalize::normalize_text;
pub use selector::{EngineSelector, Extracted};

/// Identifies an extraction engine in logs, metrics and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    /// PDF parsed inside the service process.
    InProcess,
    /// External `pdftotext` process.
    External,
}

impl EngineKind {
    /// Stable name used in messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProcess => "in-process",
            Self::External => "pdftotext",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while turning document bytes into text.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The engine exceeded its per-call timeout.
    #[error("{engine} engine timed out after {timeout_ms} ms")]
    Timeout {
        /// Engine that timed out.
        engine: EngineKind,
        /// Configured timeout.
        timeout_ms: u64,
    },
    /// The caller cancelled the extraction.
    #[error("{engine} engine was cancelled")]
    Cancelled {
        /// Engine that was interrupted.
        engine: EngineKind,
    },
    /// The engine ran and failed.
    #[error("{engine} engine failed: {message}")]
    Engine {
        /// Engine that failed.
        engine: EngineKind,
        /// Failure description.
        message: String,
    },
    /// The engine finished without producing any text.
    #[error("{engine} engine produced no text")]
    EmptyText {
        /// Engine that produced nothing.
        engine: EngineKind,
    },
    /// Neither the preferred nor the alternate engine can run here.
    #[error("no extraction engine available: {0}")]
    NoEngineAvailable(String),
    /// Preferred engine and its single fallback both failed.
    #[error("{fallback} (after {primary})")]
    Exhausted {
        /// Failure of the first engine tried.
        primary: Box<ExtractionError>,
        /// Failure of the fallback engine; the last failure.
        fallback: Box<ExtractionError>,
    },
}

impl ExtractionError {
    pub(crate) fn engine(engine: EngineKind, message: impl Into<String>) -> Self {
        Self::Engine {
            engine,
            message: message.into(),
        }
    }
}

/// One way of converting PDF bytes into normalized plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Which engine this is.
    fn kind(&self) -> EngineKind;

    /// Cheap liveness check; `Err` carries the reason the engine cannot run.
    async fn check_available(&self) -> Result<(), String>;

    /// Extract normalized text from `document`.
    async fn extract(
        &self,
        document: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, ExtractionError>;
}

fn duration_ms(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
