//! Engine selection with at most one fallback per run.

use super::{EngineKind, ExtractionError, LopdfEngine, PdftotextEngine, TextExtractor};
use crate::config::{EnginePreference, ExtractionSettings};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Text produced by one extraction run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// Normalized, non-blank text.
    pub text: String,
    /// Engine that produced `text`.
    pub engine: EngineKind,
    /// Whether the preferred engine failed first.
    pub fell_back: bool,
}

/// Chooses between the in-process and external engines.
///
/// The preferred engine is checked first; when it cannot run, the alternate is used
/// directly. When the preferred engine runs and fails, the alternate is checked and, if
/// available, tried exactly once.
pub struct EngineSelector {
    preference: EnginePreference,
    in_process: Arc<dyn TextExtractor>,
    external: Arc<dyn TextExtractor>,
}

impl EngineSelector {
    /// Selector over explicit engines.
    pub fn new(
        preference: EnginePreference,
        in_process: Arc<dyn TextExtractor>,
        external: Arc<dyn TextExtractor>,
    ) -> Self {
        Self {
            preference,
            in_process,
            external,
        }
    }

    /// Selector over `lopdf` and `pdftotext` configured from `settings`.
    pub fn from_settings(settings: &ExtractionSettings) -> Self {
        Self::new(
            settings.preference,
            Arc::new(LopdfEngine::new(
                settings.extract_timeout,
                settings.max_pages,
            )),
            Arc::new(PdftotextEngine::new(
                settings.pdftotext_path.clone(),
                settings.extract_timeout,
                settings.check_timeout,
                settings.max_pages,
            )),
        )
    }

    /// Configured preference.
    pub fn preference(&self) -> EnginePreference {
        self.preference
    }

    /// Whether the external tool is invocable right now.
    pub async fn check_external(&self) -> Result<(), String> {
        self.external.check_available().await
    }

    fn ordered(&self) -> (&dyn TextExtractor, &dyn TextExtractor) {
        match self.preference {
            EnginePreference::InProcess => (self.in_process.as_ref(), self.external.as_ref()),
            EnginePreference::External => (self.external.as_ref(), self.in_process.as_ref()),
        }
    }

    /// Extract text from `document`, falling back to the alternate engine at most once.
    pub async fn extract(
        &self,
        document: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<Extracted, ExtractionError> {
        let (preferred, alternate) = self.ordered();

        if let Err(reason) = preferred.check_available().await {
            tracing::warn!(
                preferred = %preferred.kind(),
                alternate = %alternate.kind(),
                reason = %reason,
                "Preferred engine unavailable; using alternate"
            );
            if let Err(alternate_reason) = alternate.check_available().await {
                return Err(ExtractionError::NoEngineAvailable(format!(
                    "{}: {reason}; {}: {alternate_reason}",
                    preferred.kind(),
                    alternate.kind()
                )));
            }
            return run(alternate, document, cancel, false).await;
        }

        let primary = match run(preferred, document, cancel, false).await {
            Ok(extracted) => return Ok(extracted),
            Err(error @ ExtractionError::Cancelled { .. }) => return Err(error),
            Err(error) => error,
        };

        if let Err(reason) = alternate.check_available().await {
            tracing::warn!(
                engine = %preferred.kind(),
                error = %primary,
                alternate = %alternate.kind(),
                reason = %reason,
                "Extraction failed and no fallback engine is available"
            );
            return Err(primary);
        }

        tracing::warn!(
            engine = %preferred.kind(),
            error = %primary,
            fallback = %alternate.kind(),
            "Extraction failed; falling back once"
        );
        run(alternate, document, cancel, true)
            .await
            .map_err(|fallback| ExtractionError::Exhausted {
                primary: Box::new(primary),
                fallback: Box::new(fallback),
            })
    }
}

async fn run(
    engine: &dyn TextExtractor,
    document: &Bytes,
    cancel: &CancellationToken,
    fell_back: bool,
) -> Result<Extracted, ExtractionError> {
    let kind = engine.kind();
    let text = engine.extract(document, cancel).await?;
    if text.trim().is_empty() {
        return Err(ExtractionError::EmptyText { engine: kind });
    }
    tracing::info!(engine = %kind, fell_back, chars = text.chars().count(), "Extracted text");
    Ok(Extracted {
        text,
        engine: kind,
        fell_back,
    })
}
