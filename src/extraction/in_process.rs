//! In-process engine: parse the PDF with `lopdf` on a blocking worker thread.

use super::{EngineKind, ExtractionError, TextExtractor, duration_ms, normalize_text};
use async_trait::async_trait;
use bytes::Bytes;
use lopdf::Document;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const KIND: EngineKind = EngineKind::InProcess;

/// Upper bound on waiting for the worker thread to observe a cancellation.
const CANCEL_GRACE: Duration = Duration::from_millis(250);

/// Pure Rust extractor; always available.
pub struct LopdfEngine {
    timeout: Duration,
    max_pages: Option<usize>,
}

impl LopdfEngine {
    /// Engine bounded by `timeout`, reading at most `max_pages` pages when set.
    pub fn new(timeout: Duration, max_pages: Option<usize>) -> Self {
        Self { timeout, max_pages }
    }
}

#[async_trait]
impl TextExtractor for LopdfEngine {
    fn kind(&self) -> EngineKind {
        KIND
    }

    async fn check_available(&self) -> Result<(), String> {
        Ok(())
    }

    async fn extract(
        &self,
        document: &Bytes,
        cancel: &CancellationToken,
    ) -> Result<String, ExtractionError> {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled { engine: KIND });
        }
        let worker_token = cancel.child_token();
        // Stops the worker between pages if this future is dropped mid-flight.
        let _stop_on_drop = worker_token.clone().drop_guard();

        let bytes = document.clone();
        let max_pages = self.max_pages;
        let token = worker_token.clone();
        let mut worker =
            tokio::task::spawn_blocking(move || extract_pages(&bytes, max_pages, &token));

        let interrupted = tokio::select! {
            joined = &mut worker => {
                return match joined {
                    Ok(result) => result.map(|raw| normalize_text(&raw)),
                    Err(error) => Err(ExtractionError::engine(
                        KIND,
                        format!("worker failed: {error}"),
                    )),
                };
            }
            _ = tokio::time::sleep(self.timeout) => ExtractionError::Timeout {
                engine: KIND,
                timeout_ms: duration_ms(self.timeout),
            },
            _ = cancel.cancelled() => ExtractionError::Cancelled { engine: KIND },
        };

        worker_token.cancel();
        if tokio::time::timeout(CANCEL_GRACE, worker).await.is_err() {
            tracing::warn!(engine = %KIND, "PDF worker still busy after cancellation");
        }
        Err(interrupted)
    }
}

/// Blocking body: load, decompress and read pages one by one, checking `cancel` between pages.
fn extract_pages(
    bytes: &[u8],
    max_pages: Option<usize>,
    cancel: &CancellationToken,
) -> Result<String, ExtractionError> {
    // Malformed fonts and streams can panic inside the parser.
    panic::catch_unwind(AssertUnwindSafe(|| read_document(bytes, max_pages, cancel)))
        .unwrap_or_else(|_| Err(ExtractionError::engine(KIND, "PDF parser panicked")))
}

fn read_document(
    bytes: &[u8],
    max_pages: Option<usize>,
    cancel: &CancellationToken,
) -> Result<String, ExtractionError> {
    let mut document = Document::load_mem(bytes)
        .map_err(|error| ExtractionError::engine(KIND, format!("unreadable PDF: {error}")))?;
    if document.is_encrypted() {
        return Err(ExtractionError::engine(KIND, "document is encrypted"));
    }
    document.decompress();

    let pages: Vec<u32> = document
        .get_pages()
        .keys()
        .copied()
        .take(max_pages.unwrap_or(usize::MAX))
        .collect();
    if pages.is_empty() {
        return Err(ExtractionError::engine(KIND, "document has no pages"));
    }

    let mut text = String::new();
    let mut unreadable = 0usize;
    for page in &pages {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled { engine: KIND });
        }
        match document.extract_text(&[*page]) {
            Ok(page_text) => {
                text.push_str(&page_text);
                text.push('\n');
            }
            Err(error) => {
                unreadable += 1;
                tracing::debug!(page, error = %error, "Skipping unreadable page");
            }
        }
    }
    if unreadable == pages.len() {
        return Err(ExtractionError::engine(
            KIND,
            format!("none of {} pages could be read", pages.len()),
        ));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{Object, Stream, dictionary};
    use std::sync::OnceLock;
    use std::time::Instant;

    const LARGE_PAGES: usize = 800;
    const LINES_PER_PAGE: i64 = 500;

    /// A few hundred text-heavy pages; slow enough that parsing outlives short deadlines.
    fn large_document() -> Bytes {
        static DOCUMENT: OnceLock<Bytes> = OnceLock::new();
        DOCUMENT.get_or_init(build_large_document).clone()
    }

    fn build_large_document() -> Bytes {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                "F1" => font_id,
            },
        });

        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 8.into()]),
        ];
        for line in 0..LINES_PER_PAGE {
            operations.push(Operation::new("Td", vec![0.into(), (-10).into()]));
            operations.push(Operation::new(
                "Tj",
                vec![Object::string_literal(format!(
                    "Line {line}: shipped payment services in Rust and Go"
                ))],
            ));
        }
        operations.push(Operation::new("ET", vec![]));
        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));

        let kids: Vec<Object> = (0..LARGE_PAGES)
            .map(|_| {
                doc.add_object(dictionary! {
                    "Type" => "Page",
                    "Parent" => pages_id,
                    "Contents" => content_id,
                })
                .into()
            })
            .collect();
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => i64::try_from(LARGE_PAGES).expect("page count"),
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut buffer = Vec::new();
        doc.save_to(&mut buffer).expect("save pdf");
        Bytes::from(buffer)
    }

    #[tokio::test]
    async fn corrupt_payload_is_an_engine_error() {
        let engine = LopdfEngine::new(Duration::from_secs(5), None);
        let error = engine
            .extract(
                &Bytes::from_static(b"%PDF-1.4\x00\x01"),
                &CancellationToken::new(),
            )
            .await
            .expect_err("corrupt");
        assert!(matches!(
            error,
            ExtractionError::Engine {
                engine: EngineKind::InProcess,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_token_stops_extraction() {
        let engine = LopdfEngine::new(Duration::from_secs(5), None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = engine
            .extract(&large_document(), &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(
            error,
            ExtractionError::Cancelled {
                engine: EngineKind::InProcess
            }
        ));
    }

    #[tokio::test]
    async fn slow_document_hits_the_deadline() {
        let document = large_document();
        let engine = LopdfEngine::new(Duration::from_millis(5), None);

        let started = Instant::now();
        let error = engine
            .extract(&document, &CancellationToken::new())
            .await
            .expect_err("timeout");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            error,
            ExtractionError::Timeout {
                engine: EngineKind::InProcess,
                timeout_ms: 5,
            }
        ));
    }

    #[tokio::test]
    async fn cancellation_mid_extraction_returns_promptly() {
        let document = large_document();
        let engine = LopdfEngine::new(Duration::from_secs(60), None);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let error = engine
            .extract(&document, &cancel)
            .await
            .expect_err("cancelled");

        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            error,
            ExtractionError::Cancelled {
                engine: EngineKind::InProcess
            }
        ));
    }

    #[tokio::test]
    async fn always_available() {
        let engine = LopdfEngine::new(Duration::from_secs(1), Some(20));
        assert_eq!(engine.check_available().await, Ok(()));
        assert_eq!(engine.kind(), EngineKind::InProcess);
    }
}
