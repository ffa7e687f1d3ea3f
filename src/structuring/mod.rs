//! Downstream text structuring: turn extracted resume text into a [`ResumeSummary`].
//!
//! The orchestrator only depends on [`StructuringClient`]; the chat-completion adapter is
//! one implementation and tests substitute scripted ones.

mod chat;
pub mod schema;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;

pub use chat::ChatCompletionClient;
pub use schema::{ParseError, ProjectEntry, ResumeSummary, parse_resume_summary};

/// Errors surfaced by the structuring collaborator.
#[derive(Debug, Error)]
pub enum StructuringError {
    /// The provider could not be reached.
    #[error("structuring provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with a non-success status.
    #[error("structuring provider returned {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status returned by the provider.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// The provider response could not be decoded.
    #[error("malformed structuring response: {0}")]
    InvalidResponse(String),
    /// The provider produced no content.
    #[error("structuring provider returned empty output")]
    EmptyOutput,
}

/// Capability: submit resume text, get the model's raw JSON text back.
#[async_trait]
pub trait StructuringClient: Send + Sync {
    /// Model identifier recorded in the call audit.
    fn model(&self) -> &str;

    /// Structure `text`, returning the provider's raw output.
    async fn structure(&self, text: &str) -> Result<String, StructuringError>;
}

/// System prompt sent ahead of the resume text.
pub fn system_prompt() -> String {
    format!(
        "You are a senior recruiting consultant. Distill the key points of the resume into \
         structured form and output strict JSON only, with no commentary and no code fences: \
         {{summary: string, highlights: string[], skills: string[], projects: [{{name, role, \
         contributions: string[], metrics: string[]}}]}}. JSON schema: {}",
        schema::resume_schema_json()
    )
}
