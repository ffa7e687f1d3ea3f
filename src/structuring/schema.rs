//! Structured resume payload and the lenient parser applied to model output.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured digest of a resume, persisted as the task result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResumeSummary {
    /// Two or three sentence overview of the candidate.
    pub summary: String,
    /// Standout achievements worth probing in an interview.
    #[serde(default)]
    pub highlights: Vec<String>,
    /// Technical and domain skills.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Projects with the candidate's role and measurable impact.
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
}

/// One project listed on a resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProjectEntry {
    /// Project name.
    #[serde(default)]
    pub name: String,
    /// Candidate's role on the project.
    #[serde(default)]
    pub role: String,
    /// What the candidate personally delivered.
    #[serde(default)]
    pub contributions: Vec<String>,
    /// Quantified outcomes.
    #[serde(default)]
    pub metrics: Vec<String>,
}

/// Model output could not be turned into a [`ResumeSummary`].
#[derive(Debug, Error)]
pub enum ParseError {
    /// The text was not valid JSON for the schema, even after repair.
    #[error("model output is not valid resume JSON: {0}")]
    Invalid(#[source] serde_json::Error),
    /// JSON parsed but the mandatory summary was blank.
    #[error("model output has an empty summary")]
    EmptySummary,
}

/// JSON schema of [`ResumeSummary`], embedded in the structuring prompt.
pub fn resume_schema_json() -> String {
    let schema = schemars::schema_for!(ResumeSummary);
    serde_json::to_string(&schema).unwrap_or_default()
}

/// Parse model output, retrying once on the span between the first `{` and the last `}`.
pub fn parse_resume_summary(content: &str) -> Result<ResumeSummary, ParseError> {
    let parsed = match serde_json::from_str::<ResumeSummary>(content.trim()) {
        Ok(summary) => summary,
        Err(first_error) => match repair_json_span(content) {
            Some(span) => serde_json::from_str::<ResumeSummary>(span).map_err(|repair_error| {
                tracing::debug!(error = %first_error, "Direct parse failed before repair");
                ParseError::Invalid(repair_error)
            })?,
            None => return Err(ParseError::Invalid(first_error)),
        },
    };
    validate(parsed)
}

fn validate(mut summary: ResumeSummary) -> Result<ResumeSummary, ParseError> {
    summary.summary = summary.summary.trim().to_string();
    if summary.summary.is_empty() {
        return Err(ParseError::EmptySummary);
    }
    summary.highlights.retain(|item| !item.trim().is_empty());
    summary.skills.retain(|item| !item.trim().is_empty());
    Ok(summary)
}

/// Slice from the first opening brace to the last closing brace, if that span differs
/// from the trimmed input.
fn repair_json_span(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end <= start {
        return None;
    }
    let span = &content[start..=end];
    (span != content.trim()).then_some(span)
}
