#![deny(missing_docs)]

//! Core library for the resume intake service.
//!
//! A submitted resume becomes a task that is fetched from object storage, converted to
//! text by one of two extraction engines, structured by a chat-completion model and
//! persisted, while callers poll its status.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// PDF text extraction engines and the fallback policy.
pub mod extraction;
/// Structured logging and tracing setup.
pub mod logging;
/// Task counters.
pub mod metrics;
/// Background run of a single task.
pub mod orchestrator;
/// Submission and status operations.
pub mod service;
/// Object storage access.
pub mod storage;
/// Downstream structuring of extracted text.
pub mod structuring;
/// Durable task records.
pub mod tasks;
/// Task queue and worker pool.
pub mod worker;
