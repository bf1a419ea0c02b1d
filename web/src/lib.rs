//! Axum HTTP boundary for Tally.
//!
//! This crate is the imperative shell around `tally-service`: it parses
//! requests, dispatches to the ingestion/stats services, and maps domain
//! errors onto HTTP responses. Nothing in here touches the stores directly
//! except the readiness probe.
//!
//! # Request flow
//!
//! 1. **HTTP request** arrives at an Axum handler
//! 2. **Extract data** from the request (JSON body, path parameters)
//! 3. **Dispatch** to `IngestionService` / `StatsService`
//! 4. **Map result** to an HTTP response via [`ApiError`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;

pub use config::{ConfigError, Settings};
pub use error::ApiError;
pub use router::router;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, ApiError>;
