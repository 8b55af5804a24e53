//! Fanout - cross-posting engine
//!
//! This library posts one submission (a set of files or a text message) to
//! many destination accounts, records every outcome in an append-only event
//! log, and resumes partially failed runs without reposting what already
//! went out.

pub mod cancellation;
pub mod config;
pub mod db;
pub mod destinations;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod rate_limiter;
pub mod service;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cancellation::CancelToken;
pub use config::Config;
pub use db::Database;
pub use error::{FanoutError, PostError, Result};
pub use service::PostManagerRegistry;
pub use types::{PostEvent, PostEventType, PostRecord, ResumeMode, RunState, Submission};
