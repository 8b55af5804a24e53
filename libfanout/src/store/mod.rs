//! Storage contracts for runs and the event log
//!
//! The engine only needs an append-only event log and a run table it can
//! read and update. [`crate::db::Database`] implements both on SQLite;
//! [`memory::MemoryStore`] keeps everything in process.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{PostEvent, PostRecord, RunUpdate};

pub mod memory;

/// Run records
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &PostRecord) -> Result<()>;

    async fn find_run(&self, run_id: &str) -> Result<Option<PostRecord>>;

    /// All runs of a submission, oldest first
    async fn find_runs_for_submission(&self, submission_id: &str) -> Result<Vec<PostRecord>>;

    /// Apply the set fields of `update`
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::NotFound` if the run does not exist.
    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<()>;
}

/// Append-only event log
///
/// Queries must reflect every insert for the same run that completed
/// before the query started.
#[async_trait]
pub trait EventLogStore: Send + Sync {
    async fn insert(&self, event: &PostEvent) -> Result<()>;

    /// Events of a run in insertion order
    async fn find_by_run(&self, run_id: &str) -> Result<Vec<PostEvent>>;

    /// Failure-type events of a run in insertion order
    async fn get_failed_events(&self, run_id: &str) -> Result<Vec<PostEvent>>;

    /// Non-empty source URLs recorded in a run by accounts other than `excluding_account`
    async fn get_source_urls_from_run(
        &self,
        run_id: &str,
        excluding_account: &str,
    ) -> Result<Vec<String>>;
}
