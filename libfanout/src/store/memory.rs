//! In-process store for runs, events and submissions

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{FanoutError, Result};
use crate::pipeline::SubmissionSource;
use crate::store::{EventLogStore, RunStore};
use crate::types::{PostEvent, PostRecord, RunUpdate, Submission};

/// Memory-backed implementation of every storage contract
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<Vec<PostRecord>>,
    events: Mutex<Vec<PostEvent>>,
    submissions: Mutex<HashMap<String, Submission>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_submission(&self, submission: Submission) {
        lock(&self.submissions).insert(submission.id.clone(), submission);
    }

    /// Remove a run record, leaving its events in place
    pub fn remove_run(&self, run_id: &str) -> bool {
        let mut runs = lock(&self.runs);
        let before = runs.len();
        runs.retain(|r| r.id != run_id);
        runs.len() != before
    }

    /// Every event of every run in insertion order
    pub fn all_events(&self) -> Vec<PostEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &PostRecord) -> Result<()> {
        let mut runs = lock(&self.runs);
        if runs.iter().any(|r| r.id == run.id) {
            return Err(FanoutError::InvalidInput(format!(
                "Run already exists: {}",
                run.id
            )));
        }
        runs.push(run.clone());
        Ok(())
    }

    async fn find_run(&self, run_id: &str) -> Result<Option<PostRecord>> {
        Ok(lock(&self.runs).iter().find(|r| r.id == run_id).cloned())
    }

    async fn find_runs_for_submission(&self, submission_id: &str) -> Result<Vec<PostRecord>> {
        let mut runs: Vec<PostRecord> = lock(&self.runs)
            .iter()
            .filter(|r| r.submission_id == submission_id)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn update_run(&self, run_id: &str, update: &RunUpdate) -> Result<()> {
        let mut runs = lock(&self.runs);
        let run = runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| FanoutError::NotFound(format!("Run not found: {}", run_id)))?;

        if let Some(state) = update.state {
            run.state = state;
        }
        if let Some(completed_at) = update.completed_at {
            run.completed_at = Some(completed_at);
        }
        Ok(())
    }
}

#[async_trait]
impl EventLogStore for MemoryStore {
    async fn insert(&self, event: &PostEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }

    async fn find_by_run(&self, run_id: &str) -> Result<Vec<PostEvent>> {
        Ok(lock(&self.events)
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_failed_events(&self, run_id: &str) -> Result<Vec<PostEvent>> {
        Ok(lock(&self.events)
            .iter()
            .filter(|e| e.run_id == run_id && e.event_type.is_failure())
            .cloned()
            .collect())
    }

    async fn get_source_urls_from_run(
        &self,
        run_id: &str,
        excluding_account: &str,
    ) -> Result<Vec<String>> {
        Ok(lock(&self.events)
            .iter()
            .filter(|e| e.run_id == run_id && e.account_id != excluding_account)
            .filter_map(|e| e.source_url.clone())
            .filter(|url| !url.is_empty())
            .collect())
    }
}

#[async_trait]
impl SubmissionSource for MemoryStore {
    async fn find_submission(&self, submission_id: &str) -> Result<Option<Submission>> {
        Ok(lock(&self.submissions).get(submission_id).cloned())
    }
}
