//! Resume context construction and run-state derivation
//!
//! Both are folds over the event log. The folds are pure functions over
//! ordered events so they can be tested without storage; the builder only
//! decides which runs' events to feed them.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{FanoutError, Result};
use crate::store::{EventLogStore, RunStore};
use crate::types::{PostEvent, PostEventType, PostRecord, ResumeContext, ResumeMode, RunState};

/// Terminal state of a run given its events
///
/// FAILED if and only if at least one failure-type event exists.
pub fn derive_run_state(events: &[PostEvent]) -> RunState {
    if events.iter().any(|e| e.event_type.is_failure()) {
        RunState::Failed
    } else {
        RunState::Done
    }
}

/// Fold ordered events (oldest first) into a resume context
///
/// An account is completed when its latest attempt-level outcome is
/// `POST_ATTEMPT_COMPLETED`. Posted files and source URLs accumulate across
/// every event, including those of attempts that later failed.
pub fn fold_resume_context<'a, I>(events: I) -> ResumeContext
where
    I: IntoIterator<Item = &'a PostEvent>,
{
    let mut context = ResumeContext::default();
    let mut last_outcome: HashMap<&str, PostEventType> = HashMap::new();

    for event in events {
        match event.event_type {
            PostEventType::PostAttemptCompleted | PostEventType::PostAttemptFailed => {
                last_outcome.insert(event.account_id.as_str(), event.event_type);
            }
            PostEventType::FilePosted => {
                if let Some(file_id) = &event.file_id {
                    context
                        .posted_files_by_account
                        .entry(event.account_id.clone())
                        .or_default()
                        .insert(file_id.clone());
                }
            }
            _ => {}
        }

        if event.event_type.is_success() {
            if let Some(url) = event.source_url.as_deref().filter(|u| !u.is_empty()) {
                let urls = context
                    .source_urls_by_account
                    .entry(event.account_id.clone())
                    .or_default();
                if !urls.iter().any(|u| u == url) {
                    urls.push(url.to_string());
                }
            }
        }
    }

    context.completed_account_ids = last_outcome
        .into_iter()
        .filter(|(_, outcome)| *outcome == PostEventType::PostAttemptCompleted)
        .map(|(account, _)| account.to_string())
        .collect();

    context
}

/// Runs whose events feed a resume from `prior_run_id`, oldest first
///
/// Walks back from the prior run through earlier runs of the same
/// submission, stopping after the most recent RESTART-mode run.
pub fn resume_chain(runs: &[PostRecord], prior_run_id: &str) -> Vec<PostRecord> {
    let Some(position) = runs.iter().position(|r| r.id == prior_run_id) else {
        return Vec::new();
    };

    let mut chain = Vec::new();
    for run in runs[..=position].iter().rev() {
        chain.push(run.clone());
        if run.resume_mode == ResumeMode::Restart {
            break;
        }
    }
    chain.reverse();
    chain
}

/// Builds resume contexts from stored runs and events
#[derive(Clone)]
pub struct ResumeContextBuilder {
    runs: Arc<dyn RunStore>,
    events: Arc<dyn EventLogStore>,
}

impl ResumeContextBuilder {
    pub fn new(runs: Arc<dyn RunStore>, events: Arc<dyn EventLogStore>) -> Self {
        Self { runs, events }
    }

    /// Reconstruct what earlier runs of `submission_id` already achieved
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::NotFound` if the prior run does not exist and
    /// `FanoutError::InvalidInput` if it belongs to another submission.
    pub async fn build(
        &self,
        submission_id: &str,
        prior_run_id: &str,
        mode: ResumeMode,
    ) -> Result<ResumeContext> {
        if !mode.carries_progress() {
            debug!(submission_id, prior_run_id, "Restart mode, empty resume context");
            return Ok(ResumeContext::default());
        }

        let prior = self
            .runs
            .find_run(prior_run_id)
            .await?
            .ok_or_else(|| FanoutError::NotFound(format!("Prior run not found: {}", prior_run_id)))?;
        if prior.submission_id != submission_id {
            return Err(FanoutError::InvalidInput(format!(
                "Run {} belongs to submission {}, not {}",
                prior_run_id, prior.submission_id, submission_id
            )));
        }

        let runs = self.runs.find_runs_for_submission(submission_id).await?;
        let mut chain = resume_chain(&runs, prior_run_id);
        if chain.is_empty() {
            chain.push(prior);
        }

        let mut events = Vec::new();
        for run in &chain {
            events.extend(self.events.find_by_run(&run.id).await?);
        }

        let context = fold_resume_context(&events);
        info!(
            submission_id,
            prior_run_id,
            mode = %mode,
            runs = chain.len(),
            completed_accounts = context.completed_account_ids.len(),
            "Built resume context"
        );

        Ok(context)
    }
}
