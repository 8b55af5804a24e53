//! Post manager: runs one submission against all of its destinations
//!
//! A manager owns at most one active run. Starting a run marks it RUNNING,
//! posts to destinations group by group, and finally derives the run's
//! terminal state from the event log. Everything that can go wrong with a
//! single destination is recorded as events for that destination and never
//! reaches the caller.
//!
//! The kind-specific part of posting (file batches or a single message) is
//! supplied by a [`SubmissionPoster`].

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancellation::CancelToken;
use crate::destinations::{Destination, DestinationRegistry, PostData};
use crate::error::{FanoutError, PostError, PostFailure, Result};
use crate::pipeline::{Collaborators, FileProcessor};
use crate::rate_limiter::RateLimiter;
use crate::service::events::{EventBus, Notification};
use crate::service::resume::derive_run_state;
use crate::store::{EventLogStore, RunStore};
use crate::types::{
    DestinationOptions, EventMetadata, PostEvent, PostEventType, PostRecord, ResumeContext,
    RunState, RunUpdate, Submission, SubmissionType,
};

/// Kind-specific half of a post manager
#[async_trait]
pub trait SubmissionPoster: Send + Sync {
    fn kind(&self) -> SubmissionType;

    /// Post the submission to the destination in `attempt`
    ///
    /// Implementations emit their own per-file or per-message events; the
    /// manager records the attempt-level outcome.
    async fn attempt_to_post(&self, attempt: &PostAttempt<'_>) -> std::result::Result<(), PostError>;
}

/// Shared services a poster needs while attempting one destination
pub struct PostingServices {
    pub events: Arc<dyn EventLogStore>,
    pub processor: Arc<dyn FileProcessor>,
    pub rate_limiter: RateLimiter,
}

/// Everything known about one destination attempt
pub struct PostAttempt<'a> {
    pub run: &'a PostRecord,
    pub submission: &'a Submission,
    pub destination: &'a dyn Destination,
    pub options: &'a DestinationOptions,
    pub data: &'a PostData,
    pub resume: Option<&'a ResumeContext>,
    pub cancel: &'a CancelToken,
    pub services: &'a PostingServices,
}

impl PostAttempt<'_> {
    pub fn account_id(&self) -> &str {
        self.destination.account_id()
    }

    /// New event for this run and account
    pub fn event(&self, event_type: PostEventType) -> PostEvent {
        PostEvent::new(&self.run.id, self.account_id(), event_type).with_metadata(EventMetadata {
            website: Some(self.destination.website().to_string()),
            ..Default::default()
        })
    }

    /// Append an event to the log
    pub async fn emit(&self, event: PostEvent) -> std::result::Result<(), PostError> {
        debug!(
            run_id = %event.run_id,
            account_id = %event.account_id,
            event_type = %event.event_type,
            file_id = ?event.file_id,
            "Recording event"
        );
        self.services.events.insert(&event).await.map_err(PostError::from)
    }

    /// Minimum interval between posts to this account
    pub fn post_interval(&self) -> Duration {
        self.services.rate_limiter.interval_for(
            self.destination.website(),
            self.destination.capabilities().minimum_post_wait_interval,
        )
    }

    /// Wait out this account's posting interval
    pub async fn wait_for_post_interval(&self) -> std::result::Result<(), PostError> {
        self.services
            .rate_limiter
            .wait(self.account_id(), self.post_interval(), self.cancel)
            .await
    }

    /// Note a successful post for rate limiting
    pub fn record_post(&self) {
        self.services.rate_limiter.record(self.account_id());
    }

    /// Links produced by other destinations, deduplicated
    ///
    /// Combines what this run has already recorded with what earlier runs
    /// produced. This account's own links are never included.
    pub async fn external_source_urls(&self) -> std::result::Result<Vec<String>, PostError> {
        let account_id = self.account_id();
        let mut urls = self
            .services
            .events
            .get_source_urls_from_run(&self.run.id, account_id)
            .await?;
        if let Some(resume) = self.resume {
            urls.extend(resume.source_urls_excluding(account_id));
        }

        let mut seen = HashSet::new();
        urls.retain(|url| !url.is_empty() && seen.insert(url.clone()));
        Ok(urls)
    }
}

/// Split a submission's accounts into ordered dispatch groups
///
/// Standard destinations come first; destinations that embed other
/// destinations' links come last. Accounts already completed according to
/// `resume` are left out, and unregistered accounts go in the first group so
/// their failure is recorded. Empty groups are dropped.
pub fn order_destinations(
    submission: &Submission,
    destinations: &DestinationRegistry,
    resume: Option<&ResumeContext>,
) -> Vec<Vec<String>> {
    let mut seen = HashSet::new();
    let mut standard = Vec::new();
    let mut external = Vec::new();

    for options in &submission.options {
        let account_id = options.account_id.as_str();
        if !seen.insert(account_id) {
            continue;
        }
        if resume.is_some_and(|r| r.is_completed(account_id)) {
            debug!(account_id, "Skipping account completed in an earlier run");
            continue;
        }

        let runs_last = destinations
            .get(account_id)
            .is_some_and(|d| d.capabilities().accepts_external_source_urls);
        if runs_last {
            external.push(account_id.to_string());
        } else {
            standard.push(account_id.to_string());
        }
    }

    [standard, external]
        .into_iter()
        .filter(|group| !group.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: String,
    submission_id: String,
    cancel: CancelToken,
}

/// Clears the manager's active run when the run ends, however it ends
struct ActiveRunGuard<'a> {
    slot: &'a Mutex<Option<ActiveRun>>,
    run_id: String,
}

impl Drop for ActiveRunGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|a| a.run_id == self.run_id) {
            *slot = None;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tunables shared by every manager
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub max_concurrent_destinations: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_destinations: 8,
        }
    }
}

/// Post manager for one submission kind
pub struct PostManager {
    poster: Arc<dyn SubmissionPoster>,
    runs: Arc<dyn RunStore>,
    services: PostingServices,
    collaborators: Collaborators,
    destinations: DestinationRegistry,
    bus: EventBus,
    settings: ManagerSettings,
    active: Mutex<Option<ActiveRun>>,
}

impl PostManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        poster: Arc<dyn SubmissionPoster>,
        runs: Arc<dyn RunStore>,
        events: Arc<dyn EventLogStore>,
        collaborators: Collaborators,
        destinations: DestinationRegistry,
        rate_limiter: RateLimiter,
        bus: EventBus,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            poster,
            runs,
            services: PostingServices {
                events,
                processor: Arc::clone(&collaborators.processor),
                rate_limiter,
            },
            collaborators,
            destinations,
            bus,
            settings,
            active: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> SubmissionType {
        self.poster.kind()
    }

    /// Whether a run is currently active on this manager
    pub fn is_posting(&self) -> bool {
        lock(&self.active).is_some()
    }

    pub fn active_run_id(&self) -> Option<String> {
        lock(&self.active).as_ref().map(|a| a.run_id.clone())
    }

    /// Cancel the active run if it belongs to `submission_id`
    pub fn cancel_if_running(&self, submission_id: &str) -> bool {
        match lock(&self.active).as_ref() {
            Some(active) if active.submission_id == submission_id => {
                info!(run_id = %active.run_id, submission_id, "Cancelling run");
                active.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Run `run` to completion
    ///
    /// Returns the terminal state, or `None` if the run was not started
    /// (another run is active, or the run is not PENDING) or could not be
    /// finalized.
    ///
    /// # Errors
    ///
    /// Returns an error only if `submission` does not belong to `run` or is
    /// of the wrong kind; per-destination problems end up in the event log.
    pub async fn start_post(
        &self,
        run: PostRecord,
        submission: Submission,
        resume: Option<ResumeContext>,
    ) -> Result<Option<RunState>> {
        if submission.id != run.submission_id {
            return Err(FanoutError::InvalidInput(format!(
                "Run {} is for submission {}, not {}",
                run.id, run.submission_id, submission.id
            )));
        }
        if submission.submission_type != self.kind() {
            return Err(FanoutError::InvalidInput(format!(
                "{} manager cannot post {} submission {}",
                self.kind(),
                submission.submission_type,
                submission.id
            )));
        }
        if run.state != RunState::Pending {
            warn!(run_id = %run.id, state = %run.state, "Run is not pending, not starting");
            return Ok(None);
        }

        let cancel = CancelToken::new();
        {
            let mut active = lock(&self.active);
            if let Some(current) = active.as_ref() {
                warn!(
                    run_id = %run.id,
                    active_run_id = %current.run_id,
                    kind = %self.kind(),
                    "A run is already posting, ignoring start request"
                );
                return Ok(None);
            }
            *active = Some(ActiveRun {
                run_id: run.id.clone(),
                submission_id: run.submission_id.clone(),
                cancel: cancel.clone(),
            });
        }
        let _guard = ActiveRunGuard {
            slot: &self.active,
            run_id: run.id.clone(),
        };

        info!(run_id = %run.id, submission_id = %run.submission_id, kind = %self.kind(), "Starting run");

        if let Err(e) = self.orchestrate(&run, &submission, resume.as_ref(), &cancel).await {
            error!(run_id = %run.id, "Run orchestration failed: {}", e);
        }

        Ok(self.finalize(&run.id).await)
    }

    async fn orchestrate(
        &self,
        run: &PostRecord,
        submission: &Submission,
        resume: Option<&ResumeContext>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.runs
            .update_run(
                &run.id,
                &RunUpdate {
                    state: Some(RunState::Running),
                    completed_at: None,
                },
            )
            .await?;

        let groups = order_destinations(submission, &self.destinations, resume);
        self.bus.emit(Notification::RunStarted {
            run_id: run.id.clone(),
            submission_id: submission.id.clone(),
            accounts: groups.iter().flatten().cloned().collect(),
        });

        for (index, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(run_id = %run.id, group = index, "Run cancelled, skipping remaining destinations");
                break;
            }

            debug!(run_id = %run.id, group = index, destinations = group.len(), "Dispatching group");
            // Collected first: a closure-mapped stream makes the run future !Send
            let attempts: Vec<_> = group
                .iter()
                .map(|account_id| self.post_to_website(run, submission, account_id, resume, cancel))
                .collect();
            stream::iter(attempts)
                .buffer_unordered(self.settings.max_concurrent_destinations.max(1))
                .collect::<Vec<()>>()
                .await;
        }

        Ok(())
    }

    /// Post to one destination and record the attempt-level outcome
    async fn post_to_website(
        &self,
        run: &PostRecord,
        submission: &Submission,
        account_id: &str,
        resume: Option<&ResumeContext>,
        cancel: &CancelToken,
    ) {
        self.bus.emit(Notification::DestinationStarted {
            run_id: run.id.clone(),
            account_id: account_id.to_string(),
        });

        let result = self
            .attempt_destination(run, submission, account_id, resume, cancel)
            .await;

        let website = self
            .destinations
            .get(account_id)
            .map(|d| d.website().to_string());
        let metadata = EventMetadata {
            website,
            ..Default::default()
        };

        match result {
            Ok(()) => {
                self.services.rate_limiter.record(account_id);
                let event = PostEvent::new(&run.id, account_id, PostEventType::PostAttemptCompleted)
                    .with_metadata(metadata);
                if let Err(e) = self.services.events.insert(&event).await {
                    error!(run_id = %run.id, account_id, "Failed to record completed attempt: {}", e);
                }
                info!(run_id = %run.id, account_id, "Posted to destination");
                self.bus.emit(Notification::DestinationCompleted {
                    run_id: run.id.clone(),
                    account_id: account_id.to_string(),
                });
            }
            Err(err) => {
                let event = PostEvent::new(&run.id, account_id, PostEventType::PostAttemptFailed)
                    .with_error(err.to_response())
                    .with_metadata(metadata);
                if let Err(e) = self.services.events.insert(&event).await {
                    error!(run_id = %run.id, account_id, "Failed to record failed attempt: {}", e);
                }

                if err.is_cancellation() {
                    info!(run_id = %run.id, account_id, "Destination cancelled");
                    self.bus.emit(Notification::DestinationCancelled {
                        run_id: run.id.clone(),
                        account_id: account_id.to_string(),
                    });
                } else {
                    warn!(run_id = %run.id, account_id, stage = err.stage(), "Failed to post: {}", err);
                    self.bus.emit(Notification::DestinationFailed {
                        run_id: run.id.clone(),
                        account_id: account_id.to_string(),
                        stage: err.stage().to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    async fn attempt_destination(
        &self,
        run: &PostRecord,
        submission: &Submission,
        account_id: &str,
        resume: Option<&ResumeContext>,
        cancel: &CancelToken,
    ) -> std::result::Result<(), PostError> {
        let destination = self
            .destinations
            .get(account_id)
            .ok_or_else(|| PostError::UnknownAccount(account_id.to_string()))?;
        let options = submission
            .options_for(account_id)
            .ok_or_else(|| PostError::UnknownAccount(account_id.to_string()))?;

        let login = destination.login_state().await.map_err(|e| {
            PostError::Adapter(
                PostFailure::new(format!("Could not check login: {}", e)).with_stage("login"),
            )
        })?;
        if !login.is_logged_in {
            return Err(PostError::NotLoggedIn(account_id.to_string()));
        }
        if !destination.supports_kind(submission.submission_type) {
            return Err(PostError::UnsupportedKind {
                account: account_id.to_string(),
                kind: submission.submission_type,
            });
        }

        let data = self
            .collaborators
            .preparer
            .prepare(submission, destination.as_ref(), options)
            .await
            .map_err(|e| PostError::Preparation(e.to_string()))?;

        let attempt = PostAttempt {
            run,
            submission,
            destination: destination.as_ref(),
            options,
            data: &data,
            resume,
            cancel,
            services: &self.services,
        };

        attempt
            .emit(attempt.event(PostEventType::PostAttemptStarted))
            .await?;

        let results = self
            .collaborators
            .validator
            .validate(submission, options)
            .await
            .map_err(|e| PostError::Validation(e.to_string()))?;
        let errors: Vec<String> = results.into_iter().flat_map(|r| r.errors).collect();
        if !errors.is_empty() {
            return Err(PostError::Validation(errors.join("; ")));
        }

        self.poster.attempt_to_post(&attempt).await
    }

    /// Derive and persist the run's terminal state from its events
    async fn finalize(&self, run_id: &str) -> Option<RunState> {
        match self.runs.find_run(run_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                error!(run_id, "Run disappeared before it could be finalized");
                return None;
            }
            Err(e) => {
                error!(run_id, "Failed to load run for finalize: {}", e);
                return None;
            }
        }

        let failures = match self.services.events.get_failed_events(run_id).await {
            Ok(failures) => failures,
            Err(e) => {
                error!(run_id, "Failed to read event log for finalize: {}", e);
                return None;
            }
        };
        let state = derive_run_state(&failures);

        let update = RunUpdate {
            state: Some(state),
            completed_at: Some(chrono::Utc::now().timestamp_millis()),
        };
        if let Err(e) = self.runs.update_run(run_id, &update).await {
            error!(run_id, "Failed to record run state: {}", e);
            return None;
        }

        info!(run_id, state = %state, failures = failures.len(), "Run finished");
        self.bus.emit(Notification::RunFinished {
            run_id: run_id.to_string(),
            state,
        });

        Some(state)
    }
}
