//! Run orchestration entry point
//!
//! `PostManagerRegistry` owns one [`PostManager`] per submission kind, so a
//! file run and a message run can post side by side while two runs of the
//! same kind cannot. It loads the run's submission, builds the resume
//! context when the run continues an earlier one, and hands off to the
//! manager.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use libfanout::destinations::DestinationRegistry;
//! use libfanout::destinations::mock::MockDestination;
//! use libfanout::pipeline::Collaborators;
//! use libfanout::service::PostManagerRegistry;
//! use libfanout::store::memory::MemoryStore;
//! use libfanout::types::ResumeMode;
//! use libfanout::Config;
//!
//! # async fn example() -> libfanout::Result<()> {
//! let submissions = Arc::new(MemoryStore::new());
//! let destinations = DestinationRegistry::new()
//!     .with(Arc::new(MockDestination::success("my-account")));
//!
//! let registry = PostManagerRegistry::from_config(
//!     Config::load()?,
//!     Collaborators::passthrough(submissions),
//!     destinations,
//! )
//! .await?;
//!
//! let run = registry.create_run("submission-1", ResumeMode::Restart).await?;
//! let state = registry.start_post(run, None).await?;
//! println!("Run finished: {:?}", state);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::destinations::DestinationRegistry;
use crate::error::{FanoutError, Result};
use crate::pipeline::{Collaborators, SubmissionSource};
use crate::rate_limiter::RateLimiter;
use crate::service::events::{EventBus, NotificationReceiver};
use crate::service::file_poster::FilePoster;
use crate::service::manager::{ManagerSettings, PostManager, SubmissionPoster};
use crate::service::message_poster::MessagePoster;
use crate::service::resume::ResumeContextBuilder;
use crate::store::{EventLogStore, RunStore};
use crate::types::{PostRecord, ResumeMode, RunState, SubmissionType};

/// Everything a registry needs besides storage, collaborators and destinations
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub manager: ManagerSettings,
    pub event_bus_capacity: usize,
    /// Per-website floors on the posting interval
    pub rate_limit_floors: HashMap<String, std::time::Duration>,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            manager: ManagerSettings::default(),
            event_bus_capacity: 100,
            rate_limit_floors: HashMap::new(),
        }
    }
}

impl RegistrySettings {
    /// Settings from a loaded configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a rate limit interval cannot be parsed.
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            manager: ManagerSettings {
                max_concurrent_destinations: config.posting.max_concurrent_destinations,
            },
            event_bus_capacity: config.posting.event_bus_capacity,
            rate_limit_floors: config.rate_limit_floors()?,
        })
    }
}

/// One post manager per submission kind
pub struct PostManagerRegistry {
    managers: HashMap<SubmissionType, Arc<PostManager>>,
    runs: Arc<dyn RunStore>,
    resume: ResumeContextBuilder,
    submissions: Arc<dyn SubmissionSource>,
    bus: EventBus,
}

impl PostManagerRegistry {
    pub fn new(
        runs: Arc<dyn RunStore>,
        events: Arc<dyn EventLogStore>,
        collaborators: Collaborators,
        destinations: DestinationRegistry,
        settings: RegistrySettings,
    ) -> Self {
        let bus = EventBus::new(settings.event_bus_capacity);
        let posters: [Arc<dyn SubmissionPoster>; 2] =
            [Arc::new(FilePoster::new()), Arc::new(MessagePoster::new())];

        let managers = posters
            .into_iter()
            .map(|poster| {
                let manager = PostManager::new(
                    poster,
                    Arc::clone(&runs),
                    Arc::clone(&events),
                    collaborators.clone(),
                    destinations.clone(),
                    RateLimiter::new(settings.rate_limit_floors.clone()),
                    bus.clone(),
                    settings.manager.clone(),
                );
                (manager.kind(), Arc::new(manager))
            })
            .collect();

        Self {
            managers,
            resume: ResumeContextBuilder::new(Arc::clone(&runs), events),
            runs,
            submissions: Arc::clone(&collaborators.submissions),
            bus,
        }
    }

    /// Open the configured SQLite database and build a registry on it
    ///
    /// # Errors
    ///
    /// Returns an error if the rate limits are invalid or the database
    /// cannot be opened or migrated.
    pub async fn from_config(
        config: Config,
        collaborators: Collaborators,
        destinations: DestinationRegistry,
    ) -> Result<Self> {
        let settings = RegistrySettings::from_config(&config)?;
        let db_path = config.database_path();
        let db_path = db_path.to_str().ok_or_else(|| {
            FanoutError::InvalidInput(format!("Database path is not valid UTF-8: {:?}", db_path))
        })?;
        let db = Arc::new(Database::new(db_path).await?);

        Ok(Self::new(
            db.clone(),
            db,
            collaborators,
            destinations,
            settings,
        ))
    }

    /// Record a new PENDING run for `submission_id`
    pub async fn create_run(&self, submission_id: &str, mode: ResumeMode) -> Result<PostRecord> {
        let run = PostRecord::new(submission_id, mode);
        self.runs.insert_run(&run).await?;
        info!(run_id = %run.id, submission_id, mode = %mode, "Created run");
        Ok(run)
    }

    /// Start `run`, resuming from `prior_run_id` if given
    ///
    /// Returns the run's terminal state, or `None` if the run was not
    /// started because a run of the same kind is already posting or the
    /// run is not PENDING.
    ///
    /// # Errors
    ///
    /// Returns `FanoutError::NotFound` if the submission or prior run does
    /// not exist, and `FanoutError::InvalidInput` if the prior run belongs
    /// to a different submission.
    pub async fn start_post(
        &self,
        run: PostRecord,
        prior_run_id: Option<&str>,
    ) -> Result<Option<RunState>> {
        let submission = self
            .submissions
            .find_submission(&run.submission_id)
            .await?
            .ok_or_else(|| {
                FanoutError::NotFound(format!("Submission not found: {}", run.submission_id))
            })?;

        let kind = submission.submission_type;
        let manager = self.manager(kind)?;
        // Fast path only; the single-flight guard is taken in PostManager::start_post
        if manager.is_posting() {
            warn!(
                run_id = %run.id,
                kind = %kind,
                active_run_id = ?manager.active_run_id(),
                "Already posting this submission type, ignoring start request"
            );
            return Ok(None);
        }

        let resume = match prior_run_id {
            Some(prior) => Some(
                self.resume
                    .build(&submission.id, prior, run.resume_mode)
                    .await?,
            ),
            None => None,
        };

        manager.start_post(run, submission, resume).await
    }

    /// Cancel whichever run is posting `submission_id`
    ///
    /// Returns `true` if a run was signalled.
    pub fn cancel_if_running(&self, submission_id: &str) -> bool {
        let mut cancelled = false;
        for manager in self.managers.values() {
            cancelled |= manager.cancel_if_running(submission_id);
        }
        cancelled
    }

    pub fn is_posting_type(&self, kind: SubmissionType) -> bool {
        self.managers.get(&kind).is_some_and(|m| m.is_posting())
    }

    /// Subscribe to live run progress
    pub fn subscribe(&self) -> NotificationReceiver {
        self.bus.subscribe()
    }

    fn manager(&self, kind: SubmissionType) -> Result<&Arc<PostManager>> {
        self.managers
            .get(&kind)
            .ok_or_else(|| FanoutError::InvalidInput(format!("No post manager for {} submissions", kind)))
    }
}
