//! Core types for Fanout

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PostErrorResponse;

// ============================================================================
// Runs
// ============================================================================

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(RunState::Pending),
            "RUNNING" => Some(RunState::Running),
            "DONE" => Some(RunState::Done),
            "FAILED" => Some(RunState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a run relates to the work of earlier runs of the same submission
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResumeMode {
    /// Start over; nothing from earlier runs is carried forward
    Restart,
    Retry,
    Continue,
    ContinueRetry,
}

impl ResumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeMode::Restart => "RESTART",
            ResumeMode::Retry => "RETRY",
            ResumeMode::Continue => "CONTINUE",
            ResumeMode::ContinueRetry => "CONTINUE_RETRY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RESTART" => Some(ResumeMode::Restart),
            "RETRY" => Some(ResumeMode::Retry),
            "CONTINUE" => Some(ResumeMode::Continue),
            "CONTINUE_RETRY" => Some(ResumeMode::ContinueRetry),
            _ => None,
        }
    }

    /// Whether earlier work is carried into the resume context
    pub fn carries_progress(&self) -> bool {
        !matches!(self, ResumeMode::Restart)
    }
}

impl std::fmt::Display for ResumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One attempt to post one submission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostRecord {
    pub id: String,
    pub submission_id: String,
    pub state: RunState,
    pub resume_mode: ResumeMode,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
    /// Unix timestamp in milliseconds
    pub completed_at: Option<i64>,
}

impl PostRecord {
    pub fn new(submission_id: impl Into<String>, resume_mode: ResumeMode) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            submission_id: submission_id.into(),
            state: RunState::Pending,
            resume_mode,
            created_at: chrono::Utc::now().timestamp_millis(),
            completed_at: None,
        }
    }
}

/// Fields the engine is allowed to change on a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub state: Option<RunState>,
    pub completed_at: Option<i64>,
}

// ============================================================================
// Submissions
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionType {
    File,
    Message,
}

impl std::fmt::Display for SubmissionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmissionType::File => write!(f, "FILE"),
            SubmissionType::Message => write!(f, "MESSAGE"),
        }
    }
}

/// Width/height pair in pixels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A file attached to a submission
#[derive(Debug, Clone)]
pub struct SubmissionFile {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub dimensions: Option<Dimensions>,
    /// Position within the submission; batches follow this order
    pub order: u32,
    /// Accounts this file must not be sent to
    pub ignored_accounts: HashSet<String>,
    /// User-chosen per-account size caps
    pub dimension_overrides: HashMap<String, Dimensions>,
    pub thumbnail: Option<Arc<Vec<u8>>>,
}

impl SubmissionFile {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
        order: u32,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes: Arc::new(bytes),
            dimensions: None,
            order,
            ignored_accounts: HashSet::new(),
            dimension_overrides: HashMap::new(),
            thumbnail: None,
        }
    }

    pub fn is_ignored_for(&self, account_id: &str) -> bool {
        self.ignored_accounts.contains(account_id)
    }

    /// Snapshot recorded on FILE_* events
    pub fn snapshot(&self) -> FileSnapshot {
        let mut hasher = Sha256::new();
        hasher.update(self.bytes.as_slice());
        let hash = hasher.finalize();

        FileSnapshot {
            file_name: self.file_name.clone(),
            content_type: self.content_type.clone(),
            size: self.bytes.len() as u64,
            sha256: format!("{:x}", hash),
        }
    }
}

/// Per-destination options chosen by the user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationOptions {
    pub account_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub rating: Option<String>,
    /// Website-specific fields, opaque to the engine
    #[serde(default)]
    pub extra: serde_json::Value,
}

impl DestinationOptions {
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            title: None,
            description: None,
            tags: Vec::new(),
            rating: None,
            extra: serde_json::Value::Null,
        }
    }
}

/// The thing being published, owned outside the engine
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: String,
    pub submission_type: SubmissionType,
    pub files: Vec<SubmissionFile>,
    pub options: Vec<DestinationOptions>,
}

impl Submission {
    pub fn options_for(&self, account_id: &str) -> Option<&DestinationOptions> {
        self.options.iter().find(|o| o.account_id == account_id)
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PostEventType {
    PostAttemptStarted,
    PostAttemptCompleted,
    PostAttemptFailed,
    FilePosted,
    FileFailed,
    MessagePosted,
    MessageFailed,
}

impl PostEventType {
    pub const ALL: [PostEventType; 7] = [
        PostEventType::PostAttemptStarted,
        PostEventType::PostAttemptCompleted,
        PostEventType::PostAttemptFailed,
        PostEventType::FilePosted,
        PostEventType::FileFailed,
        PostEventType::MessagePosted,
        PostEventType::MessageFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostEventType::PostAttemptStarted => "POST_ATTEMPT_STARTED",
            PostEventType::PostAttemptCompleted => "POST_ATTEMPT_COMPLETED",
            PostEventType::PostAttemptFailed => "POST_ATTEMPT_FAILED",
            PostEventType::FilePosted => "FILE_POSTED",
            PostEventType::FileFailed => "FILE_FAILED",
            PostEventType::MessagePosted => "MESSAGE_POSTED",
            PostEventType::MessageFailed => "MESSAGE_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PostEventType::PostAttemptFailed
                | PostEventType::FileFailed
                | PostEventType::MessageFailed
        )
    }

    /// Success events that may carry an external link
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            PostEventType::FilePosted | PostEventType::MessagePosted
        )
    }

    pub fn failure_types() -> impl Iterator<Item = PostEventType> {
        Self::ALL.into_iter().filter(|t| t.is_failure())
    }
}

impl std::fmt::Display for PostEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identity of a file at the moment it was posted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSnapshot {
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub sha256: String,
}

/// Free-form context stored alongside an event
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self == &EventMetadata::default()
    }
}

/// Immutable fact about a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostEvent {
    pub id: String,
    pub run_id: String,
    pub account_id: String,
    pub event_type: PostEventType,
    pub file_id: Option<String>,
    pub source_url: Option<String>,
    pub error: Option<PostErrorResponse>,
    pub metadata: EventMetadata,
    /// Unix timestamp in milliseconds
    pub created_at: i64,
}

impl PostEvent {
    pub fn new(
        run_id: impl Into<String>,
        account_id: impl Into<String>,
        event_type: PostEventType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            account_id: account_id.into(),
            event_type,
            file_id: None,
            source_url: None,
            error: None,
            metadata: EventMetadata::default(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_file(mut self, file_id: impl Into<String>, snapshot: FileSnapshot) -> Self {
        self.file_id = Some(file_id.into());
        self.metadata.file = Some(snapshot);
        self
    }

    pub fn with_source_url(mut self, source_url: Option<String>) -> Self {
        self.source_url = source_url.filter(|url| !url.trim().is_empty());
        self
    }

    pub fn with_error(mut self, error: PostErrorResponse) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// Resume context
// ============================================================================

/// What earlier runs already achieved, folded from their event logs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeContext {
    pub completed_account_ids: HashSet<String>,
    pub posted_files_by_account: HashMap<String, HashSet<String>>,
    pub source_urls_by_account: HashMap<String, Vec<String>>,
}

impl ResumeContext {
    pub fn is_empty(&self) -> bool {
        self.completed_account_ids.is_empty()
            && self.posted_files_by_account.is_empty()
            && self.source_urls_by_account.is_empty()
    }

    pub fn is_completed(&self, account_id: &str) -> bool {
        self.completed_account_ids.contains(account_id)
    }

    pub fn was_file_posted(&self, account_id: &str, file_id: &str) -> bool {
        self.posted_files_by_account
            .get(account_id)
            .is_some_and(|files| files.contains(file_id))
    }

    /// Source URLs produced by every account except `account_id`
    pub fn source_urls_excluding(&self, account_id: &str) -> Vec<String> {
        let mut accounts: Vec<&String> = self
            .source_urls_by_account
            .keys()
            .filter(|a| a.as_str() != account_id)
            .collect();
        accounts.sort();

        accounts
            .into_iter()
            .flat_map(|a| self.source_urls_by_account[a].iter().cloned())
            .collect()
    }
}
