//! Destination adapter contract
//!
//! A destination is one account on one website. The engine never probes an
//! adapter's concrete type: everything it needs to decide ordering, batching
//! and conversion is declared up front in [`DestinationCapabilities`], and
//! dispatch happens on the submission kind tag.
//!
//! # Examples
//!
//! ```no_run
//! use libfanout::destinations::{Destination, DestinationCapabilities};
//! use libfanout::types::SubmissionType;
//!
//! # fn example(destination: &dyn Destination) {
//! let caps = destination.capabilities();
//! if caps.supports(SubmissionType::File) {
//!     println!(
//!         "{} takes {} file(s) per post",
//!         destination.account_id(),
//!         caps.effective_batch_size()
//!     );
//! }
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancelToken;
use crate::error::{PostFailure, Result};
use crate::types::{Dimensions, SubmissionType};

// Mock destination is available for all builds to support integration tests
pub mod mock;

/// Upper bounds a destination places on uploaded files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeLimits {
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub max_bytes: Option<u64>,
}

impl ResizeLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_width.is_none() && self.max_height.is_none() && self.max_bytes.is_none()
    }

    /// Apply a user override; the override wins on each dimension it sets
    pub fn with_override(mut self, dimensions: Option<Dimensions>) -> Self {
        if let Some(dimensions) = dimensions {
            self.max_width = Some(dimensions.width);
            self.max_height = Some(dimensions.height);
        }
        self
    }

    /// Whether a file of this size and shape exceeds the limits
    pub fn exceeded_by(&self, dimensions: Option<Dimensions>, size: u64) -> bool {
        let too_wide = match (self.max_width, dimensions) {
            (Some(max), Some(d)) => d.width > max,
            _ => false,
        };
        let too_tall = match (self.max_height, dimensions) {
            (Some(max), Some(d)) => d.height > max,
            _ => false,
        };
        let too_big = self.max_bytes.is_some_and(|max| size > max);

        too_wide || too_tall || too_big
    }
}

/// Tagged capability set declared by a destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationCapabilities {
    pub supports_file: bool,
    pub supports_message: bool,
    /// Files per upload call; values below 1 are treated as 1
    pub file_batch_size: usize,
    /// Accepted content types; empty means anything is accepted
    pub accepted_content_types: Vec<String>,
    /// Destination embeds links produced by other destinations, so it runs last
    pub accepts_external_source_urls: bool,
    pub minimum_post_wait_interval: Duration,
    pub resize_limits: ResizeLimits,
}

impl Default for DestinationCapabilities {
    fn default() -> Self {
        Self {
            supports_file: false,
            supports_message: false,
            file_batch_size: 1,
            accepted_content_types: Vec::new(),
            accepts_external_source_urls: false,
            minimum_post_wait_interval: Duration::ZERO,
            resize_limits: ResizeLimits::default(),
        }
    }
}

impl DestinationCapabilities {
    pub fn supports(&self, kind: SubmissionType) -> bool {
        match kind {
            SubmissionType::File => self.supports_file,
            SubmissionType::Message => self.supports_message,
        }
    }

    pub fn effective_batch_size(&self) -> usize {
        self.file_batch_size.max(1)
    }

    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        self.accepted_content_types.is_empty()
            || self
                .accepted_content_types
                .iter()
                .any(|accepted| accepted.eq_ignore_ascii_case(content_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginState {
    pub is_logged_in: bool,
    pub username: Option<String>,
}

/// Rendered, destination-ready post fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostData {
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub rating: Option<String>,
    #[serde(default)]
    pub options: serde_json::Value,
}

/// Run-scoped metadata stamped onto each posting file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostingFileMetadata {
    /// Links to this submission on destinations that already posted it
    pub source_urls: Vec<String>,
}

/// A processed, upload-ready file
#[derive(Debug, Clone)]
pub struct PostingFile {
    pub id: String,
    pub file_name: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub dimensions: Option<Dimensions>,
    pub thumbnail: Option<Arc<Vec<u8>>>,
    pub metadata: PostingFileMetadata,
}

/// What a destination returns from a successful post
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostOutcome {
    /// Public link to the new post, if the website has one
    pub source_url: Option<String>,
    pub message: Option<String>,
}

pub type PostResult = std::result::Result<PostOutcome, PostFailure>;

/// Destination trait for one account on one website
#[async_trait]
pub trait Destination: Send + Sync {
    /// Account identifier (the engine's key for this destination)
    fn account_id(&self) -> &str;

    /// Website name, e.g. "furaffinity"
    fn website(&self) -> &str;

    fn capabilities(&self) -> &DestinationCapabilities;

    fn supports_kind(&self, kind: SubmissionType) -> bool {
        self.capabilities().supports(kind)
    }

    /// Current login state of the account
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be determined.
    async fn login_state(&self) -> Result<LoginState>;

    /// Upload one batch of files
    ///
    /// `batch_index` is 1-based.
    async fn post_files(
        &self,
        _data: &PostData,
        _files: &[PostingFile],
        _batch_index: usize,
        _cancel: &CancelToken,
    ) -> PostResult {
        Err(PostFailure::new(format!(
            "{} does not support file submissions",
            self.website()
        )))
    }

    /// Post a text message
    async fn post_message(&self, _data: &PostData, _cancel: &CancelToken) -> PostResult {
        Err(PostFailure::new(format!(
            "{} does not support message submissions",
            self.website()
        )))
    }
}

/// Destinations known to the engine, keyed by account id
#[derive(Clone, Default)]
pub struct DestinationRegistry {
    destinations: HashMap<String, Arc<dyn Destination>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a destination, replacing any previous one for the same account
    pub fn register(&mut self, destination: Arc<dyn Destination>) {
        self.destinations
            .insert(destination.account_id().to_string(), destination);
    }

    pub fn with(mut self, destination: Arc<dyn Destination>) -> Self {
        self.register(destination);
        self
    }

    pub fn get(&self, account_id: &str) -> Option<&Arc<dyn Destination>> {
        self.destinations.get(account_id)
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }
}
