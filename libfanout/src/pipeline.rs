//! Collaborator contracts the engine calls but does not implement
//!
//! Rendering post text, validating fields, resizing or transcoding files and
//! loading submissions all live outside the engine. Each concern is a trait
//! object handed to the registry; simple pass-through implementations are
//! provided for embedders that have nothing better and for tests.

use async_trait::async_trait;
use std::sync::Arc;

use crate::destinations::{Destination, PostData, ResizeLimits};
use crate::error::Result;
use crate::types::{DestinationOptions, Dimensions, Submission, SubmissionFile};

/// Turns a submission plus per-destination options into post fields
#[async_trait]
pub trait PostDataPreparer: Send + Sync {
    async fn prepare(
        &self,
        submission: &Submission,
        destination: &dyn Destination,
        options: &DestinationOptions,
    ) -> Result<PostData>;
}

/// Outcome of one validation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Field validation for a submission bound for one destination
#[async_trait]
pub trait SubmissionValidator: Send + Sync {
    async fn validate(
        &self,
        submission: &Submission,
        options: &DestinationOptions,
    ) -> Result<Vec<ValidationResult>>;
}

/// File content as it moves through conversion and resizing
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
    pub dimensions: Option<Dimensions>,
}

impl From<&SubmissionFile> for ProcessedFile {
    fn from(file: &SubmissionFile) -> Self {
        Self {
            file_name: file.file_name.clone(),
            content_type: file.content_type.clone(),
            bytes: Arc::clone(&file.bytes),
            dimensions: file.dimensions,
        }
    }
}

/// Image resizing and content-type conversion
#[async_trait]
pub trait FileProcessor: Send + Sync {
    /// Shrink `file` to fit `limits`
    async fn resize(&self, file: ProcessedFile, limits: &ResizeLimits) -> Result<ProcessedFile>;

    /// Convert `file` to one of `accepted_types`
    async fn convert(&self, file: ProcessedFile, accepted_types: &[String])
        -> Result<ProcessedFile>;
}

/// Source of submissions by id
#[async_trait]
pub trait SubmissionSource: Send + Sync {
    async fn find_submission(&self, submission_id: &str) -> Result<Option<Submission>>;
}

/// Copies the user's options into post data unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct OptionsPreparer;

#[async_trait]
impl PostDataPreparer for OptionsPreparer {
    async fn prepare(
        &self,
        _submission: &Submission,
        _destination: &dyn Destination,
        options: &DestinationOptions,
    ) -> Result<PostData> {
        Ok(PostData {
            title: options.title.clone(),
            description: options.description.clone(),
            tags: options.tags.clone(),
            rating: options.rating.clone(),
            options: options.extra.clone(),
        })
    }
}

/// Reports no validation problems
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllValidator;

#[async_trait]
impl SubmissionValidator for AcceptAllValidator {
    async fn validate(
        &self,
        _submission: &Submission,
        _options: &DestinationOptions,
    ) -> Result<Vec<ValidationResult>> {
        Ok(Vec::new())
    }
}

/// Returns files untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughProcessor;

#[async_trait]
impl FileProcessor for PassthroughProcessor {
    async fn resize(&self, file: ProcessedFile, _limits: &ResizeLimits) -> Result<ProcessedFile> {
        Ok(file)
    }

    async fn convert(
        &self,
        file: ProcessedFile,
        _accepted_types: &[String],
    ) -> Result<ProcessedFile> {
        Ok(file)
    }
}

/// Everything the engine needs from the outside world besides storage
#[derive(Clone)]
pub struct Collaborators {
    pub preparer: Arc<dyn PostDataPreparer>,
    pub validator: Arc<dyn SubmissionValidator>,
    pub processor: Arc<dyn FileProcessor>,
    pub submissions: Arc<dyn SubmissionSource>,
}

impl Collaborators {
    /// Pass-through collaborators around a submission source
    pub fn passthrough(submissions: Arc<dyn SubmissionSource>) -> Self {
        Self {
            preparer: Arc::new(OptionsPreparer),
            validator: Arc::new(AcceptAllValidator),
            processor: Arc::new(PassthroughProcessor),
            submissions,
        }
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn PostDataPreparer>) -> Self {
        self.preparer = preparer;
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SubmissionValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_processor(mut self, processor: Arc<dyn FileProcessor>) -> Self {
        self.processor = processor;
        self
    }
}
