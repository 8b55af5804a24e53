//! File submission posting
//!
//! Files go out in batches sized by the destination. Every batch is
//! processed (converted and resized as needed), stamped with links from
//! destinations that already posted, and uploaded after the account's rate
//! limit has elapsed. Each file gets its own FILE_POSTED or FILE_FAILED
//! event, so a later resume can skip what already went out.

use async_trait::async_trait;
use futures::future::try_join_all;
use tracing::{debug, info};

use crate::destinations::{Destination, PostingFile, PostingFileMetadata};
use crate::error::PostError;
use crate::pipeline::{FileProcessor, ProcessedFile};
use crate::service::manager::{PostAttempt, SubmissionPoster};
use crate::types::{PostEventType, SubmissionFile, SubmissionType};

/// Poster for `SubmissionType::File`
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePoster;

impl FilePoster {
    pub fn new() -> Self {
        Self
    }
}

/// Files still to be sent to `account_id`, in submission order
pub fn select_files<'a>(attempt: &PostAttempt<'a>) -> Vec<&'a SubmissionFile> {
    let account_id = attempt.account_id();
    let mut files: Vec<&SubmissionFile> = attempt
        .submission
        .files
        .iter()
        .filter(|f| !f.is_ignored_for(account_id))
        .filter(|f| !attempt.resume.is_some_and(|r| r.was_file_posted(account_id, &f.id)))
        .collect();
    files.sort_by_key(|f| f.order);
    files
}

/// Convert and resize one file for `destination`
async fn process_file(
    processor: &dyn FileProcessor,
    destination: &dyn Destination,
    file: &SubmissionFile,
    source_urls: &[String],
) -> Result<PostingFile, PostError> {
    let caps = destination.capabilities();
    let processing_error = |e: crate::error::FanoutError| PostError::Processing {
        file_id: file.id.clone(),
        reason: e.to_string(),
    };

    let mut processed = ProcessedFile::from(file);

    if !caps.accepts_content_type(&processed.content_type) {
        debug!(
            file_id = %file.id,
            from = %processed.content_type,
            "Converting file to an accepted type"
        );
        processed = processor
            .convert(processed, &caps.accepted_content_types)
            .await
            .map_err(processing_error)?;
    }

    if processed.content_type.starts_with("image/") {
        let limits = caps
            .resize_limits
            .with_override(file.dimension_overrides.get(destination.account_id()).copied());
        if limits.exceeded_by(processed.dimensions, processed.bytes.len() as u64) {
            debug!(file_id = %file.id, ?limits, "Resizing file");
            processed = processor
                .resize(processed, &limits)
                .await
                .map_err(processing_error)?;
        }
    }

    if !caps.accepts_content_type(&processed.content_type) {
        return Err(PostError::ContentTypeMismatch {
            account: destination.account_id().to_string(),
            file_id: file.id.clone(),
            content_type: processed.content_type,
        });
    }

    Ok(PostingFile {
        id: file.id.clone(),
        file_name: processed.file_name,
        content_type: processed.content_type,
        bytes: processed.bytes,
        dimensions: processed.dimensions,
        thumbnail: file.thumbnail.clone(),
        metadata: PostingFileMetadata {
            source_urls: source_urls.to_vec(),
        },
    })
}

#[async_trait]
impl SubmissionPoster for FilePoster {
    fn kind(&self) -> SubmissionType {
        SubmissionType::File
    }

    async fn attempt_to_post(&self, attempt: &PostAttempt<'_>) -> Result<(), PostError> {
        let files = select_files(attempt);
        if files.is_empty() {
            info!(
                run_id = %attempt.run.id,
                account_id = attempt.account_id(),
                "No files left to post"
            );
            return Ok(());
        }

        let batch_size = attempt.destination.capabilities().effective_batch_size();

        for (index, batch) in files.chunks(batch_size).enumerate() {
            attempt.cancel.check()?;
            let batch_index = index + 1;

            let file_event = |event_type: PostEventType, file: &SubmissionFile| {
                let mut event = attempt
                    .event(event_type)
                    .with_file(&file.id, file.snapshot());
                event.metadata.batch_index = Some(batch_index);
                event
            };

            let source_urls = attempt.external_source_urls().await?;
            let processor = attempt.services.processor.as_ref();
            let processing: Vec<_> = batch
                .iter()
                .map(|file| process_file(processor, attempt.destination, file, &source_urls))
                .collect();
            let processed = try_join_all(processing).await;
            let posting_files = match processed {
                Ok(files) => files,
                Err(error) => {
                    for file in batch {
                        let event = file_event(PostEventType::FileFailed, file)
                            .with_error(error.to_response());
                        attempt.emit(event).await?;
                    }
                    return Err(error);
                }
            };

            attempt.wait_for_post_interval().await?;

            debug!(
                run_id = %attempt.run.id,
                account_id = attempt.account_id(),
                batch_index,
                files = posting_files.len(),
                "Uploading batch"
            );
            let result = attempt
                .destination
                .post_files(attempt.data, &posting_files, batch_index, attempt.cancel)
                .await;

            match result {
                Ok(outcome) => {
                    attempt.record_post();
                    for file in batch {
                        let event = file_event(PostEventType::FilePosted, file)
                            .with_source_url(outcome.source_url.clone());
                        attempt.emit(event).await?;
                    }
                }
                Err(failure) => {
                    if attempt.cancel.is_cancelled() {
                        return Err(PostError::Cancelled);
                    }
                    let error = PostError::Adapter(failure);
                    for file in batch {
                        let event = file_event(PostEventType::FileFailed, file)
                            .with_error(error.to_response());
                        attempt.emit(event).await?;
                    }
                    return Err(error);
                }
            }
        }

        Ok(())
    }
}
