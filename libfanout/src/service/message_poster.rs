//! Message submission posting

use async_trait::async_trait;
use tracing::debug;

use crate::error::PostError;
use crate::service::manager::{PostAttempt, SubmissionPoster};
use crate::types::{PostEventType, SubmissionType};

/// Poster for `SubmissionType::Message`: one post per destination
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePoster;

impl MessagePoster {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SubmissionPoster for MessagePoster {
    fn kind(&self) -> SubmissionType {
        SubmissionType::Message
    }

    async fn attempt_to_post(&self, attempt: &PostAttempt<'_>) -> Result<(), PostError> {
        attempt.cancel.check()?;
        attempt.wait_for_post_interval().await?;

        debug!(
            run_id = %attempt.run.id,
            account_id = attempt.account_id(),
            "Posting message"
        );
        let result = attempt
            .destination
            .post_message(attempt.data, attempt.cancel)
            .await;

        match result {
            Ok(outcome) => {
                attempt.record_post();
                let mut event = attempt
                    .event(PostEventType::MessagePosted)
                    .with_source_url(outcome.source_url);
                event.metadata.message = outcome.message;
                attempt.emit(event).await
            }
            Err(failure) => {
                if attempt.cancel.is_cancelled() {
                    return Err(PostError::Cancelled);
                }
                let error = PostError::Adapter(failure);
                attempt
                    .emit(
                        attempt
                            .event(PostEventType::MessageFailed)
                            .with_error(error.to_response()),
                    )
                    .await?;
                Err(error)
            }
        }
    }
}
