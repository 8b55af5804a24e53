//! Cooperative cancellation for runs
//!
//! One token is created per run and cloned into every destination task and
//! every file batch. Checking is explicit: callers poll `check()` at the
//! points where stopping is safe, or race a wait against `cancelled()`.

use tokio_util::sync::CancellationToken;

use crate::error::PostError;

/// Cancellation token shared by everything a run spawns
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation to every holder of this token
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Return `PostError::Cancelled` if the run has been cancelled
    pub fn check(&self) -> Result<(), PostError> {
        if self.is_cancelled() {
            Err(PostError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
