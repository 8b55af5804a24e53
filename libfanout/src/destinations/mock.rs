//! Mock destination implementation for testing
//!
//! Simulates logins, successes, failures and latency, and records every
//! adapter call so tests can assert on batching, ordering, timing and the
//! source URLs each batch carried.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::cancellation::CancelToken;
use crate::destinations::{
    Destination, DestinationCapabilities, LoginState, PostData, PostOutcome, PostResult,
    PostingFile,
};
use crate::error::{PostFailure, Result};

/// One recorded adapter call
#[derive(Debug, Clone)]
pub struct MockCall {
    /// 1-based batch index for file posts, 0 for messages
    pub batch_index: usize,
    pub file_ids: Vec<String>,
    pub content_types: Vec<String>,
    /// Source URLs stamped on each file of the batch
    pub source_urls: Vec<Vec<String>>,
    pub data: PostData,
    pub at: Instant,
}

/// Configuration for mock destination behavior
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub account_id: String,
    pub website: String,
    pub capabilities: DestinationCapabilities,
    pub logged_in: bool,
    /// 1-based call numbers that fail
    pub fail_on_calls: HashSet<usize>,
    pub failure_message: String,
    /// Returned on success; `{n}` is replaced with the call number
    pub source_url: Option<String>,
    pub delay: Duration,
    pub calls: Arc<Mutex<Vec<MockCall>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            account_id: "mock-account".to_string(),
            website: "mock".to_string(),
            capabilities: DestinationCapabilities {
                supports_file: true,
                supports_message: true,
                ..Default::default()
            },
            logged_in: true,
            fail_on_calls: HashSet::new(),
            failure_message: "Mock upload failed".to_string(),
            source_url: None,
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

/// Mock destination for testing
pub struct MockDestination {
    config: MockConfig,
}

impl MockDestination {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A logged-in destination that always succeeds
    pub fn success(account_id: &str) -> Self {
        Self::new(MockConfig {
            account_id: account_id.to_string(),
            ..Default::default()
        })
    }

    /// A destination that fails on the given 1-based call numbers
    pub fn failing_on(account_id: &str, calls: &[usize]) -> Self {
        Self::new(MockConfig {
            account_id: account_id.to_string(),
            fail_on_calls: calls.iter().copied().collect(),
            ..Default::default()
        })
    }

    pub fn logged_out(account_id: &str) -> Self {
        Self::new(MockConfig {
            account_id: account_id.to_string(),
            logged_in: false,
            ..Default::default()
        })
    }

    pub fn with_capabilities(mut self, capabilities: DestinationCapabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    pub fn with_source_url(mut self, url: &str) -> Self {
        self.config.source_url = Some(url.to_string());
        self
    }

    pub fn with_website(mut self, website: &str) -> Self {
        self.config.website = website.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.config.delay = delay;
        self
    }

    /// Handle to the recorded calls, usable after the mock is moved
    pub fn calls_handle(&self) -> Arc<Mutex<Vec<MockCall>>> {
        Arc::clone(&self.config.calls)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.config.calls.lock().unwrap().clone()
    }

    async fn respond(&self, call: MockCall) -> PostResult {
        if !self.config.delay.is_zero() {
            tokio::time::sleep(self.config.delay).await;
        }

        let number = {
            let mut calls = self.config.calls.lock().unwrap();
            calls.push(call);
            calls.len()
        };

        if self.config.fail_on_calls.contains(&number) {
            return Err(PostFailure::new(self.config.failure_message.clone())
                .with_additional_info(serde_json::json!({ "call": number })));
        }

        Ok(PostOutcome {
            source_url: self
                .config
                .source_url
                .as_ref()
                .map(|url| url.replace("{n}", &number.to_string())),
            message: None,
        })
    }
}

#[async_trait]
impl Destination for MockDestination {
    fn account_id(&self) -> &str {
        &self.config.account_id
    }

    fn website(&self) -> &str {
        &self.config.website
    }

    fn capabilities(&self) -> &DestinationCapabilities {
        &self.config.capabilities
    }

    async fn login_state(&self) -> Result<LoginState> {
        Ok(LoginState {
            is_logged_in: self.config.logged_in,
            username: Some(self.config.account_id.clone()),
        })
    }

    async fn post_files(
        &self,
        data: &PostData,
        files: &[PostingFile],
        batch_index: usize,
        _cancel: &CancelToken,
    ) -> PostResult {
        self.respond(MockCall {
            batch_index,
            file_ids: files.iter().map(|f| f.id.clone()).collect(),
            content_types: files.iter().map(|f| f.content_type.clone()).collect(),
            source_urls: files
                .iter()
                .map(|f| f.metadata.source_urls.clone())
                .collect(),
            data: data.clone(),
            at: Instant::now(),
        })
        .await
    }

    async fn post_message(&self, data: &PostData, _cancel: &CancelToken) -> PostResult {
        self.respond(MockCall {
            batch_index: 0,
            file_ids: Vec::new(),
            content_types: Vec::new(),
            source_urls: Vec::new(),
            data: data.clone(),
            at: Instant::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_fails_on_configured_call() {
        let mock = MockDestination::failing_on("acct", &[2]).with_source_url("https://m/{n}");
        let cancel = CancelToken::new();
        let data = PostData::default();

        let first = mock.post_message(&data, &cancel).await.unwrap();
        assert_eq!(first.source_url.as_deref(), Some("https://m/1"));

        let second = mock.post_message(&data, &cancel).await;
        assert!(second.is_err());
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_login_state() {
        let mock = MockDestination::logged_out("acct");
        let state = mock.login_state().await.unwrap();
        assert!(!state.is_logged_in);
    }
}
