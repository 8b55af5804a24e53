//! End-to-end posting tests against the in-memory store
//!
//! Every test drives a full run through `PostManagerRegistry` with mock
//! destinations and asserts on the event log, the run state and the calls
//! each mock received.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use libfanout::destinations::mock::MockDestination;
use libfanout::destinations::{DestinationCapabilities, DestinationRegistry};
use libfanout::error::Result;
use libfanout::pipeline::{Collaborators, SubmissionValidator, ValidationResult};
use libfanout::service::events::Notification;
use libfanout::service::{ManagerSettings, PostManager, PostManagerRegistry, RegistrySettings};
use libfanout::service::file_poster::FilePoster;
use libfanout::store::memory::MemoryStore;
use libfanout::store::{EventLogStore, RunStore};
use libfanout::types::{
    DestinationOptions, PostEventType, PostRecord, ResumeMode, RunState, Submission,
    SubmissionFile, SubmissionType,
};
use libfanout::rate_limiter::RateLimiter;
use libfanout::service::events::EventBus;

fn file_caps(batch_size: usize) -> DestinationCapabilities {
    DestinationCapabilities {
        supports_file: true,
        supports_message: true,
        file_batch_size: batch_size,
        ..Default::default()
    }
}

fn external_caps(batch_size: usize) -> DestinationCapabilities {
    DestinationCapabilities {
        accepts_external_source_urls: true,
        ..file_caps(batch_size)
    }
}

fn file(id: &str, order: u32) -> SubmissionFile {
    SubmissionFile::new(id, format!("{}.png", id), "image/png", id.as_bytes().to_vec(), order)
}

fn submission(kind: SubmissionType, files: Vec<SubmissionFile>, accounts: &[&str]) -> Submission {
    Submission {
        id: "sub-1".to_string(),
        submission_type: kind,
        files,
        options: accounts
            .iter()
            .map(|a| DestinationOptions::for_account(*a))
            .collect(),
    }
}

fn setup(destinations: DestinationRegistry, submission: Submission) -> (Arc<MemoryStore>, PostManagerRegistry) {
    setup_with(destinations, submission, |c| c)
}

fn setup_with(
    destinations: DestinationRegistry,
    submission: Submission,
    customize: impl FnOnce(Collaborators) -> Collaborators,
) -> (Arc<MemoryStore>, PostManagerRegistry) {
    let store = Arc::new(MemoryStore::new());
    store.add_submission(submission);

    let collaborators = customize(Collaborators::passthrough(store.clone()));
    let registry = PostManagerRegistry::new(
        store.clone(),
        store.clone(),
        collaborators,
        destinations,
        RegistrySettings::default(),
    );

    (store, registry)
}

async fn event_types(store: &MemoryStore, run_id: &str, account_id: &str) -> Vec<PostEventType> {
    store
        .find_by_run(run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.account_id == account_id)
        .map(|e| e.event_type)
        .collect()
}

async fn failure_stage(store: &MemoryStore, run_id: &str, account_id: &str) -> String {
    store
        .find_by_run(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|e| e.account_id == account_id && e.event_type == PostEventType::PostAttemptFailed)
        .and_then(|e| e.error)
        .map(|e| e.stage)
        .unwrap_or_default()
}

#[tokio::test]
async fn test_batch_failure_stops_destination() {
    let a = Arc::new(
        MockDestination::failing_on("a", &[2])
            .with_capabilities(file_caps(1))
            .with_source_url("https://a/{n}"),
    );
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(
        SubmissionType::File,
        vec![file("f1", 0), file("f2", 1), file("f3", 2)],
        &["a"],
    );
    let (store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run.clone(), None).await.unwrap();

    assert_eq!(state, Some(RunState::Failed));
    assert_eq!(a.calls().len(), 2);
    assert_eq!(
        event_types(&store, &run.id, "a").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::FilePosted,
            PostEventType::FileFailed,
            PostEventType::PostAttemptFailed,
        ]
    );

    let events = store.find_by_run(&run.id).await.unwrap();
    let failed = events
        .iter()
        .find(|e| e.event_type == PostEventType::FileFailed)
        .unwrap();
    assert_eq!(failed.file_id.as_deref(), Some("f2"));
    assert_eq!(failed.metadata.batch_index, Some(2));
    let snapshot = failed.metadata.file.as_ref().unwrap();
    assert_eq!(snapshot.file_name, "f2.png");
    assert_eq!(snapshot.size, 2);
    assert_eq!(snapshot.sha256.len(), 64);

    let posted = events
        .iter()
        .find(|e| e.event_type == PostEventType::FilePosted)
        .unwrap();
    assert_eq!(posted.source_url.as_deref(), Some("https://a/1"));

    let stored = store.find_run(&run.id).await.unwrap().unwrap();
    assert_eq!(stored.state, RunState::Failed);
    assert!(stored.completed_at.is_some());
}

#[tokio::test]
async fn test_batches_follow_file_order() {
    let a = Arc::new(MockDestination::success("a").with_capabilities(file_caps(2)));
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(
        SubmissionType::File,
        vec![file("third", 3), file("first", 1), file("second", 2)],
        &["a"],
    );
    let (_store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run, None).await.unwrap();

    assert_eq!(state, Some(RunState::Done));
    let calls = a.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].batch_index, 1);
    assert_eq!(calls[0].file_ids, vec!["first", "second"]);
    assert_eq!(calls[1].batch_index, 2);
    assert_eq!(calls[1].file_ids, vec!["third"]);
}

#[tokio::test]
async fn test_ignored_files_are_not_sent() {
    let a = Arc::new(MockDestination::success("a").with_capabilities(file_caps(5)));
    let b = Arc::new(MockDestination::success("b").with_capabilities(file_caps(5)));
    let destinations = DestinationRegistry::new().with(a.clone()).with(b.clone());

    let mut private = file("private", 1);
    private.ignored_accounts.insert("b".to_string());
    let sub = submission(SubmissionType::File, vec![file("public", 0), private], &["a", "b"]);
    let (_store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(run, None).await.unwrap();

    assert_eq!(a.calls()[0].file_ids, vec!["public", "private"]);
    assert_eq!(b.calls()[0].file_ids, vec!["public"]);
}

#[tokio::test]
async fn test_all_files_ignored_posts_nothing() {
    let a = Arc::new(MockDestination::success("a").with_capabilities(file_caps(1)));
    let destinations = DestinationRegistry::new().with(a.clone());

    let mut only = file("f1", 0);
    only.ignored_accounts.insert("a".to_string());
    let sub = submission(SubmissionType::File, vec![only], &["a"]);
    let (store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run.clone(), None).await.unwrap();

    assert_eq!(state, Some(RunState::Done));
    assert!(a.calls().is_empty());
    assert_eq!(
        event_types(&store, &run.id, "a").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::PostAttemptCompleted
        ]
    );
}

#[tokio::test]
async fn test_source_urls_flow_to_external_destinations() {
    let a = Arc::new(
        MockDestination::success("a")
            .with_capabilities(file_caps(2))
            .with_source_url("https://a/{n}"),
    );
    let b = Arc::new(
        MockDestination::success("b")
            .with_capabilities(external_caps(1))
            .with_source_url("https://b/{n}"),
    );
    // Registered and listed with the external destination first
    let destinations = DestinationRegistry::new().with(b.clone()).with(a.clone());
    let sub = submission(
        SubmissionType::File,
        vec![file("f1", 0), file("f2", 1)],
        &["b", "a"],
    );
    let (_store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run, None).await.unwrap();
    assert_eq!(state, Some(RunState::Done));

    let a_calls = a.calls();
    let b_calls = b.calls();
    assert_eq!(a_calls.len(), 1);
    assert_eq!(b_calls.len(), 2);
    assert!(a_calls[0].at <= b_calls[0].at);

    // A's link reaches B exactly once per file, and B never sees its own links
    for call in &b_calls {
        for urls in &call.source_urls {
            assert_eq!(urls, &vec!["https://a/1".to_string()]);
        }
    }
    assert!(a_calls[0].source_urls.iter().all(|urls| urls.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_spaces_batches() {
    let a = Arc::new(MockDestination::success("a").with_capabilities(DestinationCapabilities {
        minimum_post_wait_interval: Duration::from_millis(5000),
        ..file_caps(1)
    }));
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(
        SubmissionType::File,
        vec![file("f1", 0), file("f2", 1), file("f3", 2)],
        &["a"],
    );
    let (_store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(run, None).await.unwrap();

    let calls = a.calls();
    assert_eq!(calls.len(), 3);
    for pair in calls.windows(2) {
        assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(5000));
    }
}

#[tokio::test(start_paused = true)]
async fn test_configured_floor_raises_interval() {
    let a = Arc::new(
        MockDestination::success("a")
            .with_website("slowsite")
            .with_capabilities(file_caps(1)),
    );
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(SubmissionType::File, vec![file("f1", 0), file("f2", 1)], &["a"]);

    let store = Arc::new(MemoryStore::new());
    store.add_submission(sub);
    let mut settings = RegistrySettings::default();
    settings
        .rate_limit_floors
        .insert("slowsite".to_string(), Duration::from_secs(30));
    let registry = PostManagerRegistry::new(
        store.clone(),
        store.clone(),
        Collaborators::passthrough(store.clone()),
        destinations,
        settings,
    );

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(run, None).await.unwrap();

    let calls = a.calls();
    assert!(calls[1].at.duration_since(calls[0].at) >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_remaining_batches_and_groups() {
    let a = Arc::new(
        MockDestination::success("a")
            .with_capabilities(file_caps(1))
            .with_delay(Duration::from_secs(1)),
    );
    let b = Arc::new(MockDestination::success("b").with_capabilities(external_caps(1)));
    let destinations = DestinationRegistry::new().with(a.clone()).with(b.clone());
    let sub = submission(SubmissionType::File, vec![file("f1", 0), file("f2", 1)], &["a", "b"]);
    let (store, registry) = setup(destinations, sub);
    let registry = Arc::new(registry);
    let mut notifications = registry.subscribe();

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let handle = {
        let registry = Arc::clone(&registry);
        let run = run.clone();
        tokio::spawn(async move { registry.start_post(run, None).await })
    };

    // First upload is in flight
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(registry.is_posting_type(SubmissionType::File));
    assert!(!registry.is_posting_type(SubmissionType::Message));
    assert!(!registry.cancel_if_running("other-submission"));
    assert!(registry.cancel_if_running("sub-1"));

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state, Some(RunState::Failed));
    assert!(!registry.is_posting_type(SubmissionType::File));

    // The in-flight batch finished; the next one never started
    assert_eq!(a.calls().len(), 1);
    assert_eq!(
        event_types(&store, &run.id, "a").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::FilePosted,
            PostEventType::PostAttemptFailed,
        ]
    );
    assert_eq!(failure_stage(&store, &run.id, "a").await, "cancelled");

    // The external group was skipped entirely
    assert!(b.calls().is_empty());
    assert!(event_types(&store, &run.id, "b").await.is_empty());

    let mut saw_cancelled = false;
    while let Ok(notification) = notifications.try_recv() {
        match notification {
            Notification::DestinationCancelled { account_id, .. } => {
                assert_eq!(account_id, "a");
                saw_cancelled = true;
            }
            Notification::DestinationFailed { .. } => panic!("cancellation reported as failure"),
            _ => {}
        }
    }
    assert!(saw_cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_second_run_of_same_kind_is_rejected() {
    let a = Arc::new(
        MockDestination::success("a")
            .with_capabilities(file_caps(1))
            .with_delay(Duration::from_secs(1)),
    );
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(SubmissionType::File, vec![file("f1", 0)], &["a"]);
    let (store, registry) = setup(destinations, sub);
    let registry = Arc::new(registry);

    let first = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let handle = {
        let registry = Arc::clone(&registry);
        let run = first.clone();
        tokio::spawn(async move { registry.start_post(run, None).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let rejected = registry.start_post(second.clone(), None).await.unwrap();
    assert_eq!(rejected, None);

    assert_eq!(handle.await.unwrap().unwrap(), Some(RunState::Done));

    let untouched = store.find_run(&second.id).await.unwrap().unwrap();
    assert_eq!(untouched.state, RunState::Pending);
    assert!(store.find_by_run(&second.id).await.unwrap().is_empty());
    assert_eq!(a.calls().len(), 1);
}

#[tokio::test]
async fn test_continue_skips_completed_work() {
    let a = Arc::new(
        MockDestination::success("a")
            .with_capabilities(file_caps(2))
            .with_source_url("https://a/{n}"),
    );
    let b = Arc::new(MockDestination::failing_on("b", &[2]).with_capabilities(file_caps(1)));
    let destinations = DestinationRegistry::new().with(a.clone()).with(b.clone());
    let sub = submission(SubmissionType::File, vec![file("f1", 0), file("f2", 1)], &["a", "b"]);
    let (store, registry) = setup(destinations, sub);

    let first = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    assert_eq!(
        registry.start_post(first.clone(), None).await.unwrap(),
        Some(RunState::Failed)
    );
    assert_eq!(a.calls().len(), 1);
    assert_eq!(b.calls().len(), 2);

    let second = registry.create_run("sub-1", ResumeMode::Continue).await.unwrap();
    let state = registry
        .start_post(second.clone(), Some(&first.id))
        .await
        .unwrap();
    assert_eq!(state, Some(RunState::Done));

    // A finished in the first run and is not attempted again
    assert_eq!(a.calls().len(), 1);
    assert!(event_types(&store, &second.id, "a").await.is_empty());

    // B only retries the file that failed, with A's link from the earlier run
    let b_calls = b.calls();
    assert_eq!(b_calls.len(), 3);
    assert_eq!(b_calls[2].file_ids, vec!["f2"]);
    assert_eq!(b_calls[2].source_urls, vec![vec!["https://a/1".to_string()]]);

    // Nothing left to do: a third run posts nothing at all
    let third = registry.create_run("sub-1", ResumeMode::Continue).await.unwrap();
    let state = registry
        .start_post(third.clone(), Some(&second.id))
        .await
        .unwrap();
    assert_eq!(state, Some(RunState::Done));
    assert_eq!(a.calls().len(), 1);
    assert_eq!(b.calls().len(), 3);
    assert!(store.find_by_run(&third.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_reposts_everything() {
    let a = Arc::new(MockDestination::success("a").with_capabilities(file_caps(1)));
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(SubmissionType::File, vec![file("f1", 0)], &["a"]);
    let (_store, registry) = setup(destinations, sub);

    let first = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(first.clone(), None).await.unwrap();

    let second = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(second, Some(&first.id)).await.unwrap();

    assert_eq!(a.calls().len(), 2);
}

#[tokio::test]
async fn test_message_run_records_one_event_per_destination() {
    let ok = Arc::new(MockDestination::success("ok").with_source_url("https://ok/post"));
    let bad = Arc::new(MockDestination::failing_on("bad", &[1]));
    let destinations = DestinationRegistry::new().with(ok.clone()).with(bad.clone());
    let sub = submission(SubmissionType::Message, vec![], &["ok", "bad"]);
    let (store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run.clone(), None).await.unwrap();

    assert_eq!(state, Some(RunState::Failed));
    assert_eq!(
        event_types(&store, &run.id, "ok").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::MessagePosted,
            PostEventType::PostAttemptCompleted,
        ]
    );
    assert_eq!(
        event_types(&store, &run.id, "bad").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::MessageFailed,
            PostEventType::PostAttemptFailed,
        ]
    );
    assert_eq!(failure_stage(&store, &run.id, "bad").await, "upload");
    assert_eq!(
        store.get_source_urls_from_run(&run.id, "bad").await.unwrap(),
        vec!["https://ok/post"]
    );
}

#[tokio::test]
async fn test_file_and_message_runs_post_side_by_side() {
    let a = Arc::new(
        MockDestination::success("a")
            .with_capabilities(file_caps(1))
            .with_delay(Duration::from_millis(50)),
    );
    let destinations = DestinationRegistry::new().with(a.clone());

    let store = Arc::new(MemoryStore::new());
    store.add_submission(submission(SubmissionType::File, vec![file("f1", 0)], &["a"]));
    let mut message = submission(SubmissionType::Message, vec![], &["a"]);
    message.id = "sub-2".to_string();
    store.add_submission(message);

    let registry = PostManagerRegistry::new(
        store.clone(),
        store.clone(),
        Collaborators::passthrough(store.clone()),
        destinations,
        RegistrySettings::default(),
    );

    let file_run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let message_run = registry.create_run("sub-2", ResumeMode::Restart).await.unwrap();
    let (file_state, message_state) = tokio::join!(
        registry.start_post(file_run, None),
        registry.start_post(message_run, None)
    );

    assert_eq!(file_state.unwrap(), Some(RunState::Done));
    assert_eq!(message_state.unwrap(), Some(RunState::Done));
    assert_eq!(a.calls().len(), 2);
}

struct RejectingValidator;

#[async_trait]
impl SubmissionValidator for RejectingValidator {
    async fn validate(
        &self,
        _submission: &Submission,
        options: &DestinationOptions,
    ) -> Result<Vec<ValidationResult>> {
        Ok(vec![ValidationResult {
            errors: vec![format!("{} needs a title", options.account_id)],
            warnings: vec!["tags look sparse".to_string()],
        }])
    }
}

#[tokio::test]
async fn test_validation_errors_fail_destination() {
    let a = Arc::new(MockDestination::success("a"));
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(SubmissionType::Message, vec![], &["a"]);
    let (store, registry) = setup_with(destinations, sub, |c| {
        c.with_validator(Arc::new(RejectingValidator))
    });

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run.clone(), None).await.unwrap();

    assert_eq!(state, Some(RunState::Failed));
    assert!(a.calls().is_empty());
    assert_eq!(
        event_types(&store, &run.id, "a").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::PostAttemptFailed
        ]
    );
    assert_eq!(failure_stage(&store, &run.id, "a").await, "validation");
}

#[tokio::test]
async fn test_precondition_failures_are_recorded_per_destination() {
    let logged_out = Arc::new(MockDestination::logged_out("logged-out"));
    let no_files = Arc::new(MockDestination::success("no-files").with_capabilities(
        DestinationCapabilities {
            supports_message: true,
            ..Default::default()
        },
    ));
    let fine = Arc::new(MockDestination::success("fine").with_capabilities(file_caps(1)));
    let destinations = DestinationRegistry::new()
        .with(logged_out.clone())
        .with(no_files.clone())
        .with(fine.clone());
    let sub = submission(
        SubmissionType::File,
        vec![file("f1", 0)],
        &["logged-out", "no-files", "ghost", "fine"],
    );
    let (store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run.clone(), None).await.unwrap();

    assert_eq!(state, Some(RunState::Failed));
    assert_eq!(failure_stage(&store, &run.id, "logged-out").await, "login");
    assert_eq!(failure_stage(&store, &run.id, "no-files").await, "support");
    assert_eq!(failure_stage(&store, &run.id, "ghost").await, "resolve");
    for account in ["logged-out", "no-files", "ghost"] {
        assert_eq!(
            event_types(&store, &run.id, account).await,
            vec![PostEventType::PostAttemptFailed]
        );
    }

    // Siblings are unaffected
    assert_eq!(fine.calls().len(), 1);
    assert!(logged_out.calls().is_empty());
    assert!(no_files.calls().is_empty());
}

#[tokio::test]
async fn test_unconvertible_content_type_fails_before_upload() {
    let jpeg_only = Arc::new(MockDestination::success("a").with_capabilities(
        DestinationCapabilities {
            accepted_content_types: vec!["image/jpeg".to_string()],
            ..file_caps(3)
        },
    ));
    let destinations = DestinationRegistry::new().with(jpeg_only.clone());
    let sub = submission(SubmissionType::File, vec![file("f1", 0), file("f2", 1)], &["a"]);
    let (store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let state = registry.start_post(run.clone(), None).await.unwrap();

    assert_eq!(state, Some(RunState::Failed));
    assert!(jpeg_only.calls().is_empty());
    assert_eq!(failure_stage(&store, &run.id, "a").await, "content-type");

    // Every file of the rejected batch gets its own failure
    assert_eq!(
        event_types(&store, &run.id, "a").await,
        vec![
            PostEventType::PostAttemptStarted,
            PostEventType::FileFailed,
            PostEventType::FileFailed,
            PostEventType::PostAttemptFailed,
        ]
    );
    let failed = store.get_failed_events(&run.id).await.unwrap();
    let failed_files: Vec<_> = failed
        .iter()
        .filter(|e| e.event_type == PostEventType::FileFailed)
        .map(|e| {
            assert_eq!(e.metadata.batch_index, Some(1));
            assert_eq!(e.error.as_ref().unwrap().stage, "content-type");
            e.file_id.clone().unwrap()
        })
        .collect();
    assert_eq!(failed_files, vec!["f1", "f2"]);
}

fn assert_send<T: Send>(value: T) -> T {
    value
}

#[tokio::test]
async fn test_run_can_be_spawned_on_the_runtime() {
    let a = Arc::new(MockDestination::success("a").with_capabilities(file_caps(1)));
    let b = Arc::new(MockDestination::success("b").with_capabilities(file_caps(1)));
    let destinations = DestinationRegistry::new().with(a.clone()).with(b.clone());
    let sub = submission(SubmissionType::Message, vec![], &["a", "b"]);
    let (store, registry) = setup(destinations, sub);
    let registry = Arc::new(registry);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    let task = {
        let registry = Arc::clone(&registry);
        let run = run.clone();
        assert_send(async move { registry.start_post(run, None).await })
    };

    let state = tokio::spawn(task).await.unwrap().unwrap();
    assert_eq!(state, Some(RunState::Done));
    assert_eq!(a.calls().len(), 1);
    assert_eq!(b.calls().len(), 1);
    assert_eq!(
        store.find_run(&run.id).await.unwrap().unwrap().state,
        RunState::Done
    );
}

#[tokio::test]
async fn test_notifications_bracket_the_run() {
    let a = Arc::new(MockDestination::success("a"));
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(SubmissionType::Message, vec![], &["a"]);
    let (_store, registry) = setup(destinations, sub);
    let mut notifications = registry.subscribe();

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(run.clone(), None).await.unwrap();

    let mut received = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        received.push(notification);
    }

    assert_eq!(
        received.first(),
        Some(&Notification::RunStarted {
            run_id: run.id.clone(),
            submission_id: "sub-1".to_string(),
            accounts: vec!["a".to_string()],
        })
    );
    assert_eq!(
        received.last(),
        Some(&Notification::RunFinished {
            run_id: run.id.clone(),
            state: RunState::Done,
        })
    );
}

#[tokio::test]
async fn test_start_rejects_non_pending_run() {
    let a = Arc::new(MockDestination::success("a"));
    let destinations = DestinationRegistry::new().with(a.clone());
    let sub = submission(SubmissionType::Message, vec![], &["a"]);
    let (_store, registry) = setup(destinations, sub);

    let run = registry.create_run("sub-1", ResumeMode::Restart).await.unwrap();
    registry.start_post(run.clone(), None).await.unwrap();

    let mut finished = run.clone();
    finished.state = RunState::Done;
    assert_eq!(registry.start_post(finished, None).await.unwrap(), None);
    assert_eq!(a.calls().len(), 1);
}

#[tokio::test]
async fn test_unknown_submission_is_an_error() {
    let (_store, registry) = setup(
        DestinationRegistry::new(),
        submission(SubmissionType::Message, vec![], &[]),
    );

    let run = registry.create_run("missing", ResumeMode::Restart).await.unwrap();
    let result = registry.start_post(run, None).await;
    assert!(matches!(result, Err(libfanout::FanoutError::NotFound(_))));
}

#[tokio::test]
async fn test_missing_run_is_not_finalized() {
    let store = Arc::new(MemoryStore::new());
    let destinations =
        DestinationRegistry::new().with(Arc::new(MockDestination::success("a").with_capabilities(file_caps(1))));
    let manager = PostManager::new(
        Arc::new(FilePoster::new()),
        store.clone(),
        store.clone(),
        Collaborators::passthrough(store.clone()),
        destinations,
        RateLimiter::default(),
        EventBus::new(10),
        ManagerSettings::default(),
    );

    // Never inserted, as if deleted while posting
    let run = PostRecord::new("sub-1", ResumeMode::Restart);
    let sub = submission(SubmissionType::File, vec![file("f1", 0)], &["a"]);

    let state = manager.start_post(run.clone(), sub, None).await.unwrap();
    assert_eq!(state, None);
    assert!(store.find_run(&run.id).await.unwrap().is_none());
    assert!(!manager.is_posting());
}
