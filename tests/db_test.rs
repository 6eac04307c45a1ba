use chrono::Utc;
use queuectl::db::Db;
use queuectl::db::jobs::JobUpdate;
use queuectl::error::Error;
use queuectl::model::{ConfigKey, JobId, JobState, NewJob};
use queuectl::retry::RetryDecision;
use std::time::Duration;
use tempfile::TempDir;

/// Helper: fresh store in a temp directory. Keep the `TempDir` alive.
async fn test_db() -> (TempDir, Db) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open(dir.path().join("data").join("jobs.db"))
        .await
        .unwrap();
    (dir, db)
}

/// Claim the job and fail it with the given attempt count.
async fn claim_and_fail(db: &Db, attempts: u32, max_retries: u32) -> (JobId, RetryDecision) {
    let job = db.claim_next_job(4242).await.unwrap().unwrap();
    let decision = db
        .mark_job_failed(&job.id, 4242, "boom", attempts, max_retries)
        .await
        .unwrap();
    (job.id, decision)
}

#[tokio::test]
async fn opens_creates_parent_dir_and_seeds_config() {
    let (dir, db) = test_db().await;
    assert!(dir.path().join("data").join("jobs.db").exists());
    db.health_check().await.unwrap();

    assert_eq!(db.get_config(ConfigKey::MaxRetries, "x").await.unwrap(), "3");
    assert_eq!(db.get_config(ConfigKey::BackoffBase, "x").await.unwrap(), "2");

    // Re-running the schema is harmless.
    db.migrate().await.unwrap();
    let again = Db::open(db.path()).await.unwrap();
    assert_eq!(again.max_retries().await.unwrap(), 3);
}

#[tokio::test]
async fn create_job_starts_pending_with_config_budget() {
    let (_dir, db) = test_db().await;

    let job = db.create_job(NewJob::new("echo hi")).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 3);
    assert!(job.retry_at.is_none());
    assert!(job.output.is_none());
    assert_eq!(job.created_at, job.updated_at);

    db.set_config(ConfigKey::MaxRetries, "5").await.unwrap();
    let later = db.create_job(NewJob::new("echo later")).await.unwrap();
    assert_eq!(later.max_retries, 5);

    let explicit = db
        .create_job(NewJob::new("echo mine").id("job-1").max_retries(1))
        .await
        .unwrap();
    assert_eq!(explicit.id, JobId::from("job-1"));
    assert_eq!(explicit.max_retries, 1);

    let fetched = db.get_job(&explicit.id).await.unwrap().unwrap();
    assert_eq!(fetched.command, "echo mine");
}

#[tokio::test]
async fn create_job_rejects_duplicates_and_empty_commands() {
    let (_dir, db) = test_db().await;

    db.create_job(NewJob::new("true").id("same")).await.unwrap();
    let err = db
        .create_job(NewJob::new("false").id("same"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)), "got {err:?}");

    let err = db.create_job(NewJob::new("   ")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err:?}");

    let from_json: NewJob = serde_json::from_str(r#"{"id":"j2","command":"ls"}"#).unwrap();
    let job = db.create_job(from_json).await.unwrap();
    assert_eq!(job.id.as_str(), "j2");
}

#[tokio::test]
async fn claim_is_fifo_and_returns_none_when_empty() {
    let (_dir, db) = test_db().await;

    for id in ["a", "b", "c"] {
        db.create_job(NewJob::new("true").id(id)).await.unwrap();
    }

    for expected in ["a", "b", "c"] {
        let job = db.claim_next_job(7).await.unwrap().unwrap();
        assert_eq!(job.id.as_str(), expected);
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.worker_pid, Some(7));
    }

    assert!(db.claim_next_job(7).await.unwrap().is_none());
}

#[tokio::test]
async fn failed_jobs_wait_for_retry_at() {
    let (_dir, db) = test_db().await;
    let job = db.create_job(NewJob::new("false")).await.unwrap();

    let future = Utc::now() + chrono::Duration::seconds(60);
    db.update_job_state(&job.id, JobState::Failed, JobUpdate::new().retry_at(future))
        .await
        .unwrap()
        .unwrap();
    assert!(db.claim_next_job(1).await.unwrap().is_none());

    let past = Utc::now() - chrono::Duration::seconds(1);
    db.update_job_state(&job.id, JobState::Failed, JobUpdate::new().retry_at(past))
        .await
        .unwrap()
        .unwrap();
    let claimed = db.claim_next_job(1).await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
}

#[tokio::test]
async fn update_job_state_applies_fields_and_misses_unknown_ids() {
    let (_dir, db) = test_db().await;
    let job = db.create_job(NewJob::new("echo")).await.unwrap();

    let updated = db
        .update_job_state(
            &job.id,
            JobState::Completed,
            JobUpdate::new()
                .output("done")
                .completed_at(Utc::now())
                .duration(Duration::from_millis(15)),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.state, JobState::Completed);
    assert_eq!(updated.output.as_deref(), Some("done"));
    assert_eq!(updated.duration_ms, Some(15));
    assert!(updated.completed_at.is_some());
    assert!(updated.updated_at >= job.updated_at);

    let missing = db
        .update_job_state(&JobId::from("nope"), JobState::Pending, JobUpdate::new())
        .await
        .unwrap();
    assert!(missing.is_none());

    let err = db
        .update_job_state(&job.id, JobState::Dead, JobUpdate::new())
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn completion_is_guarded_on_processing() {
    let (_dir, db) = test_db().await;
    let job = db.create_job(NewJob::new("echo")).await.unwrap();

    let err = db
        .mark_job_completed(&job.id, 1, "", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }), "got {err:?}");

    let err = db
        .mark_job_completed(&JobId::from("ghost"), 1, "", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");

    db.claim_next_job(1).await.unwrap().unwrap();
    let err = db
        .mark_job_completed(&job.id, 2, "not mine", Duration::ZERO)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClaimLost { pid: 2, .. }), "got {err:?}");

    let done = db
        .mark_job_completed(&job.id, 1, "hi", Duration::from_millis(3))
        .await
        .unwrap();
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.output.as_deref(), Some("hi"));
    assert!(done.worker_pid.is_none());
}

#[tokio::test]
async fn failure_below_budget_schedules_backoff() {
    let (_dir, db) = test_db().await;
    db.create_job(NewJob::new("false")).await.unwrap();

    let before = Utc::now();
    let (id, decision) = claim_and_fail(&db, 1, 3).await;
    let RetryDecision::Retry {
        retry_at,
        delay_secs,
    } = decision
    else {
        panic!("expected retry, got {decision:?}");
    };
    assert_eq!(delay_secs, 2);
    assert!(retry_at >= before + chrono::Duration::seconds(2));

    let job = db.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error.as_deref(), Some("boom"));
    // Stored with microsecond precision.
    let stored = job.retry_at.unwrap();
    assert!((stored - retry_at).num_milliseconds().abs() < 1);

    // Not eligible until the delay passes.
    assert!(db.claim_next_job(1).await.unwrap().is_none());
}

#[tokio::test]
async fn failure_from_a_non_holder_changes_nothing() {
    let (_dir, db) = test_db().await;
    db.create_job(NewJob::new("false").id("held").max_retries(1))
        .await
        .unwrap();
    let job = db.claim_next_job(10).await.unwrap().unwrap();

    // Both the retry path and the dead-letter path check the holder.
    for max_retries in [3, 1] {
        let err = db
            .mark_job_failed(&job.id, 20, "late", 1, max_retries)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ClaimLost { pid: 20, .. }), "got {err:?}");
    }

    let current = db.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(current.state, JobState::Processing);
    assert_eq!(current.worker_pid, Some(10));
    assert_eq!(current.attempts, 0);
    assert!(current.error.is_none());
    assert_eq!(db.count_dlq().await.unwrap(), 0);
}

#[tokio::test]
async fn backoff_follows_configured_base() {
    let (_dir, db) = test_db().await;
    db.set_config(ConfigKey::BackoffBase, "3").await.unwrap();
    db.create_job(NewJob::new("false")).await.unwrap();

    let (_, decision) = claim_and_fail(&db, 2, 5).await;
    assert!(matches!(decision, RetryDecision::Retry { delay_secs: 9, .. }));
}

#[tokio::test]
async fn exhausted_budget_moves_job_to_dlq() {
    let (_dir, db) = test_db().await;
    let job = db
        .create_job(NewJob::new("exit 1").max_retries(1))
        .await
        .unwrap();

    let (id, decision) = claim_and_fail(&db, 1, 1).await;
    assert!(decision.is_dead_letter());
    assert_eq!(id, job.id);

    assert!(db.get_job(&id).await.unwrap().is_none());
    let entry = db.get_dlq_entry(&id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 1);
    assert_eq!(entry.command, "exit 1");
    assert_eq!(entry.error.as_deref(), Some("boom"));
    assert_eq!(entry.created_at, job.created_at);

    let counts = db.counts_by_state().await.unwrap();
    assert_eq!(counts.dead, 1);
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn retry_dlq_requeues_with_fresh_budget() {
    let (_dir, db) = test_db().await;
    let original = db
        .create_job(NewJob::new("exit 1").id("doomed").max_retries(1))
        .await
        .unwrap();
    claim_and_fail(&db, 1, 1).await;

    db.set_config(ConfigKey::MaxRetries, "4").await.unwrap();
    let job = db.retry_dlq(&original.id).await.unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 4);
    assert_eq!(job.created_at, original.created_at);
    assert!(job.error.is_none());
    assert!(job.retry_at.is_none());

    assert_eq!(db.count_dlq().await.unwrap(), 0);
    assert!(db.get_dlq_entry(&original.id).await.unwrap().is_none());

    let err = db.retry_dlq(&original.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
}

#[tokio::test]
async fn retry_dlq_refuses_to_shadow_a_live_job() {
    let (_dir, db) = test_db().await;
    db.create_job(NewJob::new("exit 1").id("twin").max_retries(1))
        .await
        .unwrap();
    claim_and_fail(&db, 1, 1).await;

    // The id is free again in the jobs table.
    db.create_job(NewJob::new("echo new").id("twin")).await.unwrap();

    let err = db.retry_dlq(&JobId::from("twin")).await.unwrap_err();
    assert!(matches!(err, Error::Duplicate(_)), "got {err:?}");
    assert_eq!(db.count_dlq().await.unwrap(), 1);
}

#[tokio::test]
async fn list_jobs_filters_and_paginates_newest_first() {
    let (_dir, db) = test_db().await;
    for i in 0..5 {
        db.create_job(NewJob::new("true").id(format!("j{i}")))
            .await
            .unwrap();
    }
    db.claim_next_job(1).await.unwrap().unwrap(); // j0

    let all = db.list_jobs(None, 10, 0).await.unwrap();
    let ids: Vec<_> = all.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, ["j4", "j3", "j2", "j1", "j0"]);

    let page = db.list_jobs(None, 2, 1).await.unwrap();
    let ids: Vec<_> = page.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, ["j3", "j2"]);

    let processing = db
        .list_jobs(Some(JobState::Processing), 10, 0)
        .await
        .unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id.as_str(), "j0");

    let counts = db.counts_by_state().await.unwrap();
    assert_eq!(counts.pending, 4);
    assert_eq!(counts.processing, 1);
    assert_eq!(counts.get(JobState::Completed), 0);
}

#[tokio::test]
async fn config_values_must_be_positive_integers() {
    let (_dir, db) = test_db().await;

    for bad in ["0", "-1", "abc", ""] {
        let err = db.set_config(ConfigKey::MaxRetries, bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{bad}: {err:?}");
    }
    assert_eq!(db.max_retries().await.unwrap(), 3);

    db.set_config(ConfigKey::BackoffBase, " 4 ").await.unwrap();
    assert_eq!(db.backoff_base().await.unwrap(), 4);
    assert_eq!(db.get_config(ConfigKey::BackoffBase, "2").await.unwrap(), "4");

    assert!("retries".parse::<ConfigKey>().is_err());
    assert_eq!(
        "backoff-base".parse::<ConfigKey>().unwrap(),
        ConfigKey::BackoffBase
    );
}

#[tokio::test]
async fn settings_written_by_one_handle_are_seen_by_another() {
    let (dir, db) = test_db().await;
    let other = Db::open(dir.path().join("data").join("jobs.db"))
        .await
        .unwrap();

    db.set_config(ConfigKey::MaxRetries, "7").await.unwrap();
    assert_eq!(other.max_retries().await.unwrap(), 7);

    let job = other.create_job(NewJob::new("true")).await.unwrap();
    assert_eq!(job.max_retries, 7);
}
