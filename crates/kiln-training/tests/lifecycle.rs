//! End-to-end lifecycle tests: jobs driven by scripted trainers through
//! creation, control commands, event streams and registry retention.

use kiln_training::{
    ArtifactKind, ControlAction, ControlOutcome, Job, JobConfig, JobEvent, JobId, JobManager,
    JobStatus, JobSubscription, ScriptedTrainer, StagePlan, TrainingError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn fast_plan() -> StagePlan {
    StagePlan::with_delays(Duration::ZERO, Duration::ZERO)
}

fn slow_plan() -> StagePlan {
    StagePlan::with_delays(Duration::from_millis(5), Duration::from_millis(10))
}

fn config(epochs: u32) -> JobConfig {
    JobConfig { epochs, ..JobConfig::new("base-7b", vec!["ds-1".to_string()]) }
}

/// Strictly improving schedule: never triggers early stopping.
fn improving_losses(n: usize) -> Vec<f64> {
    (0..n).map(|i| 3.0 - i as f64 * 0.01).collect()
}

async fn wait_terminal(subscription: &mut JobSubscription) -> Job {
    timeout(Duration::from_secs(10), async {
        loop {
            match subscription.recv().await {
                Some(JobEvent::Terminal { data, .. }) => return *data,
                Some(_) => {}
                None => panic!("stream closed before terminal event"),
            }
        }
    })
    .await
    .expect("timed out waiting for terminal event")
}

async fn run_to_end(manager: &JobManager, config: JobConfig) -> Job {
    let job = manager.create_job(config).await.expect("create job");
    let mut subscription = manager.subscribe(&job.id).await.expect("subscribe");
    wait_terminal(&mut subscription).await
}

async fn wait_for_status(manager: &JobManager, id: &JobId, status: JobStatus) -> Job {
    timeout(Duration::from_secs(10), async {
        loop {
            let job = manager.get_job(id).await.expect("job exists");
            if job.status == status {
                return job;
            }
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for status")
}

#[tokio::test]
async fn test_job_runs_to_completion() {
    let trainer = Arc::new(ScriptedTrainer::new(vec![0.9, 0.8, 0.7]));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());

    let job = run_to_end(&manager, config(3)).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.stage, "completed");
    assert!(job.start_time.is_some());
    assert!(job.end_time.is_some());
    assert!(job.error.is_none());

    assert_eq!(job.run.epoch, 3);
    assert_eq!(job.run.best_val_loss, Some(0.7));
    assert_eq!(job.run.patience, 0);
    assert_eq!(job.run.best_checkpoint, job.run.last_checkpoint);

    // Three improving epochs => three checkpoints, plus the final model
    // and report.
    let artifacts = manager.job_artifacts(&job.id).await.expect("artifacts");
    assert_eq!(artifacts.len(), 5);
    let checkpoints =
        artifacts.iter().filter(|a| a.kind == ArtifactKind::Checkpoint).count();
    assert_eq!(checkpoints, 3);
    assert!(artifacts.iter().any(|a| a.kind == ArtifactKind::Model));
    assert!(artifacts.iter().any(|a| a.kind == ArtifactKind::Report));
    assert!(artifacts.iter().all(|a| a.job_id == job.id));

    let logs = manager.job_logs(&job.id, None, 100).await.expect("logs");
    assert!(logs.iter().any(|e| e.message == "Training started"));
    assert!(logs.iter().any(|e| e.message == "Training completed successfully"));
}

#[tokio::test]
async fn test_early_stopping_after_max_patience() {
    // Three consecutive non-improvements after the first epoch; maxPatience
    // is 3, so the run must stop after the 4th value despite epochs = 10.
    let trainer = Arc::new(ScriptedTrainer::new(vec![0.9, 0.95, 1.0, 1.1, 0.5, 0.4]));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());

    let job = run_to_end(&manager, config(10)).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.run.epoch, 4, "stopped after the 4th epoch");
    assert_eq!(job.run.best_val_loss, Some(0.9));
    assert_eq!(job.run.patience, 3);

    // One best checkpoint (epoch 0) and the differing last checkpoint are
    // both retained.
    let artifacts = manager.job_artifacts(&job.id).await.expect("artifacts");
    let checkpoints =
        artifacts.iter().filter(|a| a.kind == ArtifactKind::Checkpoint).count();
    assert_eq!(checkpoints, 2);
    assert_ne!(job.run.best_checkpoint, job.run.last_checkpoint);

    let logs = manager.job_logs(&job.id, None, 100).await.expect("logs");
    assert!(logs.iter().any(|e| e.message.starts_with("Early stopping")));
}

#[tokio::test]
async fn test_failure_is_contained_to_one_job() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(10)).failing_at(1));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());

    let failed = run_to_end(&manager, config(5)).await;
    assert_eq!(failed.status, JobStatus::Failed);
    let message = failed.error.expect("error message");
    assert!(message.contains("scripted failure at epoch 1"));
    assert!(!message.contains("backtrace"));

    // The failed job stays queryable and a sibling job is unaffected.
    let queried = manager.get_job(&failed.id).await.expect("failed job still queryable");
    assert_eq!(queried.status, JobStatus::Failed);

    // Epoch 0 never fails, so a single-epoch sibling completes normally.
    let sibling = run_to_end(&manager, config(1)).await;
    assert_eq!(sibling.status, JobStatus::Completed);

    let stats = manager.stats().await;
    assert_eq!(stats.total, 2);
    assert!(stats.failed >= 1);
}

#[tokio::test]
async fn test_registry_evicts_oldest_terminal_jobs() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(3)));
    let manager =
        JobManager::with_max_retained(trainer, 3).with_stage_plan(fast_plan());

    let mut ids = Vec::new();
    for _ in 0..5 {
        let job = run_to_end(&manager, config(2)).await;
        assert_eq!(job.status, JobStatus::Completed);
        ids.push(job.id);
    }

    let listed = manager.list_jobs(None, None).await;
    assert!(listed.len() <= 3);
    assert!(listed.iter().all(|j| j.status.is_terminal()));

    // The oldest jobs are gone, and their artifacts with them.
    let evicted = &ids[0];
    assert!(matches!(
        manager.get_job(evicted).await,
        Err(TrainingError::JobNotFound(_))
    ));
    let newest = &ids[4];
    assert!(manager.get_job(newest).await.is_ok());
}

#[tokio::test]
async fn test_late_subscriber_gets_snapshot_not_history() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(5)));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());

    let done = run_to_end(&manager, config(5)).await;
    assert_eq!(done.status, JobStatus::Completed);

    // Joining after the fact yields the current snapshot and the terminal
    // event, not a replay of every historical transition.
    let mut late = manager.subscribe(&done.id).await.expect("subscribe");
    match late.recv().await {
        Some(JobEvent::State { data, .. }) => {
            assert_eq!(data.status, JobStatus::Completed);
            assert_eq!(data.progress, 100);
        }
        other => panic!("expected snapshot first, got {other:?}"),
    }
    assert!(matches!(late.recv().await, Some(JobEvent::Terminal { .. })));
    assert!(late.recv().await.is_none());
}

#[tokio::test]
async fn test_stop_halts_within_a_boundary_and_never_completes() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(200)));
    let manager = JobManager::new(trainer).with_stage_plan(slow_plan());

    let created = manager.create_job(config(200)).await.expect("create job");
    wait_for_status(&manager, &created.id, JobStatus::Running).await;

    let outcome = manager.control_job(&created.id, ControlAction::Stop).await.expect("control");
    assert!(outcome.is_applied());

    let stopped = wait_for_status(&manager, &created.id, JobStatus::Stopped).await;
    assert!(stopped.progress < 100);
    assert!(stopped.end_time.is_some());

    // The task honors the stop at its next boundary; nothing moves after.
    sleep(Duration::from_millis(50)).await;
    let after = manager.get_job(&created.id).await.expect("job");
    assert_eq!(after.status, JobStatus::Stopped);
    assert_eq!(after.progress, stopped.progress);
    assert_eq!(after.run.epoch, stopped.run.epoch);
}

#[tokio::test]
async fn test_pause_freezes_progress_and_resume_continues() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(30)));
    let manager = JobManager::new(trainer).with_stage_plan(slow_plan());

    let created = manager.create_job(config(30)).await.expect("create job");
    wait_for_status(&manager, &created.id, JobStatus::Running).await;
    let outcome = manager.control_job(&created.id, ControlAction::Pause).await.expect("control");
    assert!(outcome.is_applied());

    // Let any in-flight epoch drain, then watch progress stand still.
    sleep(Duration::from_millis(40)).await;
    let first = manager.get_job(&created.id).await.expect("job");
    assert_eq!(first.status, JobStatus::Paused);
    sleep(Duration::from_millis(40)).await;
    let second = manager.get_job(&created.id).await.expect("job");
    assert_eq!(second.progress, first.progress);
    assert_eq!(second.run.epoch, first.run.epoch);

    let outcome = manager.control_job(&created.id, ControlAction::Resume).await.expect("control");
    assert!(outcome.is_applied());
    let mut subscription = manager.subscribe(&created.id).await.expect("subscribe");
    let done = wait_terminal(&mut subscription).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
}

#[tokio::test]
async fn test_pause_in_final_stage_then_resume_completes() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(1)));
    let manager = JobManager::new(trainer)
        .with_stage_plan(StagePlan::with_delays(Duration::from_millis(50), Duration::ZERO));

    let created = manager.create_job(config(1)).await.expect("create job");

    // Catch the task inside its last stage.
    let saving = timeout(Duration::from_secs(10), async {
        loop {
            let job = manager.get_job(&created.id).await.expect("job exists");
            if job.stage == "saving" {
                return job;
            }
            sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("timed out waiting for the saving stage");
    assert_eq!(saving.status, JobStatus::Running);

    let outcome = manager.control_job(&created.id, ControlAction::Pause).await.expect("control");
    assert!(outcome.is_applied());

    // The task parks instead of finishing; nothing final is recorded while
    // paused.
    sleep(Duration::from_millis(120)).await;
    let paused = manager.get_job(&created.id).await.expect("job");
    assert_eq!(paused.status, JobStatus::Paused);
    let artifacts = manager.job_artifacts(&created.id).await.expect("artifacts");
    assert!(artifacts.iter().all(|a| a.kind == ArtifactKind::Checkpoint));

    let outcome = manager.control_job(&created.id, ControlAction::Resume).await.expect("control");
    assert!(outcome.is_applied());
    let mut subscription = manager.subscribe(&created.id).await.expect("subscribe");
    let done = wait_terminal(&mut subscription).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    assert!(done.end_time.is_some());
}

#[tokio::test]
async fn test_control_on_terminal_job_is_noop() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(2)));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());
    let done = run_to_end(&manager, config(2)).await;

    for action in [ControlAction::Pause, ControlAction::Resume, ControlAction::Stop] {
        let outcome = manager.control_job(&done.id, action).await.expect("control");
        assert!(matches!(
            outcome,
            ControlOutcome::NotApplicable { status: JobStatus::Completed, .. }
        ));
    }
    let after = manager.get_job(&done.id).await.expect("job");
    assert_eq!(after.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_concurrent_jobs_stay_isolated() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(4)));
    let manager = JobManager::new(trainer).with_stage_plan(slow_plan());

    let a = manager.create_job(config(4)).await.expect("create a");
    let b = manager.create_job(config(3)).await.expect("create b");
    let mut sub_a = manager.subscribe(&a.id).await.expect("subscribe a");
    let mut sub_b = manager.subscribe(&b.id).await.expect("subscribe b");

    let (done_a, done_b) =
        tokio::join!(wait_terminal(&mut sub_a), wait_terminal(&mut sub_b));
    assert_eq!(done_a.status, JobStatus::Completed);
    assert_eq!(done_b.status, JobStatus::Completed);
    assert_eq!(done_a.run.epoch, 4);
    assert_eq!(done_b.run.epoch, 3);

    // Artifact sets are disjoint and correctly owned.
    let artifacts_a = manager.job_artifacts(&a.id).await.expect("artifacts a");
    let artifacts_b = manager.job_artifacts(&b.id).await.expect("artifacts b");
    assert!(artifacts_a.iter().all(|art| art.job_id == a.id));
    assert!(artifacts_b.iter().all(|art| art.job_id == b.id));
    assert!(artifacts_a.iter().all(|art| !artifacts_b.iter().any(|o| o.id == art.id)));

    // Each log stream only saw its own epochs.
    let logs_a = manager.job_logs(&a.id, None, 1000).await.expect("logs a");
    let logs_b = manager.job_logs(&b.id, None, 1000).await.expect("logs b");
    assert_eq!(logs_a.iter().filter(|e| e.message.starts_with("Epoch ")).count(), 4);
    assert_eq!(logs_b.iter().filter(|e| e.message.starts_with("Epoch ")).count(), 3);
}

#[tokio::test]
async fn test_validation_error_creates_nothing() {
    let manager = JobManager::default();

    let err = manager.create_job(JobConfig::default()).await.expect_err("must reject");
    assert!(matches!(err, TrainingError::Validation(_)));

    assert!(manager.list_jobs(None, None).await.is_empty());
    assert_eq!(manager.stats().await.total, 0);
}

#[tokio::test]
async fn test_unknown_job_is_reported() {
    let manager = JobManager::default();
    let ghost = JobId::new();

    assert!(matches!(manager.get_job(&ghost).await, Err(TrainingError::JobNotFound(_))));
    assert!(matches!(
        manager.control_job(&ghost, ControlAction::Stop).await,
        Err(TrainingError::JobNotFound(_))
    ));
    assert!(matches!(manager.subscribe(&ghost).await, Err(TrainingError::JobNotFound(_))));
}

#[tokio::test]
async fn test_stats_count_jobs_and_artifacts() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(2)));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());

    run_to_end(&manager, config(2)).await;
    run_to_end(&manager, config(2)).await;

    let stats = manager.stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.running, 0);
    // Two checkpoints, a model and a report per job.
    assert_eq!(stats.total_artifacts, 8);
    assert_eq!(stats.live_subscriptions, 0);
}

#[tokio::test]
async fn test_event_stream_orders_state_before_terminal() {
    let trainer = Arc::new(ScriptedTrainer::new(improving_losses(2)));
    let manager = JobManager::new(trainer).with_stage_plan(fast_plan());

    let job = manager.create_job(config(2)).await.expect("create job");
    let mut subscription = manager.subscribe(&job.id).await.expect("subscribe");

    let mut saw_snapshot = false;
    let mut last_progress = 0u8;
    loop {
        match timeout(Duration::from_secs(10), subscription.recv())
            .await
            .expect("stream timed out")
        {
            Some(JobEvent::State { .. }) => saw_snapshot = true,
            Some(JobEvent::Updated { data, .. }) => {
                assert!(saw_snapshot, "snapshot must come first");
                assert!(data.progress >= last_progress, "progress never moves backward");
                last_progress = data.progress;
            }
            Some(JobEvent::Terminal { data, .. }) => {
                assert!(data.status.is_terminal());
                break;
            }
            Some(_) => {}
            None => panic!("stream closed before terminal event"),
        }
    }
}
