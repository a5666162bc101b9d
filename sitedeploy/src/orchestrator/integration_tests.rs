//! Scenario tests for the orchestrator, run against in-memory collaborators.

use super::*;
use crate::config::{RetentionConfig, WatchConfig};
use crate::core::{ArtifactContent, ArtifactId, StageKind};
use crate::errors::{StageError, StageErrorKind};
use crate::stages::{FnStage, StageContext};
use crate::store::{ArtifactStore, FsArtifactStore};
use crate::testing::{trigger, GateStage, ScriptedStage, TestPipeline};
use crate::utils::now_utc;
use crate::watcher::SourceWatcher;
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(10);

fn config(generate_attempts: u32, sync_attempts: u32) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_generate(StagePolicy::new(generate_attempts, Duration::from_secs(5)))
        .with_sync(StagePolicy::new(sync_attempts, Duration::from_secs(5)))
}

async fn finish(orchestrator: &Orchestrator, run_id: RunId) -> Run {
    orchestrator
        .wait_for_terminal_within(run_id, WAIT)
        .await
        .expect("run did not reach a terminal state in time")
        .expect("run is known")
}

fn created(outcome: Result<SubmitOutcome>) -> RunId {
    outcome.unwrap().created().expect("a new run")
}

fn state_of(orchestrator: &Orchestrator, run_id: RunId) -> RunState {
    orchestrator.run(run_id).unwrap().state
}

#[tokio::test]
async fn test_happy_path_publishes_generated_site() {
    let (p, generate, sync) = TestPipeline::scripted(config(1, 3));

    let r1 = created(p.orchestrator.submit(trigger("main", "abc123", 1)));
    let run = finish(&p.orchestrator, r1).await;

    assert_eq!(run.state, RunState::Succeeded);
    assert!(run.published);
    assert_eq!(run.invocations.len(), 2);
    assert_eq!(generate.call_count(), 1);
    assert_eq!(sync.call_count(), 1);

    // Sync consumed exactly the artifact generate produced.
    let g1 = run.output_of(StageKind::Generate).unwrap().clone();
    let sync_invocation = run.invocation(StageKind::Sync).unwrap();
    assert_eq!(sync_invocation.input, crate::core::StageInputRef::Artifact(g1.clone()));

    let stored = p.artifacts.get(&g1.id).await.unwrap();
    assert_eq!(stored.content.get("commit.txt"), Some(&b"abc123"[..]));
    assert_eq!(p.artifacts.len(), 2);

    assert_eq!(p.orchestrator.published_run("main").unwrap().id, r1);
    assert!(p.orchestrator.active_run("main").is_none());

    p.notifier.flush().await;
    assert_eq!(p.events.events_of_type("run.succeeded").len(), 1);
}

#[tokio::test]
async fn test_new_commit_during_sync_does_not_interrupt_it() {
    let generate = Arc::new(ScriptedStage::new("generate"));
    let sync = Arc::new(GateStage::new(Arc::new(ScriptedStage::new("sync"))));
    sync.gate("abc123");
    let p = TestPipeline::new(config(1, 3), generate.clone(), sync.clone());

    let r1 = created(p.orchestrator.submit(trigger("main", "abc123", 1)));
    sync.wait_entered("abc123").await;
    assert_eq!(state_of(&p.orchestrator, r1), RunState::Syncing);

    let r2 = created(p.orchestrator.submit(trigger("main", "def456", 2)));
    assert_eq!(state_of(&p.orchestrator, r2), RunState::Pending);
    assert_eq!(state_of(&p.orchestrator, r1), RunState::Syncing);
    assert!(!p.orchestrator.run(r1).unwrap().supersede_requested);

    sync.release("abc123");
    let first = finish(&p.orchestrator, r1).await;
    let second = finish(&p.orchestrator, r2).await;

    assert_eq!(first.state, RunState::Succeeded);
    assert_eq!(second.state, RunState::Succeeded);
    assert!(second.published);
    assert!(!p.orchestrator.run(r1).unwrap().published);
    assert_eq!(p.orchestrator.published_run("main").unwrap().id, r2);
}

#[tokio::test]
async fn test_new_commit_during_generate_supersedes_at_boundary() {
    let generate = Arc::new(GateStage::new(Arc::new(ScriptedStage::new("generate"))));
    let sync = Arc::new(ScriptedStage::new("sync"));
    generate.gate("abc123");
    let p = TestPipeline::new(config(1, 3), generate.clone(), sync.clone());

    let r1 = created(p.orchestrator.submit(trigger("main", "abc123", 1)));
    generate.wait_entered("abc123").await;
    assert_eq!(state_of(&p.orchestrator, r1), RunState::Generating);

    let r2 = created(p.orchestrator.submit(trigger("main", "def456", 2)));
    let flagged = p.orchestrator.run(r1).unwrap();
    assert!(flagged.supersede_requested);
    assert_eq!(flagged.state, RunState::Generating);

    generate.release("abc123");
    let first = finish(&p.orchestrator, r1).await;
    let second = finish(&p.orchestrator, r2).await;

    assert_eq!(first.state, RunState::Superseded);
    assert_eq!(first.superseded_by, Some(r2));
    // The finished generate output is kept but never published.
    assert!(first.output_of(StageKind::Generate).is_some());
    assert!(first.invocation(StageKind::Sync).is_none());
    assert!(!first.published);
    assert_eq!(sync.calls_for("abc123"), 0);

    assert_eq!(second.state, RunState::Succeeded);
    assert_eq!(p.orchestrator.published_run("main").unwrap().id, r2);

    assert!(matches!(
        p.orchestrator.wait_for_success(r1).await,
        Err(DeployError::Superseded { by: Some(by), .. }) if by == r2
    ));

    p.notifier.flush().await;
    let superseded = p.events.events_of_type("run.superseded");
    assert_eq!(superseded.len(), 1);
    assert!(matches!(
        &superseded[0],
        ActivityEvent::RunSuperseded { run_id, superseded_by: Some(by), .. } if *run_id == r1 && *by == r2
    ));
}

#[tokio::test]
async fn test_flagged_run_halts_between_generate_retries() {
    let inner = Arc::new(
        ScriptedStage::new("generate").with_script("c1", vec![Err(StageError::unavailable("git fetch failed"))]),
    );
    let generate = Arc::new(GateStage::new(inner.clone()));
    let sync = Arc::new(ScriptedStage::new("sync"));
    generate.gate("c1");
    let p = TestPipeline::new(config(3, 3), generate.clone(), sync.clone());

    let r1 = created(p.orchestrator.submit(trigger("main", "c1", 1)));
    generate.wait_entered("c1").await;
    let r2 = created(p.orchestrator.submit(trigger("main", "c2", 2)));
    generate.release("c1");

    let first = finish(&p.orchestrator, r1).await;
    assert_eq!(first.state, RunState::Superseded);
    assert_eq!(first.superseded_by, Some(r2));
    let invocation = first.invocation(StageKind::Generate).unwrap();
    assert_eq!(invocation.attempts, 1);
    assert_eq!(invocation.status, crate::core::InvocationStatus::Failed);
    assert_eq!(inner.calls_for("c1"), 1);
    assert_eq!(sync.calls_for("c1"), 0);

    assert_eq!(finish(&p.orchestrator, r2).await.state, RunState::Succeeded);
    assert_eq!(p.orchestrator.published_run("main").unwrap().id, r2);
}

#[tokio::test]
async fn test_flagged_run_whose_generate_fails_ends_superseded() {
    let inner = Arc::new(
        ScriptedStage::new("generate").failing_for("c1", StageError::transform_failed("template error")),
    );
    let generate = Arc::new(GateStage::new(inner.clone()));
    generate.gate("c1");
    let p = TestPipeline::new(config(3, 3), generate.clone(), Arc::new(ScriptedStage::new("sync")));

    let r1 = created(p.orchestrator.submit(trigger("main", "c1", 1)));
    generate.wait_entered("c1").await;
    let r2 = created(p.orchestrator.submit(trigger("main", "c2", 2)));
    generate.release("c1");

    let first = finish(&p.orchestrator, r1).await;
    assert_eq!(first.state, RunState::Superseded);
    assert_eq!(first.superseded_by, Some(r2));
    assert_eq!(inner.calls_for("c1"), 1);
    assert_eq!(finish(&p.orchestrator, r2).await.state, RunState::Succeeded);

    p.notifier.flush().await;
    assert!(p.events.events_of_type("run.failed").is_empty());
    assert_eq!(p.events.events_of_type("run.superseded").len(), 1);
}

#[tokio::test]
async fn test_pending_runs_are_superseded_immediately() {
    let generate = Arc::new(GateStage::new(Arc::new(ScriptedStage::new("generate"))));
    let inner_sync = Arc::new(ScriptedStage::new("sync"));
    generate.gate("c1");
    let p = TestPipeline::new(config(1, 3), generate.clone(), inner_sync.clone());

    let r1 = created(p.orchestrator.submit(trigger("main", "c1", 1)));
    generate.wait_entered("c1").await;
    let r2 = created(p.orchestrator.submit(trigger("main", "c2", 2)));
    let r3 = created(p.orchestrator.submit(trigger("main", "c3", 3)));

    let pending = p.orchestrator.run(r2).unwrap();
    assert_eq!(pending.state, RunState::Superseded);
    assert_eq!(pending.superseded_by, Some(r3));
    assert!(pending.invocations.is_empty());

    generate.release("c1");
    assert_eq!(finish(&p.orchestrator, r1).await.state, RunState::Superseded);
    assert_eq!(finish(&p.orchestrator, r3).await.state, RunState::Succeeded);
    assert_eq!(inner_sync.call_count(), 1);
    assert_eq!(inner_sync.calls()[0].commit, "c3");
}

#[tokio::test]
async fn test_one_active_run_per_branch() {
    let generate = Arc::new(ScriptedStage::new("generate").with_delay(Duration::from_millis(5)));
    let sync = Arc::new(ScriptedStage::new("sync").with_delay(Duration::from_millis(5)));
    let p = TestPipeline::new(config(1, 3), generate.clone(), sync.clone());

    let mut ids = Vec::new();
    for seq in 1..=6u64 {
        for branch in ["main", "staging"] {
            let commit = format!("{branch}-{seq}");
            ids.push(created(p.orchestrator.submit(trigger(branch, &commit, seq))));
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    for id in ids {
        finish(&p.orchestrator, id).await;
    }

    for branch in ["main", "staging"] {
        assert_eq!(generate.peak_in_flight(branch), 1);
        assert!(sync.peak_in_flight(branch) <= 1);
        let runs = p.orchestrator.runs_for_branch(branch);
        assert_eq!(runs.len(), 6);
        assert!(runs.iter().all(Run::is_terminal));
        assert_eq!(runs.last().unwrap().state, RunState::Succeeded);
        assert!(runs.iter().filter(|r| r.published).count() == 1);
    }
}

#[tokio::test]
async fn test_branches_do_not_block_each_other() {
    let generate = Arc::new(GateStage::new(Arc::new(ScriptedStage::new("generate"))));
    generate.gate("slow");
    let p = TestPipeline::new(config(1, 3), generate.clone(), Arc::new(ScriptedStage::new("sync")));

    let blocked = created(p.orchestrator.submit(trigger("main", "slow", 1)));
    generate.wait_entered("slow").await;

    let other = created(p.orchestrator.submit(trigger("preview", "fast", 1)));
    assert_eq!(finish(&p.orchestrator, other).await.state, RunState::Succeeded);
    assert_eq!(state_of(&p.orchestrator, blocked), RunState::Generating);

    generate.release("slow");
    assert_eq!(finish(&p.orchestrator, blocked).await.state, RunState::Succeeded);
}

#[tokio::test]
async fn test_permanent_generate_failure() {
    let generate = Arc::new(
        ScriptedStage::new("generate").failing_for("bad000", StageError::transform_failed("template error")),
    );
    let sync = Arc::new(ScriptedStage::new("sync"));
    let p = TestPipeline::new(config(3, 3), generate.clone(), sync.clone());

    let (watcher, _rx) = SourceWatcher::new(&WatchConfig::default(), p.notifier.clone()).unwrap();
    let outcome = watcher.on_change("main", "bad000", now_utc()).unwrap();
    let run_id = created(p.orchestrator.submit(outcome.trigger().unwrap().clone()));

    let run = finish(&p.orchestrator, run_id).await;
    assert_eq!(run.state, RunState::GenerateFailed);
    assert_eq!(generate.calls_for("bad000"), 1);
    assert_eq!(sync.call_count(), 0);
    assert_eq!(run.invocation(StageKind::Generate).unwrap().attempts, 1);

    let (stage, err) = run.failure().unwrap();
    assert_eq!(stage, StageKind::Generate);
    assert_eq!(err.kind, StageErrorKind::TransformFailed);
    assert!(p.orchestrator.published_run("main").is_none());

    p.notifier.flush().await;
    assert_eq!(p.events.events_of_type("source.commit_pushed").len(), 1);
    let failures = p.events.events_of_type("run.failed");
    assert_eq!(failures.len(), 1);
    assert!(matches!(
        &failures[0],
        ActivityEvent::RunFailed { run_id: id, stage: StageKind::Generate, error_kind: StageErrorKind::TransformFailed, .. }
            if *id == run_id
    ));
}

#[tokio::test]
async fn test_duplicate_and_stale_triggers() {
    let (p, generate, _) = TestPipeline::scripted(config(1, 3));

    let event = trigger("main", "abc123", 1);
    let r1 = created(p.orchestrator.submit(event.clone()));
    assert_eq!(p.orchestrator.submit(event.clone()).unwrap(), SubmitOutcome::Duplicate(r1));
    finish(&p.orchestrator, r1).await;
    assert_eq!(p.orchestrator.submit(event).unwrap(), SubmitOutcome::Duplicate(r1));

    let r2 = created(p.orchestrator.submit(trigger("main", "def456", 3)));
    assert_eq!(
        p.orchestrator.submit(trigger("main", "0ld000", 2)).unwrap(),
        SubmitOutcome::Stale { last_sequence: 3 }
    );
    finish(&p.orchestrator, r2).await;

    assert_eq!(p.orchestrator.runs_for_branch("main").len(), 2);
    assert_eq!(generate.calls_for("abc123"), 1);
}

#[tokio::test]
async fn test_transient_failures_stop_at_attempt_limit() {
    let generate = Arc::new(ScriptedStage::new("generate"));
    let sync = Arc::new(
        ScriptedStage::new("sync").failing_for("abc123", StageError::unavailable("bucket offline")),
    );
    let p = TestPipeline::new(config(1, 3), generate.clone(), sync.clone());

    let run = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "abc123", 1)))).await;

    assert_eq!(run.state, RunState::SyncFailed);
    assert_eq!(sync.calls_for("abc123"), 3);
    let attempts: Vec<u32> = sync.calls().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    let invocation = run.invocation(StageKind::Sync).unwrap();
    assert_eq!(invocation.attempts, 3);
    assert_eq!(invocation.status, crate::core::InvocationStatus::Failed);
    assert!(run.output_of(StageKind::Generate).is_some());
}

#[tokio::test]
async fn test_transient_failure_then_success() {
    let generate = Arc::new(
        ScriptedStage::new("generate").with_script("abc123", vec![Err(StageError::unavailable("git fetch failed"))]),
    );
    let p = TestPipeline::new(config(2, 3), generate.clone(), Arc::new(ScriptedStage::new("sync")));

    let run = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "abc123", 1)))).await;
    assert_eq!(run.state, RunState::Succeeded);
    let invocation = run.invocation(StageKind::Generate).unwrap();
    assert_eq!(invocation.attempts, 2);
    assert_eq!(
        invocation.error.as_ref().map(|e| e.kind),
        Some(StageErrorKind::Unavailable)
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_retried_then_fails() {
    let generate = Arc::new(ScriptedStage::new("generate").with_delay(Duration::from_secs(60)));
    let cfg = OrchestratorConfig::default()
        .with_generate(StagePolicy::new(2, Duration::from_secs(1)))
        .with_sync(StagePolicy::new(1, Duration::from_secs(1)));
    let p = TestPipeline::new(cfg, generate.clone(), Arc::new(ScriptedStage::new("sync")));

    let run = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "abc123", 1)))).await;
    assert_eq!(run.state, RunState::GenerateFailed);
    assert_eq!(generate.call_count(), 2);
    assert_eq!(run.failure().unwrap().1.kind, StageErrorKind::Timeout);
}

#[tokio::test]
async fn test_stage_panic_fails_only_that_run() {
    let generate = Arc::new(FnStage::new("explosive", |ctx: &StageContext| {
        if ctx.source.commit == "boom" {
            panic!("template engine exploded");
        }
        Ok(ArtifactContent::new().with_file("index.html", ctx.source.commit.clone()))
    }));
    let p = TestPipeline::new(config(3, 3), generate, Arc::new(ScriptedStage::new("sync")));

    let bad = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "boom", 1)))).await;
    assert_eq!(bad.state, RunState::GenerateFailed);
    assert_eq!(bad.invocation(StageKind::Generate).unwrap().attempts, 1);
    assert_eq!(bad.failure().unwrap().1.kind, StageErrorKind::Crashed);

    let good = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "fine", 2)))).await;
    assert_eq!(good.state, RunState::Succeeded);
}

#[tokio::test]
async fn test_output_hash_is_reproducible() {
    let (p, _, _) = TestPipeline::scripted(config(1, 3));

    let first = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "abc123", 1)))).await;
    let middle = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "def456", 2)))).await;
    let again = finish(&p.orchestrator, created(p.orchestrator.submit(trigger("main", "abc123", 3)))).await;

    for stage in StageKind::ALL {
        let a = first.output_of(stage).unwrap();
        let b = again.output_of(stage).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, middle.output_of(stage).unwrap().content_hash);
    }
}

#[tokio::test]
async fn test_retention_and_garbage_collection() {
    let cfg = config(1, 1).with_retention(RetentionConfig {
        keep_runs_per_branch: 2,
        artifact_min_age_seconds: 0,
    });
    let (p, _, _) = TestPipeline::scripted(cfg);

    let mut runs = Vec::new();
    for (seq, commit) in ["c1", "c2", "c3", "c4"].iter().enumerate() {
        let id = created(p.orchestrator.submit(trigger("main", commit, seq as u64 + 1)));
        runs.push(finish(&p.orchestrator, id).await);
    }
    assert_eq!(p.artifacts.len(), 8);

    let report = p.orchestrator.apply_retention();
    let mut expected = vec![runs[0].id, runs[1].id];
    expected.sort();
    assert_eq!(report.archived, expected);
    assert!(p.orchestrator.run(runs[0].id).is_none());
    assert_eq!(p.orchestrator.runs_for_branch("main").len(), 2);
    assert_eq!(p.orchestrator.published_run("main").unwrap().id, runs[3].id);

    let garbage = p.orchestrator.collect_garbage().await.unwrap();
    assert_eq!(garbage.deleted.len(), 4);
    assert_eq!(garbage.kept, 4);
    for run in &runs[2..] {
        for artifact in run.artifacts() {
            assert!(p.artifacts.get(&artifact.id).await.is_ok());
        }
    }

    assert_eq!(p.orchestrator.apply_retention(), RetentionReport::default());
}

#[tokio::test]
async fn test_garbage_collection_survives_torn_record() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = Arc::new(FsArtifactStore::open(dir.path()).await.unwrap());
    let cfg = config(1, 1).with_retention(RetentionConfig {
        keep_runs_per_branch: 1,
        artifact_min_age_seconds: 0,
    });
    let orchestrator = Orchestrator::new(
        cfg,
        Arc::new(ScriptedStage::new("generate")),
        Arc::new(ScriptedStage::new("sync")),
        artifacts.clone(),
        Arc::new(Notifier::new()),
    );

    let mut runs = Vec::new();
    for (seq, commit) in ["c1", "c2"].iter().enumerate() {
        let id = created(orchestrator.submit(trigger("main", commit, seq as u64 + 1)));
        runs.push(finish(&orchestrator, id).await);
    }
    std::fs::write(dir.path().join(format!("{}.json", ArtifactId::new())), br#"{"id":"#).unwrap();

    assert_eq!(orchestrator.apply_retention().archived, vec![runs[0].id]);
    let garbage = orchestrator.collect_garbage().await.unwrap();
    assert_eq!(garbage.deleted.len(), 2);
    assert_eq!(garbage.kept, 2);
    for artifact in runs[0].artifacts() {
        assert!(matches!(
            artifacts.get(&artifact.id).await,
            Err(crate::errors::StoreError::NotFound(_))
        ));
    }
}

#[tokio::test]
async fn test_garbage_collection_respects_min_age() {
    let cfg = config(1, 1).with_retention(RetentionConfig {
        keep_runs_per_branch: 1,
        artifact_min_age_seconds: 3600,
    });
    let (p, _, _) = TestPipeline::scripted(cfg);

    for (seq, commit) in ["c1", "c2"].iter().enumerate() {
        let id = created(p.orchestrator.submit(trigger("main", commit, seq as u64 + 1)));
        finish(&p.orchestrator, id).await;
    }
    assert_eq!(p.orchestrator.apply_retention().archived.len(), 1);

    let garbage = p.orchestrator.collect_garbage().await.unwrap();
    assert!(garbage.deleted.is_empty());
    assert_eq!(garbage.kept, 4);
}

#[tokio::test]
async fn test_intake_and_shutdown() {
    let (p, generate, _) = TestPipeline::scripted(config(1, 3));
    let (watcher, rx) = SourceWatcher::new(&WatchConfig::default(), p.notifier.clone()).unwrap();
    let intake = p.orchestrator.spawn_intake(rx);

    watcher.on_change("main", "abc123", now_utc()).unwrap();
    watcher.on_change("main", "abc123", now_utc()).unwrap();
    watcher.on_change("feature/x", "zzz999", now_utc()).unwrap();

    let run_id = tokio::time::timeout(WAIT, async {
        loop {
            if let Some(run) = p.orchestrator.runs_for_branch("main").first() {
                return run.id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    p.orchestrator.shutdown().await;
    assert!(p.orchestrator.run(run_id).unwrap().is_terminal());
    assert_eq!(generate.call_count(), 1);
    assert_eq!(p.orchestrator.branches(), vec!["main".to_string()]);

    assert!(matches!(
        p.orchestrator.submit(trigger("main", "def456", 9)),
        Err(DeployError::Shutdown)
    ));

    drop(watcher);
    tokio::time::timeout(WAIT, intake).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_run() {
    let (p, _, _) = TestPipeline::scripted(config(1, 1));
    let missing = RunId::new();
    assert!(p.orchestrator.run(missing).is_none());
    assert!(p.orchestrator.subscribe(missing).is_none());
    assert!(matches!(
        p.orchestrator.wait_for_terminal(missing).await,
        Err(DeployError::UnknownRun(id)) if id == missing
    ));
}

#[tokio::test]
async fn test_subscribe_sees_terminal_state() {
    let generate = Arc::new(GateStage::new(Arc::new(ScriptedStage::new("generate"))));
    generate.gate("abc123");
    let p = TestPipeline::new(config(1, 1), generate.clone(), Arc::new(ScriptedStage::new("sync")));

    let run_id = created(p.orchestrator.submit(trigger("main", "abc123", 1)));
    let mut rx = p.orchestrator.subscribe(run_id).unwrap();
    generate.wait_entered("abc123").await;
    assert_eq!(*rx.borrow_and_update(), RunState::Generating);

    generate.release("abc123");
    let state = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
    assert_eq!(state, RunState::Succeeded);
}
