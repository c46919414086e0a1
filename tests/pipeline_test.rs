use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use filetime::FileTime;
use meridian::config::MeridianConfig;
use meridian::flow::{CycleOutcome, Flow, FlowSettings, RetryPolicy, RetryQueue};
use meridian::message::{IntegrityMethod, Message};
use meridian::source::MemoryBroker;
use meridian::stage::{EntryPoints, Stage, StageChain, StageRegistry, StageResult};
use meridian::supervisor::build_flow;
use meridian::transfer::Direction;
use meridian::worklist::{PartitionCounts, Worklist};
use meridian_core_resilience::BackoffConfig;
use tempfile::tempdir;
use tokio::sync::watch;
use url::Url;

fn quiet(name: &str) -> FlowSettings {
    FlowSettings {
        direction: Direction::None,
        ..FlowSettings::new(name)
    }
}

fn instant_retries(max_attempts: Option<u32>, path: Option<&Path>) -> RetryPolicy {
    RetryPolicy {
        path: path.map(Path::to_path_buf),
        max_attempts,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_factor: 1.0,
    }
}

async fn cycle(flow: &mut Flow) -> CycleOutcome {
    let (_tx, mut rx) = watch::channel(false);
    flow.run_cycle(&mut rx).await.unwrap()
}

fn counts_of(outcome: &CycleOutcome) -> PartitionCounts {
    match outcome {
        CycleOutcome::Processed { counts, .. } => *counts,
        other => panic!("expected a processed cycle, got {:?}", other),
    }
}

/// Fails everything it sees
struct FailAll;

#[async_trait]
impl Stage for FailAll {
    fn name(&self) -> &str {
        "test.fail_all"
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_MESSAGES
    }

    async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        let incoming = std::mem::take(&mut worklist.incoming);
        worklist.failed.extend(incoming);
        Ok(())
    }
}

fn failing_chain() -> StageChain {
    let mut chain = StageChain::new();
    chain.push(Box::new(FailAll)).unwrap();
    chain
}

fn touch(path: &Path, age_secs: i64) {
    std::fs::write(path, b"x").unwrap();
    let mtime = FileTime::from_unix_time(Utc::now().timestamp() - age_secs, 0);
    filetime::set_file_mtime(path, mtime).unwrap();
}

#[tokio::test]
async fn test_file_delay_defers_young_and_passes_old() {
    let dir = tempdir().unwrap();
    touch(&dir.path().join("old.txt"), 600);
    touch(&dir.path().join("young.txt"), 0);
    let here = dir.path().display().to_string();

    let broker = MemoryBroker::default();
    broker
        .publish(
            Message::new("file:///", "old.txt")
                .with_pub_time(Utc::now() - chrono::Duration::seconds(600))
                .with_destination(here.clone(), "old.txt"),
        )
        .unwrap();
    broker
        .publish(Message::new("file:///", "young.txt").with_destination(here.clone(), "young.txt"))
        .unwrap();
    broker
        .publish(Message::new("file:///", "gone.txt").with_integrity(IntegrityMethod::Remove))
        .unwrap();

    let mut defaults = toml::Table::new();
    defaults.insert("fdelay".into(), toml::Value::Integer(60));
    let chain = StageRegistry::with_builtin()
        .load_chain(&["msg.fdelay"], &defaults, &HashMap::new())
        .unwrap();

    let mut flow = Flow::new(quiet("delay"), Box::new(broker.source()), chain)
        .with_retry_queue(RetryQueue::new(RetryPolicy::default()));
    let outcome = cycle(&mut flow).await;
    let counts = counts_of(&outcome);
    assert_eq!((counts.ok, counts.rejected, counts.failed), (1, 1, 1));

    let CycleOutcome::Processed { posted, .. } = outcome else {
        unreachable!()
    };
    assert_eq!(posted[0].rel_path, "old.txt");

    // deferral is not an attempt
    assert_eq!(flow.retry_queue().len(), 1);
    assert_eq!(flow.stats().exhausted, 0);
    // every message, deferred ones included, is acknowledged exactly once
    assert_eq!(broker.acknowledged().unwrap().len(), 3);
}

#[tokio::test]
async fn test_retries_exhaust_after_max_attempts() {
    let broker = MemoryBroker::default();
    broker.publish(Message::new("http://h/", "doomed")).unwrap();

    let mut flow = Flow::new(quiet("exhaust"), Box::new(broker.source()), failing_chain())
        .with_retry_queue(RetryQueue::new(instant_retries(Some(1), None)));

    // first failure came from the source, not a retry: not counted
    assert_eq!(counts_of(&cycle(&mut flow).await).failed, 1);
    assert_eq!(flow.retry_queue().len(), 1);

    // first counted attempt
    assert_eq!(counts_of(&cycle(&mut flow).await).failed, 1);
    assert_eq!(flow.stats().retried, 1);

    // second counted attempt exceeds the cap
    let counts = counts_of(&cycle(&mut flow).await);
    assert_eq!((counts.failed, counts.rejected), (0, 1));
    assert_eq!(flow.stats().exhausted, 1);
    assert!(flow.retry_queue().is_empty());

    // acknowledged once, when it first arrived
    assert_eq!(broker.max_acks_per_delivery().unwrap(), 1);
    assert_eq!(cycle(&mut flow).await, CycleOutcome::Idle);
}

/// Turns every message about to be posted into a failure
struct RefusePost;

#[async_trait]
impl Stage for RefusePost {
    fn name(&self) -> &str {
        "test.refuse_post"
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_POSTS
    }

    async fn on_posts(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        let ok = std::mem::take(&mut worklist.ok);
        worklist.failed.extend(ok);
        Ok(())
    }
}

#[tokio::test]
async fn test_post_stage_failures_count_toward_max_attempts() {
    let broker = MemoryBroker::default();
    broker.publish(Message::new("http://h/", "unpostable")).unwrap();

    let mut chain = StageChain::new();
    chain.push(Box::new(RefusePost)).unwrap();
    let mut flow = Flow::new(quiet("refused"), Box::new(broker.source()), chain)
        .with_retry_queue(RetryQueue::new(instant_retries(Some(1), None)));

    assert_eq!(counts_of(&cycle(&mut flow).await).failed, 1);
    assert_eq!(counts_of(&cycle(&mut flow).await).failed, 1);
    assert_eq!(flow.retry_queue().len(), 1);

    let outcome = cycle(&mut flow).await;
    let counts = counts_of(&outcome);
    assert_eq!((counts.ok, counts.failed, counts.rejected), (0, 0, 1));
    assert_eq!(flow.stats().exhausted, 1);
    assert!(flow.retry_queue().is_empty());
    let CycleOutcome::Processed { posted, .. } = outcome else {
        unreachable!()
    };
    assert!(posted.is_empty());
}

#[tokio::test]
async fn test_unlimited_retries_keep_failing_messages() {
    let broker = MemoryBroker::default();
    broker.publish(Message::new("http://h/", "stubborn")).unwrap();

    let mut flow = Flow::new(quiet("forever"), Box::new(broker.source()), failing_chain())
        .with_retry_queue(RetryQueue::new(instant_retries(None, None)));
    for _ in 0..5 {
        assert_eq!(counts_of(&cycle(&mut flow).await).failed, 1);
    }
    assert_eq!(flow.retry_queue().len(), 1);
    assert_eq!(flow.stats().exhausted, 0);
}

#[tokio::test]
async fn test_retry_queue_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state/retry.jsonl");
    let broker = MemoryBroker::default();
    broker.publish(Message::new("http://h/", "a")).unwrap();
    broker.publish(Message::new("http://h/", "b")).unwrap();

    {
        let retry = RetryQueue::open(instant_retries(Some(3), Some(&path)))
            .await
            .unwrap();
        let mut flow = Flow::new(quiet("persist"), Box::new(broker.source()), failing_chain())
            .with_retry_queue(retry);
        cycle(&mut flow).await;
        cycle(&mut flow).await;
        flow.shutdown().await;
    }
    assert!(path.exists());

    let reopened = RetryQueue::open(instant_retries(Some(3), Some(&path)))
        .await
        .unwrap();
    assert_eq!(reopened.len(), 2);
    let mut reopened = reopened;
    let taken = reopened.take_eligible(10);
    let paths: Vec<_> = taken.iter().map(|m| m.rel_path.as_str()).collect();
    assert_eq!(paths, vec!["a", "b"]);
    assert!(taken.iter().all(|m| m.is_retry && m.is_acknowledged()));
    // the counted attempt from the second cycle was kept
    assert_eq!(reopened.attempts(&taken[0]), 1);
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(5),
        factor: 2.0,
        jitter: false,
    }
}

#[tokio::test]
async fn test_source_faults_are_retried_with_backoff() {
    let broker = MemoryBroker::default();
    broker.publish(Message::new("http://h/", "a")).unwrap();
    broker.fail_fetches(2).unwrap();
    broker.fail_acks(1).unwrap();

    let settings = FlowSettings {
        source_backoff: fast_backoff(),
        ..quiet("flaky")
    };
    let mut flow = Flow::new(settings, Box::new(broker.source()), StageChain::new());

    let counts = counts_of(&cycle(&mut flow).await);
    assert_eq!(counts.ok, 1);
    assert_eq!(flow.stats().source_faults, 3);
    assert_eq!(flow.stats().acked, 1);
    assert_eq!(broker.acknowledged().unwrap(), vec!["a".to_string()]);
}

#[tokio::test]
async fn test_stop_interrupts_fetch_backoff() {
    let broker = MemoryBroker::default();
    broker.publish(Message::new("http://h/", "a")).unwrap();
    broker.fail_fetches(u32::MAX).unwrap();

    let settings = FlowSettings {
        source_backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(10),
            factor: 1.0,
            jitter: false,
        },
        ..quiet("unreachable")
    };
    let mut flow = Flow::new(settings, Box::new(broker.source()), StageChain::new());

    let (tx, mut rx) = watch::channel(false);
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);
        tx
    });
    let outcome = flow.run_cycle(&mut rx).await.unwrap();
    let _tx = stopper.await.unwrap();

    assert_eq!(outcome, CycleOutcome::Abandoned);
    assert!(flow.stats().source_faults >= 1);
    assert_eq!(broker.pending().unwrap(), 1);
}

#[tokio::test]
async fn test_spool_flow_downloads_and_reposts() {
    let dir = tempdir().unwrap();
    let inbox = dir.path().join("in");
    let outbox = dir.path().join("posted");
    let data = dir.path().join("data");
    let store = dir.path().join("store");
    std::fs::create_dir_all(&inbox).unwrap();
    std::fs::create_dir_all(data.join("obs")).unwrap();
    std::fs::write(data.join("obs/a.txt"), b"observation").unwrap();

    let base = Url::from_file_path(&data).unwrap().to_string();
    let message = Message::new(base, "obs/a.txt").with_size(11);
    std::fs::write(
        inbox.join("0001.json"),
        serde_json::to_vec(&message.to_value().unwrap()).unwrap(),
    )
    .unwrap();

    let text = format!(
        r#"
[[flow]]
name = "relay"
stages = ["post.spool"]
directory = "{store}"

[flow.source]
dir = "{inbox}"

[flow.retry]
path = "{retry}"

[flow.settings."post.spool"]
post_dir = "{outbox}"
"#,
        store = store.display(),
        inbox = inbox.display(),
        retry = dir.path().join("retry.jsonl").display(),
        outbox = outbox.display(),
    );
    let config = MeridianConfig::parse(&text).unwrap();
    let mut flow = build_flow(&config.flows[0], &StageRegistry::with_builtin())
        .await
        .unwrap();
    flow.start().await.unwrap();

    let counts = counts_of(&cycle(&mut flow).await);
    assert_eq!(counts.ok, 1);
    assert_eq!(std::fs::read(store.join("obs/a.txt")).unwrap(), b"observation");
    assert!(!inbox.join("0001.json").exists());

    let posted: Vec<_> = std::fs::read_dir(&outbox)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(posted.len(), 1);
    let body: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&posted[0]).unwrap()).unwrap();
    assert_eq!(body["relPath"], "obs/a.txt");
    assert_eq!(body["new_file"], "a.txt");
    assert_eq!(body["report"]["code"], 201);
    assert!(body.get("spool_file").is_none());

    assert_eq!(cycle(&mut flow).await, CycleOutcome::Idle);
    flow.shutdown().await;
}
