use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use meridian::flow::{CycleOutcome, Flow, FlowSettings};
use meridian::message::Message;
use meridian::source::MemoryBroker;
use meridian::stage::{EntryPoints, Stage, StageChain, StageResult};
use meridian::transfer::Direction;
use meridian::worklist::{Partition, Worklist};
use tokio::sync::watch;

type Events = Arc<Mutex<Vec<String>>>;

fn events() -> Events {
    Arc::new(Mutex::new(Vec::new()))
}

fn taken(events: &Events) -> Vec<String> {
    std::mem::take(&mut *events.lock().unwrap())
}

fn settings() -> FlowSettings {
    FlowSettings {
        direction: Direction::None,
        ..FlowSettings::new("engine")
    }
}

fn broker_with(paths: &[&str]) -> MemoryBroker {
    let broker = MemoryBroker::default();
    for path in paths {
        broker.publish(Message::new("http://example.com/", *path)).unwrap();
    }
    broker
}

fn chain(stages: Vec<Box<dyn Stage>>) -> StageChain {
    let mut chain = StageChain::new();
    for stage in stages {
        chain.push(stage).unwrap();
    }
    chain
}

fn processed(outcome: CycleOutcome) -> (meridian::worklist::PartitionCounts, Vec<Message>) {
    match outcome {
        CycleOutcome::Processed { counts, posted } => (counts, posted),
        other => panic!("expected a processed cycle, got {:?}", other),
    }
}

/// Records every call it receives
struct Recorder {
    name: &'static str,
    events: Events,
}

#[async_trait]
impl Stage for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_MESSAGES | EntryPoints::ON_POSTS | EntryPoints::ON_STOP
    }

    async fn on_messages(&mut self, _worklist: &mut Worklist) -> StageResult<()> {
        self.events.lock().unwrap().push(format!("{}:on_messages", self.name));
        Ok(())
    }

    async fn on_posts(&mut self, _worklist: &mut Worklist) -> StageResult<()> {
        self.events.lock().unwrap().push(format!("{}:on_posts", self.name));
        Ok(())
    }

    async fn on_stop(&mut self) -> StageResult<()> {
        self.events.lock().unwrap().push(format!("{}:on_stop", self.name));
        Ok(())
    }
}

/// Rejects `r*`, fails `f*`, leaves the rest in incoming
struct Sorter;

#[async_trait]
impl Stage for Sorter {
    fn name(&self) -> &str {
        "test.sorter"
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_MESSAGES
    }

    async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        worklist.reject_where(|m| m.rel_path.starts_with('r'));
        worklist.fail_where(|m| m.rel_path.starts_with('f'));
        Ok(())
    }
}

enum Misbehaviour {
    Drop,
    Duplicate,
    ErrAfterMoving,
    Panic,
}

struct Misbehaving(Misbehaviour);

#[async_trait]
impl Stage for Misbehaving {
    fn name(&self) -> &str {
        "test.misbehaving"
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_MESSAGES
    }

    async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        match self.0 {
            Misbehaviour::Drop => {
                worklist.incoming.remove(0);
                Ok(())
            }
            Misbehaviour::Duplicate => {
                let copy = worklist.incoming[0].clone();
                worklist.ok.push(copy);
                Ok(())
            }
            Misbehaviour::ErrAfterMoving => {
                worklist.move_all(Partition::Incoming, Partition::Rejected);
                anyhow::bail!("gave up halfway")
            }
            Misbehaviour::Panic => {
                worklist.incoming.clear();
                panic!("stage bug")
            }
        }
    }
}

/// Notes, at post time, whether every posted message was already acknowledged
struct AckWitness {
    broker: MemoryBroker,
    events: Events,
}

#[async_trait]
impl Stage for AckWitness {
    fn name(&self) -> &str {
        "test.ack_witness"
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_POSTS | EntryPoints::POST
    }

    async fn on_posts(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        self.witness("on_posts", worklist)
    }

    async fn post(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        self.witness("post", worklist)
    }
}

impl AckWitness {
    fn witness(&self, entry_point: &str, worklist: &Worklist) -> StageResult<()> {
        let acked = self.broker.acknowledged()?;
        for message in worklist.ok.iter().chain(worklist.failed.iter()) {
            let seen = acked.contains(&message.rel_path) && message.is_acknowledged();
            self.events
                .lock()
                .unwrap()
                .push(format!("{}:{}:{}", entry_point, message.rel_path, seen));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() {
    let log = events();
    let broker = MemoryBroker::default();
    let stages = chain(vec![Box::new(Recorder { name: "A", events: log.clone() })]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    let (_tx, mut rx) = watch::channel(false);

    assert_eq!(flow.run_cycle(&mut rx).await.unwrap(), CycleOutcome::Idle);
    assert!(taken(&log).is_empty());
    assert_eq!(flow.stats().cycles, 0);
}

#[tokio::test]
async fn test_stages_run_in_load_order_and_stop_in_reverse() {
    let log = events();
    let broker = broker_with(&["a"]);
    let stages = chain(vec![
        Box::new(Recorder { name: "A", events: log.clone() }),
        Box::new(Recorder { name: "B", events: log.clone() }),
        Box::new(Recorder { name: "C", events: log.clone() }),
    ]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    let (_tx, mut rx) = watch::channel(false);

    flow.run_cycle(&mut rx).await.unwrap();
    broker.publish(Message::new("http://example.com/", "b")).unwrap();
    flow.run_cycle(&mut rx).await.unwrap();

    let batch = [
        "A:on_messages",
        "B:on_messages",
        "C:on_messages",
        "A:on_posts",
        "B:on_posts",
        "C:on_posts",
    ];
    let expected: Vec<String> = batch.iter().chain(batch.iter()).map(|s| s.to_string()).collect();
    assert_eq!(taken(&log), expected);

    flow.shutdown().await;
    assert_eq!(taken(&log), vec!["C:on_stop", "B:on_stop", "A:on_stop"]);
}

#[tokio::test]
async fn test_every_partition_is_acknowledged_exactly_once_before_post() {
    let log = events();
    let broker = broker_with(&["ok1", "r1", "f1", "ok2"]);
    let stages = chain(vec![
        Box::new(Sorter),
        Box::new(AckWitness {
            broker: broker.clone(),
            events: log.clone(),
        }),
    ]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    let (_tx, mut rx) = watch::channel(false);

    let (counts, posted) = processed(flow.run_cycle(&mut rx).await.unwrap());
    assert_eq!((counts.ok, counts.rejected, counts.failed), (2, 1, 1));

    let mut acked = broker.acknowledged().unwrap();
    acked.sort();
    assert_eq!(acked, vec!["f1", "ok1", "ok2", "r1"]);
    assert_eq!(broker.max_acks_per_delivery().unwrap(), 1);
    assert_eq!(broker.unacked().unwrap(), 0);

    let witnessed = taken(&log);
    assert!(!witnessed.is_empty());
    assert!(witnessed.iter().all(|e| e.ends_with(":true")), "{:?}", witnessed);

    // transient source fields are gone from what was posted
    let paths: Vec<_> = posted.iter().map(|m| m.rel_path.as_str()).collect();
    assert_eq!(paths, vec!["ok1", "ok2"]);
    assert!(posted.iter().all(|m| m.get("delivery_tag").is_none()));
}

#[tokio::test]
async fn test_dropped_message_is_restored_into_failed() {
    let broker = broker_with(&["a", "b", "c"]);
    let stages = chain(vec![Box::new(Misbehaving(Misbehaviour::Drop))]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    let (_tx, mut rx) = watch::channel(false);

    let (counts, _) = processed(flow.run_cycle(&mut rx).await.unwrap());
    assert_eq!((counts.ok, counts.failed), (2, 1));
    assert_eq!(flow.stats().restored, 1);
    assert_eq!(broker.acknowledged().unwrap().len(), 3);
    assert_eq!(flow.retry_queue().len(), 1);
}

#[tokio::test]
async fn test_duplicated_message_keeps_one_copy() {
    let broker = broker_with(&["a", "b"]);
    let stages = chain(vec![Box::new(Misbehaving(Misbehaviour::Duplicate))]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    let (_tx, mut rx) = watch::channel(false);

    let (counts, posted) = processed(flow.run_cycle(&mut rx).await.unwrap());
    assert_eq!(counts.ok, 2);
    let paths: Vec<_> = posted.iter().map(|m| m.rel_path.as_str()).collect();
    assert_eq!(paths, vec!["a", "b"]);
    assert_eq!(broker.max_acks_per_delivery().unwrap(), 1);
}

#[tokio::test]
async fn test_faulty_stages_leave_membership_untouched() {
    for misbehaviour in [Misbehaviour::ErrAfterMoving, Misbehaviour::Panic] {
        let log = events();
        let broker = broker_with(&["a", "r1"]);
        let stages = chain(vec![
            Box::new(Misbehaving(misbehaviour)),
            Box::new(Sorter),
            Box::new(Recorder { name: "after", events: log.clone() }),
        ]);
        let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
        let (_tx, mut rx) = watch::channel(false);

        let (counts, _) = processed(flow.run_cycle(&mut rx).await.unwrap());
        // the chain continued past the fault with the batch intact
        assert_eq!((counts.ok, counts.rejected, counts.failed), (1, 1, 0));
        assert_eq!(flow.stats().stage_faults, 1);
        assert!(taken(&log).contains(&"after:on_messages".to_string()));
        assert_eq!(broker.acknowledged().unwrap().len(), 2);
    }
}

/// Records where each message landed, optionally requesting a stop
struct Snapshotter {
    outcome: Arc<Mutex<Vec<(String, Partition)>>>,
    stop: Option<Arc<watch::Sender<bool>>>,
}

#[async_trait]
impl Stage for Snapshotter {
    fn name(&self) -> &str {
        "test.snapshotter"
    }

    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ON_MESSAGES
    }

    async fn on_messages(&mut self, worklist: &mut Worklist) -> StageResult<()> {
        let mut outcome = self.outcome.lock().unwrap();
        outcome.clear();
        for (partition, message) in worklist.iter() {
            outcome.push((message.rel_path.clone(), partition));
        }
        if let Some(stop) = &self.stop {
            stop.send_replace(true);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_batch_abandoned_before_ack_replays_identically() {
    let broker = broker_with(&["a", "r1", "f1", "b"]);

    // first run: stop arrives during on_messages, before acknowledgment
    let first = Arc::new(Mutex::new(Vec::new()));
    let (tx, mut rx) = watch::channel(false);
    let tx = Arc::new(tx);
    let stages = chain(vec![
        Box::new(Sorter),
        Box::new(Snapshotter {
            outcome: first.clone(),
            stop: Some(tx.clone()),
        }),
    ]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    assert_eq!(flow.run_cycle(&mut rx).await.unwrap(), CycleOutcome::Abandoned);
    flow.shutdown().await;
    assert!(broker.acknowledged().unwrap().is_empty());
    assert_eq!(broker.pending().unwrap(), 4);

    // second run over the redelivered batch
    let second = Arc::new(Mutex::new(Vec::new()));
    let stages = chain(vec![
        Box::new(Sorter),
        Box::new(Snapshotter {
            outcome: second.clone(),
            stop: None,
        }),
    ]);
    let mut flow = Flow::new(settings(), Box::new(broker.source()), stages);
    let (_tx, mut rx) = watch::channel(false);
    processed(flow.run_cycle(&mut rx).await.unwrap());

    assert_eq!(*first.lock().unwrap(), *second.lock().unwrap());
    assert_eq!(broker.acknowledged().unwrap().len(), 4);
    assert_eq!(broker.max_acks_per_delivery().unwrap(), 1);
}

#[tokio::test]
async fn test_run_stops_on_signal_and_stops_stages() {
    let log = events();
    let broker = broker_with(&["a"]);
    let stages = chain(vec![Box::new(Recorder { name: "A", events: log.clone() })]);
    let flow = Flow::new(
        FlowSettings {
            sleep: std::time::Duration::from_millis(10),
            ..settings()
        },
        Box::new(broker.source()),
        stages,
    );
    let (tx, rx) = watch::channel(false);

    let task = tokio::spawn(flow.run(rx));
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    tx.send_replace(true);

    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.cycles, 1);
    assert_eq!(stats.acked, 1);
    assert!(taken(&log).contains(&"A:on_stop".to_string()));
}
