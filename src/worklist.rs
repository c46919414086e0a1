//! The four-partition container of in-flight messages
//!
//! Until a message is acknowledged it lives in exactly one of `incoming`,
//! `ok`, `rejected` or `failed`. Stages move messages between partitions;
//! they never drop them. [`Worklist::reconcile`] lets the engine enforce that
//! after every pre-acknowledgment stage call.

use std::collections::HashSet;
use std::fmt;

use crate::message::{Message, MessageId};

/// Named partition of a [`Worklist`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Incoming,
    Ok,
    Rejected,
    Failed,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Incoming,
        Partition::Ok,
        Partition::Rejected,
        Partition::Failed,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Partition::Incoming => "incoming",
            Partition::Ok => "ok",
            Partition::Rejected => "rejected",
            Partition::Failed => "failed",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// In-flight messages partitioned by processing outcome.
///
/// `failed` means "retry later", not "permanent error".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Worklist {
    pub incoming: Vec<Message>,
    pub ok: Vec<Message>,
    pub rejected: Vec<Message>,
    pub failed: Vec<Message>,
}

/// What [`Worklist::reconcile`] had to repair
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Messages that vanished and were put back into `failed`
    pub restored: Vec<MessageId>,
    /// Extra copies of a message that were removed
    pub duplicates: Vec<MessageId>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.restored.is_empty() && self.duplicates.is_empty()
    }
}

impl Worklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// A worklist whose `incoming` holds `messages`
    pub fn with_incoming(messages: Vec<Message>) -> Self {
        Self {
            incoming: messages,
            ..Self::default()
        }
    }

    pub fn partition(&self, partition: Partition) -> &Vec<Message> {
        match partition {
            Partition::Incoming => &self.incoming,
            Partition::Ok => &self.ok,
            Partition::Rejected => &self.rejected,
            Partition::Failed => &self.failed,
        }
    }

    pub fn partition_mut(&mut self, partition: Partition) -> &mut Vec<Message> {
        match partition {
            Partition::Incoming => &mut self.incoming,
            Partition::Ok => &mut self.ok,
            Partition::Rejected => &mut self.rejected,
            Partition::Failed => &mut self.failed,
        }
    }

    /// Total messages across all partitions
    pub fn len(&self) -> usize {
        Partition::ALL.iter().map(|p| self.partition(*p).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every message, partition by partition, in partition order
    pub fn iter(&self) -> impl Iterator<Item = (Partition, &Message)> {
        Partition::ALL
            .into_iter()
            .flat_map(move |p| self.partition(p).iter().map(move |m| (p, m)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Message> {
        self.incoming
            .iter_mut()
            .chain(self.ok.iter_mut())
            .chain(self.rejected.iter_mut())
            .chain(self.failed.iter_mut())
    }

    /// Which partition holds `id`, if any
    pub fn locate(&self, id: MessageId) -> Option<Partition> {
        self.iter().find(|(_, m)| m.id() == id).map(|(p, _)| p)
    }

    /// Move every message of `from` matching `predicate` to the end of `to`,
    /// preserving relative order. Returns how many moved.
    pub fn move_where<F>(&mut self, from: Partition, to: Partition, mut predicate: F) -> usize
    where
        F: FnMut(&Message) -> bool,
    {
        if from == to {
            return 0;
        }
        let source = std::mem::take(self.partition_mut(from));
        let (moving, staying): (Vec<_>, Vec<_>) = source.into_iter().partition(|m| predicate(m));
        let moved = moving.len();
        *self.partition_mut(from) = staying;
        self.partition_mut(to).extend(moving);
        moved
    }

    /// Move the whole of `from` to the end of `to`
    pub fn move_all(&mut self, from: Partition, to: Partition) -> usize {
        self.move_where(from, to, |_| true)
    }

    pub fn reject_where<F: FnMut(&Message) -> bool>(&mut self, predicate: F) -> usize {
        self.move_where(Partition::Incoming, Partition::Rejected, predicate)
    }

    pub fn fail_where<F: FnMut(&Message) -> bool>(&mut self, predicate: F) -> usize {
        self.move_where(Partition::Incoming, Partition::Failed, predicate)
    }

    /// Counts per partition, for logs
    pub fn counts(&self) -> PartitionCounts {
        PartitionCounts {
            incoming: self.incoming.len(),
            ok: self.ok.len(),
            rejected: self.rejected.len(),
            failed: self.failed.len(),
        }
    }

    /// Remove extra copies of assigned ids; the first occurrence in
    /// partition order wins. Returns the ids that had copies.
    pub fn dedup(&mut self) -> Vec<MessageId> {
        let mut duplicates = Vec::new();
        let mut seen = HashSet::new();
        for partition in Partition::ALL {
            self.partition_mut(partition).retain(|message| {
                let id = message.id();
                if id.is_assigned() && !seen.insert(id) {
                    duplicates.push(id);
                    return false;
                }
                true
            });
        }
        duplicates
    }

    /// Enforce single membership against `snapshot`, taken before a stage ran.
    ///
    /// Duplicates are removed as in [`Worklist::dedup`]. Messages of the
    /// snapshot that are now missing are restored into `failed` so they are
    /// acknowledged and retried rather than lost. Messages with unassigned
    /// ids (created by the stage) are left alone.
    pub fn reconcile(&mut self, snapshot: &Worklist) -> Reconciliation {
        let duplicates = self.dedup();
        let present: HashSet<MessageId> = self.iter().map(|(_, m)| m.id()).collect();

        let mut restored = Vec::new();
        for (_, message) in snapshot.iter() {
            let id = message.id();
            if id.is_assigned() && !present.contains(&id) {
                restored.push(id);
                self.failed.push(message.clone());
            }
        }

        Reconciliation {
            restored,
            duplicates,
        }
    }
}

/// Partition sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartitionCounts {
    pub incoming: usize,
    pub ok: usize,
    pub rejected: usize,
    pub failed: usize,
}

impl fmt::Display for PartitionCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "incoming={} ok={} rejected={} failed={}",
            self.incoming, self.ok, self.rejected, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: u64) -> Message {
        let mut m = Message::new("http://h", format!("obs/{}.txt", id));
        m.set_id(MessageId(id));
        m
    }

    fn ids(messages: &[Message]) -> Vec<u64> {
        messages.iter().map(|m| m.id().0).collect()
    }

    #[test]
    fn test_move_where_preserves_order() {
        let mut worklist = Worklist::with_incoming((1..=6).map(message).collect());
        let moved = worklist.fail_where(|m| m.id().0 % 2 == 0);

        assert_eq!(moved, 3);
        assert_eq!(ids(&worklist.incoming), vec![1, 3, 5]);
        assert_eq!(ids(&worklist.failed), vec![2, 4, 6]);
        assert_eq!(worklist.len(), 6);
    }

    #[test]
    fn test_locate() {
        let mut worklist = Worklist::with_incoming(vec![message(1), message(2)]);
        worklist.reject_where(|m| m.id().0 == 2);
        assert_eq!(worklist.locate(MessageId(1)), Some(Partition::Incoming));
        assert_eq!(worklist.locate(MessageId(2)), Some(Partition::Rejected));
        assert_eq!(worklist.locate(MessageId(3)), None);
    }

    #[test]
    fn test_reconcile_restores_dropped_messages() {
        let snapshot = Worklist::with_incoming(vec![message(1), message(2), message(3)]);
        let mut worklist = snapshot.clone();
        worklist.incoming.retain(|m| m.id().0 != 2);

        let report = worklist.reconcile(&snapshot);

        assert_eq!(report.restored, vec![MessageId(2)]);
        assert_eq!(ids(&worklist.incoming), vec![1, 3]);
        assert_eq!(ids(&worklist.failed), vec![2]);
    }

    #[test]
    fn test_reconcile_removes_duplicates() {
        let snapshot = Worklist::with_incoming(vec![message(1), message(2)]);
        let mut worklist = snapshot.clone();
        worklist.ok.push(message(1));

        let report = worklist.reconcile(&snapshot);

        assert_eq!(report.duplicates, vec![MessageId(1)]);
        assert_eq!(ids(&worklist.incoming), vec![1, 2]);
        assert!(worklist.ok.is_empty());
    }

    #[test]
    fn test_reconcile_keeps_stage_created_messages() {
        let snapshot = Worklist::with_incoming(vec![message(1)]);
        let mut worklist = snapshot.clone();
        worklist.incoming.push(Message::new("http://h", "new.txt"));
        worklist.incoming.push(Message::new("http://h", "other.txt"));

        assert!(worklist.reconcile(&snapshot).is_clean());
        assert_eq!(worklist.incoming.len(), 3);
    }

    #[test]
    fn test_counts_display() {
        let mut worklist = Worklist::with_incoming(vec![message(1), message(2)]);
        worklist.move_all(Partition::Incoming, Partition::Ok);
        assert_eq!(
            worklist.counts().to_string(),
            "incoming=0 ok=2 rejected=0 failed=0"
        );
    }
}
