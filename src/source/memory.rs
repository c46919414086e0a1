//! In-process broker
//!
//! [`MemoryBroker`] behaves like a queue on a pub/sub broker: published
//! messages wait in a queue, a consumer ([`MemorySource`]) receives them with
//! a delivery tag, and messages that were delivered but not acknowledged go
//! back to the head of the queue when the consumer closes. Faults can be
//! injected for fetch and acknowledge to exercise the engine's backoff.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{MessageSource, SourceError, SourceResult};
use crate::message::Message;

const DELIVERY_TAG: &str = "delivery_tag";
const EXCHANGE: &str = "exchange";

#[derive(Debug, Default)]
struct BrokerState {
    queue: VecDeque<Message>,
    unacked: BTreeMap<u64, Message>,
    acks: HashMap<u64, u32>,
    ack_order: Vec<String>,
    next_tag: u64,
    fetch_faults: u32,
    ack_faults: u32,
}

/// Shared handle to an in-memory queue
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    exchange: String,
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new("xpublic")
    }
}

impl MemoryBroker {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            state: Arc::new(Mutex::new(BrokerState::default())),
        }
    }

    fn lock(&self) -> SourceResult<MutexGuard<'_, BrokerState>> {
        self.state
            .lock()
            .map_err(|e| SourceError::Poisoned(e.to_string()))
    }

    /// Queue a message for delivery
    pub fn publish(&self, message: Message) -> SourceResult<()> {
        self.lock()?.queue.push_back(message);
        Ok(())
    }

    /// A consumer of this queue
    pub fn source(&self) -> MemorySource {
        MemorySource {
            broker: self.clone(),
        }
    }

    /// Messages waiting for delivery
    pub fn pending(&self) -> SourceResult<usize> {
        Ok(self.lock()?.queue.len())
    }

    /// Messages delivered and not yet acknowledged
    pub fn unacked(&self) -> SourceResult<usize> {
        Ok(self.lock()?.unacked.len())
    }

    /// Relative paths of acknowledged messages, in acknowledgment order
    pub fn acknowledged(&self) -> SourceResult<Vec<String>> {
        Ok(self.lock()?.ack_order.clone())
    }

    /// Highest number of acknowledgments any single delivery received
    pub fn max_acks_per_delivery(&self) -> SourceResult<u32> {
        Ok(self.lock()?.acks.values().copied().max().unwrap_or(0))
    }

    /// Fail the next `count` fetches with `Unavailable`
    pub fn fail_fetches(&self, count: u32) -> SourceResult<()> {
        self.lock()?.fetch_faults = count;
        Ok(())
    }

    /// Fail the next `count` acknowledgments with `Unavailable`
    pub fn fail_acks(&self, count: u32) -> SourceResult<()> {
        self.lock()?.ack_faults = count;
        Ok(())
    }

    /// Put every unacknowledged delivery back at the head of the queue
    pub fn redeliver(&self) -> SourceResult<usize> {
        let mut state = self.lock()?;
        let unacked = std::mem::take(&mut state.unacked);
        let count = unacked.len();
        for (_, mut message) in unacked.into_iter().rev() {
            message.extra.remove(DELIVERY_TAG);
            message.extra.remove(EXCHANGE);
            state.queue.push_front(message);
        }
        Ok(count)
    }

    fn unavailable(reason: &str) -> SourceError {
        SourceError::Unavailable {
            source_name: "memory".to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Consumer side of a [`MemoryBroker`]
#[derive(Debug, Clone)]
pub struct MemorySource {
    broker: MemoryBroker,
}

#[async_trait]
impl MessageSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_batch(&mut self, max: usize) -> SourceResult<Vec<Message>> {
        let exchange = self.broker.exchange.clone();
        let mut state = self.broker.lock()?;
        if state.fetch_faults > 0 {
            state.fetch_faults -= 1;
            return Err(MemoryBroker::unavailable("injected fetch fault"));
        }

        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(mut message) = state.queue.pop_front() else {
                break;
            };
            state.next_tag += 1;
            let tag = state.next_tag;
            message.set(DELIVERY_TAG, tag);
            message.set(EXCHANGE, exchange.as_str());
            message.add_delete_on_post(DELIVERY_TAG);
            message.add_delete_on_post(EXCHANGE);
            state.unacked.insert(tag, message.clone());
            batch.push(message);
        }
        Ok(batch)
    }

    async fn acknowledge(&mut self, message: &Message) -> SourceResult<()> {
        let mut state = self.broker.lock()?;
        if state.ack_faults > 0 {
            state.ack_faults -= 1;
            return Err(MemoryBroker::unavailable("injected ack fault"));
        }

        let tag = message
            .get(DELIVERY_TAG)
            .and_then(|v| v.as_u64())
            .ok_or_else(|| SourceError::UnknownDelivery {
                rel_path: message.rel_path.clone(),
                reason: "no delivery_tag".to_string(),
            })?;

        *state.acks.entry(tag).or_insert(0) += 1;
        if state.unacked.remove(&tag).is_none() {
            return Err(SourceError::UnknownDelivery {
                rel_path: message.rel_path.clone(),
                reason: format!("delivery {} is not outstanding", tag),
            });
        }
        state.ack_order.push(message.rel_path.clone());
        Ok(())
    }

    async fn close(&mut self) -> SourceResult<()> {
        let redelivered = self.broker.redeliver()?;
        if redelivered > 0 {
            debug!(redelivered, "unacknowledged messages returned to queue");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with(paths: &[&str]) -> MemoryBroker {
        let broker = MemoryBroker::default();
        for path in paths {
            broker.publish(Message::new("http://h", *path)).unwrap();
        }
        broker
    }

    #[tokio::test]
    async fn test_fetch_tags_and_marks_transient() {
        let broker = broker_with(&["a", "b", "c"]);
        let mut source = broker.source();

        let batch = source.fetch_batch(2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].get("delivery_tag"), Some(&serde_json::json!(1)));
        assert!(batch[0].delete_on_post().contains("delivery_tag"));
        assert!(batch[0].delete_on_post().contains("exchange"));
        assert_eq!(broker.pending().unwrap(), 1);
        assert_eq!(broker.unacked().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ack_and_double_ack() {
        let broker = broker_with(&["a"]);
        let mut source = broker.source();
        let batch = source.fetch_batch(10).await.unwrap();

        source.acknowledge(&batch[0]).await.unwrap();
        assert_eq!(broker.unacked().unwrap(), 0);
        assert_eq!(broker.acknowledged().unwrap(), vec!["a".to_string()]);

        let err = source.acknowledge(&batch[0]).await.unwrap_err();
        assert!(matches!(err, SourceError::UnknownDelivery { .. }));
        assert_eq!(broker.max_acks_per_delivery().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_close_redelivers_in_order() {
        let broker = broker_with(&["a", "b", "c"]);
        let mut source = broker.source();
        let batch = source.fetch_batch(2).await.unwrap();
        source.acknowledge(&batch[0]).await.unwrap();
        source.close().await.unwrap();

        let mut again = broker.source();
        let batch = again.fetch_batch(10).await.unwrap();
        let paths: Vec<_> = batch.iter().map(|m| m.rel_path.as_str()).collect();
        assert_eq!(paths, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let broker = broker_with(&["a"]);
        broker.fail_fetches(1).unwrap();
        let mut source = broker.source();

        let err = source.fetch_batch(1).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(source.fetch_batch(1).await.unwrap().len(), 1);
    }
}
