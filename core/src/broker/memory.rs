use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::{BrokerClient, CommitMode, Generation, PartitionClaim, TopicLister};
use crate::errors::BrokerError;
use crate::lock;
use crate::message::{Header, Message};

/// A committed offset as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub mode: CommitMode,
}

/// In-process broker with append-only partition logs and a single group
/// member. Every join claims every partition of the requested topics and
/// replays them from the committed offset.
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    topics: BTreeMap<String, Vec<Vec<Message>>>,
    committed: HashMap<(String, i32), i64>,
    commits: Vec<CommitRecord>,
    live: Option<LiveGeneration>,
    generations: i32,
    join_calls: usize,
    join_failures: usize,
    commit_failures: usize,
    closed: bool,
}

struct LiveGeneration {
    ended: CancellationToken,
    sources: HashMap<(String, i32), mpsc::UnboundedSender<Message>>,
}

impl LiveGeneration {
    fn end(self) {
        // cancel before dropping the senders so claims see a revocation, not a closed source
        self.ended.cancel();
        drop(self.sources);
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = lock(&self.state);
        let logs = state.topics.entry(topic.to_string()).or_default();
        if logs.len() < partitions {
            logs.resize_with(partitions, Vec::new);
        }
    }

    pub fn delete_topic(&self, topic: &str) {
        let mut state = lock(&self.state);
        state.topics.remove(topic);
        state.committed.retain(|(t, _), _| t != topic);
    }

    /// Appends a message and returns its offset. The topic and partition are
    /// created on first use.
    pub fn produce(&self, topic: &str, partition: i32, value: impl Into<Vec<u8>>) -> i64 {
        self.produce_with_headers(topic, partition, value, vec![])
    }

    pub fn produce_with_headers(
        &self,
        topic: &str,
        partition: i32,
        value: impl Into<Vec<u8>>,
        headers: Vec<Header>,
    ) -> i64 {
        let mut state = lock(&self.state);
        let index = partition.max(0) as usize;
        let logs = state.topics.entry(topic.to_string()).or_default();
        if logs.len() <= index {
            logs.resize_with(index + 1, Vec::new);
        }
        let log = &mut logs[index];
        let message = Message {
            topic: topic.to_string(),
            partition,
            offset: log.len() as i64,
            key: None,
            value: value.into(),
            headers,
            timestamp: Some(Utc::now()),
        };
        let offset = message.offset;
        log.push(message.clone());

        if let Some(source) = state
            .live
            .as_ref()
            .and_then(|live| live.sources.get(&(topic.to_string(), partition)))
        {
            // a claim that already exited simply misses it; the next join replays it
            let _ = source.send(message);
        }
        offset
    }

    /// Ends the live generation as a broker-side rebalance would.
    pub fn rebalance(&self) {
        let live = lock(&self.state).live.take();
        if let Some(live) = live {
            debug!("ending generation on rebalance");
            live.end();
        }
    }

    /// Closes one partition's message source without ending the generation.
    pub fn drop_partition_source(&self, topic: &str, partition: i32) {
        let mut state = lock(&self.state);
        if let Some(live) = state.live.as_mut() {
            live.sources.remove(&(topic.to_string(), partition));
        }
    }

    /// The next `count` joins fail with a retryable error.
    pub fn fail_next_joins(&self, count: usize) {
        lock(&self.state).join_failures = count;
    }

    /// The next `count` commits fail with a retryable error.
    pub fn fail_next_commits(&self, count: usize) {
        lock(&self.state).commit_failures = count;
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        lock(&self.state).commits.clone()
    }

    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.state)
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn join_calls(&self) -> usize {
        lock(&self.state).join_calls
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

#[async_trait]
impl TopicLister for MemoryBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let state = lock(&self.state);
        if state.closed {
            return Err(BrokerError::ClientClosed);
        }
        Ok(state.topics.keys().cloned().collect())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn join_and_claim(&self, topics: &[String]) -> Result<Generation, BrokerError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BrokerError::ClientClosed);
        }
        state.join_calls += 1;
        if state.join_failures > 0 {
            state.join_failures -= 1;
            return Err(BrokerError::Join {
                reason: "coordinator not available".to_string(),
            });
        }
        if let Some(previous) = state.live.take() {
            previous.end();
        }

        state.generations += 1;
        let ended = CancellationToken::new();
        let mut sources = HashMap::new();
        let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::new();
        for topic in topics {
            let Some(logs) = state.topics.get(topic) else {
                continue;
            };
            for (index, log) in logs.iter().enumerate() {
                let partition = index as i32;
                let start = state
                    .committed
                    .get(&(topic.clone(), partition))
                    .map_or(0, |offset| offset + 1);
                let (tx, rx) = mpsc::unbounded_channel();
                for message in log.iter().filter(|m| m.offset >= start) {
                    let _ = tx.send(message.clone());
                }
                sources.insert((topic.clone(), partition), tx);
                claims.push(Box::new(MemoryClaim {
                    topic: topic.clone(),
                    partition,
                    source: rx,
                    ended: ended.clone(),
                }));
            }
        }

        let generation = Generation::new(state.generations, claims, ended.clone());
        state.live = Some(LiveGeneration { ended, sources });
        Ok(generation)
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BrokerError::ClientClosed);
        }
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(BrokerError::Commit {
                topic: topic.to_string(),
                partition,
                offset,
                reason: "request timed out".to_string(),
            });
        }
        state.committed.insert((topic.to_string(), partition), offset);
        state.commits.push(CommitRecord {
            topic: topic.to_string(),
            partition,
            offset,
            mode,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let live = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.live.take()
        };
        if let Some(live) = live {
            live.end();
        }
        Ok(())
    }
}

struct MemoryClaim {
    topic: String,
    partition: i32,
    source: mpsc::UnboundedReceiver<Message>,
    ended: CancellationToken,
}

#[async_trait]
impl PartitionClaim for MemoryClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn next_message(&mut self) -> Option<Message> {
        self.source.recv().await
    }

    fn try_next_message(&mut self) -> Option<Message> {
        self.source.try_recv().ok()
    }

    fn is_revoked(&self) -> bool {
        self.ended.is_cancelled()
    }
}
