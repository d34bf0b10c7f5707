//! The narrow broker surface the consumer runtime depends on.
//!
//! [`kafka::KafkaBroker`] talks to a real cluster through rdkafka;
//! [`memory::MemoryBroker`] keeps everything in process.

pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

use crate::errors::BrokerError;
use crate::message::Message;

pub use kafka::KafkaBroker;
pub use memory::MemoryBroker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    /// Queue the commit and return without waiting for the broker.
    Async,
    /// Wait for the broker to acknowledge the commit.
    Sync,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TopicLister: Send + Sync {
    /// Names of every non-internal topic currently known to the cluster.
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError>;
}

#[async_trait]
pub trait BrokerClient: TopicLister {
    /// Joins the group for `topics` and waits for the partitions assigned to
    /// this member.
    async fn join_and_claim(&self, topics: &[String]) -> Result<Generation, BrokerError>;

    /// Records `offset` as the last processed message of the partition.
    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), BrokerError>;

    /// Leaves the group and releases the client. Later joins fail with
    /// [`BrokerError::ClientClosed`].
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Message source of one claimed topic-partition for one generation.
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Waits for the next message. `None` means the source is gone, either
    /// because the generation ended or because it closed unexpectedly.
    async fn next_message(&mut self) -> Option<Message>;

    /// Returns a message only if one is already buffered.
    fn try_next_message(&mut self) -> Option<Message>;

    /// True once the generation owning this claim has ended.
    fn is_revoked(&self) -> bool;
}

/// The partitions claimed by one successful join, valid until `ended` fires.
pub struct Generation {
    id: i32,
    claims: Vec<Box<dyn PartitionClaim>>,
    ended: CancellationToken,
}

impl Generation {
    pub fn new(id: i32, claims: Vec<Box<dyn PartitionClaim>>, ended: CancellationToken) -> Self {
        Self { id, claims, ended }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    /// Cancelled by the broker on rebalance or loss of the claim.
    pub fn ended(&self) -> &CancellationToken {
        &self.ended
    }

    pub fn claim_count(&self) -> usize {
        self.claims.len()
    }

    pub fn into_claims(self) -> (Vec<Box<dyn PartitionClaim>>, CancellationToken) {
        (self.claims, self.ended)
    }
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let claims: Vec<String> = self
            .claims
            .iter()
            .map(|c| format!("{}/{}", c.topic(), c.partition()))
            .collect();
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("claims", &claims)
            .field("ended", &self.ended.is_cancelled())
            .finish()
    }
}
