use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::broker::{BrokerClient, CommitMode, PartitionClaim};
use crate::collector::BatchCollector;
use crate::context::ConsumeContext;
use crate::errors::{ConsumerError, HandlerError};
use crate::handler::MessageHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    WaitingFirstMessage,
    Collecting,
    Dispatching,
    Committing,
    Terminated,
}

/// Last processed offset of a partition and whether the broker has it yet.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitCursor {
    committed: Option<i64>,
    pending: Option<i64>,
}

impl CommitCursor {
    pub fn advance(&mut self, offset: i64) {
        debug_assert!(self.last().is_none_or(|last| offset > last));
        self.pending = Some(offset);
    }

    pub fn pending(&self) -> Option<i64> {
        self.pending
    }

    pub fn committed(&self) -> Option<i64> {
        self.committed
    }

    /// Highest offset handed to the cursor, committed or not.
    pub fn last(&self) -> Option<i64> {
        self.pending.or(self.committed)
    }

    fn mark_committed(&mut self, offset: i64) {
        self.committed = Some(offset);
        if self.pending == Some(offset) {
            self.pending = None;
        }
    }
}

/// Drives a single claimed partition: collect, dispatch, commit, repeat.
pub struct PartitionConsumer {
    claim: Box<dyn PartitionClaim>,
    broker: Arc<dyn BrokerClient>,
    handler: Arc<dyn MessageHandler>,
    collector: BatchCollector,
    cursor: CommitCursor,
    state: ClaimState,
}

impl PartitionConsumer {
    pub fn new(
        claim: Box<dyn PartitionClaim>,
        broker: Arc<dyn BrokerClient>,
        handler: Arc<dyn MessageHandler>,
        collector: BatchCollector,
    ) -> Self {
        Self {
            claim,
            broker,
            handler,
            collector,
            cursor: CommitCursor::default(),
            state: ClaimState::WaitingFirstMessage,
        }
    }

    pub fn state(&self) -> ClaimState {
        self.state
    }

    pub fn cursor(&self) -> CommitCursor {
        self.cursor
    }

    fn transition(&mut self, next: ClaimState) {
        trace!(
            topic = %self.claim.topic(),
            partition = self.claim.partition(),
            from = ?self.state,
            to = ?next,
            "claim state"
        );
        self.state = next;
    }

    /// Runs until the context is cancelled, the generation ends, or an
    /// unrecoverable error occurs. Cancellation returns `Ok`.
    pub async fn run(mut self, ctx: ConsumeContext) -> Result<(), ConsumerError> {
        let topic = self.claim.topic().to_string();
        let partition = self.claim.partition();
        debug!(%topic, partition, "partition consumer started");

        let result = self.consume(&ctx).await;
        self.transition(ClaimState::Terminated);

        match result {
            Ok(()) | Err(ConsumerError::Cancelled) => {
                self.flush().await;
                debug!(%topic, partition, committed = ?self.cursor.committed(), "partition consumer stopped");
                Ok(())
            }
            Err(e) => {
                error!(%topic, partition, error = %e, "partition consumer failed");
                Err(e)
            }
        }
    }

    async fn consume(&mut self, ctx: &ConsumeContext) -> Result<(), ConsumerError> {
        loop {
            self.transition(ClaimState::WaitingFirstMessage);
            let batch = self.collector.collect(ctx, self.claim.as_mut()).await?;
            self.transition(ClaimState::Collecting);
            trace!(
                topic = %batch.topic(),
                partition = batch.partition(),
                size = batch.len(),
                "batch collected"
            );

            self.transition(ClaimState::Dispatching);
            match self.handler.handle(ctx, &batch).await {
                Ok(()) => {}
                Err(HandlerError::Cancelled) => return Err(ConsumerError::Cancelled),
                Err(HandlerError::Failed(source)) => {
                    return Err(ConsumerError::Handler {
                        topic: batch.topic().to_string(),
                        partition: batch.partition(),
                        source,
                    });
                }
            }

            self.transition(ClaimState::Committing);
            self.cursor.advance(batch.last_offset());
            self.commit(CommitMode::Async).await?;
        }
    }

    /// Commits the pending offset. A retryable failure keeps the offset
    /// pending for the next batch or the final flush.
    async fn commit(&mut self, mode: CommitMode) -> Result<(), ConsumerError> {
        let Some(offset) = self.cursor.pending() else {
            return Ok(());
        };
        match self
            .broker
            .commit(self.claim.topic(), self.claim.partition(), offset, mode)
            .await
        {
            Ok(()) => {
                self.cursor.mark_committed(offset);
                Ok(())
            }
            Err(e) if e.is_client_closed() => Err(ConsumerError::Cancelled),
            Err(e) => {
                warn!(
                    topic = %self.claim.topic(),
                    partition = self.claim.partition(),
                    offset,
                    error = %e,
                    "commit failed, keeping offset pending"
                );
                Ok(())
            }
        }
    }

    async fn flush(&mut self) {
        if self.cursor.pending().is_some() {
            // errors are already logged by commit
            let _ = self.commit(CommitMode::Sync).await;
        }
    }
}
