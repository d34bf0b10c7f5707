use crate::broker::PartitionClaim;
use crate::context::ConsumeContext;
use crate::errors::ConsumerError;
use crate::message::Batch;

/// Builds one batch per handler call: waits for the first message, then takes
/// whatever else is already buffered, up to `capacity`.
#[derive(Debug, Clone, Copy)]
pub struct BatchCollector {
    capacity: usize,
}

impl BatchCollector {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn collect(
        &self,
        ctx: &ConsumeContext,
        claim: &mut dyn PartitionClaim,
    ) -> Result<Batch, ConsumerError> {
        let first = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ConsumerError::Cancelled),
            message = claim.next_message() => message,
        };

        let Some(first) = first else {
            if ctx.is_cancelled() || claim.is_revoked() {
                return Err(ConsumerError::Cancelled);
            }
            return Err(ConsumerError::SourceClosed {
                topic: claim.topic().to_string(),
                partition: claim.partition(),
            });
        };

        let mut batch = Batch::with_capacity(first, self.capacity);
        while batch.len() < self.capacity {
            match claim.try_next_message() {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        Ok(batch)
    }
}
