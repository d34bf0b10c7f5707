use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use crate::broker::{BrokerClient, Generation, KafkaBroker};
use crate::claim::PartitionConsumer;
use crate::collector::BatchCollector;
use crate::config::{ConsumerConfig, ConsumerOptions};
use crate::context::ConsumeContext;
use crate::errors::{ConsumerError, Result};
use crate::handler::MessageHandler;
use crate::lock;
use crate::topics::TopicSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    Idle,
    /// The topic set is empty; nothing is joined until it is not.
    WaitingForTopics,
    Joining,
    Claimed,
    Consuming,
    Rebalancing,
    Closed,
}

/// Where a consume loop reads its topics from at the start of a generation.
pub(crate) enum TopicSource {
    Fixed(Vec<String>),
    Shared(Arc<TopicSet>),
}

/// One member of a consumer group. Cloning yields another handle to the same
/// member.
#[derive(Clone)]
pub struct ConsumerGroup {
    inner: Arc<GroupInner>,
}

struct GroupInner {
    group_id: String,
    broker: Arc<dyn BrokerClient>,
    handler: Arc<dyn MessageHandler>,
    collector: BatchCollector,
    cancel: CancellationToken,
    generation: Mutex<GenerationSlot>,
    state: Mutex<GroupState>,
    running: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

#[derive(Default)]
struct GenerationSlot {
    token: Option<CancellationToken>,
    /// A rejoin was requested while no generation was running.
    stale: bool,
}

impl ConsumerGroup {
    /// Creates a member backed by an rdkafka consumer. Cancelling `parent`
    /// stops consumption the same way [`ConsumerGroup::close`] does, without
    /// releasing the client.
    pub fn new(
        parent: &CancellationToken,
        group_id: &str,
        config: &ConsumerConfig,
        handler: impl MessageHandler + 'static,
        options: ConsumerOptions,
    ) -> Result<Self> {
        config.validate()?;
        let broker = KafkaBroker::new(group_id, config)?;
        Ok(Self::with_broker(
            parent,
            group_id,
            Arc::new(broker),
            handler,
            options,
        ))
    }

    pub fn with_broker(
        parent: &CancellationToken,
        group_id: &str,
        broker: Arc<dyn BrokerClient>,
        handler: impl MessageHandler + 'static,
        options: ConsumerOptions,
    ) -> Self {
        let handler = options.interceptor_chain().compose(Arc::new(handler));
        Self {
            inner: Arc::new(GroupInner {
                group_id: group_id.to_string(),
                broker,
                handler,
                collector: BatchCollector::new(options.batch_capacity()),
                cancel: parent.child_token(),
                generation: Mutex::new(GenerationSlot::default()),
                state: Mutex::new(GroupState::Idle),
                running: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    pub fn state(&self) -> GroupState {
        *lock(&self.inner.state)
    }

    /// Cancelled by [`ConsumerGroup::close`] or by the parent token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Consumes `topics` until closed or until a partition fails. Rebalances
    /// and join failures are handled internally.
    pub async fn consume(&self, topics: &[String]) -> Result<()> {
        let topics: BTreeSet<String> = topics.iter().cloned().collect();
        self.run(TopicSource::Fixed(topics.into_iter().collect()))
            .await
    }

    /// Ends the current generation so the consume loop joins again with the
    /// latest topic set.
    pub fn rejoin(&self) {
        let mut slot = lock(&self.inner.generation);
        match &slot.token {
            Some(token) => {
                debug!(group = %self.inner.group_id, "rejoin requested, ending generation");
                token.cancel();
            }
            None => slot.stale = true,
        }
    }

    /// Stops consumption, waits for partition consumers to exit and releases
    /// the broker client. Calling it again returns `Ok`.
    pub async fn close(&self) -> Result<()> {
        self.inner.cancel.cancel();
        let _running = self.inner.running.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(GroupState::Closed);
        self.inner.broker.close().await?;
        info!(group = %self.inner.group_id, "consumer group closed");
        Ok(())
    }

    fn set_state(&self, next: GroupState) {
        let mut state = lock(&self.inner.state);
        // closed is terminal
        if *state != next && *state != GroupState::Closed {
            debug!(group = %self.inner.group_id, from = ?*state, to = ?next, "group state");
            *state = next;
        }
    }

    /// Marks the group as consuming until the guard is dropped.
    pub(crate) fn begin(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.inner
            .running
            .try_lock()
            .map_err(|_| ConsumerError::AlreadyConsuming)
    }

    pub(crate) async fn run(&self, source: TopicSource) -> Result<()> {
        let running = self.begin()?;
        self.run_guarded(&running, source).await
    }

    /// The rejoin loop. Callers hold the guard returned by [`Self::begin`].
    pub(crate) async fn run_guarded(
        &self,
        _running: &tokio::sync::MutexGuard<'_, ()>,
        source: TopicSource,
    ) -> Result<()> {
        let cancel = &self.inner.cancel;

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            let topics = match &source {
                TopicSource::Fixed(topics) if topics.is_empty() => {
                    self.set_state(GroupState::WaitingForTopics);
                    cancel.cancelled().await;
                    break Ok(());
                }
                TopicSource::Fixed(topics) => topics.clone(),
                TopicSource::Shared(set) => {
                    let topics = set.snapshot();
                    if topics.is_empty() {
                        self.set_state(GroupState::WaitingForTopics);
                        match set.wait_non_empty(cancel).await {
                            Some(topics) => topics,
                            None => break Ok(()),
                        }
                    } else {
                        topics
                    }
                }
            };

            self.set_state(GroupState::Joining);
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                joined = self.inner.broker.join_and_claim(&topics) => joined,
            };
            let generation = match joined {
                Ok(generation) => generation,
                Err(e) if e.is_client_closed() => {
                    info!(group = %self.inner.group_id, "broker client closed, leaving consume loop");
                    break Ok(());
                }
                Err(e) => {
                    warn!(
                        group = %self.inner.group_id,
                        ?topics,
                        error = %e,
                        "failed to join consumer group, retrying"
                    );
                    if !sleep_or_cancel(e.retry_delay(), cancel).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            self.set_state(GroupState::Claimed);
            if let Err(e) = self.consume_generation(generation).await {
                break Err(e);
            }
            if !cancel.is_cancelled() {
                self.set_state(GroupState::Rebalancing);
            }
        };

        self.set_state(GroupState::Idle);
        result
    }

    async fn consume_generation(&self, generation: Generation) -> Result<()> {
        let id = generation.id();
        let (claims, ended) = generation.into_claims();
        let token = self.inner.cancel.child_token();
        {
            let mut slot = lock(&self.inner.generation);
            if std::mem::take(&mut slot.stale) {
                token.cancel();
            }
            slot.token = Some(token.clone());
        }

        info!(group = %self.inner.group_id, generation = id, claims = claims.len(), "generation started");
        let logger = info_span!("generation", group = %self.inner.group_id, generation = id);
        let ctx = ConsumeContext::new(token.clone()).with_logger(logger);

        let mut tasks = JoinSet::new();
        for claim in claims {
            let consumer = PartitionConsumer::new(
                claim,
                self.inner.broker.clone(),
                self.inner.handler.clone(),
                self.inner.collector,
            );
            tasks.spawn(consumer.run(ctx.clone()));
        }
        self.set_state(GroupState::Consuming);

        let mut failure = None;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ended.cancelled() => {
                    debug!(group = %self.inner.group_id, generation = id, "generation ended by broker");
                    break;
                }
                joined = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Some(Ok(Ok(()))) | None => {}
                    Some(Ok(Err(e))) => {
                        failure = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        failure = Some(ConsumerError::Task(e));
                        break;
                    }
                },
            }
        }

        token.cancel();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(e)) if failure.is_none() => failure = Some(e),
                Err(e) if failure.is_none() && !e.is_cancelled() => {
                    failure = Some(ConsumerError::Task(e))
                }
                _ => {}
            }
        }
        lock(&self.inner.generation).token = None;

        match failure {
            Some(e) => {
                error!(group = %self.inner.group_id, generation = id, error = %e, "generation aborted");
                Err(e)
            }
            None => {
                info!(group = %self.inner.group_id, generation = id, "generation finished");
                Ok(())
            }
        }
    }
}

/// Returns false if cancelled before `delay` elapsed.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl std::fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("group_id", &self.inner.group_id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::errors::HandlerError;
    use crate::handler::handler_fn;

    fn noop_handler() -> impl MessageHandler + 'static {
        handler_fn(|_ctx, _batch| async { Ok::<(), HandlerError>(()) })
    }

    #[tokio::test]
    async fn test_second_concurrent_consume_is_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 1);
        let group = ConsumerGroup::with_broker(
            &CancellationToken::new(),
            "billing",
            broker,
            noop_handler(),
            ConsumerOptions::default(),
        );

        let running = {
            let group = group.clone();
            tokio::spawn(async move { group.consume(&["orders".to_string()]).await })
        };
        while group.state() != GroupState::Consuming {
            tokio::task::yield_now().await;
        }

        let second = group.consume(&["orders".to_string()]).await;
        assert!(matches!(second, Err(ConsumerError::AlreadyConsuming)));

        group.close().await.unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(group.state(), GroupState::Closed);
    }

    #[tokio::test]
    async fn test_rejoin_starts_a_new_generation() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 1);
        let group = ConsumerGroup::with_broker(
            &CancellationToken::new(),
            "billing",
            broker.clone(),
            noop_handler(),
            ConsumerOptions::default(),
        );

        let running = {
            let group = group.clone();
            tokio::spawn(async move { group.consume(&["orders".to_string()]).await })
        };
        while broker.join_calls() < 1 || group.state() != GroupState::Consuming {
            tokio::task::yield_now().await;
        }
        group.rejoin();
        while broker.join_calls() < 2 {
            tokio::task::yield_now().await;
        }

        group.close().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_consume() {
        let broker = Arc::new(MemoryBroker::new());
        broker.create_topic("orders", 1);
        let parent = CancellationToken::new();
        let group = ConsumerGroup::with_broker(
            &parent,
            "billing",
            broker.clone(),
            noop_handler(),
            ConsumerOptions::default(),
        );

        let running = {
            let group = group.clone();
            tokio::spawn(async move { group.consume(&["orders".to_string()]).await })
        };
        parent.cancel();
        running.await.unwrap().unwrap();
        assert!(!broker.is_closed());

        group.close().await.unwrap();
        assert!(broker.is_closed());
    }
}
