//! Consumer groups whose topic set is resolved at run time.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::broker::{BrokerClient, KafkaBroker};
use crate::config::{ConsumerConfig, ConsumerOptions};
use crate::errors::Result;
use crate::group::{ConsumerGroup, GroupState, TopicSource};
use crate::handler::MessageHandler;
use crate::topics::{
    ChangeHandler, RegexTopicWatcher, TopicListener, TopicSet, TopicUpdater, dynamic_topics,
};

/// Change handler that ends the group's generation so it rejoins with the new set.
fn rejoin_on_change(group: &ConsumerGroup) -> ChangeHandler {
    let group = group.clone();
    Box::new(move |change| {
        info!(
            group = %group.group_id(),
            added = change.added.len(),
            removed = change.removed.len(),
            "topic set changed, rejoining"
        );
        group.rejoin();
    })
}

/// Runs `group` over `topics` while `resolver` keeps the set current. The
/// resolver stops when consumption ends, whether by close or by failure.
async fn consume_with_resolver<F, Fut>(
    group: &ConsumerGroup,
    topics: Arc<TopicSet>,
    resolver: F,
) -> Result<()>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    // a second consume must fail before its resolver can touch the live group
    let running = group.begin()?;
    let stop = group.cancellation_token().child_token();
    let resolver = tokio::spawn(resolver(stop.clone()));

    let result = group.run_guarded(&running, TopicSource::Shared(topics)).await;

    stop.cancel();
    // a panicking resolver must not mask the consume result
    let _ = resolver.await;
    result
}

/// Consumer group subscribed to every topic matching one of a set of regular
/// expressions. The matched set is refreshed from broker metadata.
pub struct ConsumerWatcher {
    group: ConsumerGroup,
    watcher: Arc<RegexTopicWatcher>,
}

impl ConsumerWatcher {
    pub fn new(
        parent: &CancellationToken,
        group_id: &str,
        config: &ConsumerConfig,
        handler: impl MessageHandler + 'static,
        regex_topics: &[String],
        options: ConsumerOptions,
    ) -> Result<Self> {
        config.validate()?;
        let broker = Arc::new(KafkaBroker::new(group_id, config)?);
        Self::with_broker(
            parent,
            group_id,
            broker,
            handler,
            regex_topics,
            config.topic_watch_interval(),
            options,
        )
    }

    pub fn with_broker<B>(
        parent: &CancellationToken,
        group_id: &str,
        broker: Arc<B>,
        handler: impl MessageHandler + 'static,
        regex_topics: &[String],
        interval: std::time::Duration,
        options: ConsumerOptions,
    ) -> Result<Self>
    where
        B: BrokerClient + 'static,
    {
        let group = ConsumerGroup::with_broker(parent, group_id, broker.clone(), handler, options);
        let watcher = RegexTopicWatcher::new(
            broker as Arc<dyn crate::broker::TopicLister>,
            regex_topics,
            Arc::new(TopicSet::new()),
            interval,
            rejoin_on_change(&group),
        )?;
        Ok(Self {
            group,
            watcher: Arc::new(watcher),
        })
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    pub fn topics(&self) -> Vec<String> {
        self.watcher.topics().snapshot()
    }

    pub fn state(&self) -> GroupState {
        self.group.state()
    }

    /// Blocks until closed or until a partition fails.
    pub async fn consume(&self) -> Result<()> {
        let watcher = self.watcher.clone();
        consume_with_resolver(&self.group, watcher.topics().clone(), move |cancel| async move {
            watcher.run(cancel).await
        })
        .await
    }

    pub async fn close(&self) -> Result<()> {
        self.group.close().await
    }
}

/// Consumer group whose topic list is pushed through a [`TopicUpdater`].
pub struct ConsumerDynamic {
    group: ConsumerGroup,
    updater: TopicUpdater,
    listener: Arc<TopicListener>,
}

impl ConsumerDynamic {
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
        let group = ConsumerGroup::with_broker(parent, group_id, broker, handler, options);
        let (updater, listener) = dynamic_topics(Arc::new(TopicSet::new()));
        Self {
            group,
            updater,
            listener: Arc::new(listener),
        }
    }

    /// Handle for pushing topic lists; usable from any task.
    pub fn updater(&self) -> TopicUpdater {
        self.updater.clone()
    }

    pub fn group(&self) -> &ConsumerGroup {
        &self.group
    }

    pub fn topics(&self) -> Vec<String> {
        self.listener.topics().snapshot()
    }

    pub fn state(&self) -> GroupState {
        self.group.state()
    }

    /// Blocks until closed or until a partition fails. Nothing is joined
    /// before the first non-empty topic list arrives.
    pub async fn consume(&self) -> Result<()> {
        let listener = self.listener.clone();
        let on_change = rejoin_on_change(&self.group);
        consume_with_resolver(&self.group, listener.topics().clone(), move |cancel| async move {
            listener.run(cancel, on_change).await
        })
        .await
    }

    pub async fn close(&self) -> Result<()> {
        self.group.close().await
    }
}
