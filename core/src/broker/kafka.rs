use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::StreamExt;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message as _};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, CommitMode, Generation, PartitionClaim, TopicLister};
use crate::config::ConsumerConfig;
use crate::errors::BrokerError;
use crate::lock;
use crate::message::{Header, Message};

/// Messages buffered per claimed partition before the dispatcher waits.
const PARTITION_BUFFER: usize = 256;
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

type PartitionKey = (String, i32);

/// Group member backed by an rdkafka [`StreamConsumer`].
///
/// One dispatcher task polls the consumer and routes each message to the
/// channel of its partition claim. Rebalance callbacks run inside that poll,
/// so a generation is always ended before messages of the next assignment are
/// routed.
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer<GroupContext>>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<GroupEvent>,
    subscribed: Mutex<Option<BTreeSet<String>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    claim_timeout: Duration,
    closed: AtomicBool,
}

#[derive(Debug)]
enum GroupEvent {
    /// The broker assigned partitions; build a generation from the full assignment.
    Assigned,
    /// Same subscription, fresh claims over the current assignment.
    Reclaim,
}

struct Route {
    sender: mpsc::Sender<Message>,
    /// Messages below this offset were fetched before the seek and are dropped.
    rewind_to: Option<i64>,
}

impl Route {
    /// Whether `offset` belongs to the current generation's stream.
    fn admits(&mut self, offset: i64) -> bool {
        match self.rewind_to {
            Some(expected) if offset < expected => false,
            Some(_) => {
                // control markers and compaction can leave `expected` itself unfetchable
                self.rewind_to = None;
                true
            }
            None => true,
        }
    }
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<PartitionKey, Route>>,
    /// First offset not yet processed, per partition that delivered anything.
    resume: Mutex<HashMap<PartitionKey, i64>>,
    /// Partitions of the current assignment, claimed or not.
    assigned: Mutex<HashSet<PartitionKey>>,
    live: Mutex<Option<CancellationToken>>,
    /// Outcome of the last assignment, waiting for `join_and_claim` to take it.
    pending: Mutex<Option<Result<Generation, BrokerError>>>,
    ready: Notify,
    generations: AtomicI32,
}

impl Shared {
    fn has_live(&self) -> bool {
        lock(&self.live).is_some()
    }

    /// Cancels the live generation and discards one not yet handed out.
    fn end_generation(&self) {
        if let Some(ended) = lock(&self.live).take() {
            ended.cancel();
        }
        lock(&self.pending).take();
    }

    fn revoke(&self, partitions: &[PartitionKey]) {
        self.end_generation();
        let mut routes = lock(&self.routes);
        let mut resume = lock(&self.resume);
        let mut assigned = lock(&self.assigned);
        for key in partitions {
            routes.remove(key);
            resume.remove(key);
            assigned.remove(key);
        }
    }

    fn record_commit(&self, topic: &str, partition: i32, next_offset: i64) {
        lock(&self.resume).insert((topic.to_string(), partition), next_offset);
    }

    fn owns(&self, topic: &str, partition: i32) -> bool {
        lock(&self.routes).contains_key(&(topic.to_string(), partition))
    }
}

pub struct GroupContext {
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<GroupEvent>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked = partition_keys(partitions);
                info!(partitions = revoked.len(), "partitions revoked");
                self.shared.revoke(&revoked);
            }
            Rebalance::Assign(partitions) => {
                debug!(partitions = partitions.count(), "assigning partitions");
            }
            Rebalance::Error(e) => error!(error = %e, "rebalance error"),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                // empty incremental assignments leave the current claims valid
                if partitions.count() == 0 && self.shared.has_live() {
                    debug!("skipping empty assignment");
                    return;
                }
                info!(partitions = partitions.count(), "partitions assigned");
                self.shared.end_generation();
                if self.events.send(GroupEvent::Assigned).is_err() {
                    warn!("dispatcher stopped, assignment not claimed");
                }
            }
            Rebalance::Revoke(_) => debug!("revocation complete"),
            Rebalance::Error(e) => error!(error = %e, "rebalance error"),
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "offsets committed"),
            Err(e) => warn!(error = %e, "failed to commit offsets"),
        }
    }
}

fn partition_keys(partitions: &TopicPartitionList) -> Vec<PartitionKey> {
    partitions
        .elements()
        .iter()
        .map(|e| (e.topic().to_string(), e.partition()))
        .collect()
}

fn client_config(group_id: &str, config: &ConsumerConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", config.bootstrap_servers())
        .set("group.id", group_id)
        .set("enable.partition.eof", "false")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", config.initial_offset.as_offset_reset())
        .set(
            "partition.assignment.strategy",
            config.rebalance_strategy.as_assignment_strategy(),
        )
        .set(
            "topic.metadata.refresh.interval.ms",
            config.metadata_refresh_interval_ms.to_string(),
        );

    if let Some(timeout) = config.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }

    if let Some(heartbeat) = config.heartbeat_interval_ms {
        client_config.set("heartbeat.interval.ms", heartbeat.to_string());
    }

    if let Some(security_protocol) = &config.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &config.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &config.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &config.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

impl KafkaBroker {
    /// Creates the consumer and starts its dispatcher. Must be called from
    /// within a tokio runtime.
    pub fn new(group_id: &str, config: &ConsumerConfig) -> Result<Self, BrokerError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            BrokerError::ClientCreation {
                reason: e.to_string(),
            }
        })?;

        let shared = Arc::new(Shared::default());
        let (events, events_rx) = mpsc::unbounded_channel();
        let context = GroupContext {
            shared: shared.clone(),
            events: events.clone(),
        };
        let consumer: StreamConsumer<GroupContext> = client_config(group_id, config)
            .create_with_context(context)
            .map_err(|e| BrokerError::ClientCreation {
                reason: e.to_string(),
            })?;
        let consumer = Arc::new(consumer);

        let shutdown = CancellationToken::new();
        let dispatcher = runtime.spawn(dispatch(
            consumer.clone(),
            shared.clone(),
            events_rx,
            shutdown.clone(),
        ));
        info!(group = group_id, brokers = %config.bootstrap_servers(), "kafka consumer created");

        Ok(Self {
            consumer,
            shared,
            events,
            subscribed: Mutex::new(None),
            dispatcher: Mutex::new(Some(dispatcher)),
            shutdown,
            claim_timeout: config.claim_timeout(),
            closed: AtomicBool::new(false),
        })
    }

    fn subscribe(&self, topics: &BTreeSet<String>) -> Result<(), BrokerError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| BrokerError::Subscription {
                topics: topics.iter().cloned().collect(),
                reason: e.to_string(),
            })?;
        info!(?names, "subscribed to topics");
        Ok(())
    }

    async fn wait_for_generation(&self) -> Result<Generation, BrokerError> {
        let deadline = tokio::time::Instant::now() + self.claim_timeout;
        loop {
            let ready = self.shared.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if let Some(outcome) = lock(&self.shared.pending).take() {
                return outcome;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(BrokerError::ClientClosed),
                _ = &mut ready => {}
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(BrokerError::Join {
                        reason: format!(
                            "no partitions claimed within {}ms",
                            self.claim_timeout.as_millis()
                        ),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl TopicLister for KafkaBroker {
    async fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ClientClosed);
        }
        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, rdkafka::error::KafkaError> {
            let metadata = consumer.fetch_metadata(None, METADATA_TIMEOUT)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|t| t.name())
                .filter(|name| !name.starts_with("__"))
                .map(str::to_string)
                .collect())
        })
        .await
        .map_err(|e| BrokerError::Metadata {
            reason: e.to_string(),
        })?
        .map_err(|e| BrokerError::Metadata {
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn join_and_claim(&self, topics: &[String]) -> Result<Generation, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ClientClosed);
        }

        let topics: BTreeSet<String> = topics.iter().cloned().collect();
        let resubscribe = lock(&self.subscribed).as_ref() != Some(&topics);
        if resubscribe {
            self.shared.end_generation();
            self.subscribe(&topics)?;
            *lock(&self.subscribed) = Some(topics);
        } else if self.events.send(GroupEvent::Reclaim).is_err() {
            return Err(BrokerError::ClientClosed);
        }

        self.wait_for_generation().await
    }

    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ClientClosed);
        }
        let commit_error = |reason: String| BrokerError::Commit {
            topic: topic.to_string(),
            partition,
            offset,
            reason,
        };
        if !self.shared.owns(topic, partition) {
            return Err(commit_error("partition is not assigned to this member".to_string()));
        }

        // kafka stores the offset of the next message to read
        let next_offset = offset + 1;
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(|e| commit_error(e.to_string()))?;

        match mode {
            CommitMode::Async => self
                .consumer
                .commit(&tpl, rdkafka::consumer::CommitMode::Async)
                .map_err(|e| commit_error(e.to_string()))?,
            CommitMode::Sync => {
                let consumer = self.consumer.clone();
                tokio::task::spawn_blocking(move || {
                    consumer.commit(&tpl, rdkafka::consumer::CommitMode::Sync)
                })
                .await
                .map_err(|e| commit_error(e.to_string()))?
                .map_err(|e| commit_error(e.to_string()))?
            }
        }

        self.shared.record_commit(topic, partition, next_offset);
        debug!(topic, partition, offset = next_offset, ?mode, "committed offset");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.end_generation();
        self.shutdown.cancel();

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "dispatcher task failed");
            }
        }
        lock(&self.shared.routes).clear();
        self.consumer.unsubscribe();
        info!("kafka consumer closed");
        Ok(())
    }
}

impl Drop for KafkaBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch(
    consumer: Arc<StreamConsumer<GroupContext>>,
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<GroupEvent>,
    shutdown: CancellationToken,
) {
    let mut stream = consumer.stream();
    loop {
        // assignment changes queued by the last poll apply before its message is routed
        while let Ok(event) = events.try_recv() {
            handle_event(&consumer, &shared, event);
        }

        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => {
                if let Some(event) = event {
                    handle_event(&consumer, &shared, event);
                }
                continue;
            }
            next = stream.next() => match next {
                Some(Ok(borrowed)) => convert_message(&borrowed),
                Some(Err(e)) => {
                    warn!(error = %e, "error receiving message");
                    continue;
                }
                None => break,
            },
        };

        while let Ok(event) = events.try_recv() {
            handle_event(&consumer, &shared, event);
        }
        route(&shared, message, &shutdown).await;
    }
    debug!("dispatcher stopped");
}

fn handle_event(consumer: &StreamConsumer<GroupContext>, shared: &Shared, event: GroupEvent) {
    if matches!(event, GroupEvent::Reclaim) && lock(&shared.pending).is_some() {
        return;
    }
    match consumer.assignment() {
        Ok(assignment) => open_generation(shared, partition_keys(&assignment), |topic, partition, offset| {
            consumer.seek(topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
        }),
        Err(e) => warn!(error = %e, ?event, "failed to read assignment"),
    }
}

/// Builds the generation for `partitions`, rewinding each one that already
/// delivered messages. If a rewind fails no claim is handed out and the
/// waiting join fails with a retryable error; the next join rewinds again.
fn open_generation<S>(shared: &Shared, partitions: Vec<PartitionKey>, mut seek: S)
where
    S: FnMut(&str, i32, i64) -> rdkafka::error::KafkaResult<()>,
{
    let resume = lock(&shared.resume).clone();
    let ended = CancellationToken::new();
    let mut routes = HashMap::with_capacity(partitions.len());
    let mut claims: Vec<Box<dyn PartitionClaim>> = Vec::with_capacity(partitions.len());

    if let Some(previous) = lock(&shared.live).take() {
        previous.cancel();
    }
    lock(&shared.routes).clear();
    *lock(&shared.assigned) = partitions.iter().cloned().collect();

    for key in partitions {
        // messages routed to the previous generation but never processed are fetched again
        let rewind_to = resume.get(&key).copied();
        if let Some(offset) = rewind_to {
            if let Err(e) = seek(&key.0, key.1, offset) {
                warn!(topic = %key.0, partition = key.1, offset, error = %e, "failed to rewind partition");
                *lock(&shared.pending) = Some(Err(BrokerError::Join {
                    reason: format!("failed to rewind {}/{} to offset {offset}: {e}", key.0, key.1),
                }));
                shared.ready.notify_waiters();
                return;
            }
        }
        let (sender, source) = mpsc::channel(PARTITION_BUFFER);
        claims.push(Box::new(KafkaClaim {
            topic: key.0.clone(),
            partition: key.1,
            source,
            ended: ended.clone(),
        }));
        routes.insert(key, Route { sender, rewind_to });
    }

    *lock(&shared.live) = Some(ended.clone());
    *lock(&shared.routes) = routes;

    let id = shared.generations.fetch_add(1, Ordering::SeqCst) + 1;
    info!(generation = id, claims = claims.len(), "generation ready");
    *lock(&shared.pending) = Some(Ok(Generation::new(id, claims, ended)));
    shared.ready.notify_waiters();
}

async fn route(shared: &Shared, message: Message, shutdown: &CancellationToken) {
    let key = (message.topic.clone(), message.partition);
    let sender = {
        let mut routes = lock(&shared.routes);
        let Some(route) = routes.get_mut(&key) else {
            if lock(&shared.assigned).contains(&key) {
                // assigned but unclaimed: the next generation starts from the first dropped offset
                lock(&shared.resume).entry(key.clone()).or_insert(message.offset);
            }
            debug!(topic = %key.0, partition = key.1, offset = message.offset, "no claim for message, dropping");
            return;
        };
        if !route.admits(message.offset) {
            return;
        }
        route.sender.clone()
    };
    lock(&shared.resume).entry(key).or_insert(message.offset);

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {}
        sent = sender.send(message) => {
            if sent.is_err() {
                debug!("claim released before message was delivered");
            }
        }
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> Message {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| Header::new(h.key, h.value.unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();

    Message {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(chrono::DateTime::from_timestamp_millis),
    }
}

struct KafkaClaim {
    topic: String,
    partition: i32,
    source: mpsc::Receiver<Message>,
    ended: CancellationToken,
}

#[async_trait]
impl PartitionClaim for KafkaClaim {
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
