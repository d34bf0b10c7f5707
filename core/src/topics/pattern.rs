use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::TopicLister;
use crate::errors::{BrokerError, ConfigError, METADATA_RETRY_DELAY};
use crate::topics::{TopicChange, TopicSet};

/// Invoked when a non-empty topic set changes.
pub type ChangeHandler = Box<dyn Fn(&TopicChange) + Send + Sync>;

/// Keeps a [`TopicSet`] equal to the cluster topics matching any of a list of
/// patterns, polling broker metadata on a fixed interval.
pub struct RegexTopicWatcher<L: TopicLister + ?Sized = dyn TopicLister> {
    lister: Arc<L>,
    patterns: Vec<Regex>,
    topics: Arc<TopicSet>,
    interval: Duration,
    on_change: ChangeHandler,
}

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

impl<L: TopicLister + ?Sized> RegexTopicWatcher<L> {
    pub fn new(
        lister: Arc<L>,
        patterns: &[String],
        topics: Arc<TopicSet>,
        interval: Duration,
        on_change: ChangeHandler,
    ) -> Result<Self, ConfigError> {
        if patterns.is_empty() {
            return Err(ConfigError::MissingField {
                field: "topic patterns".to_string(),
            });
        }
        Ok(Self {
            lister,
            patterns: compile_patterns(patterns)?,
            topics,
            interval,
            on_change,
        })
    }

    pub fn topics(&self) -> &Arc<TopicSet> {
        &self.topics
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(topic))
    }

    /// Fetches the topic list once and applies it. Returns the change, if any.
    /// The poll that first populates the set is a baseline and does not reach
    /// the change handler.
    pub async fn refresh(&self) -> Result<Option<TopicChange>, BrokerError> {
        let available = self.lister.list_topics().await?;
        let matched = available.into_iter().filter(|t| self.matches(t));

        let change = self.topics.replace(matched);
        match &change {
            Some(change) if change.is_initial() => {
                info!(current = ?change.current, "matched topic set populated");
            }
            Some(change) => {
                info!(
                    current = ?change.current,
                    added = ?change.added,
                    removed = ?change.removed,
                    "matched topic set changed"
                );
                (self.on_change)(change);
            }
            None => debug!("matched topic set unchanged"),
        }
        Ok(change)
    }

    /// Polls until `cancel` fires. The first poll happens immediately; a failed
    /// poll is retried after a short delay instead of waiting a full interval.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            loop {
                match self.refresh().await {
                    Ok(_) => break,
                    Err(e) if e.is_client_closed() => {
                        debug!("topic watcher stopping, client closed");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, retry_in_ms = METADATA_RETRY_DELAY.as_millis() as u64, "failed to list topics");
                    }
                }
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(METADATA_RETRY_DELAY) => {}
                }
            }
        }
        debug!("topic watcher stopped");
    }
}
