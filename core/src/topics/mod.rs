//! The subscribed topic set and the two ways of keeping it current.

pub mod dynamic;
pub mod pattern;

use std::collections::BTreeSet;
use std::sync::Mutex;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::lock;

pub use dynamic::{TopicListener, TopicUpdater, dynamic_topics};
pub use pattern::{ChangeHandler, RegexTopicWatcher};

/// Difference between two successive topic sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicChange {
    pub current: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl TopicChange {
    /// True when the previous set was empty. Nothing is consuming yet, and the
    /// driver waiting in [`TopicSet::wait_non_empty`] picks the set up itself.
    pub fn is_initial(&self) -> bool {
        self.removed.is_empty() && self.added.len() == self.current.len()
    }
}

/// Topic set shared between the resolver that writes it and the group driver
/// that reads it at the start of every generation.
#[derive(Debug, Default)]
pub struct TopicSet {
    topics: Mutex<BTreeSet<String>>,
    changed: Notify,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<String> {
        lock(&self.topics).iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.topics).is_empty()
    }

    /// Stores `topics` and reports what changed. Order and duplicates in the
    /// input are ignored; an identical set returns `None`.
    pub fn replace<I>(&self, topics: I) -> Option<TopicChange>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let next: BTreeSet<String> = topics.into_iter().map(Into::into).collect();
        let change = {
            let mut current = lock(&self.topics);
            if *current == next {
                return None;
            }
            let change = TopicChange {
                current: next.iter().cloned().collect(),
                added: next.difference(&current).cloned().collect(),
                removed: current.difference(&next).cloned().collect(),
            };
            *current = next;
            change
        };
        self.changed.notify_waiters();
        Some(change)
    }

    /// Waits until the set is non-empty. Returns `None` if cancelled first.
    pub async fn wait_non_empty(&self, cancel: &CancellationToken) -> Option<Vec<String>> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // register before reading so a concurrent replace is not missed
            notified.as_mut().enable();

            let topics = self.snapshot();
            if !topics.is_empty() {
                return Some(topics);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }
}
