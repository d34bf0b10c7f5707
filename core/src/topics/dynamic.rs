use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::errors::ConsumerError;
use crate::topics::{ChangeHandler, TopicChange, TopicSet};

/// Pushes topic lists to a running [`TopicListener`].
#[derive(Debug, Clone)]
pub struct TopicUpdater {
    tx: mpsc::Sender<Vec<String>>,
}

impl TopicUpdater {
    /// Hands a new topic list to the listener, waiting while the previous one
    /// has not been taken yet.
    pub async fn update<I>(&self, topics: I) -> Result<(), ConsumerError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        self.tx
            .send(topics)
            .await
            .map_err(|_| ConsumerError::Closed)
    }
}

/// Receives pushed topic lists and applies them to the shared [`TopicSet`].
pub struct TopicListener {
    rx: Mutex<mpsc::Receiver<Vec<String>>>,
    topics: Arc<TopicSet>,
}

pub fn dynamic_topics(topics: Arc<TopicSet>) -> (TopicUpdater, TopicListener) {
    let (tx, rx) = mpsc::channel(1);
    (
        TopicUpdater { tx },
        TopicListener {
            rx: Mutex::new(rx),
            topics,
        },
    )
}

impl TopicListener {
    pub fn topics(&self) -> &Arc<TopicSet> {
        &self.topics
    }

    /// Stores `topics`. Only changes to a non-empty set reach `on_change`.
    pub fn apply(&self, topics: Vec<String>, on_change: &ChangeHandler) -> Option<TopicChange> {
        let change = self.topics.replace(topics)?;
        if change.is_initial() {
            info!(current = ?change.current, "pushed topic set populated");
            return Some(change);
        }
        info!(
            current = ?change.current,
            added = ?change.added,
            removed = ?change.removed,
            "pushed topic set changed"
        );
        on_change(&change);
        Some(change)
    }

    /// Applies updates until `cancel` fires or every updater is dropped.
    pub async fn run(&self, cancel: CancellationToken, on_change: ChangeHandler) {
        let mut rx = self.rx.lock().await;
        loop {
            let topics = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                topics = rx.recv() => topics,
            };
            match topics {
                Some(topics) => {
                    self.apply(topics, &on_change);
                }
                None => {
                    debug!("all topic updaters dropped");
                    break;
                }
            }
        }
        debug!("topic listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pushed_topics_trigger_change_once() {
        let topics = Arc::new(TopicSet::new());
        let (updater, listener) = dynamic_topics(topics.clone());
        let changes = Arc::new(StdMutex::new(Vec::new()));

        let cancel = CancellationToken::new();
        let task = {
            let changes = changes.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                listener
                    .run(
                        cancel,
                        Box::new(move |change| changes.lock().unwrap().push(change.clone())),
                    )
                    .await
            })
        };

        updater.update(["orders"]).await.unwrap();
        updater.update(["orders"]).await.unwrap();
        updater.update(["orders", "payments"]).await.unwrap();
        drop(updater);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        cancel.cancel();

        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].added, vec!["payments".to_string()]);
        assert_eq!(topics.snapshot(), vec!["orders", "payments"]);
    }

    #[tokio::test]
    async fn test_update_fails_after_listener_is_gone() {
        let (updater, listener) = dynamic_topics(Arc::new(TopicSet::new()));
        drop(listener);
        let result = updater.update(["orders"]).await;
        assert!(matches!(result, Err(ConsumerError::Closed)));
    }

    #[tokio::test]
    async fn test_listener_stops_on_cancel() {
        let (_updater, listener) = dynamic_topics(Arc::new(TopicSet::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        listener.run(cancel, Box::new(|_| {})).await;
    }
}
