//! Minimal view of the daemon's internal publish-subscribe fabric.
//!
//! The IPC core only ever publishes peer liveness to named topics; the rest
//! of the datapipe lives elsewhere in the daemon.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::broadcast;
use tracing::trace;

const TOPIC_DEPTH: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Stopped,
}

/// Handle on one named topic.
#[derive(Clone)]
pub struct Topic {
    name: Arc<str>,
    tx: broadcast::Sender<Liveness>,
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publish(&self, liveness: Liveness) {
        trace!("topic {}: {:?}", self.name, liveness);
        // No receivers is fine; the datapipe is best-effort.
        let _ = self.tx.send(liveness);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Liveness> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Topic").field(&self.name).finish()
    }
}

/// Hands out topics by name, creating them on first use.
#[derive(Default)]
pub struct Datapipe {
    topics: Mutex<HashMap<String, Topic>>,
}

impl Datapipe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(&self, name: &str) -> Topic {
        let mut topics = self.topics.lock().unwrap();
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(TOPIC_DEPTH);
                Topic {
                    name: name.into(),
                    tx,
                }
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn topics_are_shared_by_name() {
        let pipe = Datapipe::new();
        let a = pipe.topic("powerd");
        let mut rx = a.subscribe();
        pipe.topic("powerd").publish(Liveness::Running);
        assert_eq!(rx.recv().await.unwrap(), Liveness::Running);
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let pipe = Datapipe::new();
        pipe.topic("sensord").publish(Liveness::Stopped);
    }
}
