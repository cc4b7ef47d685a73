//! Owner-loss monitoring, a bounded per-caller façade over peer tracking.
//!
//! A caller keeps one [`MonitorList`] and adds `(service, callback)` pairs to
//! it; each pair maps to a quit subscription on the service's peer tracker,
//! so the callback fires once when the service drops off the bus.

use std::sync::Arc;

use tracing::warn;

use crate::peer::{Peers, QuitHandler};

struct MonitorEntry {
    service: String,
    handler: QuitHandler,
    cookie: u64,
}

/// One caller's set of owner monitors.
#[derive(Default)]
pub struct MonitorList {
    entries: Vec<MonitorEntry>,
}

impl MonitorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Monitor `service` for owner loss. Returns the list length after the add,
/// or `None` when the list is full. Adding a pair that is already present
/// changes nothing and reports the current length.
pub fn add(
    peers: &Arc<Peers>,
    list: &mut MonitorList,
    service: &str,
    handler: QuitHandler,
    max: usize,
) -> Option<usize> {
    let present = list
        .entries
        .iter()
        .any(|e| e.service == service && Arc::ptr_eq(&e.handler, &handler));
    if present {
        return Some(list.len());
    }
    if list.len() >= max {
        warn!("monitor list full ({max}), not monitoring {service}");
        return None;
    }
    let cookie = peers.subscribe_quit(service, handler.clone());
    list.entries.push(MonitorEntry {
        service: service.to_string(),
        handler,
        cookie,
    });
    Some(list.len())
}

/// Stop monitoring `service`. Returns the list length after the removal, or
/// `None` when the service was not monitored.
pub fn remove(peers: &Arc<Peers>, list: &mut MonitorList, service: &str) -> Option<usize> {
    let before = list.len();
    list.entries.retain(|entry| {
        if entry.service == service {
            peers.unsubscribe_quit(&entry.service, entry.cookie);
            false
        } else {
            true
        }
    });
    if list.len() == before {
        None
    } else {
        Some(list.len())
    }
}

/// Drop every monitor in the list.
pub fn remove_all(peers: &Arc<Peers>, list: &mut MonitorList) {
    for entry in list.entries.drain(..) {
        peers.unsubscribe_quit(&entry.service, entry.cookie);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use crate::peer::{OwnerChange, PrivilegedIds};

    use super::*;

    fn peers() -> Arc<Peers> {
        Peers::new(
            PrivilegedIds::default(),
            Duration::from_millis(40),
            PathBuf::from("/nonexistent/proxy"),
        )
    }

    fn counting_handler(count: Arc<AtomicUsize>) -> QuitHandler {
        Arc::new(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn add_is_idempotent_and_bounded() {
        let peers = peers();
        let mut list = MonitorList::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(count.clone());

        assert_eq!(
            add(&peers, &mut list, "org.ex.A", handler.clone(), 2),
            Some(1)
        );
        // Same pair again: same count, no second subscription.
        assert_eq!(
            add(&peers, &mut list, "org.ex.A", handler.clone(), 2),
            Some(1)
        );
        assert_eq!(peers.snapshot("org.ex.A").unwrap().quit_subscribers, 1);

        let other = counting_handler(Arc::new(AtomicUsize::new(0)));
        assert_eq!(add(&peers, &mut list, "org.ex.B", other.clone(), 2), Some(2));
        // Full.
        assert_eq!(add(&peers, &mut list, "org.ex.C", other, 2), None);
        assert!(!peers.is_tracked("org.ex.C"));
    }

    #[tokio::test]
    async fn remove_twice_reports_missing() {
        let peers = peers();
        let mut list = MonitorList::new();
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));
        add(&peers, &mut list, "org.ex.A", handler, 4);

        assert_eq!(remove(&peers, &mut list, "org.ex.A"), Some(0));
        assert_eq!(remove(&peers, &mut list, "org.ex.A"), None);
        assert_eq!(peers.snapshot("org.ex.A").unwrap().quit_subscribers, 0);
    }

    #[tokio::test]
    async fn monitored_service_loss_fires_once() {
        let peers = peers();
        let mut list = MonitorList::new();
        let count = Arc::new(AtomicUsize::new(0));
        add(&peers, &mut list, "org.ex.A", counting_handler(count.clone()), 4);

        // Resolve, then lose the owner.
        let seq = peers.snapshot("org.ex.A").unwrap().pending_owner.unwrap();
        peers.on_owner_reply("org.ex.A", seq, body_reply(&(":1.5",)));
        let seq = peers.snapshot("org.ex.A").unwrap().pending_pid.unwrap();
        peers.on_pid_reply("org.ex.A", seq, body_reply(&(std::process::id(),)));
        peers.handle_owner_change(&OwnerChange {
            name: "org.ex.A".into(),
            old: Some(":1.5".into()),
            new: None,
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The subscription drained with the firing; removal reports that.
        assert_eq!(remove(&peers, &mut list, "org.ex.A"), Some(0));
    }

    #[tokio::test]
    async fn remove_all_detaches_everything() {
        let peers = peers();
        let mut list = MonitorList::new();
        let handler = counting_handler(Arc::new(AtomicUsize::new(0)));
        add(&peers, &mut list, "org.ex.A", handler.clone(), 4);
        add(&peers, &mut list, "org.ex.B", handler, 4);

        remove_all(&peers, &mut list);
        assert!(list.is_empty());
        assert_eq!(peers.snapshot("org.ex.A").unwrap().quit_subscribers, 0);
        assert_eq!(peers.snapshot("org.ex.B").unwrap().quit_subscribers, 0);
    }

    fn body_reply<B>(body: &B) -> crate::bus::send::ReplyOutcome
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        let msg = zbus::message::Message::method_call("/", "Reply")
            .unwrap()
            .build(body)
            .unwrap();
        crate::bus::send::ReplyOutcome::reply(msg)
    }
}
