//! # Notification Dispatcher
//!
//! Distributes decoded push notifications to in-process listeners. A single
//! notification is wrapped in an `Arc` once and every matching listener gets a
//! pointer to the same allocation.
//!
//! Listeners register under a topic. Each notification is delivered on up to
//! four topics, from the broadest to the narrowest:
//!
//! | topic                         | receives                                 |
//! |-------------------------------|------------------------------------------|
//! | `notification`                | everything                               |
//! | `notification:<type>`         | every change to one resource type        |
//! | `notification:<type>:<event>` | one action on one resource type          |
//! | `notification:<type>:<id>`    | every change to one record               |
//!
//! Listeners whose receiver was dropped are removed on the next dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::lock_or_recover;
use crate::ingestors::frames::NotificationMessage;

/// Which notifications a listener wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListenerTopic {
    /// Every notification.
    All,
    /// Every notification for one resource type.
    Resource(String),
    /// One event name on one resource type.
    Action(String, String),
    /// Every notification for one record.
    Record(String, String),
}

impl ListenerTopic {
    /// The string form used as the dispatch key.
    pub fn name(&self) -> String {
        match self {
            ListenerTopic::All => "notification".to_string(),
            ListenerTopic::Resource(t) => format!("notification:{}", t),
            ListenerTopic::Action(t, event) => format!("notification:{}:{}", t, event),
            ListenerTopic::Record(t, id) => format!("notification:{}:{}", t, id),
        }
    }
}

/// Receiving half handed to a listener.
pub struct NotificationListener {
    /// Id to pass to [`NotificationDispatcher::remove_listener`].
    pub id: u64,
    /// Topic the listener registered under.
    pub topic: ListenerTopic,
    rx: mpsc::UnboundedReceiver<Arc<NotificationMessage>>,
}

impl NotificationListener {
    /// Waits for the next notification. `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Arc<NotificationMessage>> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<Arc<NotificationMessage>> {
        self.rx.try_recv().ok()
    }
}

struct ListenerHandle {
    id: u64,
    sender: mpsc::UnboundedSender<Arc<NotificationMessage>>,
}

/// Topic-keyed fan-out of notifications.
#[derive(Default)]
pub struct NotificationDispatcher {
    listeners: Mutex<HashMap<String, Vec<ListenerHandle>>>,
    next_id: AtomicU64,
}

impl NotificationDispatcher {
    /// Creates a dispatcher with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener on `topic`.
    pub fn listen(&self, topic: ListenerTopic) -> NotificationListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = topic.name();

        lock_or_recover(&self.listeners)
            .entry(name.clone())
            .or_default()
            .push(ListenerHandle { id, sender: tx });
        log::debug!("[dispatch] listener {} registered on '{}'", id, name);

        NotificationListener { id, topic, rx }
    }

    /// Removes a listener by id. Returns true if it was registered.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = lock_or_recover(&self.listeners);
        let mut found = false;
        listeners.retain(|_, handles| {
            let before = handles.len();
            handles.retain(|h| h.id != id);
            found |= handles.len() != before;
            !handles.is_empty()
        });
        found
    }

    /// Delivers `message` on every topic it matches. Returns how many listeners received it.
    pub fn dispatch(&self, message: NotificationMessage) -> usize {
        let message = Arc::new(message);
        let mut topics = vec![
            ListenerTopic::All.name(),
            ListenerTopic::Resource(message.resource_type.clone()).name(),
            ListenerTopic::Action(message.resource_type.clone(), message.event.clone()).name(),
        ];
        if let Some(id) = &message.resource_id {
            let record = ListenerTopic::Record(message.resource_type.clone(), id.clone()).name();
            // An id equal to the event name would address the same topic twice.
            if !topics.contains(&record) {
                topics.push(record);
            }
        }

        let mut delivered = 0;
        let mut listeners = lock_or_recover(&self.listeners);
        for topic in &topics {
            let Some(handles) = listeners.get_mut(topic) else {
                continue;
            };
            handles.retain(|handle| match handle.sender.send(Arc::clone(&message)) {
                Ok(_) => {
                    delivered += 1;
                    true
                }
                Err(_) => {
                    log::debug!("[dispatch] listener {} gone, removing", handle.id);
                    false
                }
            });
        }
        listeners.retain(|_, handles| !handles.is_empty());
        delivered
    }

    /// Number of live listeners on `topic`.
    pub fn listener_count(&self, topic: &ListenerTopic) -> usize {
        lock_or_recover(&self.listeners)
            .get(&topic.name())
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::frames::Action;
    use serde_json::json;

    fn message(resource_type: &str, id: Option<&str>, event: &str) -> NotificationMessage {
        NotificationMessage {
            resource_type: resource_type.to_string(),
            resource_id: id.map(str::to_string),
            action: Action::from_event(event),
            event: event.to_string(),
            data: json!({"id": id}),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn one_notification_reaches_every_matching_topic() {
        let dispatcher = NotificationDispatcher::new();
        let mut all = dispatcher.listen(ListenerTopic::All);
        let mut by_type = dispatcher.listen(ListenerTopic::Resource("orders".into()));
        let mut by_action =
            dispatcher.listen(ListenerTopic::Action("orders".into(), "updated".into()));
        let mut by_record = dispatcher.listen(ListenerTopic::Record("orders".into(), "7".into()));
        let mut other = dispatcher.listen(ListenerTopic::Resource("users".into()));

        let delivered = dispatcher.dispatch(message("orders", Some("7"), "updated"));
        assert_eq!(delivered, 4);

        let first = all.recv().await.unwrap();
        let second = by_type.recv().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(by_action.recv().await.unwrap().action, Action::Update);
        assert_eq!(
            by_record.recv().await.unwrap().resource_id.as_deref(),
            Some("7")
        );
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_listeners_are_pruned() {
        let dispatcher = NotificationDispatcher::new();
        let keep = dispatcher.listen(ListenerTopic::All);
        drop(dispatcher.listen(ListenerTopic::All));

        assert_eq!(dispatcher.dispatch(message("orders", None, "created")), 1);
        assert_eq!(dispatcher.listener_count(&ListenerTopic::All), 1);

        assert!(dispatcher.remove_listener(keep.id));
        assert!(!dispatcher.remove_listener(keep.id));
        assert_eq!(dispatcher.listener_count(&ListenerTopic::All), 0);
    }
}
