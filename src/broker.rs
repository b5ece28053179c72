//! Pub/sub fan-out of session notifications
//!
//! An in-memory multimap from session id to the set of connections that
//! currently want that session's updates. Subscription is implicit (create,
//! `session/get`, or `session/prompt` subscribes the issuing connection) and
//! ends when the connection closes or the session is archived.
//!
//! Publishing is best-effort: the frame is serialized once and sent to each
//! subscriber; a dead subscriber is dropped from the set, never failing the
//! publish. Per-session publish order follows append order because every
//! publish for a session happens on its single pump task.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

/// Outbound channel of one WebSocket connection.
pub type ClientSender = mpsc::UnboundedSender<String>;

/// Subscription map and broadcast fan-out.
#[derive(Default)]
pub struct Broker {
    subs: Mutex<HashMap<String, HashMap<String, ClientSender>>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a session's updates. Re-subscribing
    /// replaces the previous sender for that connection.
    pub fn subscribe(&self, session_id: &str, conn_id: &str, sender: ClientSender) {
        let mut subs = self.subs.lock().expect("broker lock poisoned");
        subs.entry(session_id.to_string())
            .or_default()
            .insert(conn_id.to_string(), sender);
    }

    /// Remove a connection from every session's subscriber set.
    pub fn drop_connection(&self, conn_id: &str) {
        let mut subs = self.subs.lock().expect("broker lock poisoned");
        subs.retain(|_, clients| {
            clients.remove(conn_id);
            !clients.is_empty()
        });
    }

    /// Remove every subscriber of a session (archival).
    pub fn remove_session(&self, session_id: &str) {
        self.subs
            .lock()
            .expect("broker lock poisoned")
            .remove(session_id);
    }

    /// Broadcast a frame to all live subscribers of a session.
    pub fn publish(&self, session_id: &str, frame: &Value) {
        let text = match serde_json::to_string(frame) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(session_id, "Failed to serialize notification: {e}");
                return;
            }
        };

        let mut subs = self.subs.lock().expect("broker lock poisoned");
        if let Some(clients) = subs.get_mut(session_id) {
            clients.retain(|conn_id, sender| {
                if sender.send(text.clone()).is_ok() {
                    true
                } else {
                    tracing::debug!(session_id, %conn_id, "Dropping dead subscriber");
                    false
                }
            });
            if clients.is_empty() {
                subs.remove(session_id);
            }
        }
    }

    /// Number of subscribers for a session.
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.subs
            .lock()
            .expect("broker lock poisoned")
            .get(session_id)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_reaches_all_subscribers() {
        let broker = Broker::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx1);
        broker.subscribe("s1", "c2", tx2);

        broker.publish("s1", &json!({"method": "session/updated"}));

        assert!(rx1.try_recv().unwrap().contains("session/updated"));
        assert!(rx2.try_recv().unwrap().contains("session/updated"));
    }

    #[test]
    fn publish_is_scoped_to_the_session() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx);

        broker.publish("other", &json!({"n": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dead_subscriber_dropped_without_failing_publish() {
        let broker = Broker::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx1);
        broker.subscribe("s1", "c2", tx2);
        drop(rx1);

        broker.publish("s1", &json!({"n": 1}));
        assert_eq!(broker.subscriber_count("s1"), 1);
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn publish_order_matches_call_order() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx);

        for i in 1..=5 {
            broker.publish("s1", &json!({"seq": i}));
        }
        for i in 1..=5 {
            let text = rx.try_recv().unwrap();
            assert!(text.contains(&format!("\"seq\":{i}")));
        }
    }

    #[test]
    fn drop_connection_removes_from_all_sessions() {
        let broker = Broker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx.clone());
        broker.subscribe("s2", "c1", tx);

        broker.drop_connection("c1");
        assert_eq!(broker.subscriber_count("s1"), 0);
        assert_eq!(broker.subscriber_count("s2"), 0);
    }

    #[test]
    fn remove_session_silences_it() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx);

        broker.remove_session("s1");
        broker.publish("s1", &json!({"n": 1}));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn resubscribe_replaces_sender() {
        let broker = Broker::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        broker.subscribe("s1", "c1", tx1);
        broker.subscribe("s1", "c1", tx2);

        broker.publish("s1", &json!({"n": 1}));
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_ok());
        assert_eq!(broker.subscriber_count("s1"), 1);
    }
}
