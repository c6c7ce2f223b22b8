//! Connection registry: who is online, and how to reach them.
//!
//! Each connected session owns an outbox (`mpsc::UnboundedSender<String>`)
//! drained to its socket by a dedicated writer task. Registration is a
//! single check-and-insert under the lock, so a username can never be held
//! by two live sessions. Broadcast delivery is best-effort per peer: a
//! session whose outbox is gone is simply skipped.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

pub struct Registry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    next_seq: u64,
}

struct Session {
    seq: u64,
    outbox: mpsc::UnboundedSender<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                sessions: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Register a session under `username`. Returns false if the name is
    /// already held (case-sensitive exact match); the existing session is
    /// unaffected.
    pub async fn register(&self, username: &str, outbox: mpsc::UnboundedSender<String>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.sessions.contains_key(username) {
            return false;
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.sessions.insert(username.to_string(), Session { seq, outbox });
        true
    }

    pub async fn unregister(&self, username: &str) -> bool {
        self.inner.lock().await.sessions.remove(username).is_some()
    }

    pub async fn is_online(&self, username: &str) -> bool {
        self.inner.lock().await.sessions.contains_key(username)
    }

    /// Queue a private line for one session. Returns false if the session
    /// is not registered or its outbox is closed.
    pub async fn send_to(&self, username: &str, line: &str) -> bool {
        let inner = self.inner.lock().await;
        match inner.sessions.get(username) {
            Some(session) => session.outbox.send(line.to_string()).is_ok(),
            None => false,
        }
    }

    /// Queue a line for every session except `exclude`. A closed outbox
    /// does not stop delivery to the rest.
    pub async fn broadcast(&self, line: &str, exclude: Option<&str>) {
        let inner = self.inner.lock().await;
        for (username, session) in &inner.sessions {
            if exclude == Some(username.as_str()) {
                continue;
            }
            let _ = session.outbox.send(line.to_string());
        }
    }

    /// Usernames in registration order.
    pub async fn list_online(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut sessions: Vec<(&String, &Session)> = inner.sessions.iter().collect();
        sessions.sort_by_key(|(_, session)| session.seq);
        sessions
            .into_iter()
            .map(|(username, _)| username.clone())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_duplicate_usernames() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        assert!(registry.register("alice", tx_a).await);
        assert!(!registry.register("alice", tx_b).await);
        assert!(registry.is_online("alice").await);
    }

    #[tokio::test]
    async fn usernames_are_case_sensitive() {
        let registry = Registry::new();
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        assert!(registry.register("alice", tx_a).await);
        assert!(registry.register("Alice", tx_b).await);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_sender() {
        let registry = Registry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register("alice", tx_a).await;
        registry.register("bob", tx_b).await;

        registry.broadcast("[alice] hi", Some("alice")).await;

        assert_eq!(rx_b.recv().await.unwrap(), "[alice] hi");
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_survives_a_dead_outbox() {
        let registry = Registry::new();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        registry.register("alice", tx_a).await;
        registry.register("bob", tx_b).await;
        drop(rx_a);

        registry.broadcast("still here", None).await;
        assert_eq!(rx_b.recv().await.unwrap(), "still here");
    }

    #[tokio::test]
    async fn list_online_is_in_registration_order() {
        let registry = Registry::new();
        for name in ["carol", "alice", "bob"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            registry.register(name, tx).await;
        }
        assert_eq!(registry.list_online().await, vec!["carol", "alice", "bob"]);

        registry.unregister("alice").await;
        assert_eq!(registry.list_online().await, vec!["carol", "bob"]);
    }
}
