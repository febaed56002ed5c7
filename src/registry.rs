use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::protocol::ControlFrame;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("name '{0}' is already registered")]
pub struct DuplicateName(pub String);

/// A registered client: its name, advertised transfer endpoint, and a queue
/// feeding its control connection.
///
/// The queue's receiving half is owned by the connection's dispatch task,
/// which writes frames out in arrival order. Cloning a `Session` clones the
/// sender, so snapshots stay usable after the map changes underneath them.
#[derive(Debug, Clone)]
pub struct Session {
    pub name: String,
    pub transfer_host: String,
    pub transfer_port: u16,
    outbox: mpsc::UnboundedSender<ControlFrame>,
}

impl Session {
    /// Queues a frame for delivery on this session's control connection.
    ///
    /// Returns `false` if the owning dispatch task is gone; the caller should
    /// not treat that as fatal, cleanup belongs to the dead connection's own
    /// failure path.
    pub fn send(&self, frame: ControlFrame) -> bool {
        self.outbox.send(frame).is_ok()
    }

    pub fn transfer_addr(&self) -> String {
        format!("{}:{}", self.transfer_host, self.transfer_port)
    }
}

/// Name-keyed map of live sessions, the only structure mutated from multiple
/// tasks. A single mutex guards every access.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session, rejecting a second registration under the same name.
    pub async fn register(
        &self,
        name: &str,
        transfer_host: &str,
        transfer_port: u16,
        outbox: mpsc::UnboundedSender<ControlFrame>,
    ) -> Result<Session, DuplicateName> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(name) {
            return Err(DuplicateName(name.to_string()));
        }

        let session = Session {
            name: name.to_string(),
            transfer_host: transfer_host.to_string(),
            transfer_port,
            outbox,
        };
        sessions.insert(name.to_string(), session.clone());
        Ok(session)
    }

    pub async fn lookup(&self, name: &str) -> Option<Session> {
        let sessions = self.sessions.lock().await;
        sessions.get(name).cloned()
    }

    pub async fn unregister(&self, name: &str) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(name)
    }

    /// Point-in-time copy of every session, ordered by name.
    ///
    /// Broadcasts iterate the copy, so registrations and removals that race
    /// with an in-flight fan-out never corrupt it.
    pub async fn snapshot(&self) -> Vec<Session> {
        let sessions = self.sessions.lock().await;
        let mut snapshot: Vec<Session> = sessions.values().cloned().collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox() -> mpsc::UnboundedSender<ControlFrame> {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let registry = SessionRegistry::new();
        registry
            .register("alice", "127.0.0.1", 9001, outbox())
            .await
            .expect("first registration should pass");

        let result = registry.register("alice", "127.0.0.1", 9002, outbox()).await;
        assert_eq!(result.unwrap_err(), DuplicateName("alice".into()));

        // The original session survives the rejected attempt.
        let kept = registry.lookup("alice").await.expect("alice still present");
        assert_eq!(kept.transfer_port, 9001);
    }

    #[tokio::test]
    async fn snapshot_is_ordered_and_detached() {
        let registry = SessionRegistry::new();
        registry
            .register("bob", "127.0.0.1", 9002, outbox())
            .await
            .expect("register bob");
        registry
            .register("alice", "127.0.0.1", 9001, outbox())
            .await
            .expect("register alice");

        let snapshot = registry.snapshot().await;
        let names: Vec<&str> = snapshot.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["alice", "bob"]);

        registry.unregister("bob").await.expect("bob was registered");
        // Detached copy: removal does not shrink the snapshot already taken.
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        registry
            .register("alice", "127.0.0.1", 9001, outbox())
            .await
            .expect("register alice");

        assert!(registry.unregister("alice").await.is_some());
        assert!(registry.unregister("alice").await.is_none());
        assert!(registry.lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn queued_frames_reach_the_owning_task() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry
            .register("alice", "127.0.0.1", 9001, tx)
            .await
            .expect("register alice");

        let session = registry.lookup("alice").await.expect("lookup alice");
        assert!(session.send(ControlFrame::Chat {
            sender: "bob".into(),
            message: "hi".into(),
        }));

        let frame = rx.recv().await.expect("frame queued");
        assert_eq!(
            frame,
            ControlFrame::Chat {
                sender: "bob".into(),
                message: "hi".into(),
            }
        );
    }
}
