//! One real-time channel per client id.
//!
//! The WebSocket task owns the receiving half of each session's outbound
//! queue; everything else reaches the client through [`ChannelRegistry::send`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use memeloop_common::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::correlator::Correlator;
use crate::errors::SessionError;

struct Session {
    session_id: Uuid,
    tx: mpsc::UnboundedSender<ServerMessage>,
    run_active: bool,
    opened_at: DateTime<Utc>,
    /// Cancelled when the session is removed; runs bound to it stop.
    closed: CancellationToken,
}

/// Handed to the connection task on a successful handshake.
pub struct SessionHandle {
    pub client_id: String,
    pub session_id: Uuid,
    pub outbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Process-wide session table.
pub struct ChannelRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    correlator: Arc<Correlator>,
}

impl ChannelRegistry {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            correlator,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session. An id that already has an open session is rejected,
    /// never replaced, so the existing reviewer keeps its pending approvals.
    pub fn register(&self, client_id: &str) -> Result<SessionHandle, SessionError> {
        let mut sessions = self.lock();
        if sessions.contains_key(client_id) {
            return Err(SessionError::DuplicateSession {
                client_id: client_id.to_string(),
            });
        }
        let (tx, outbound) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4();
        sessions.insert(
            client_id.to_string(),
            Session {
                session_id,
                tx,
                run_active: false,
                opened_at: Utc::now(),
                closed: CancellationToken::new(),
            },
        );
        drop(sessions);

        tracing::info!(client_id, %session_id, "session opened");
        Ok(SessionHandle {
            client_id: client_id.to_string(),
            session_id,
            outbound,
        })
    }

    /// Close a client's session and release any approval still waiting on it.
    pub fn deregister(&self, client_id: &str) -> bool {
        let removed = self.lock().remove(client_id);
        self.finish_removal(client_id, removed)
    }

    /// Close the session only if it is still the one identified by
    /// `session_id`. Used by connection tasks so a stale task never closes a
    /// newer session for the same client.
    pub fn deregister_session(&self, client_id: &str, session_id: Uuid) -> bool {
        let removed = {
            let mut sessions = self.lock();
            let current = sessions.get(client_id).map(|s| s.session_id);
            if current == Some(session_id) {
                sessions.remove(client_id)
            } else {
                None
            }
        };
        self.finish_removal(client_id, removed)
    }

    fn finish_removal(&self, client_id: &str, removed: Option<Session>) -> bool {
        match removed {
            Some(session) => {
                let open_for = Utc::now() - session.opened_at;
                tracing::info!(
                    client_id,
                    session_id = %session.session_id,
                    open_secs = open_for.num_seconds(),
                    "session closed"
                );
                session.closed.cancel();
                self.correlator.fail_client(client_id);
                true
            }
            None => false,
        }
    }

    /// Queue an outbound message for a client.
    pub fn send(&self, client_id: &str, message: ServerMessage) -> Result<(), SessionError> {
        let sessions = self.lock();
        let session = sessions
            .get(client_id)
            .ok_or_else(|| SessionError::NoSuchSession {
                client_id: client_id.to_string(),
            })?;
        session
            .tx
            .send(message)
            .map_err(|_| SessionError::NoSuchSession {
                client_id: client_id.to_string(),
            })
    }

    /// Queue an outbound message, but only while `session_id` is still the
    /// client's open session. A reconnect under the same client id is a
    /// different session and never sees messages meant for the old one.
    pub fn send_to_session(
        &self,
        client_id: &str,
        session_id: Uuid,
        message: ServerMessage,
    ) -> Result<(), SessionError> {
        let sessions = self.lock();
        let closed = || SessionError::NoSuchSession {
            client_id: client_id.to_string(),
        };
        match sessions.get(client_id) {
            Some(session) if session.session_id == session_id => {
                session.tx.send(message).map_err(|_| closed())
            }
            _ => Err(closed()),
        }
    }

    /// Whether `session_id` is still the client's open session.
    pub fn is_current(&self, client_id: &str, session_id: Uuid) -> bool {
        self.lock()
            .get(client_id)
            .is_some_and(|s| s.session_id == session_id)
    }

    pub fn is_open(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Mark a run in flight for the client's session.
    ///
    /// Fails with `NoSuchSession` when the client never completed the
    /// handshake and `RunInProgress` when its previous run has not finished.
    pub fn claim_run(self: &Arc<Self>, client_id: &str) -> Result<RunGuard, SessionError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(client_id)
            .ok_or_else(|| SessionError::NoSuchSession {
                client_id: client_id.to_string(),
            })?;
        if session.run_active {
            return Err(SessionError::RunInProgress {
                client_id: client_id.to_string(),
            });
        }
        session.run_active = true;
        Ok(RunGuard {
            registry: Arc::clone(self),
            client_id: client_id.to_string(),
            session_id: session.session_id,
            closed: session.closed.clone(),
        })
    }

    fn release_run(&self, client_id: &str, session_id: Uuid) {
        if let Some(session) = self.lock().get_mut(client_id) {
            if session.session_id == session_id {
                session.run_active = false;
            }
        }
    }
}

/// A run's claim on one session. Releases the claim on drop.
pub struct RunGuard {
    registry: Arc<ChannelRegistry>,
    client_id: String,
    session_id: Uuid,
    closed: CancellationToken,
}

impl RunGuard {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Fires when the claimed session closes.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release_run(&self.client_id, self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memeloop_common::Decision;

    use crate::session::correlator::Resolution;

    fn registry() -> (Arc<ChannelRegistry>, Arc<Correlator>) {
        let correlator = Arc::new(Correlator::new());
        (Arc::new(ChannelRegistry::new(Arc::clone(&correlator))), correlator)
    }

    #[tokio::test]
    async fn test_register_and_send() {
        let (reg, _) = registry();
        let mut handle = reg.register("alice").unwrap();
        assert!(reg.is_open("alice"));

        reg.send("alice", ServerMessage::event_log("hello")).unwrap();
        assert_eq!(
            handle.outbound.recv().await,
            Some(ServerMessage::event_log("hello"))
        );
    }

    #[test]
    fn test_duplicate_handshake_is_rejected() {
        let (reg, _) = registry();
        let first = reg.register("alice").unwrap();
        let err = reg.register("alice").err().unwrap();
        assert_eq!(
            err,
            SessionError::DuplicateSession {
                client_id: "alice".to_string()
            }
        );
        // The original session survives.
        assert!(reg.is_open("alice"));
        assert_eq!(reg.session_count(), 1);
        drop(first);
    }

    #[test]
    fn test_send_to_unknown_client_fails() {
        let (reg, _) = registry();
        let err = reg.send("ghost", ServerMessage::event_log("hi")).unwrap_err();
        assert!(matches!(err, SessionError::NoSuchSession { .. }));
    }

    #[test]
    fn test_send_after_receiver_dropped_fails() {
        let (reg, _) = registry();
        let handle = reg.register("alice").unwrap();
        drop(handle);
        assert!(reg.send("alice", ServerMessage::event_log("hi")).is_err());
    }

    #[tokio::test]
    async fn test_deregister_fails_pending_approval() {
        let (reg, correlator) = registry();
        let _handle = reg.register("alice").unwrap();
        let mut waiter = correlator.register_waiter("cmd-1", "alice", "a").unwrap();

        assert!(reg.deregister("alice"));
        assert_eq!(waiter.recv().await, Resolution::ChannelClosed);
        assert_eq!(correlator.pending_count(), 0);
        assert!(!reg.is_open("alice"));
        assert!(!reg.deregister("alice"));
    }

    #[test]
    fn test_deregister_leaves_other_clients_alone() {
        let (reg, correlator) = registry();
        let _a = reg.register("alice").unwrap();
        let _b = reg.register("bob").unwrap();
        let _wait_b = correlator.register_waiter("cmd-b", "bob", "b").unwrap();

        reg.deregister("alice");
        assert!(reg.is_open("bob"));
        assert_eq!(correlator.pending_count(), 1);
        assert_eq!(
            correlator.submit_decision("bob", "cmd-b", Decision::approve()),
            crate::session::correlator::SubmitOutcome::Resolved
        );
    }

    #[test]
    fn test_stale_session_cannot_close_newer_one() {
        let (reg, _) = registry();
        let old = reg.register("alice").unwrap();
        reg.deregister("alice");
        let new = reg.register("alice").unwrap();

        assert!(!reg.deregister_session("alice", old.session_id));
        assert!(reg.is_open("alice"));
        assert!(reg.deregister_session("alice", new.session_id));
    }

    #[test]
    fn test_session_bound_send_ignores_reconnect() {
        let (reg, _) = registry();
        let old = reg.register("alice").unwrap();
        let old_id = old.session_id;
        reg.send_to_session("alice", old_id, ServerMessage::event_log("hi"))
            .unwrap();

        reg.deregister("alice");
        let mut new = reg.register("alice").unwrap();
        assert!(!reg.is_current("alice", old_id));
        assert!(reg.is_current("alice", new.session_id));

        let err = reg
            .send_to_session("alice", old_id, ServerMessage::event_log("stale"))
            .unwrap_err();
        assert!(matches!(err, SessionError::NoSuchSession { .. }));
        assert!(new.outbound.try_recv().is_err());
    }

    #[test]
    fn test_closing_session_cancels_its_run_claim() {
        let (reg, _) = registry();
        let _handle = reg.register("alice").unwrap();
        let guard = reg.claim_run("alice").unwrap();
        let closed = guard.closed();
        assert!(!closed.is_cancelled());

        reg.deregister("alice");
        assert!(closed.is_cancelled());

        // A fresh session starts with a fresh token.
        let _again = reg.register("alice").unwrap();
        let next = reg.claim_run("alice").unwrap();
        assert!(!next.closed().is_cancelled());
        drop(guard);
    }

    #[test]
    fn test_run_claims() {
        let (reg, _) = registry();
        let err = reg.claim_run("alice").err().unwrap();
        assert!(matches!(err, SessionError::NoSuchSession { .. }));

        let _handle = reg.register("alice").unwrap();
        let guard = reg.claim_run("alice").unwrap();
        assert_eq!(guard.client_id(), "alice");
        let err = reg.claim_run("alice").err().unwrap();
        assert!(matches!(err, SessionError::RunInProgress { .. }));

        drop(guard);
        assert!(reg.claim_run("alice").is_ok());
    }
}
