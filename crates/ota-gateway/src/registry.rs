//! Per-device session registry.
//!
//! Maps a device IP to its active push session. Every read and write goes
//! through one `Mutex`, held only for the map operation itself and never
//! across network I/O.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::info;

use crate::command::CommandKind;
use crate::progress::{self, Outcome, ProgressReceiver};
use crate::session::Session;

/// Shared registry of live sessions, keyed by device address.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<IpAddr, Arc<Session>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `address` and return it with the read end of
    /// its progress queue. Replaces any session already registered for the
    /// address; a replaced session that no device has connected to yet is
    /// failed so its reader is not left waiting for the expiry.
    pub async fn register(
        &self,
        address: IpAddr,
        payload: Bytes,
        command: CommandKind,
    ) -> (Arc<Session>, ProgressReceiver) {
        let (tx, rx) = progress::channel();
        let session = Arc::new(Session::new(address, command, payload, tx));

        let replaced = {
            let mut sessions = self.inner.lock().await;
            sessions.insert(address, session.clone())
        };

        if let Some(old) = replaced {
            info!(
                "Session {} for {} replaced by {}",
                old.id(),
                address,
                session.id()
            );
            if old.supersede() {
                // The old reader may be slow; don't hold up the new upload.
                tokio::spawn(async move {
                    old.close(Outcome::Failed("replaced by a newer upload".into()))
                        .await;
                });
            }
        }

        (session, rx)
    }

    pub async fn lookup(&self, address: IpAddr) -> Option<Arc<Session>> {
        self.inner.lock().await.get(&address).cloned()
    }

    /// Unconditionally drop whatever session is registered for `address`.
    /// Sessions ending on their own go through [`conclude`](Self::conclude),
    /// which only removes the entry if it is still theirs.
    pub async fn remove(&self, address: IpAddr) -> Option<Arc<Session>> {
        self.inner.lock().await.remove(&address)
    }

    /// Remove `session` only if it is still the one registered for its
    /// address, so a finished session never evicts its replacement.
    pub async fn remove_session(&self, session: &Session) -> bool {
        let mut sessions = self.inner.lock().await;
        let current = sessions
            .get(&session.address())
            .is_some_and(|s| s.id() == session.id());
        if current {
            sessions.remove(&session.address());
        }
        current
    }

    /// Move `session` into the terminal state matching `outcome`, drop it
    /// from the registry and close its progress queue. Returns false if the
    /// session had already ended.
    pub async fn conclude(&self, session: &Session, outcome: Outcome) -> bool {
        if !session.advance((&outcome).into()) {
            return false;
        }
        self.remove_session(session).await;
        session.close(outcome).await;
        true
    }

    /// [`conclude`](Self::conclude), but only while no device has connected.
    pub async fn conclude_unclaimed(&self, session: &Session, outcome: Outcome) -> bool {
        if !session.end_unclaimed((&outcome).into()) {
            return false;
        }
        self.remove_session(session).await;
        session.close(outcome).await;
        true
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    fn device() -> IpAddr {
        "192.168.4.20".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup(device()).await.is_none());

        let (session, _rx) = registry
            .register(device(), Bytes::from_static(b"fw"), CommandKind::Flash)
            .await;
        let found = registry.lookup(device()).await.unwrap();
        assert_eq!(found.id(), session.id());
        assert_eq!(found.payload().as_ref(), b"fw");
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove(device()).await.is_some());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_second_registration_replaces_first() {
        let registry = SessionRegistry::new();
        let (first, first_rx) = registry
            .register(device(), Bytes::from_static(b"first"), CommandKind::Flash)
            .await;
        let (second, _second_rx) = registry
            .register(device(), Bytes::from_static(b"second"), CommandKind::Flash)
            .await;

        assert_eq!(registry.len().await, 1);
        let found = registry.lookup(device()).await.unwrap();
        assert_eq!(found.id(), second.id());
        assert_eq!(found.payload().as_ref(), b"second");

        assert_eq!(first.state(), SessionState::Failed);
        let (_, outcome) = first_rx.drain().await;
        assert_eq!(outcome, Outcome::Failed("replaced by a newer upload".into()));
    }

    #[tokio::test]
    async fn test_replacing_connected_session_leaves_it_running() {
        let registry = SessionRegistry::new();
        let (first, _first_rx) = registry
            .register(device(), Bytes::from_static(b"first"), CommandKind::Flash)
            .await;
        assert!(first.advance(SessionState::Connected));

        let (second, _second_rx) = registry
            .register(device(), Bytes::from_static(b"second"), CommandKind::Flash)
            .await;
        assert_eq!(first.state(), SessionState::Connected);

        // The finishing first session must not evict the second.
        assert!(registry.conclude(&first, Outcome::Completed).await);
        let found = registry.lookup(device()).await.unwrap();
        assert_eq!(found.id(), second.id());
    }

    #[tokio::test]
    async fn test_conclude_only_once() {
        let registry = SessionRegistry::new();
        let (session, rx) = registry
            .register(device(), Bytes::from_static(b"fw"), CommandKind::Flash)
            .await;

        assert!(registry.conclude(&session, Outcome::Failed("boom".into())).await);
        assert!(!registry.conclude(&session, Outcome::Completed).await);
        assert!(registry.is_empty().await);
        assert!(session.cancel_token().is_cancelled());
        assert_eq!(rx.drain().await.1, Outcome::Failed("boom".into()));
    }

    #[tokio::test]
    async fn test_conclude_unclaimed_spares_connected_session() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry
            .register(device(), Bytes::from_static(b"fw"), CommandKind::Flash)
            .await;
        assert!(session.advance(SessionState::Connected));

        assert!(
            !registry
                .conclude_unclaimed(&session, Outcome::Failed("invitation failed".into()))
                .await
        );
        assert_eq!(session.state(), SessionState::Connected);
        assert!(!session.cancel_token().is_cancelled());
        assert_eq!(registry.len().await, 1);

        let (other, other_rx) = registry
            .register(device(), Bytes::from_static(b"fw2"), CommandKind::Flash)
            .await;
        assert!(
            registry
                .conclude_unclaimed(&other, Outcome::Failed("invitation failed".into()))
                .await
        );
        assert_eq!(other_rx.drain().await.1, Outcome::Failed("invitation failed".into()));
    }

    #[tokio::test]
    async fn test_remove_drops_entry_unconditionally() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry
            .register(device(), Bytes::from_static(b"fw"), CommandKind::Flash)
            .await;
        assert!(session.advance(SessionState::Connected));
        let removed = registry.remove(device()).await.unwrap();
        assert_eq!(removed.id(), session.id());
        assert!(registry.lookup(device()).await.is_none());
        assert!(!registry.remove_session(&session).await);
    }

    #[tokio::test]
    async fn test_distinct_devices_are_independent() {
        let registry = SessionRegistry::new();
        let other: IpAddr = "192.168.4.21".parse().unwrap();
        registry
            .register(device(), Bytes::from_static(b"a"), CommandKind::Flash)
            .await;
        registry
            .register(other, Bytes::from_static(b"b"), CommandKind::SpiFs)
            .await;
        assert_eq!(registry.len().await, 2);
        assert_eq!(
            registry.lookup(other).await.unwrap().command(),
            CommandKind::SpiFs
        );
    }
}
