use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deaddrop_core::SessionId;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::socks5::Target;

/// What the registry knows about one live tunnel session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub target: Target,
    pub peer: SocketAddr,
    pub started: Instant,
    pub cancel: CancellationToken,
}

/// Live sessions of this proxy, keyed by session id.
///
/// Owned by the SOCKS5 front end and handed to every session. The lock is
/// only taken for map updates and never held across an await.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionId, SessionInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. Dropping the returned guard tears it down.
    pub fn create(&self, id: SessionId, info: SessionInfo) -> SessionGuard {
        let cancel = info.cancel.clone();
        self.sessions.lock().insert(id.clone(), info);
        SessionGuard {
            registry: self.clone(),
            id,
            cancel,
        }
    }

    pub fn lookup(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.lock().get(id).cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals every live session to stop. Entries leave the map as each
    /// session's guard drops.
    pub fn cancel_all(&self) {
        for info in self.sessions.lock().values() {
            info.cancel.cancel();
        }
    }

    /// Cancels every session and waits up to `grace` for all of them to
    /// deregister. Returns whether the registry drained in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cancel_all();

        let drained = tokio::time::timeout(grace, async {
            while !self.is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("{} sessions still running after {grace:?}", self.len());
        }
        drained
    }
}

/// Ends a session exactly once: cancels both loops and deregisters.
pub struct SessionGuard {
    registry: SessionRegistry,
    id: SessionId,
    cancel: CancellationToken,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(info) = self.registry.remove(&self.id) {
            info!(
                "[{}] Session {} -> {} closed after {:.1?}",
                self.id,
                info.peer,
                info.target,
                info.started.elapsed()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(cancel: CancellationToken) -> SessionInfo {
        SessionInfo {
            target: Target::new("example.com", 80),
            peer: "127.0.0.1:50000".parse().unwrap(),
            started: Instant::now(),
            cancel,
        }
    }

    #[test]
    fn test_create_lookup_remove() {
        let registry = SessionRegistry::new();
        let id = SessionId::generate();
        let guard = registry.create(id.clone(), info(CancellationToken::new()));

        assert_eq!(registry.len(), 1);
        let found = registry.lookup(&id).unwrap();
        assert_eq!(found.target.to_string(), "example.com:80");

        assert!(registry.remove(&id).is_some());
        assert!(registry.lookup(&id).is_none());
        assert!(registry.remove(&id).is_none());

        // Guard drop after an explicit remove is a no-op.
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_guard_drop_tears_down_once() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let id = SessionId::generate();
        let guard = registry.create(id.clone(), info(cancel.clone()));
        let other = registry.create(SessionId::generate(), info(CancellationToken::new()));

        drop(guard);
        assert!(cancel.is_cancelled());
        assert!(registry.lookup(&id).is_none());
        assert_eq!(registry.len(), 1);

        drop(other);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_cancel_all() {
        let registry = SessionRegistry::new();
        let a = CancellationToken::new();
        let b = CancellationToken::new();
        let _ga = registry.create(SessionId::generate(), info(a.clone()));
        let _gb = registry.create(SessionId::generate(), info(b.clone()));

        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_sessions_to_leave() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let guard = registry.create(SessionId::generate(), info(cancel.clone()));

        let session = tokio::spawn(async move {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(registry.shutdown(Duration::from_secs(5)).await);
        assert!(registry.is_empty());
        session.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_after_grace() {
        let registry = SessionRegistry::new();
        let cancel = CancellationToken::new();
        let _stuck = registry.create(SessionId::generate(), info(cancel.clone()));

        assert!(!registry.shutdown(Duration::from_millis(50)).await);
        assert!(cancel.is_cancelled());
        assert_eq!(registry.len(), 1);
    }
}
