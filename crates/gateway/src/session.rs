//! Session registry
//!
//! Tracks live session tasks by id. The registry holds only the inbox
//! handle and activity timestamp; all real session state lives inside the
//! task (see `pipeline`). A background task shuts down sessions whose
//! sockets have gone quiet past the idle timeout.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

use crate::pipeline::SessionEvent;
use crate::GatewayError;

/// Handle to one live session task
pub struct SessionHandle {
    pub id: String,
    pub inbox: mpsc::Sender<SessionEvent>,
    last_activity: RwLock<Instant>,
}

impl SessionHandle {
    pub fn new(id: String, inbox: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            id,
            inbox,
            last_activity: RwLock::new(Instant::now()),
        }
    }

    /// Record client activity
    pub fn touch(&self) {
        *self.last_activity.write() = Instant::now();
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.read().elapsed() > timeout
    }
}

/// Registry of live sessions on this gateway instance
pub struct SessionManager {
    sessions: DashMap<String, Arc<SessionHandle>>,
    max_sessions: usize,
    idle_timeout: Duration,
    cleanup_interval: Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            idle_timeout,
            cleanup_interval: Duration::from_secs(30),
        }
    }

    /// Register a new session, enforcing the capacity cap
    pub fn register(
        &self,
        id: &str,
        inbox: mpsc::Sender<SessionEvent>,
    ) -> Result<Arc<SessionHandle>, GatewayError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(GatewayError::Capacity);
        }
        let handle = Arc::new(SessionHandle::new(id.to_string(), inbox));
        self.sessions.insert(id.to_string(), handle.clone());
        tracing::info!(session_id = %id, live = self.sessions.len(), "session registered");
        Ok(handle)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) {
        if self.sessions.remove(id).is_some() {
            tracing::info!(session_id = %id, live = self.sessions.len(), "session removed");
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Start the idle-session reaper.
    ///
    /// Returns a shutdown sender that stops the task.
    pub fn start_cleanup_task(self: &Arc<Self>) -> watch::Sender<bool> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let interval = manager.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.shutdown_expired().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("session cleanup task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        shutdown_tx
    }

    async fn shutdown_expired(&self) {
        let expired: Vec<Arc<SessionHandle>> = self
            .sessions
            .iter()
            .filter(|entry| entry.is_expired(self.idle_timeout))
            .map(|entry| entry.value().clone())
            .collect();

        for handle in expired {
            tracing::info!(session_id = %handle.id, "session idle past timeout, closing");
            // Session teardown removes the registry entry
            let _ = handle.inbox.send(SessionEvent::Shutdown).await;
            self.remove(&handle.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: usize) -> SessionManager {
        SessionManager::new(max, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let mgr = manager(4);
        let (tx, _rx) = mpsc::channel(1);
        mgr.register("s1", tx).unwrap();

        assert!(mgr.get("s1").is_some());
        assert_eq!(mgr.count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_cap() {
        let mgr = manager(1);
        let (tx, _rx) = mpsc::channel(1);
        mgr.register("s1", tx.clone()).unwrap();
        assert!(matches!(
            mgr.register("s2", tx),
            Err(GatewayError::Capacity)
        ));
    }

    #[tokio::test]
    async fn test_remove() {
        let mgr = manager(4);
        let (tx, _rx) = mpsc::channel(1);
        mgr.register("s1", tx).unwrap();
        mgr.remove("s1");
        assert!(mgr.get("s1").is_none());
    }

    #[tokio::test]
    async fn test_expired_session_gets_shutdown() {
        let mgr = Arc::new(SessionManager::new(4, Duration::from_millis(0)));
        let (tx, mut rx) = mpsc::channel(4);
        let handle = mgr.register("s1", tx).unwrap();
        handle.touch();

        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.shutdown_expired().await;

        assert!(matches!(rx.recv().await, Some(SessionEvent::Shutdown)));
        assert_eq!(mgr.count(), 0);
    }
}
