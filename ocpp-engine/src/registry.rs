//! Table of connected sessions, keyed by station identity
//!
//! The registry is the only state shared between sessions. Its lock guards
//! the table alone and is never held across an await.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::OcppError;
use crate::session::{Session, SessionState};

/// What happens when an identity connects while it already has a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Close the old session and give the slot to the new one
    #[default]
    Replace,
    /// Refuse the new session with `IdentityConflict`
    Reject,
}

/// Why a registered session left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The session closed on its own
    Disconnected,
    /// A newer session took over the identity
    Replaced,
    /// Removed by `deregister` or registry shutdown
    Deregistered,
}

/// Fires exactly once when the session leaves the registry
#[derive(Debug)]
pub struct ReleaseSignal {
    rx: oneshot::Receiver<ReleaseReason>,
}

impl ReleaseSignal {
    pub async fn released(self) -> ReleaseReason {
        // Sender only vanishes with the registry itself
        self.rx.await.unwrap_or(ReleaseReason::Deregistered)
    }
}

struct RegistryEntry {
    session: Arc<Session>,
    release: oneshot::Sender<ReleaseReason>,
}

impl RegistryEntry {
    fn release(self, reason: ReleaseReason) -> Arc<Session> {
        let _ = self.release.send(reason);
        self.session
    }
}

/// Connected sessions by identity
#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<RwLock<HashMap<String, RegistryEntry>>>,
    policy: DuplicatePolicy,
}

impl Registry {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            sessions: Arc::default(),
            policy,
        }
    }

    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Add a session under its identity.
    ///
    /// The session is removed again when it closes. Under
    /// [`DuplicatePolicy::Replace`] an existing session for the same identity
    /// is released with [`ReleaseReason::Replaced`] and closed.
    pub fn register(&self, session: Arc<Session>) -> Result<ReleaseSignal, OcppError> {
        let identity = session.identity().to_string();
        let (release, rx) = oneshot::channel();

        let replaced = {
            let mut sessions = self.sessions.write();

            if let Some(existing) = sessions.get(&identity) {
                let live = matches!(
                    existing.session.state(),
                    SessionState::Connecting | SessionState::Open
                );
                if live && self.policy == DuplicatePolicy::Reject {
                    warn!("Refusing second connection for {}", identity);
                    return Err(OcppError::IdentityConflict(identity));
                }
            }

            sessions.insert(
                identity.clone(),
                RegistryEntry {
                    session: Arc::clone(&session),
                    release,
                },
            )
        };

        if let Some(old) = replaced {
            info!("Charging station {} reconnected, replacing old session", identity);
            let old = old.release(ReleaseReason::Replaced);
            tokio::spawn(async move { old.close("replaced").await });
        }

        self.watch(session);
        info!("Charging station {} registered", identity);
        Ok(ReleaseSignal { rx })
    }

    /// Deregister the session once it closes, unless it was already replaced
    fn watch(&self, session: Arc<Session>) {
        let registry = self.clone();

        tokio::spawn(async move {
            session.closed().await;

            let entry = {
                let mut sessions = registry.sessions.write();
                match sessions.get(session.identity()) {
                    Some(current) if current.session.session_id() == session.session_id() => {
                        sessions.remove(session.identity())
                    }
                    _ => None,
                }
            };

            if let Some(entry) = entry {
                debug!("Charging station {} deregistered on close", session.identity());
                entry.release(ReleaseReason::Disconnected);
            }
        });
    }

    /// Remove `identity` and close its session
    pub async fn deregister(&self, identity: &str) -> Result<(), OcppError> {
        let entry = self
            .sessions
            .write()
            .remove(identity)
            .ok_or_else(|| OcppError::NotFound(identity.to_string()))?;

        let session = entry.release(ReleaseReason::Deregistered);
        session.close("deregistered").await;
        info!("Charging station {} deregistered", identity);
        Ok(())
    }

    pub fn lookup(&self, identity: &str) -> Result<Arc<Session>, OcppError> {
        self.sessions
            .read()
            .get(identity)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| OcppError::NotFound(identity.to_string()))
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.sessions.read().contains_key(identity)
    }

    /// Connected identities, sorted
    pub fn list_identities(&self) -> Vec<String> {
        let mut identities: Vec<String> = self.sessions.read().keys().cloned().collect();
        identities.sort();
        identities
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send a CALL to a connected station and wait for its reply.
    ///
    /// An unknown identity fails with `NotFound` without waiting on anything.
    pub async fn send_to(
        &self,
        identity: &str,
        action: impl Into<String>,
        payload: impl Serialize,
    ) -> Result<Value, OcppError> {
        let session = self.lookup(identity)?;
        session.call(action, payload).await
    }

    /// Release and close every session
    pub async fn close_all(&self, reason: &str) {
        let entries: Vec<RegistryEntry> = self.sessions.write().drain().map(|(_, e)| e).collect();

        for entry in entries {
            let session = entry.release(ReleaseReason::Deregistered);
            session.close(reason).await;
        }
    }
}
