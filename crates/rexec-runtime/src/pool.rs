use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::config::{BusyPolicy, ConnectOptions, PoolConfig};
use crate::error::{ConnectFailure, ExecError};
use crate::invocation::{Invocation, InvocationResult};
use crate::session::{wait_cancelled, Session, SessionState};
use crate::target::{SessionKey, Target};
use crate::transport::{RusshTransport, Transport};

// A pool of ssh sessions, one per user@host:port.
// Acquisition is serialized per key so a burst of callers for the same host
// results in a single connect, while other hosts are never held up.

#[derive(Default)]
struct Slot {
    /// Held while a session for this key is being found or connected
    acquire: Mutex<()>,
    session: StdMutex<Option<Arc<Session>>>,
}

impl Slot {
    fn current(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        let mut current = self.session.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, session)
    }

    /// Take the session out, but only if it is still `session`
    fn take_if(&self, session: &Arc<Session>) -> Option<Arc<Session>> {
        let mut current = self.session.lock().unwrap_or_else(|e| e.into_inner());
        match current.as_ref() {
            Some(existing) if Arc::ptr_eq(existing, session) => current.take(),
            _ => None,
        }
    }
}

struct PoolInner {
    transport: Arc<dyn Transport>,
    options: Arc<ConnectOptions>,
    busy_policy: BusyPolicy,
    slots: StdMutex<HashMap<SessionKey, Arc<Slot>>>,
}

/// Snapshot of one pooled session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub key: SessionKey,
    pub state: SessionState,
}

/// Shared handle to the session pool. Cloning is cheap.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("sessions", &self.len())
            .field("busy_policy", &self.inner.busy_policy)
            .finish()
    }
}

impl SessionPool {
    pub fn new(transport: Arc<dyn Transport>, config: &PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                transport,
                options: Arc::new(config.connect.clone()),
                busy_policy: config.busy_policy,
                slots: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// A pool backed by real SSH connections
    pub fn with_russh(config: &PoolConfig) -> Self {
        Self::new(Arc::new(RusshTransport), config)
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Arc<Slot>>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &SessionKey) -> Arc<Slot> {
        self.slots().entry(key.clone()).or_default().clone()
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        slots.iter().filter_map(|slot| slot.current()).collect()
    }

    /// Return a Ready session for `target`, connecting one if needed
    pub async fn acquire(&self, target: &Target) -> Result<Arc<Session>, ExecError> {
        let key = target.key();
        let slot = self.slot(&key);
        let _guard = slot.acquire.lock().await;

        let session = match slot.current() {
            Some(session) if session.state() == SessionState::Ready => {
                tracing::debug!("found existing ssh session for {key} in pool");
                return Ok(session);
            }
            Some(session) if session.is_closed() || session.target().auth() != target.auth() =>
            {
                tracing::debug!("Replacing ssh session for {key}");
                session.close().await;
                self.new_session(&slot, target)
            }
            Some(session) if session.last_failure() == Some(ConnectFailure::Auth) => {
                return Err(ExecError::Auth {
                    key,
                    reason: "authentication previously failed with these credentials".to_string(),
                });
            }
            Some(session) => session,
            None => self.new_session(&slot, target),
        };

        session.connect().await?;
        Ok(session)
    }

    fn new_session(&self, slot: &Slot, target: &Target) -> Arc<Session> {
        let session = Arc::new(Session::new(
            target.clone(),
            self.inner.options.clone(),
            self.inner.busy_policy,
            self.inner.transport.clone(),
        ));
        slot.replace(Some(session.clone()));
        session
    }

    /// Run `invocation` on the session for `target`.
    ///
    /// If the connection turns out to be dead the session is evicted and the
    /// command is tried once more on a fresh one.
    pub async fn execute(
        &self,
        target: &Target,
        invocation: &Invocation,
    ) -> Result<InvocationResult, ExecError> {
        invocation.validate()?;

        let mut retried = false;
        loop {
            let (session, result) = self.attempt(target, invocation).await;

            match result {
                Err(e) if e.is_connection_loss() => {
                    if let Some(session) = session {
                        self.evict(&session).await;
                    }
                    if retried {
                        return Err(e);
                    }
                    tracing::warn!("Lost connection to {}, retrying once: {e}", target.key());
                    retried = true;
                }
                other => return other,
            }
        }
    }

    async fn attempt(
        &self,
        target: &Target,
        invocation: &Invocation,
    ) -> (Option<Arc<Session>>, Result<InvocationResult, ExecError>) {
        let acquired = tokio::select! {
            acquired = self.acquire(target) => acquired,
            _ = wait_cancelled(invocation.cancel.as_ref()) => Err(ExecError::Cancelled {
                partial: Box::new(InvocationResult::empty(&invocation.command)),
            }),
        };

        match acquired {
            Ok(session) => {
                let result = session.run(invocation).await;
                (Some(session), result)
            }
            Err(e) => (None, Err(e)),
        }
    }

    /// Drop `session` from its slot (if it is still there) and close it
    async fn evict(&self, session: &Arc<Session>) {
        let slot = self.slots().get(session.key()).cloned();
        if let Some(slot) = slot {
            if slot.take_if(session).is_some() {
                tracing::warn!("Evicting ssh session for {}", session.key());
            }
        }
        session.close().await;
    }

    /// Close and forget the session for `target`
    pub async fn release(&self, target: &Target) {
        let key = target.key();
        let slot = self.slots().get(&key).cloned();
        let Some(slot) = slot else {
            return;
        };

        if let Some(session) = slot.replace(None) {
            tracing::debug!("Releasing ssh session for {key}");
            session.close().await;
        }
    }

    /// Close every session. Later calls connect afresh.
    ///
    /// Slots stay in the map, so a connect racing with this call still lands
    /// in the pool and is closed by the next `close_all`.
    pub async fn close_all(&self) {
        let slots: Vec<Arc<Slot>> = self.slots().values().cloned().collect();
        let sessions: Vec<Arc<Session>> = slots
            .iter()
            .filter_map(|slot| slot.replace(None))
            .collect();

        tracing::debug!("Closing {} ssh sessions", sessions.len());

        let mut closing = tokio::task::JoinSet::new();
        for session in sessions {
            closing.spawn(async move { session.close().await });
        }
        while closing.join_next().await.is_some() {}
    }

    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .sessions()
            .into_iter()
            .map(|session| ConnectionInfo {
                key: session.key().clone(),
                state: session.state(),
            })
            .collect();
        connections.sort_by(|a, b| a.key.cmp(&b.key));
        connections
    }

    /// Number of sessions currently held, whatever their state
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Probe every Ready session and evict the ones that no longer answer.
    /// Returns the keys that were evicted.
    pub async fn health_check(&self) -> Vec<SessionKey> {
        let mut evicted = Vec::new();

        for session in self.sessions() {
            if session.state() != SessionState::Ready {
                continue;
            }
            if !session.is_alive().await {
                tracing::debug!("Removing dead SSH connection for {}", session.key());
                evicted.push(session.key().clone());
                self.evict(&session).await;
            }
        }

        evicted.sort();
        evicted
    }
}
