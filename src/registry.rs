use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use bon::Builder;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        OnceCell,
        mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
    },
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
#[cfg(not(coverage_nightly))]
use tracing::{debug, error, info, warn};

use crate::{
    error::TunnelError,
    identity::{AddressPair, CompositeId, SessionId},
    resolver::{ResolvedTarget, Resolver, Target},
    session::{ForwardExit, Session},
    ssh::{Connector, Credentials},
    store::{ForwardRecord, ForwardStore},
};

// A session, or the pending creation of one. Concurrent openers share the same cell.
type SessionSlot = Arc<OnceCell<Arc<Session>>>;

/// Flat description of one live forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardDescriptor {
    pub id: String,
    pub session_id: String,
    pub user: String,
    pub host: String,
    pub port: u16,
    // Dial address of the owning session.
    pub address: String,
    pub local_address: String,
    pub remote_address: String,
    pub bound_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    pub closed: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseAllOutcome {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub failed: usize,
}

// Failed-forward notices from every session, consumed by `reap_failed_forwards`.
struct ExitChannel {
    sender: UnboundedSender<ForwardExit>,
    receiver: Mutex<Option<UnboundedReceiver<ForwardExit>>>,
}

impl Default for ExitChannel {
    fn default() -> Self {
        let (sender, receiver) = unbounded_channel();
        ExitChannel {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

/// Owner of every live session, keyed by session identity.
#[derive(Builder)]
pub struct Registry {
    // Turns requested targets into dial addresses and jump chains.
    resolver: Resolver,
    // Dials and authenticates new sessions.
    connector: Arc<dyn Connector>,
    // Durable record of forwards, replayed on startup.
    store: Option<ForwardStore>,
    #[builder(skip = RwLock::default())]
    sessions: RwLock<HashMap<SessionId, SessionSlot>>,
    // Root of the daemon -> session -> forward cancellation tree.
    #[builder(skip = CancellationToken::new())]
    cancellation_token: CancellationToken,
    #[builder(skip = TaskTracker::new())]
    tracker: TaskTracker,
    #[builder(skip)]
    exits: ExitChannel,
}

impl Registry {
    /// Open a forward on the session for `target`, creating the session if needed.
    pub async fn open(
        &self,
        target: &Target,
        pair: AddressPair,
        credentials: &Credentials,
    ) -> Result<CompositeId, TunnelError> {
        if self.cancellation_token.is_cancelled() {
            return Err(TunnelError::ShuttingDown);
        }
        let resolved = self.resolver.resolve(target).await?;
        let session_id = resolved.session_id();
        let mut retried = false;
        let (session, forward_id) = loop {
            let session = self
                .get_or_create(&session_id, target, &resolved, credentials)
                .await?;
            match session.add_forward(pair.clone()).await {
                Ok(forward_id) => break (session, forward_id),
                // The session was retired between lookup and insertion; try a fresh one.
                Err(TunnelError::SessionClosed(_)) if !retried => retried = true,
                Err(error) => {
                    self.close_if_empty(&session).await;
                    return Err(error);
                }
            }
        };
        let id = CompositeId::new(session_id, forward_id);
        #[cfg(not(coverage_nightly))]
        info!(%id, session = %session.dial_address(), %pair, "Opened forward.");
        self.persist(&id, &session, &pair).await;
        Ok(id)
    }

    async fn get_or_create(
        &self,
        id: &SessionId,
        target: &Target,
        resolved: &ResolvedTarget,
        credentials: &Credentials,
    ) -> Result<Arc<Session>, TunnelError> {
        let existing = self.sessions.read().unwrap().get(id).cloned();
        let slot = match existing {
            Some(slot) if !slot.get().is_some_and(|session| session.is_closed()) => slot,
            _ => {
                let (slot, stale) = {
                    let mut sessions = self.sessions.write().unwrap();
                    let stale = match sessions.get(id) {
                        Some(slot) if slot.get().is_some_and(|session| session.is_closed()) => {
                            sessions.remove(id).and_then(|slot| slot.get().cloned())
                        }
                        _ => None,
                    };
                    (Arc::clone(sessions.entry(id.clone()).or_default()), stale)
                };
                if let Some(stale) = stale {
                    #[cfg(not(coverage_nightly))]
                    warn!(session = %id, address = %stale.dial_address(), "Session lost its connection, reconnecting.");
                    // Its forwards go down with the connection, so their records go too.
                    let lost = stale
                        .forwards()
                        .into_iter()
                        .map(|forward| CompositeId::new(id.clone(), forward.id).to_string())
                        .collect::<Vec<_>>();
                    if let Err(error) = stale.close().await {
                        #[cfg(not(coverage_nightly))]
                        debug!(session = %id, %error, "Error closing stale session.");
                    }
                    for lost_id in lost.iter() {
                        #[cfg(not(coverage_nightly))]
                        warn!(id = %lost_id, "Dropped forward of disconnected session.");
                    }
                    self.forget(&lost).await;
                }
                slot
            }
        };

        let created = slot
            .get_or_try_init(|| async {
                let transport = self.connector.connect(resolved, credentials).await?;
                // Persist the user/port that were actually used, with the host as requested.
                let persisted_target = Target::new(
                    resolved.user(),
                    target.host.clone(),
                    resolved.endpoint.port,
                );
                #[cfg(not(coverage_nightly))]
                info!(session = %id, address = %resolved.dial_address(), "Session connected.");
                Ok::<_, TunnelError>(Arc::new(
                    Session::builder()
                        .id(id.clone())
                        .target(persisted_target)
                        .dial_address(resolved.dial_address())
                        .credentials(credentials.clone())
                        .transport(transport)
                        .cancellation_token(self.cancellation_token.child_token())
                        .tracker(self.tracker.clone())
                        .exits(self.exits.sender.clone())
                        .build(),
                ))
            })
            .await;

        match created {
            Ok(session) => {
                let registered = self
                    .sessions
                    .read()
                    .unwrap()
                    .get(id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot));
                if !registered {
                    // Drained by close-all or shutdown while connecting.
                    if let Err(error) = session.close().await {
                        #[cfg(not(coverage_nightly))]
                        debug!(session = %id, %error, "Error closing drained session.");
                    }
                    return Err(if self.cancellation_token.is_cancelled() {
                        TunnelError::ShuttingDown
                    } else {
                        TunnelError::SessionClosed(id.to_string())
                    });
                }
                Ok(Arc::clone(session))
            }
            Err(error) => {
                // Don't keep a failed creation around, so the next open can retry.
                let mut sessions = self.sessions.write().unwrap();
                if sessions
                    .get(id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none())
                {
                    sessions.remove(id);
                }
                Err(error)
            }
        }
    }

    fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(id)
            .and_then(|slot| slot.get().cloned())
    }

    // Close and deregister the session if its last forward is gone.
    async fn close_if_empty(&self, session: &Arc<Session>) {
        let retired = {
            let mut sessions = self.sessions.write().unwrap();
            let registered = sessions.get(session.id()).is_some_and(|slot| {
                slot.get()
                    .is_some_and(|current| Arc::ptr_eq(current, session))
            });
            if registered && session.retire_if_empty() {
                sessions.remove(session.id());
                true
            } else {
                false
            }
        };
        if retired {
            #[cfg(not(coverage_nightly))]
            info!(session = %session.id(), address = %session.dial_address(), "Last forward closed, closing session.");
            if let Err(error) = session.close().await {
                #[cfg(not(coverage_nightly))]
                warn!(session = %session.id(), %error, "Error closing session.");
            }
        }
    }

    /// Close the given forwards, reporting each id as either closed or failed.
    pub async fn close(&self, ids: &[String]) -> CloseOutcome {
        let mut outcome = CloseOutcome::default();
        for raw_id in ids {
            let id: CompositeId = match raw_id.parse() {
                Ok(id) => id,
                Err(error) => {
                    outcome.errors.push(error.to_string());
                    continue;
                }
            };
            let Some(session) = self.lookup(&id.session) else {
                outcome
                    .errors
                    .push(TunnelError::SessionNotFound(id.session.to_string()).to_string());
                continue;
            };
            if !session.remove_forward(&id.forward).await {
                outcome
                    .errors
                    .push(TunnelError::ForwardNotFound(id.forward.to_string()).to_string());
                continue;
            }
            #[cfg(not(coverage_nightly))]
            info!(%raw_id, "Closed forward.");
            outcome.closed.push(raw_id.clone());
            self.close_if_empty(&session).await;
        }
        if let Some(store) = &self.store {
            if let Err(error) = store.delete(&outcome.closed).await {
                #[cfg(not(coverage_nightly))]
                warn!(%error, "Unable to delete forward records.");
            }
        }
        outcome
    }

    /// Close every session. Reports `ok: false` if there was nothing to close.
    pub async fn close_all(&self) -> CloseAllOutcome {
        let sessions = self.drain_sessions();
        if sessions.is_empty() {
            return CloseAllOutcome {
                ok: false,
                error: "No open tunnels".into(),
            };
        }
        for session in sessions.iter() {
            if let Err(error) = session.close().await {
                #[cfg(not(coverage_nightly))]
                warn!(session = %session.id(), %error, "Error closing session.");
            }
        }
        #[cfg(not(coverage_nightly))]
        info!(sessions = sessions.len(), "Closed all sessions.");
        if let Some(store) = &self.store {
            if let Err(error) = store.clear_all().await {
                #[cfg(not(coverage_nightly))]
                warn!(%error, "Unable to clear forward records.");
            }
        }
        CloseAllOutcome {
            ok: true,
            error: String::new(),
        }
    }

    fn drain_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .write()
            .unwrap()
            .drain()
            .filter_map(|(_, slot)| slot.get().cloned())
            .collect()
    }

    /// Snapshot every forward of every session.
    pub fn list(&self) -> Vec<ForwardDescriptor> {
        let sessions = self
            .sessions
            .read()
            .unwrap()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect::<Vec<_>>();
        let mut descriptors = sessions
            .iter()
            .flat_map(|session| {
                session.forwards().into_iter().map(|forward| {
                    let target = session.target();
                    ForwardDescriptor {
                        id: CompositeId::new(session.id().clone(), forward.id).to_string(),
                        session_id: session.id().to_string(),
                        user: target.user.clone(),
                        host: target.host.clone(),
                        port: target.port,
                        address: session.dial_address().to_string(),
                        local_address: forward.pair.local,
                        remote_address: forward.pair.remote,
                        bound_address: forward.bound_address.to_string(),
                    }
                })
            })
            .collect::<Vec<_>>();
        descriptors.sort_by(|a, b| {
            (&a.address, &a.local_address, &a.remote_address, &a.id).cmp(&(
                &b.address,
                &b.local_address,
                &b.remote_address,
                &b.id,
            ))
        });
        descriptors
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Re-open every persisted forward. Sessions are deduplicated by identity, so order doesn't matter.
    pub async fn restore(&self) -> RestoreReport {
        let mut report = RestoreReport::default();
        let Some(store) = &self.store else {
            return report;
        };
        let records = match store.list_all().await {
            Ok(records) => records,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                error!(%error, "Unable to read persisted forwards.");
                return report;
            }
        };
        for (stored_id, record) in records {
            let target = Target::new(record.user, record.host, record.port);
            let pair = AddressPair::new(record.local_address, record.remote_address);
            match self.open(&target, pair, &record.credentials).await {
                Ok(id) => {
                    report.restored += 1;
                    // Resolution may have changed since the record was written.
                    if id.to_string() != stored_id {
                        #[cfg(not(coverage_nightly))]
                        debug!(%stored_id, %id, "Re-keyed restored forward.");
                        self.forget(&[stored_id]).await;
                    }
                }
                Err(TunnelError::Conflict) => {
                    #[cfg(not(coverage_nightly))]
                    warn!(%stored_id, "Dropping duplicate persisted forward.");
                    self.forget(&[stored_id]).await;
                }
                Err(error) => {
                    report.failed += 1;
                    #[cfg(not(coverage_nightly))]
                    warn!(%stored_id, %target, %error, "Unable to restore forward.");
                }
            }
        }
        #[cfg(not(coverage_nightly))]
        info!(
            restored = report.restored,
            failed = report.failed,
            "Restored persisted forwards."
        );
        report
    }

    async fn persist(&self, id: &CompositeId, session: &Session, pair: &AddressPair) {
        let Some(store) = &self.store else {
            return;
        };
        let target = session.target();
        let record = ForwardRecord {
            user: target.user.clone(),
            host: target.host.clone(),
            port: target.port,
            local_address: pair.local.clone(),
            remote_address: pair.remote.clone(),
            credentials: session.credentials().clone(),
        };
        if let Err(error) = store.put(&id.to_string(), &record).await {
            #[cfg(not(coverage_nightly))]
            warn!(%id, %error, "Unable to persist forward, it won't survive a restart.");
        }
    }

    async fn forget(&self, ids: &[String]) {
        if let Some(store) = &self.store {
            if let Err(error) = store.delete(ids).await {
                #[cfg(not(coverage_nightly))]
                warn!(%error, "Unable to delete forward records.");
            }
        }
    }

    /// Clean up after forwards whose listener failed, until the registry shuts down.
    ///
    /// Their records are deleted, and their session is closed if nothing else uses it.
    pub async fn reap_failed_forwards(&self) {
        let Some(mut receiver) = self.exits.receiver.lock().unwrap().take() else {
            return;
        };
        loop {
            let exit = tokio::select! {
                _ = self.cancellation_token.cancelled() => break,
                exit = receiver.recv() => match exit {
                    Some(exit) => exit,
                    None => break,
                },
            };
            self.forward_failed(exit).await;
        }
    }

    async fn forward_failed(&self, ForwardExit { session, forward }: ForwardExit) {
        let id = CompositeId::new(session.clone(), forward.clone()).to_string();
        let current = self.lookup(&session);
        // The same pair may have been opened again since.
        if current
            .as_ref()
            .is_some_and(|current| current.has_forward(&forward))
        {
            return;
        }
        #[cfg(not(coverage_nightly))]
        warn!(%id, "Forward stopped listening, removing it.");
        self.forget(&[id]).await;
        if let Some(current) = current {
            self.close_if_empty(&current).await;
        }
    }

    /// Cancel every session and clear the registry. Persisted records are kept for the next start.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let sessions = self.drain_sessions();
        for session in sessions.iter() {
            if let Err(error) = session.close().await {
                #[cfg(not(coverage_nightly))]
                debug!(session = %session.id(), %error, "Error closing session on shutdown.");
            }
        }
    }

    /// Wait up to `grace` for every forward and connection task to finish.
    pub async fn wait(&self, grace: Duration) -> bool {
        self.tracker.close();
        timeout(grace, self.tracker.wait()).await.is_ok()
    }
}
