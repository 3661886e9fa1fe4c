use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bon::Builder;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
#[cfg(not(coverage_nightly))]
use tracing::{debug, error, info, warn};

use crate::{
    error::TunnelError,
    identity::{AddressPair, ForwardId, SessionId},
    resolver::Target,
    ssh::{BoxedStream, Credentials, Transport},
};

// Pause before accepting again when the process is out of file descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of a session. Sessions still being dialed only exist as pending registry slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Closing,
    Closed,
}

/// Snapshot of one registered forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardInfo {
    pub id: ForwardId,
    pub pair: AddressPair,
    // Actual listening address, which differs from the requested one for port 0.
    pub bound_address: SocketAddr,
}

struct ForwardEntry {
    pair: AddressPair,
    bound_address: SocketAddr,
    // Distinguishes re-registrations of the same pair, so an exiting accept loop only removes its own entry.
    instance: u64,
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

type ForwardMap = Arc<RwLock<HashMap<ForwardId, ForwardEntry>>>;

/// Notice that a forward's listener failed and the forward was dropped from its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardExit {
    pub session: SessionId,
    pub forward: ForwardId,
}

/// One authenticated connection to a remote endpoint, hosting any number of forwards.
#[derive(Builder)]
pub struct Session {
    id: SessionId,
    // User, host (as requested) and port needed to re-open this session.
    target: Target,
    dial_address: String,
    // Credentials the session was authenticated with, replayed when restoring its forwards.
    #[builder(default)]
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    cancellation_token: CancellationToken,
    // Tracker shared with the registry, for accept loops and copy tasks.
    tracker: TaskTracker,
    // Where to report forwards whose listener failed.
    exits: Option<UnboundedSender<ForwardExit>>,
    #[builder(skip = Mutex::new(SessionState::Connected))]
    state: Mutex<SessionState>,
    #[builder(skip)]
    transport_closed: AtomicBool,
    #[builder(skip)]
    next_instance: AtomicU64,
    #[builder(skip)]
    forwards: ForwardMap,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn dial_address(&self) -> &str {
        &self.dial_address
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    /// Whether this session can no longer host forwards.
    pub fn is_closed(&self) -> bool {
        self.cancellation_token.is_cancelled() || self.transport.is_closed()
    }

    /// Open a sub-connection to `address` through this session.
    pub async fn dial_through(&self, address: &str) -> Result<BoxedStream, TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Connection {
                address: self.dial_address.clone(),
                reason: "session has no live connection".into(),
            });
        }
        self.transport.open_stream(address).await
    }

    /// Bind a listener on the pair's local address and start relaying its connections.
    pub async fn add_forward(&self, pair: AddressPair) -> Result<ForwardId, TunnelError> {
        if self.cancellation_token.is_cancelled() {
            return Err(TunnelError::SessionClosed(self.id.to_string()));
        }
        let id = pair.id();
        if self.forwards.read().unwrap().contains_key(&id) {
            return Err(TunnelError::Conflict);
        }
        let listener =
            TcpListener::bind(pair.local.as_str())
                .await
                .map_err(|source| TunnelError::Bind {
                    address: pair.local.clone(),
                    source,
                })?;
        let bound_address = listener.local_addr()?;

        let mut forwards = self.forwards.write().unwrap();
        // Checked under the lock, so close() either sees this forward or we see its cancellation.
        if self.cancellation_token.is_cancelled() {
            return Err(TunnelError::SessionClosed(self.id.to_string()));
        }
        if forwards.contains_key(&id) {
            return Err(TunnelError::Conflict);
        }
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let cancellation_token = self.cancellation_token.child_token();
        let join_handle = self.tracker.spawn(accept_loop(AcceptLoop {
            listener,
            session: self.id.clone(),
            id: id.clone(),
            instance,
            remote: pair.remote.clone(),
            cancellation_token: cancellation_token.clone(),
            transport: Arc::clone(&self.transport),
            tracker: self.tracker.clone(),
            forwards: Arc::clone(&self.forwards),
            exits: self.exits.clone(),
        }));
        #[cfg(not(coverage_nightly))]
        info!(session = %self.id, %pair, %bound_address, "Forward started.");
        forwards.insert(
            id.clone(),
            ForwardEntry {
                pair,
                bound_address,
                instance,
                cancellation_token,
                join_handle,
            },
        );
        Ok(id)
    }

    /// Stop the given forward and wait for its listener to be released.
    ///
    /// Returns false if no such forward is registered, which makes repeated calls harmless.
    pub async fn remove_forward(&self, id: &ForwardId) -> bool {
        let entry = self.forwards.write().unwrap().remove(id);
        match entry {
            Some(entry) => {
                entry.cancellation_token.cancel();
                if let Err(error) = entry.join_handle.await {
                    #[cfg(not(coverage_nightly))]
                    warn!(session = %self.id, forward = %id, %error, "Accept loop ended abnormally.");
                }
                #[cfg(not(coverage_nightly))]
                info!(session = %self.id, pair = %entry.pair, "Forward removed.");
                true
            }
            None => false,
        }
    }

    pub fn count_forwards(&self) -> usize {
        self.forwards.read().unwrap().len()
    }

    pub fn has_forward(&self, id: &ForwardId) -> bool {
        self.forwards.read().unwrap().contains_key(id)
    }

    pub fn forwards(&self) -> Vec<ForwardInfo> {
        let mut forwards = self
            .forwards
            .read()
            .unwrap()
            .iter()
            .map(|(id, entry)| ForwardInfo {
                id: id.clone(),
                pair: entry.pair.clone(),
                bound_address: entry.bound_address,
            })
            .collect::<Vec<_>>();
        forwards.sort_by(|a, b| a.pair.local.cmp(&b.pair.local));
        forwards
    }

    /// Begin closing if no forwards are registered. Returns whether the session is now closing.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let forwards = self.forwards.write().unwrap();
        if !forwards.is_empty() {
            return false;
        }
        self.cancellation_token.cancel();
        self.set_closing();
        true
    }

    /// Cancel every forward and close the underlying connection.
    ///
    /// Forwards are signaled but not waited on; their tasks finish on their own.
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.cancellation_token.cancel();
        self.set_closing();
        let drained = self.forwards.write().unwrap().drain().count();
        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        #[cfg(not(coverage_nightly))]
        info!(session = %self.id, address = %self.dial_address, forwards = drained, "Closing session.");
        let result = self.transport.close().await;
        *self.state.lock().unwrap() = SessionState::Closed;
        result
    }

    fn set_closing(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Connected {
            *state = SessionState::Closing;
        }
    }

    // Stop a forward the way a failing listener does, without going through remove_forward.
    #[cfg(test)]
    pub(crate) fn fail_forward(&self, id: &ForwardId) {
        let instance = {
            let forwards = self.forwards.read().unwrap();
            let Some(entry) = forwards.get(id) else {
                return;
            };
            entry.cancellation_token.cancel();
            entry.instance
        };
        deregister_failed(&self.forwards, self.exits.as_ref(), &self.id, id, instance);
    }
}

struct AcceptLoop {
    listener: TcpListener,
    session: SessionId,
    id: ForwardId,
    instance: u64,
    remote: String,
    cancellation_token: CancellationToken,
    transport: Arc<dyn Transport>,
    tracker: TaskTracker,
    forwards: ForwardMap,
    exits: Option<UnboundedSender<ForwardExit>>,
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

// Running out of descriptors or buffers is recoverable once other connections close.
fn is_resource_exhaustion(error: &io::Error) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;

        if let Some(code) = error.raw_os_error() {
            return matches!(
                Errno::from_raw(code),
                Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM
            );
        }
    }
    error.kind() == io::ErrorKind::OutOfMemory
}

// Remove a forward whose accept loop stopped on its own, and report it if it was still registered.
fn deregister_failed(
    forwards: &ForwardMap,
    exits: Option<&UnboundedSender<ForwardExit>>,
    session: &SessionId,
    id: &ForwardId,
    instance: u64,
) {
    let removed = {
        let mut forwards = forwards.write().unwrap();
        if forwards
            .get(id)
            .is_some_and(|entry| entry.instance == instance)
        {
            forwards.remove(id).is_some()
        } else {
            false
        }
    };
    if removed {
        if let Some(exits) = exits {
            let _ = exits.send(ForwardExit {
                session: session.clone(),
                forward: id.clone(),
            });
        }
    }
}

async fn accept_loop(
    AcceptLoop {
        listener,
        session,
        id,
        instance,
        remote,
        cancellation_token,
        transport,
        tracker,
        forwards,
        exits,
    }: AcceptLoop,
) {
    let mut failed = false;
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        #[cfg(not(coverage_nightly))]
                        warn!(%peer, %error, "Error setting nodelay.");
                    }
                    tracker.spawn(relay_connection(
                        stream,
                        peer,
                        remote.clone(),
                        Arc::clone(&transport),
                        cancellation_token.clone(),
                    ));
                }
                Err(error) if is_transient(&error) => {
                    #[cfg(not(coverage_nightly))]
                    warn!(forward = %id, %error, "Error accepting connection.");
                }
                Err(error) if is_resource_exhaustion(&error) => {
                    #[cfg(not(coverage_nightly))]
                    warn!(forward = %id, %error, "Out of resources accepting connection, backing off.");
                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = sleep(ACCEPT_BACKOFF) => {}
                    }
                }
                Err(error) => {
                    #[cfg(not(coverage_nightly))]
                    error!(forward = %id, %error, "Error listening on forward, closing it.");
                    failed = true;
                    break;
                }
            }
        }
    }
    drop(listener);
    if failed {
        deregister_failed(&forwards, exits.as_ref(), &session, &id, instance);
    } else {
        // Cancelled, either by remove_forward (entry gone already) or by the session closing.
        let mut forwards = forwards.write().unwrap();
        if forwards
            .get(&id)
            .is_some_and(|entry| entry.instance == instance)
        {
            forwards.remove(&id);
        }
    }
}

// Copy data between an accepted connection and a stream opened through the transport.
async fn relay_connection(
    mut local: TcpStream,
    peer: SocketAddr,
    remote: String,
    transport: Arc<dyn Transport>,
    cancellation_token: CancellationToken,
) {
    let mut upstream = tokio::select! {
        _ = cancellation_token.cancelled() => return,
        result = transport.open_stream(&remote) => match result {
            Ok(upstream) => upstream,
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                warn!(%peer, %remote, %error, "Unable to reach remote address.");
                return;
            }
        },
    };
    tokio::select! {
        // Returning drops both streams, which unblocks the other side.
        _ = cancellation_token.cancelled() => {
            #[cfg(not(coverage_nightly))]
            debug!(%peer, %remote, "Connection cancelled.");
        }
        result = copy_bidirectional(&mut local, &mut upstream) => match result {
            Ok((sent, received)) => {
                #[cfg(not(coverage_nightly))]
                debug!(%peer, %remote, sent, received, "Connection finished.");
            }
            Err(error) => {
                #[cfg(not(coverage_nightly))]
                debug!(%peer, %remote, %error, "Connection closed with error.");
            }
        },
    }
}
