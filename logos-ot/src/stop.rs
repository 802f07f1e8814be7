//! Freezing remote users while the host rewrites their documents.
//!
//! ```text
//!  initiator (host)                         affected user
//!  ────────────────                         ─────────────
//!  stop() ── Lock/Initiated ─────────────►  block all Blockables (first lock)
//!         ◄──────────── Lock/Acknowledged ─
//!  returns StartHandle
//!  ... recovery ...
//!  start() ─ Unlock/Initiated ───────────►  unblock (last lock released)
//!  await   ◄────────── Unlock/Acknowledged ─
//! ```
//!
//! Locks accumulate per user. Every `stop` hands out its own single-use
//! [`StartHandle`]; a user runs again only once every handle is started.
//! Acknowledgements arrive on `watch` channels that the waits race against a
//! deadline and the caller's [`CancellationToken`](crate::progress::CancellationToken).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::jupiter::SiteId;
use crate::progress::ProgressMonitor;
use crate::protocol::{Activity, ProtocolError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopKind {
    Lock,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StopState {
    Initiated,
    Acknowledged,
}

/// One leg of the stop/start handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopActivity {
    /// Identifies the lock, unique per initiator.
    pub id: u64,
    pub initiator: SiteId,
    pub affected: SiteId,
    pub kind: StopKind,
    pub state: StopState,
    pub cause: String,
}

impl StopActivity {
    fn acknowledgement(&self) -> Self {
        Self {
            state: StopState::Acknowledged,
            ..self.clone()
        }
    }

    /// Where this leg travels: requests to the affected user, acknowledgements back.
    fn destination(&self) -> SiteId {
        match self.state {
            StopState::Initiated => self.affected,
            StopState::Acknowledged => self.initiator,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("user {user} did not acknowledge {kind:?} within {waited:?}")]
    Timeout {
        user: SiteId,
        kind: StopKind,
        waited: Duration,
    },
    #[error("waiting for acknowledgement was cancelled")]
    Cancelled,
    #[error("start handle {0} was already started")]
    AlreadyStarted(u64),
    #[error("start handle {0} has not been started")]
    NotStarted(u64),
    #[error("the local user cannot be stopped")]
    LocalUser,
    #[error(transparent)]
    Transport(#[from] ProtocolError),
}

/// Something that must not produce activities while its user is stopped.
///
/// Called with the stop manager's ledger locked, so implementations must not
/// call back into the manager.
pub trait Blockable: Send + Sync {
    fn block(&self);
    fn unblock(&self);
}

#[derive(Default)]
struct Ledger {
    /// Initiator side: unstarted handle ids per stopped user.
    outstanding: HashMap<SiteId, HashSet<u64>>,
    /// Initiator side: acknowledgements still expected.
    acks: HashMap<(u64, StopKind), (SiteId, watch::Sender<bool>)>,
    /// Affected side: locks held on us, by (initiator, id).
    held: HashSet<(SiteId, u64)>,
}

impl Ledger {
    fn expect_ack(&mut self, user: SiteId, id: u64, kind: StopKind) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.acks.insert((id, kind), (user, tx));
        rx
    }
}

struct Shared {
    local: SiteId,
    transport: Arc<dyn Transport>,
    stop_timeout: Duration,
    start_timeout: Duration,
    next_id: AtomicU64,
    ledger: Mutex<Ledger>,
    blockables: Mutex<Vec<Arc<dyn Blockable>>>,
}

impl Shared {
    fn send(&self, activity: StopActivity) -> Result<(), ProtocolError> {
        self.transport
            .send(activity.destination(), Activity::Stop(activity))
    }

    fn set_blocked(&self, blocked: bool) {
        for blockable in self.blockables.lock().iter() {
            if blocked {
                blockable.block();
            } else {
                blockable.unblock();
            }
        }
    }
}

/// Session-wide stop/start coordinator. Cheap to clone.
#[derive(Clone)]
pub struct StopManager {
    shared: Arc<Shared>,
}

impl StopManager {
    pub fn new(
        local: SiteId,
        transport: Arc<dyn Transport>,
        stop_timeout: Duration,
        start_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                transport,
                stop_timeout,
                start_timeout,
                next_id: AtomicU64::new(1),
                ledger: Mutex::new(Ledger::default()),
                blockables: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn local_site(&self) -> SiteId {
        self.shared.local
    }

    /// Register a blockable; it is blocked right away if a lock is held.
    pub fn add_blockable(&self, blockable: Arc<dyn Blockable>) {
        let ledger = self.shared.ledger.lock();
        if !ledger.held.is_empty() {
            blockable.block();
        }
        self.shared.blockables.lock().push(blockable);
    }

    pub fn remove_blockable(&self, blockable: &Arc<dyn Blockable>) {
        self.shared
            .blockables
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, blockable));
    }

    /// Whether `user` has unstarted handles issued by this manager.
    pub fn is_blocked(&self, user: SiteId) -> bool {
        self.shared
            .ledger
            .lock()
            .outstanding
            .get(&user)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// Whether some remote initiator currently holds a lock on us.
    pub fn is_locally_blocked(&self) -> bool {
        !self.shared.ledger.lock().held.is_empty()
    }

    /// Freeze `users` and wait until each of them acknowledged.
    ///
    /// On timeout or cancellation every lock issued by this call is released
    /// again before the error is returned. The same happens when the returned
    /// future is dropped before it completes.
    pub async fn stop(
        &self,
        users: &[SiteId],
        cause: &str,
        monitor: &dyn ProgressMonitor,
    ) -> Result<Vec<StartHandle>, StopError> {
        if users.contains(&self.shared.local) {
            return Err(StopError::LocalUser);
        }

        let mut pending = PendingStop {
            handles: Vec::with_capacity(users.len()),
        };
        let mut waits = Vec::with_capacity(users.len());
        for &user in users {
            let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
            let ack = {
                let mut ledger = self.shared.ledger.lock();
                ledger.outstanding.entry(user).or_default().insert(id);
                ledger.expect_ack(user, id, StopKind::Lock)
            };
            pending
                .handles
                .push(StartHandle::new(self.shared.clone(), user, id, cause));
            waits.push((user, ack));

            let lock = StopActivity {
                id,
                initiator: self.shared.local,
                affected: user,
                kind: StopKind::Lock,
                state: StopState::Initiated,
                cause: cause.to_string(),
            };
            self.shared.send(lock)?;
        }

        monitor.subtask(&format!("waiting for {} user(s) to stop", users.len()));
        let deadline = Instant::now() + self.shared.stop_timeout;
        for (user, ack) in waits {
            match wait_for_ack(ack, deadline, monitor).await {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("stop of {user} timed out ({cause})");
                    return Err(StopError::Timeout {
                        user,
                        kind: StopKind::Lock,
                        waited: self.shared.stop_timeout,
                    });
                }
                Err(err) => {
                    log::info!("stop cancelled ({cause})");
                    return Err(err);
                }
            }
        }

        log::info!("stopped {} user(s): {cause}", users.len());
        Ok(pending.finish())
    }

    /// Process an incoming stop activity from `source`.
    pub fn handle_activity(&self, source: SiteId, activity: StopActivity) -> Result<(), StopError> {
        match activity.state {
            StopState::Initiated => self.handle_request(source, activity),
            StopState::Acknowledged => {
                self.handle_acknowledgement(activity);
                Ok(())
            }
        }
    }

    /// Forget everything involving a user who left the session.
    pub fn remove_user(&self, user: SiteId) {
        let mut ledger = self.shared.ledger.lock();
        ledger.outstanding.remove(&user);
        ledger.acks.retain(|_, (site, _)| *site != user);

        let was_blocked = !ledger.held.is_empty();
        ledger.held.retain(|(initiator, _)| *initiator != user);
        if was_blocked && ledger.held.is_empty() {
            log::info!("released locks held by departed user {user}");
            self.shared.set_blocked(false);
        }
    }

    /// Drop all state at session end, unblocking local blockables.
    pub fn dispose(&self) {
        let mut ledger = self.shared.ledger.lock();
        let was_blocked = !ledger.held.is_empty();
        *ledger = Ledger::default();
        if was_blocked {
            self.shared.set_blocked(false);
        }
        drop(ledger);
        self.shared.blockables.lock().clear();
    }

    fn handle_request(&self, source: SiteId, activity: StopActivity) -> Result<(), StopError> {
        if activity.affected != self.shared.local {
            log::warn!(
                "ignoring {:?} #{} from {source} addressed to {}",
                activity.kind,
                activity.id,
                activity.affected
            );
            return Ok(());
        }

        {
            let mut ledger = self.shared.ledger.lock();
            let key = (activity.initiator, activity.id);
            match activity.kind {
                StopKind::Lock => {
                    let was_free = ledger.held.is_empty();
                    ledger.held.insert(key);
                    if was_free {
                        self.shared.set_blocked(true);
                    }
                }
                StopKind::Unlock => {
                    if ledger.held.remove(&key) && ledger.held.is_empty() {
                        self.shared.set_blocked(false);
                    }
                }
            }
        }
        log::info!(
            "{:?} #{} by {source}: {}",
            activity.kind,
            activity.id,
            activity.cause
        );

        self.shared.send(activity.acknowledgement())?;
        Ok(())
    }

    fn handle_acknowledgement(&self, activity: StopActivity) {
        if activity.initiator != self.shared.local {
            log::warn!("ignoring acknowledgement of foreign stop #{}", activity.id);
            return;
        }
        let pending = self
            .shared
            .ledger
            .lock()
            .acks
            .remove(&(activity.id, activity.kind));
        match pending {
            Some((_, ack)) => {
                ack.send_replace(true);
            }
            None => log::debug!("late acknowledgement of {:?} #{}", activity.kind, activity.id),
        }
    }
}

/// Handles issued by a `stop` call that has not returned them yet.
///
/// Dropping it starts every handle still in `Created`.
struct PendingStop {
    handles: Vec<StartHandle>,
}

impl PendingStop {
    fn finish(mut self) -> Vec<StartHandle> {
        std::mem::take(&mut self.handles)
    }
}

impl Drop for PendingStop {
    fn drop(&mut self) {
        for handle in &self.handles {
            if handle.state() != StartHandleState::Created {
                continue;
            }
            if let Err(err) = handle.start() {
                log::warn!("failed to release stop #{} on {}: {err}", handle.id, handle.user);
            }
        }
    }
}

/// Resolve once `ack` turns true, the deadline passes, or the caller cancels.
async fn wait_for_ack(
    mut ack: watch::Receiver<bool>,
    deadline: Instant,
    monitor: &dyn ProgressMonitor,
) -> Result<bool, StopError> {
    let acknowledged = async move { ack.wait_for(|acked| *acked).await.is_ok() };
    tokio::select! {
        biased;
        _ = monitor.cancel_token().cancelled() => Err(StopError::Cancelled),
        outcome = tokio::time::timeout_at(deadline, acknowledged) => Ok(outcome.unwrap_or(false)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartHandleState {
    Created,
    Started,
    Acknowledged,
}

/// Single-use permission to resume one stopped user.
pub struct StartHandle {
    shared: Arc<Shared>,
    user: SiteId,
    id: u64,
    cause: String,
    state: Mutex<StartHandleState>,
    ack: Mutex<Option<watch::Receiver<bool>>>,
}

impl std::fmt::Debug for StartHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartHandle")
            .field("user", &self.user)
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl StartHandle {
    fn new(shared: Arc<Shared>, user: SiteId, id: u64, cause: &str) -> Self {
        Self {
            shared,
            user,
            id,
            cause: cause.to_string(),
            state: Mutex::new(StartHandleState::Created),
            ack: Mutex::new(None),
        }
    }

    pub fn user(&self) -> SiteId {
        self.user
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> StartHandleState {
        *self.state.lock()
    }

    /// Release this lock. Returns whether it was the user's last one.
    pub fn start(&self) -> Result<bool, StopError> {
        {
            let mut state = self.state.lock();
            if *state != StartHandleState::Created {
                return Err(StopError::AlreadyStarted(self.id));
            }
            *state = StartHandleState::Started;
        }

        let (last, ack) = {
            let mut ledger = self.shared.ledger.lock();
            ledger.acks.remove(&(self.id, StopKind::Lock));
            let last = match ledger.outstanding.get_mut(&self.user) {
                Some(ids) => {
                    ids.remove(&self.id);
                    ids.is_empty()
                }
                None => true,
            };
            if last {
                ledger.outstanding.remove(&self.user);
            }
            (last, ledger.expect_ack(self.user, self.id, StopKind::Unlock))
        };
        *self.ack.lock() = Some(ack);

        self.shared.send(StopActivity {
            id: self.id,
            initiator: self.shared.local,
            affected: self.user,
            kind: StopKind::Unlock,
            state: StopState::Initiated,
            cause: self.cause.clone(),
        })?;
        log::debug!("started {} (#{}, last: {last})", self.user, self.id);
        Ok(last)
    }

    /// Wait until the user confirmed it resumed. `Ok(false)` on timeout.
    pub async fn await_acknowledged(&self, monitor: &dyn ProgressMonitor) -> Result<bool, StopError> {
        let state = self.state();
        let ack = match state {
            StartHandleState::Created => return Err(StopError::NotStarted(self.id)),
            StartHandleState::Acknowledged => return Ok(true),
            StartHandleState::Started => self.ack.lock().clone(),
        };
        let Some(ack) = ack else {
            return Ok(false);
        };

        monitor.subtask(&format!("waiting for {} to resume", self.user));
        let deadline = Instant::now() + self.shared.start_timeout;
        let acknowledged = wait_for_ack(ack, deadline, monitor).await?;
        if acknowledged {
            *self.state.lock() = StartHandleState::Acknowledged;
        } else {
            log::warn!("{} did not acknowledge resume #{}", self.user, self.id);
        }
        Ok(acknowledged)
    }

    pub async fn start_and_await(&self, monitor: &dyn ProgressMonitor) -> Result<bool, StopError> {
        self.start()?;
        self.await_acknowledged(monitor).await
    }
}
