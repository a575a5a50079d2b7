//! Bounded pool of reusable browser sessions.
//!
//! Slots live in an arena addressed by [`SlotId`] and are never removed while
//! the environment is connected; only their session handle is dropped when an
//! idle slot outlives the grace period. All slot mutation happens under one
//! mutex and never across an `.await`, so acquire, release and idle expiry are
//! atomic with respect to each other.
//!
//! The pool never queues for slots: when every slot is busy and capacity is
//! reached, [`SessionPool::acquire`] fails immediately with
//! [`PoolError::Exhausted`]. Opening sessions is serialized, and consecutive
//! open failures back off exponentially before the next attempt.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::{sync::Mutex as AsyncMutex, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::automation::{AutomationEnvironment, AutomationError, BrowserSession};
use crate::util::lock::mutex_lock;

const LOCK_TARGET: &str = "application::pool";
const OPEN_BACKOFF_BASE: Duration = Duration::from_secs(1);
const OPEN_BACKOFF_CAP: Duration = Duration::from_secs(5);
const OPEN_FAILURE_ALERT: u32 = 3;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: NonZeroUsize,
    /// Delay after release before an idle slot's session is closed.
    pub idle_grace: Duration,
    pub open_timeout: Duration,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("all {capacity} sessions are busy, cannot create more")]
    Exhausted { capacity: usize },
    #[error("could not open browser session: {0}")]
    SessionOpen(AutomationError),
    #[error("automation environment disconnected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct IdleTimer {
    token: u64,
    task: JoinHandle<()>,
}

impl IdleTimer {
    fn cancel(self) {
        self.task.abort();
    }
}

#[derive(Default)]
struct Slot {
    busy: bool,
    handle: Option<Arc<dyn BrowserSession>>,
    idle_timer: Option<IdleTimer>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    next_timer_token: u64,
    disconnected: bool,
}

impl PoolState {
    fn publish_gauges(&self) {
        let busy = self.slots.iter().filter(|slot| slot.busy).count();
        gauge!("jsbrain_pool_slots").set(self.slots.len() as f64);
        gauge!("jsbrain_pool_busy").set(busy as f64);
    }
}

/// Consecutive session-open failures, guarded by the open gate.
#[derive(Debug, Default)]
struct OpenGate {
    consecutive_failures: u32,
}

/// `base * 2^(failures - 1)`, capped; zero when the last open succeeded.
fn open_backoff(consecutive_failures: u32) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (consecutive_failures - 1).min(16);
    OPEN_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(OPEN_BACKOFF_CAP)
}

struct PoolShared {
    environment: Arc<dyn AutomationEnvironment>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    open_gate: AsyncMutex<OpenGate>,
}

/// Point-in-time view of one slot, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub busy: bool,
    pub has_handle: bool,
    pub idle_timer_pending: bool,
}

enum Reservation {
    Ready(SlotId, Arc<dyn BrowserSession>),
    NeedsHandle(PendingSlot),
}

/// A reserved slot still waiting for its session. Dropping it before
/// [`PendingSlot::fulfil`] hands the slot back idle.
struct PendingSlot {
    pool: SessionPool,
    slot: SlotId,
    armed: bool,
}

impl PendingSlot {
    fn fulfil(mut self, session: Arc<dyn BrowserSession>) -> Option<SessionLease> {
        self.armed = false;
        if self.pool.install_handle(self.slot, Arc::clone(&session)) {
            Some(SessionLease::new(self.pool.clone(), self.slot, session))
        } else {
            None
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_reservation(self.slot);
        }
    }
}

#[derive(Clone)]
pub struct SessionPool {
    shared: Arc<PoolShared>,
}

impl SessionPool {
    pub fn new(environment: Arc<dyn AutomationEnvironment>, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                environment,
                config,
                state: Mutex::new(PoolState::default()),
                open_gate: AsyncMutex::new(OpenGate::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.config.capacity.get()
    }

    /// Hand out an idle slot, creating one if capacity allows.
    ///
    /// The slot is reserved synchronously; only (re-)establishing its session
    /// suspends, and the reservation keeps other callers off the slot meanwhile.
    /// Dropping the returned future mid-open gives the slot back.
    pub async fn acquire(&self) -> Result<SessionLease, PoolError> {
        let pending = match self.reserve()? {
            Reservation::Ready(slot, session) => {
                debug!(
                    target = "application::pool",
                    op = "pool::acquire",
                    slot = slot.index(),
                    session = session.id(),
                    result = "reused",
                    "Reusing idle browser session"
                );
                return Ok(SessionLease::new(self.clone(), slot, session));
            }
            Reservation::NeedsHandle(pending) => pending,
        };
        let slot = pending.slot;

        let started_at = Instant::now();
        let session = self.open_serialized(slot).await?;
        counter!("jsbrain_pool_sessions_opened_total").increment(1);
        let session_id = session.id().to_string();
        let Some(lease) = pending.fulfil(Arc::clone(&session)) else {
            self.close_detached(session);
            return Err(PoolError::Disconnected);
        };
        info!(
            target = "application::pool",
            op = "pool::acquire",
            slot = slot.index(),
            session = session_id,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            result = "opened",
            "Opened browser session for slot"
        );
        Ok(lease)
    }

    /// Open one session at a time, backing off after consecutive failures.
    async fn open_serialized(&self, slot: SlotId) -> Result<Arc<dyn BrowserSession>, PoolError> {
        let mut gate = self.shared.open_gate.lock().await;

        let delay = open_backoff(gate.consecutive_failures);
        if !delay.is_zero() {
            debug!(
                target = "application::pool",
                op = "pool::open",
                slot = slot.index(),
                consecutive_failures = gate.consecutive_failures,
                backoff_ms = delay.as_millis() as u64,
                "Backing off before opening browser session"
            );
            tokio::time::sleep(delay).await;
        }

        let timeout = self.shared.config.open_timeout;
        let opened = tokio::time::timeout(timeout, self.shared.environment.open_session())
            .await
            .unwrap_or(Err(AutomationError::Timeout(timeout)));

        match opened {
            Ok(session) => {
                gate.consecutive_failures = 0;
                Ok(session)
            }
            Err(err) => {
                gate.consecutive_failures = gate.consecutive_failures.saturating_add(1);
                counter!("jsbrain_pool_open_failures_total").increment(1);
                if gate.consecutive_failures >= OPEN_FAILURE_ALERT {
                    error!(
                        target = "application::pool",
                        op = "pool::open",
                        slot = slot.index(),
                        consecutive_failures = gate.consecutive_failures,
                        error = %err,
                        "Repeated browser session failures; the browser may need a restart"
                    );
                } else {
                    warn!(
                        target = "application::pool",
                        op = "pool::open",
                        slot = slot.index(),
                        consecutive_failures = gate.consecutive_failures,
                        result = "error",
                        error = %err,
                        "Failed to open browser session"
                    );
                }
                Err(PoolError::SessionOpen(err))
            }
        }
    }

    /// Consecutive open failures since the last successful open.
    pub async fn open_failures(&self) -> u32 {
        self.shared.open_gate.lock().await.consecutive_failures
    }

    fn reserve(&self) -> Result<Reservation, PoolError> {
        let mut state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::reserve");
        if state.disconnected {
            return Err(PoolError::Disconnected);
        }

        if let Some(index) = state.slots.iter().position(|slot| !slot.busy) {
            let slot = &mut state.slots[index];
            if let Some(timer) = slot.idle_timer.take() {
                timer.cancel();
            }
            slot.busy = true;
            let reservation = match slot.handle.clone() {
                Some(handle) => Reservation::Ready(SlotId(index), handle),
                None => Reservation::NeedsHandle(self.pending(SlotId(index))),
            };
            state.publish_gauges();
            return Ok(reservation);
        }

        let capacity = self.capacity();
        if state.slots.len() >= capacity {
            counter!("jsbrain_pool_exhausted_total").increment(1);
            return Err(PoolError::Exhausted { capacity });
        }

        state.slots.push(Slot {
            busy: true,
            ..Slot::default()
        });
        let id = SlotId(state.slots.len() - 1);
        state.publish_gauges();
        Ok(Reservation::NeedsHandle(self.pending(id)))
    }

    fn pending(&self, slot: SlotId) -> PendingSlot {
        PendingSlot {
            pool: self.clone(),
            slot,
            armed: true,
        }
    }

    /// Returns `false` when the pool was torn down while the session opened.
    fn install_handle(&self, slot: SlotId, session: Arc<dyn BrowserSession>) -> bool {
        let mut state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::install_handle");
        if state.disconnected {
            return false;
        }
        match state.slots.get_mut(slot.0) {
            Some(entry) => {
                entry.handle = Some(session);
                true
            }
            None => false,
        }
    }

    fn abandon_reservation(&self, slot: SlotId) {
        let mut state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::abandon");
        if let Some(entry) = state.slots.get_mut(slot.0) {
            entry.busy = false;
        }
        state.publish_gauges();
    }

    /// Mark `slot` idle and arm its reclamation timer.
    fn release(&self, slot: SlotId) {
        let mut state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::release");
        if state.disconnected {
            return;
        }
        let token = state.next_timer_token;
        state.next_timer_token = state.next_timer_token.wrapping_add(1);

        let grace = self.shared.config.idle_grace;
        let weak = Arc::downgrade(&self.shared);
        let Some(entry) = state.slots.get_mut(slot.0) else {
            return;
        };
        entry.busy = false;
        if let Some(stale) = entry.idle_timer.take() {
            stale.cancel();
        }

        if entry.handle.is_some() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let task = runtime.spawn(reclaim_after(weak, slot, token, grace));
                    entry.idle_timer = Some(IdleTimer { token, task });
                }
                Err(_) => {
                    // No runtime to run the timer on; drop the session now.
                    entry.handle = None;
                }
            }
        }
        state.publish_gauges();

        debug!(
            target = "application::pool",
            op = "pool::release",
            slot = slot.index(),
            idle_grace_ms = grace.as_millis() as u64,
            "Released browser session slot"
        );
    }

    /// Discard every slot after the automation environment went away.
    ///
    /// Handles are dropped without being closed; there is nothing left to close
    /// them against. The pool rejects all later acquisitions.
    pub fn on_environment_disconnected(&self) -> usize {
        let mut state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::disconnected");
        state.disconnected = true;
        let discarded = state.slots.len();
        for slot in state.slots.drain(..) {
            if let Some(timer) = slot.idle_timer {
                timer.cancel();
            }
        }
        state.publish_gauges();
        warn!(
            target = "application::pool",
            op = "pool::on_environment_disconnected",
            discarded,
            "Automation environment disconnected; discarded all session slots"
        );
        discarded
    }

    /// Close every open session. Used when a worker shuts down cleanly.
    pub async fn close_all(&self) {
        let handles: Vec<Arc<dyn BrowserSession>> = {
            let mut state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::close_all");
            state.disconnected = true;
            let handles = state
                .slots
                .drain(..)
                .filter_map(|slot| {
                    if let Some(timer) = slot.idle_timer {
                        timer.cancel();
                    }
                    slot.handle
                })
                .collect();
            state.publish_gauges();
            handles
        };

        for handle in handles {
            let session_id = handle.id().to_string();
            if let Err(err) = self.shared.environment.close_session(handle).await {
                warn!(
                    target = "application::pool",
                    op = "pool::close_all",
                    session = session_id,
                    error = %err,
                    "Failed to close browser session during shutdown"
                );
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        let state = mutex_lock(&self.shared.state, LOCK_TARGET, "pool::snapshot");
        state
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| SlotSnapshot {
                id: SlotId(index),
                busy: slot.busy,
                has_handle: slot.handle.is_some(),
                idle_timer_pending: slot.idle_timer.is_some(),
            })
            .collect()
    }

    fn close_detached(&self, session: Arc<dyn BrowserSession>) {
        let environment = Arc::clone(&self.shared.environment);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let _ = environment.close_session(session).await;
            });
        }
    }
}

async fn reclaim_after(shared: Weak<PoolShared>, slot: SlotId, token: u64, grace: Duration) {
    tokio::time::sleep(grace).await;

    let Some(shared) = shared.upgrade() else {
        return;
    };

    let handle = {
        let mut state = mutex_lock(&shared.state, LOCK_TARGET, "pool::reclaim");
        let Some(entry) = state.slots.get_mut(slot.0) else {
            return;
        };
        let armed = matches!(&entry.idle_timer, Some(timer) if timer.token == token);
        if !armed || entry.busy {
            return;
        }
        entry.idle_timer = None;
        entry.handle.take()
    };

    let Some(handle) = handle else {
        return;
    };
    let session_id = handle.id().to_string();
    counter!("jsbrain_pool_sessions_reclaimed_total").increment(1);
    match shared.environment.close_session(handle).await {
        Ok(()) => info!(
            target = "application::pool",
            op = "pool::reclaim",
            slot = slot.index(),
            session = session_id,
            "Closed idle browser session after grace period"
        ),
        Err(err) => warn!(
            target = "application::pool",
            op = "pool::reclaim",
            slot = slot.index(),
            session = session_id,
            error = %err,
            "Failed to close idle browser session"
        ),
    }
}

/// Exclusive use of one slot. Dropping the lease returns the slot to the pool.
pub struct SessionLease {
    pool: SessionPool,
    slot: SlotId,
    session: Arc<dyn BrowserSession>,
    released: bool,
}

impl SessionLease {
    fn new(pool: SessionPool, slot: SlotId, session: Arc<dyn BrowserSession>) -> Self {
        Self {
            pool,
            slot,
            session,
            released: false,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn session(&self) -> &dyn BrowserSession {
        self.session.as_ref()
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release(self.slot);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("slot", &self.slot)
            .field("session", &self.session.id())
            .finish()
    }
}
