//! Message router between the sidebar and studio surfaces
//!
//! Exactly two endpoints exist. Sidebar-origin messages go to the studio
//! surface, or wait in a queue for up to [`QUEUE_TTL`] if it is not open yet.
//! Studio-origin messages go to the sidebar, and are discarded with a warning
//! when no sidebar is registered.
//!
//! Every delivery arms an ack waiter. If the receiving side does not send an
//! `ack` for that id within [`ACK_TIMEOUT`], a warning is logged. Nothing is
//! retried; delivery is at-least-once only in the sense of the queue.

use crate::{BusMessage, DeliveryWarning, EndpointError, Source};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Maximum age of a queued message at flush time
pub const QUEUE_TTL: Duration = Duration::from_millis(30_000);
/// How long a delivered message may go unacknowledged before a warning
pub const ACK_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Called by a surface when it goes away on its own
pub type DisposeHook = Box<dyn FnOnce() + Send + 'static>;

/// A UI surface the router can post to
pub trait Endpoint: Send + Sync {
    /// Hand a message to the surface. Errors mean the surface is unusable.
    fn post(&self, message: &BusMessage) -> Result<(), EndpointError>;

    /// Store `hook` and run it when the surface is disposed. Surfaces that
    /// cannot observe their own disposal may ignore it.
    fn on_dispose(&self, hook: DisposeHook) {
        drop(hook);
    }
}

/// A sidebar-origin message waiting for the studio surface
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub message: BusMessage,
    pub enqueued_at: Instant,
}

impl QueuedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.enqueued_at) >= QUEUE_TTL
    }
}

/// Pending acknowledgment for one delivered message
#[derive(Debug)]
struct AckWaiter {
    kind: String,
    timer: AbortHandle,
}

struct StudioSlot {
    endpoint: Weak<dyn Endpoint>,
    generation: u64,
}

#[derive(Default)]
struct RouterState {
    sidebar: Option<Weak<dyn Endpoint>>,
    studio: Option<StudioSlot>,
    /// Bumped on every studio (un)registration so stale dispose hooks are inert
    studio_generation: u64,
    queue: VecDeque<QueuedEntry>,
    waiters: HashMap<String, AckWaiter>,
}

impl RouterState {
    fn live_sidebar(&mut self) -> Option<Arc<dyn Endpoint>> {
        let endpoint = self.sidebar.as_ref()?.upgrade();
        if endpoint.is_none() {
            debug!("sidebar endpoint dropped, clearing registration");
            self.sidebar = None;
        }
        endpoint
    }

    fn live_studio(&mut self) -> Option<Arc<dyn Endpoint>> {
        let endpoint = self.studio.as_ref()?.endpoint.upgrade();
        if endpoint.is_none() {
            debug!("studio endpoint dropped, clearing registration");
            self.clear_studio();
        }
        endpoint
    }

    fn clear_studio(&mut self) {
        self.studio = None;
        self.studio_generation += 1;
    }
}

/// Routes [`BusMessage`]s between the two surfaces.
///
/// Cloning yields another handle to the same router. Endpoints are held
/// weakly; dropping the last `Arc` to a surface counts as unregistering it.
#[derive(Clone, Default)]
pub struct MessageRouter {
    state: Arc<Mutex<RouterState>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the sidebar surface, replacing any previous one.
    pub fn register_sidebar(&self, endpoint: Arc<dyn Endpoint>) {
        self.lock().sidebar = Some(Arc::downgrade(&endpoint));
        debug!("sidebar endpoint registered");
    }

    pub fn unregister_sidebar(&self) {
        self.lock().sidebar = None;
    }

    /// Register the studio surface, replacing any previous one, and flush
    /// the queue into it.
    pub fn register_studio(&self, endpoint: Arc<dyn Endpoint>) {
        let generation = {
            let mut state = self.lock();
            state.studio_generation += 1;
            let generation = state.studio_generation;
            state.studio = Some(StudioSlot {
                endpoint: Arc::downgrade(&endpoint),
                generation,
            });
            generation
        };
        debug!(generation, "studio endpoint registered");

        let router = Arc::downgrade(&self.state);
        endpoint.on_dispose(Box::new(move || {
            if let Some(state) = router.upgrade() {
                MessageRouter { state }.unregister_studio_generation(generation);
            }
        }));

        self.flush();
    }

    /// Clear the studio registration. Idempotent.
    pub fn unregister_studio(&self) {
        let mut state = self.lock();
        if state.studio.is_some() {
            debug!("studio endpoint unregistered");
        }
        state.clear_studio();
    }

    fn unregister_studio_generation(&self, generation: u64) {
        let mut state = self.lock();
        let current = state.studio.as_ref().map(|slot| slot.generation);
        if current == Some(generation) {
            debug!(generation, "studio endpoint disposed");
            state.clear_studio();
        }
    }

    /// Route a message. Returns the message id, generating one if missing.
    pub fn send(&self, mut message: BusMessage) -> String {
        let id = message.ensure_id().to_string();

        if message.is_ack() {
            let acked = message.acked_id().to_string();
            if self.cancel_ack(&acked) {
                trace!(id = %acked, "ack received");
            } else {
                trace!(id = %acked, "ack for unknown or expired message");
            }
            return id;
        }

        match message.source {
            Source::Sidebar => {
                let studio = self.lock().live_studio();
                match studio {
                    Some(studio) => {
                        if let Err(e) = self.deliver(studio.as_ref(), &message, Source::Studio) {
                            warn!("{}", e);
                        }
                    }
                    None => {
                        trace!(id = %id, kind = %message.kind, "studio absent, queueing");
                        self.lock().queue.push_back(QueuedEntry {
                            message,
                            enqueued_at: Instant::now(),
                        });
                    }
                }
            }
            Source::Studio => {
                let sidebar = self.lock().live_sidebar();
                match sidebar {
                    Some(sidebar) => {
                        if let Err(e) = self.deliver(sidebar.as_ref(), &message, Source::Sidebar) {
                            warn!("{}", e);
                        }
                    }
                    None => {
                        warn!(
                            "{}",
                            DeliveryWarning::Discarded {
                                kind: message.kind,
                                id: id.clone(),
                            }
                        );
                    }
                }
            }
        }

        id
    }

    /// Post to `endpoint`, arming the ack waiter first so a synchronous ack
    /// from inside `post` finds it.
    fn deliver(
        &self,
        endpoint: &dyn Endpoint,
        message: &BusMessage,
        target: Source,
    ) -> Result<(), DeliveryWarning> {
        self.arm_ack_waiter(message);
        match endpoint.post(message) {
            Ok(()) => {
                trace!(id = %message.id, kind = %message.kind, %target, "delivered");
                Ok(())
            }
            Err(e) => {
                self.cancel_ack(&message.id);
                Err(DeliveryWarning::EndpointFailed {
                    kind: message.kind.clone(),
                    id: message.id.clone(),
                    target,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drain the queue into the studio surface: expired entries are dropped,
    /// the rest go out in enqueue order. The queue is empty afterwards even
    /// if a delivery fails.
    fn flush(&self) {
        let (studio, entries) = {
            let mut state = self.lock();
            let Some(studio) = state.live_studio() else {
                return;
            };
            (studio, std::mem::take(&mut state.queue))
        };
        if entries.is_empty() {
            return;
        }

        let now = Instant::now();
        let total = entries.len();
        let fresh: Vec<QueuedEntry> = entries.into_iter().filter(|e| !e.is_expired(now)).collect();
        let expired = total - fresh.len();
        if expired > 0 {
            warn!(
                "{}",
                DeliveryWarning::Expired {
                    count: expired,
                    ttl: QUEUE_TTL,
                }
            );
        }

        debug!(count = fresh.len(), "flushing queued messages to studio");
        for entry in fresh {
            if let Err(e) = self.deliver(studio.as_ref(), &entry.message, Source::Studio) {
                warn!("{}; abandoning flush", e);
                self.unregister_studio();
                break;
            }
        }
    }

    fn arm_ack_waiter(&self, message: &BusMessage) {
        let Ok(runtime) = Handle::try_current() else {
            debug!(id = %message.id, "no async runtime, ack not tracked");
            return;
        };

        let id = message.id.clone();
        let router = Arc::downgrade(&self.state);
        let timer_id = id.clone();
        let mut state = self.lock();
        let task = runtime.spawn(async move {
            tokio::time::sleep(ACK_TIMEOUT).await;
            let Some(state) = router.upgrade() else {
                return;
            };
            // Removal under the lock decides the race with `cancel_ack`.
            let fired = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .waiters
                .remove(&timer_id);
            if let Some(waiter) = fired {
                warn!(
                    "{}",
                    DeliveryWarning::AckTimeout {
                        kind: waiter.kind,
                        id: timer_id,
                        timeout: ACK_TIMEOUT,
                    }
                );
            }
        });

        let waiter = AckWaiter {
            kind: message.kind.clone(),
            timer: task.abort_handle(),
        };
        if let Some(previous) = state.waiters.insert(id, waiter) {
            previous.timer.abort();
        }
    }

    /// Cancel the waiter for `id`. Returns whether one was pending.
    fn cancel_ack(&self, id: &str) -> bool {
        let removed = self.lock().waiters.remove(id);
        match removed {
            Some(waiter) => {
                waiter.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every ack timer, drop the queue, and clear both endpoints.
    /// Safe to call repeatedly.
    pub fn dispose(&self) {
        let mut state = self.lock();
        for (_, waiter) in state.waiters.drain() {
            waiter.timer.abort();
        }
        state.queue.clear();
        state.sidebar = None;
        state.clear_studio();
        debug!("message router disposed");
    }

    pub fn has_sidebar(&self) -> bool {
        self.lock().live_sidebar().is_some()
    }

    pub fn has_studio(&self) -> bool {
        self.lock().live_studio().is_some()
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Snapshot of the queue, oldest first
    pub fn queued(&self) -> Vec<QueuedEntry> {
        self.lock().queue.iter().cloned().collect()
    }

    pub fn pending_acks(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn has_pending_ack(&self, id: &str) -> bool {
        self.lock().waiters.contains_key(id)
    }
}
