use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use hawser_presence::TunnelTracker;
use hawser_proto::{ConnectResponse, connect_request};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::tunnel::{AgentInfo, FrameStream, Tunnel, TunnelShared, TunnelState};

const STRIPE_COUNT: usize = 64;

/// Safety slack between two presence refreshes so a concurrent GC on
/// another instance never deletes an entry that is about to be rewritten.
const REFRESH_OVERLAP: Duration = Duration::from_secs(5);

pub(crate) struct FindRequest {
    agent_id: i64,
    service: String,
    method: String,
    slot: Mutex<Option<oneshot::Sender<Tunnel>>>,
}

/// Handle for a pending tunnel search. `get` waits for the match; dropping
/// the handle withdraws the request, returning an already-assigned but
/// unused tunnel to the registry.
pub struct FindHandle {
    rx: Option<oneshot::Receiver<Tunnel>>,
    registry: Arc<TunnelRegistry>,
    req: Arc<FindRequest>,
    got: bool,
}

impl FindHandle {
    /// Waits for a matching tunnel. Returns `Unavailable` when the registry
    /// shuts down first. Callers bound the wait with their own deadline.
    pub async fn get(&mut self) -> Result<Tunnel, Status> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Status::internal("find handle used more than once"));
        };
        let res = rx.await;
        self.rx = None;
        match res {
            Ok(tunnel) => {
                self.got = true;
                Ok(tunnel)
            }
            Err(_) => Err(Status::unavailable("broker is shutting down")),
        }
    }
}

impl Drop for FindHandle {
    fn drop(&mut self) {
        if self.got {
            return;
        }
        if let Some(mut rx) = self.rx.take() {
            if let Ok(tunnel) = rx.try_recv() {
                // A tunnel was assigned but never picked up; its drop puts
                // it back into the pool.
                drop(tunnel);
                return;
            }
        }
        self.registry.remove_find_request(&self.req);
    }
}

#[derive(Default)]
struct StripeInner {
    idle: HashMap<i64, Vec<Arc<TunnelShared>>>,
    waiters: HashMap<i64, VecDeque<Arc<FindRequest>>>,
}

struct Stripe {
    inner: Mutex<StripeInner>,
}

enum PresenceAction {
    Register(i64),
    Unregister(i64),
}

/// Striped registry pairing idle agent tunnels with pending find-requests.
///
/// Per agent, matching is eager: the idle pool and the waiter queue are
/// never non-empty at the same time. Agent ids are partitioned over a fixed
/// number of stripes, each with its own mutex; nothing ever crosses
/// stripes because every structure is keyed by one agent id.
pub struct TunnelRegistry {
    stripes: Vec<Stripe>,
    tracker: Arc<dyn TunnelTracker>,
    refresh_period: Duration,
    gc_period: Duration,
    max_connection_age: Option<Duration>,
    shut: AtomicBool,
}

impl TunnelRegistry {
    pub fn new(
        tracker: Arc<dyn TunnelTracker>,
        refresh_period: Duration,
        gc_period: Duration,
        max_connection_age: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stripes: (0..STRIPE_COUNT)
                .map(|_| Stripe {
                    inner: Mutex::new(StripeInner::default()),
                })
                .collect(),
            tracker,
            refresh_period,
            gc_period,
            max_connection_age,
            shut: AtomicBool::new(false),
        })
    }

    fn stripe(&self, agent_id: i64) -> &Stripe {
        // Fibonacci hashing spreads sequential ids across stripes.
        let h = (agent_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.stripes[(h >> 32) as usize % STRIPE_COUNT]
    }

    /// Drives presence refresh and GC until `shutdown` fires, then shuts
    /// the registry down: idle tunnels are closed cleanly so agents redial,
    /// waiters fail with `Unavailable`, and all presence owned by this
    /// instance is retracted.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let start = tokio::time::Instant::now();
        let mut refresh = tokio::time::interval_at(start + self.refresh_period, self.refresh_period);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut gc = tokio::time::interval_at(start + self.gc_period, self.gc_period);
        gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = refresh.tick() => {
                    // Everything due before the next tick gets rewritten;
                    // the refresh cadence already sits an overlap short of
                    // the TTL, so entries never lapse between ticks.
                    let next_refresh = chrono::Utc::now().timestamp()
                        + self.refresh_period.max(REFRESH_OVERLAP).as_secs() as i64;
                    if let Err(err) = self.tracker.refresh(next_refresh).await {
                        tracing::error!(error = %err, "failed to refresh presence data");
                    }
                }
                _ = gc.tick() => {
                    match self.tracker.gc().await {
                        Ok(0) => {}
                        Ok(deleted) => tracing::info!(deleted, "deleted expired presence records"),
                        Err(err) => tracing::error!(error = %err, "failed to GC presence data"),
                    }
                }
            }
        }
        self.shutdown().await;
    }

    /// Called once per inbound agent stream. Reads the descriptor frame,
    /// registers the tunnel, and blocks until the tunnel terminates. The
    /// returned status is what the agent stream should end with.
    pub async fn handle_tunnel(
        self: &Arc<Self>,
        cancel: CancellationToken,
        agent_info: AgentInfo,
        mut incoming: FrameStream,
        outgoing: mpsc::Sender<Result<ConnectResponse, Status>>,
    ) -> Result<(), Status> {
        if self.shut.load(Ordering::SeqCst) {
            return Err(Status::unavailable("broker is shutting down"));
        }
        let descriptor = match incoming.next().await {
            None => return Err(Status::unavailable("tunnel closed before descriptor frame")),
            Some(Err(status)) => return Err(status),
            Some(Ok(frame)) => match frame.msg {
                Some(connect_request::Msg::Descriptor(d)) => d,
                _ => {
                    return Err(Status::invalid_argument(
                        "first frame on a tunnel must be a descriptor",
                    ));
                }
            },
        };
        let agent_id = agent_info.id;
        let (ret_tx, mut ret_rx) = oneshot::channel();
        let shared = TunnelShared::new(agent_id, descriptor, incoming, outgoing.clone(), ret_tx);

        let actions = {
            let mut inner = self.stripe(agent_id).inner.lock();
            self.register_tunnel_locked(&mut inner, &shared)
        };
        self.apply_presence_actions(actions).await;

        let max_age = async {
            match self.max_connection_age {
                Some(age) => tokio::time::sleep(age).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => self.on_tunnel_interrupted(&shared, ret_rx).await,
            _ = outgoing.closed() => self.on_tunnel_interrupted(&shared, ret_rx).await,
            _ = max_age => {
                tracing::debug!(agent_id, "tunnel reached max connection age, closing");
                self.on_tunnel_interrupted(&shared, ret_rx).await
            }
            res = &mut ret_rx => res.unwrap_or(Ok(())),
        }
    }

    /// Synchronous fast path plus queueing. Returns `(true, handle)` when a
    /// matching idle tunnel was claimed; `handle.get()` then resolves
    /// immediately. Otherwise the request is parked FIFO.
    pub fn find_tunnel(
        self: &Arc<Self>,
        agent_id: i64,
        service: &str,
        method: &str,
    ) -> (bool, FindHandle) {
        let (tx, rx) = oneshot::channel();
        let req = Arc::new(FindRequest {
            agent_id,
            service: service.to_string(),
            method: method.to_string(),
            slot: Mutex::new(Some(tx)),
        });
        let handle = FindHandle {
            rx: Some(rx),
            registry: self.clone(),
            req: req.clone(),
            got: false,
        };
        if self.shut.load(Ordering::SeqCst) {
            // Drop the slot so get() reports the shutdown.
            req.slot.lock().take();
            return (false, handle);
        }
        let mut found = false;
        let mut actions = Vec::new();
        {
            let mut inner = self.stripe(agent_id).inner.lock();
            if let Some(idle) = inner.idle.get_mut(&agent_id) {
                // Prefer the most recently parked tunnel to keep idle age low.
                if let Some(pos) = idle
                    .iter()
                    .rposition(|t| t.descriptor.supports_service_and_method(service, method))
                {
                    let shared = idle.remove(pos);
                    if idle.is_empty() {
                        inner.idle.remove(&agent_id);
                    }
                    *shared.state.lock() = TunnelState::Matched { piping: false };
                    if let Some(tx) = req.slot.lock().take() {
                        match tx.send(Tunnel {
                            shared,
                            registry: self.clone(),
                            consumed: false,
                        }) {
                            Ok(()) => {
                                found = true;
                                actions.push(PresenceAction::Unregister(agent_id));
                            }
                            Err(tunnel) => self.requeue_sent_tunnel(&mut inner, tunnel, &mut actions),
                        }
                    }
                }
            }
            if !found && !handle_slot_taken(&req) {
                inner.waiters.entry(agent_id).or_default().push_back(req);
            }
        }
        self.spawn_presence_actions(actions);
        (found, handle)
    }

    /// Aborts every idle tunnel, fails every waiter, and retracts all
    /// presence this instance owns.
    pub async fn shutdown(&self) {
        self.shut.store(true, Ordering::SeqCst);
        let mut stopped = 0usize;
        let mut aborted = 0usize;
        for stripe in &self.stripes {
            let mut inner = stripe.inner.lock();
            for (_, tunnels) in inner.idle.drain() {
                for shared in tunnels {
                    stopped += 1;
                    *shared.state.lock() = TunnelState::Done;
                    if let Some(ret) = shared.ret.lock().take() {
                        // Clean close so the agent redials immediately.
                        let _ = ret.send(Ok(()));
                    }
                }
            }
            for (_, waiters) in inner.waiters.drain() {
                for req in waiters {
                    aborted += 1;
                    req.slot.lock().take();
                }
            }
        }
        if stopped > 0 || aborted > 0 {
            tracing::info!(stopped, aborted, "stopped tunnels and aborted find requests");
        }
        if let Err(err) = self.tracker.clear().await {
            tracing::error!(error = %err, "failed to retract presence entries on shutdown");
        }
    }

    /// A matched tunnel was dropped without being piped; put it back or
    /// finish the state machine.
    pub(crate) fn on_tunnel_unused(self: &Arc<Self>, shared: &Arc<TunnelShared>) {
        let mut actions = Vec::new();
        {
            let mut inner = self.stripe(shared.agent_id).inner.lock();
            let state = *shared.state.lock();
            match state {
                TunnelState::Matched { piping: false } => {
                    actions = self.register_tunnel_locked(&mut inner, shared);
                }
                TunnelState::Closing => {}
                TunnelState::Matched { piping: true } => {
                    // forward() owns the tunnel from here on.
                }
                TunnelState::Done => panic!("tunnel finished more than once"),
                TunnelState::Ready => panic!("unreachable: idle tunnel released by a finder"),
            }
        }
        self.spawn_presence_actions(actions);
    }

    pub(crate) fn remove_find_request(&self, req: &Arc<FindRequest>) {
        let mut inner = self.stripe(req.agent_id).inner.lock();
        if let Some(queue) = inner.waiters.get_mut(&req.agent_id) {
            queue.retain(|other| !Arc::ptr_eq(other, req));
            if queue.is_empty() {
                inner.waiters.remove(&req.agent_id);
            }
        }
    }

    /// With the stripe locked: hand the tunnel to the oldest compatible
    /// waiter, or park it in the idle pool.
    fn register_tunnel_locked(
        self: &Arc<Self>,
        inner: &mut StripeInner,
        shared: &Arc<TunnelShared>,
    ) -> Vec<PresenceAction> {
        let agent_id = shared.agent_id;
        let mut actions = Vec::new();
        if let Some(queue) = inner.waiters.get_mut(&agent_id) {
            let mut i = 0;
            while i < queue.len() {
                let supports = shared
                    .descriptor
                    .supports_service_and_method(&queue[i].service, &queue[i].method);
                if !supports {
                    i += 1;
                    continue;
                }
                let req = match queue.remove(i) {
                    Some(req) => req,
                    None => break,
                };
                let Some(tx) = req.slot.lock().take() else {
                    // Request already aborted; it was only waiting for
                    // removal from the queue.
                    continue;
                };
                *shared.state.lock() = TunnelState::Matched { piping: false };
                match tx.send(Tunnel {
                    shared: shared.clone(),
                    registry: self.clone(),
                    consumed: false,
                }) {
                    Ok(()) => {
                        if queue.is_empty() {
                            inner.waiters.remove(&agent_id);
                        }
                        return actions;
                    }
                    Err(tunnel) => {
                        // Receiver left between queue scan and delivery.
                        defuse(tunnel);
                        *shared.state.lock() = TunnelState::Ready;
                    }
                }
            }
            if queue.is_empty() {
                inner.waiters.remove(&agent_id);
            }
        }
        *shared.state.lock() = TunnelState::Ready;
        inner.idle.entry(agent_id).or_default().push(shared.clone());
        actions.push(PresenceAction::Register(agent_id));
        actions
    }

    /// Undo a failed fast-path delivery: the tunnel goes straight back to
    /// the idle pool.
    fn requeue_sent_tunnel(
        self: &Arc<Self>,
        inner: &mut StripeInner,
        tunnel: Tunnel,
        actions: &mut Vec<PresenceAction>,
    ) {
        let shared = tunnel.shared.clone();
        defuse(tunnel);
        *shared.state.lock() = TunnelState::Ready;
        let agent_id = shared.agent_id;
        inner.idle.entry(agent_id).or_default().push(shared);
        actions.push(PresenceAction::Register(agent_id));
    }

    /// Cancellation, disconnect or max-age while `handle_tunnel` waits.
    async fn on_tunnel_interrupted(
        &self,
        shared: &Arc<TunnelShared>,
        ret_rx: oneshot::Receiver<Result<(), Status>>,
    ) -> Result<(), Status> {
        let agent_id = shared.agent_id;
        let wait_for_pipe = {
            let mut inner = self.stripe(agent_id).inner.lock();
            let mut state = shared.state.lock();
            match *state {
                TunnelState::Ready => {
                    *state = TunnelState::Closing;
                    drop(state);
                    if let Some(idle) = inner.idle.get_mut(&agent_id) {
                        idle.retain(|other| !Arc::ptr_eq(other, shared));
                        if idle.is_empty() {
                            inner.idle.remove(&agent_id);
                        }
                    }
                    false
                }
                TunnelState::Matched { piping: false } => {
                    // Assigned but unused; the holder's drop sees Closing
                    // and leaves the tunnel alone.
                    *state = TunnelState::Closing;
                    false
                }
                TunnelState::Matched { piping: true } | TunnelState::Done => true,
                TunnelState::Closing => false,
            }
        };
        if wait_for_pipe {
            // In-flight pipe errors out or completes on its own; return its
            // verdict.
            return ret_rx.await.unwrap_or(Ok(()));
        }
        if let Err(err) = self.tracker.unregister_tunnel(agent_id).await {
            tracing::error!(agent_id, error = %err, "failed to unregister tunnel presence");
        }
        Ok(())
    }

    async fn apply_presence_actions(&self, actions: Vec<PresenceAction>) {
        for action in actions {
            let res = match action {
                PresenceAction::Register(agent_id) => {
                    (self.tracker.register_tunnel(agent_id).await, agent_id)
                }
                PresenceAction::Unregister(agent_id) => {
                    (self.tracker.unregister_tunnel(agent_id).await, agent_id)
                }
            };
            if let (Err(err), agent_id) = res {
                // Best effort: the tunnel stays usable locally either way.
                tracing::error!(agent_id, error = %err, "failed to update tunnel presence");
            }
        }
    }

    fn spawn_presence_actions(&self, actions: Vec<PresenceAction>) {
        if actions.is_empty() {
            return;
        }
        let tracker = self.tracker.clone();
        tokio::spawn(async move {
            for action in actions {
                let (res, agent_id) = match action {
                    PresenceAction::Register(agent_id) => {
                        (tracker.register_tunnel(agent_id).await, agent_id)
                    }
                    PresenceAction::Unregister(agent_id) => {
                        (tracker.unregister_tunnel(agent_id).await, agent_id)
                    }
                };
                if let Err(err) = res {
                    tracing::error!(agent_id, error = %err, "failed to update tunnel presence");
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, agent_id: i64) -> usize {
        self.stripe(agent_id)
            .inner
            .lock()
            .idle
            .get(&agent_id)
            .map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self, agent_id: i64) -> usize {
        self.stripe(agent_id)
            .inner
            .lock()
            .waiters
            .get(&agent_id)
            .map_or(0, VecDeque::len)
    }
}

fn handle_slot_taken(req: &Arc<FindRequest>) -> bool {
    req.slot.lock().is_none()
}

/// Drops a `Tunnel` without triggering its return-to-registry drop hook.
/// Only valid while the caller already holds the stripe lock.
fn defuse(mut tunnel: Tunnel) {
    tunnel.consumed = true;
}
