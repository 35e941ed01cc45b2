use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::flavor::{FlavorCatalog, FlavorId};
use crate::lease::{Lease, LeaseId};

/// Per-flavor capacity limits for the pool.
#[derive(Clone, Debug, Default)]
pub struct PoolConfig {
    capacities: HashMap<FlavorId, usize>,
}

impl PoolConfig {
    pub fn new(capacities: HashMap<FlavorId, usize>) -> Self {
        Self { capacities }
    }

    /// Derive pool capacities from a flavor catalog.
    pub fn from_catalog(catalog: &FlavorCatalog) -> Self {
        Self {
            capacities: catalog
                .iter()
                .map(|f| (f.id.clone(), f.capacity))
                .collect(),
        }
    }

    pub fn with_capacity(mut self, flavor: impl Into<FlavorId>, capacity: usize) -> Self {
        self.capacities.insert(flavor.into(), capacity);
        self
    }

    pub fn capacity(&self, flavor: &FlavorId) -> usize {
        self.capacities.get(flavor).copied().unwrap_or(0)
    }
}

struct Waiter {
    tx: oneshot::Sender<Lease>,
}

#[derive(Default)]
struct PoolState {
    /// Free units per flavor.
    available: HashMap<FlavorId, usize>,
    /// IDs of leases handed out and not yet released.
    outstanding: HashSet<LeaseId>,
    /// Arrival-ordered waiters per flavor.
    waiters: HashMap<FlavorId, VecDeque<Waiter>>,
}

/// Tracks flavor capacity and hands out leases.
///
/// The pool is the only mutable shared state in a run; all access goes
/// through `acquire`/`release` under one internal mutex. Acquisition is
/// fair per flavor: requests queue in arrival order, so a step can never
/// be starved by later arrivals on the same flavor. Release is
/// idempotent-safe: releasing an already-released lease is a no-op,
/// since cancellation paths may attempt it twice.
pub struct FlavorPool {
    config: PoolConfig,
    state: Arc<Mutex<PoolState>>,
}

impl std::fmt::Debug for FlavorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("FlavorPool");
        debug.field("config", &self.config);
        match self.state.try_lock() {
            Ok(state) => {
                debug.field("outstanding", &state.outstanding.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl FlavorPool {
    pub fn new(config: PoolConfig) -> Self {
        let available = config.capacities.clone();
        Self {
            config,
            state: Arc::new(Mutex::new(PoolState {
                available,
                ..PoolState::default()
            })),
        }
    }

    /// Acquire a lease on one unit of `flavor`, waiting in FIFO order
    /// if the flavor is at capacity.
    ///
    /// # Errors
    ///
    /// Fails immediately for a flavor with zero configured capacity
    /// (the request could never be satisfied) or if the pool is torn
    /// down while waiting.
    pub async fn acquire(&self, flavor: &FlavorId) -> anyhow::Result<Lease> {
        let rx = {
            let mut state = self.state.lock().await;
            if self.config.capacity(flavor) == 0 {
                anyhow::bail!("flavor `{flavor}` has zero capacity");
            }
            let free = state.available.entry(flavor.clone()).or_insert(0);
            if *free > 0 {
                *free -= 1;
                let lease = Lease::new(flavor.clone());
                state.outstanding.insert(lease.id);
                tracing::debug!(flavor = %flavor, lease = %lease.id, "lease acquired");
                return Ok(lease);
            }
            let (tx, rx) = oneshot::channel();
            state
                .waiters
                .entry(flavor.clone())
                .or_default()
                .push_back(Waiter { tx });
            rx
        };

        match rx.await {
            Ok(lease) => {
                tracing::debug!(flavor = %flavor, lease = %lease.id, "lease acquired after wait");
                Ok(lease)
            }
            Err(_) => anyhow::bail!("pool dropped while waiting for flavor `{flavor}`"),
        }
    }

    /// Try to acquire without waiting. Returns `None` at capacity.
    pub async fn try_acquire(&self, flavor: &FlavorId) -> Option<Lease> {
        let mut state = self.state.lock().await;
        let free = state.available.get_mut(flavor)?;
        if *free == 0 {
            return None;
        }
        *free -= 1;
        let lease = Lease::new(flavor.clone());
        state.outstanding.insert(lease.id);
        Some(lease)
    }

    /// Return a lease's capacity unit to the pool.
    ///
    /// The unit goes to the oldest live waiter on the flavor, or back
    /// to the free count. Unknown (already released) lease IDs are
    /// ignored.
    pub async fn release(&self, lease: &Lease) {
        let mut state = self.state.lock().await;
        if !state.outstanding.remove(&lease.id) {
            tracing::trace!(lease = %lease.id, "double release ignored");
            return;
        }

        // Hand the unit to the next waiter still listening. Waiters
        // whose acquire future was cancelled have a closed channel and
        // are skipped.
        while let Some(waiter) = state
            .waiters
            .get_mut(&lease.flavor)
            .and_then(VecDeque::pop_front)
        {
            let next = Lease::new(lease.flavor.clone());
            let next_id = next.id;
            state.outstanding.insert(next_id);
            match waiter.tx.send(next) {
                Ok(()) => return,
                Err(_) => {
                    state.outstanding.remove(&next_id);
                }
            }
        }

        *state.available.entry(lease.flavor.clone()).or_insert(0) += 1;
    }

    /// Number of leases currently held on `flavor`.
    pub async fn leased(&self, flavor: &FlavorId) -> usize {
        let state = self.state.lock().await;
        let free = state.available.get(flavor).copied().unwrap_or(0);
        self.config.capacity(flavor).saturating_sub(free)
    }

    /// Total leases currently held across all flavors.
    pub async fn leased_total(&self) -> usize {
        let state = self.state.lock().await;
        state.outstanding.len()
    }

    /// Configured capacity for `flavor`.
    pub fn capacity(&self, flavor: &FlavorId) -> usize {
        self.config.capacity(flavor)
    }
}
