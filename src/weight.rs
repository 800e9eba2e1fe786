use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use crate::util::INF_FUTURE;

/// Unordered set of resolved addresses identifying one logical endpoint.
/// Two endpoints are the same endpoint iff their address sets are equal.
/// Totally ordered so endpoint lists iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddressSet {
    addresses: Vec<SocketAddr>,
}

impl EndpointAddressSet {
    pub fn new(addresses: impl IntoIterator<Item = SocketAddr>) -> Self {
        let mut addresses: Vec<SocketAddr> = addresses.into_iter().collect();
        addresses.sort_unstable();
        addresses.dedup();
        Self { addresses }
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl fmt::Display for EndpointAddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, addr) in self.addresses.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr}")?;
        }
        write!(f, "}}")
    }
}

#[derive(Debug)]
struct WeightState {
    weight: f32,
    /// Earliest tick since which non-empty reports have been continuous.
    non_empty_since_ms: u64,
    last_update_ms: u64,
}

/// Per-endpoint weight record, shared across list generations through the
/// [`WeightStore`].
pub(crate) struct EndpointWeight {
    store: Weak<WeightStore>,
    key: EndpointAddressSet,
    state: Mutex<WeightState>,
}

impl EndpointWeight {
    fn new(store: Weak<WeightStore>, key: EndpointAddressSet) -> Self {
        Self {
            store,
            key,
            state: Mutex::new(WeightState {
                weight: 0.0,
                non_empty_since_ms: INF_FUTURE,
                last_update_ms: INF_FUTURE,
            }),
        }
    }

    /// Derives a weight from a load report and records it. A report that
    /// derives to zero carries no information and leaves all state untouched.
    pub fn maybe_update_weight(
        &self,
        qps: f64,
        eps: f64,
        utilization: f64,
        error_utilization_penalty: f32,
        now_ms: u64,
    ) {
        let mut weight = 0.0f32;
        if qps > 0.0 && utilization > 0.0 {
            let mut penalty = 0.0f64;
            if eps > 0.0 && error_utilization_penalty > 0.0 {
                penalty = eps / qps * error_utilization_penalty as f64;
            }
            weight = (qps / (utilization + penalty)) as f32;
        }
        if weight == 0.0 {
            debug!(
                "endpoint {}: qps={} eps={} utilization={}: weight=0, not updating",
                self.key, qps, eps, utilization
            );
            return;
        }
        let mut state = self.state.lock().unwrap();
        debug!(
            "endpoint {}: qps={} eps={} utilization={}: setting weight={}",
            self.key, qps, eps, utilization, weight
        );
        if state.non_empty_since_ms == INF_FUTURE {
            state.non_empty_since_ms = now_ms;
        }
        state.weight = weight;
        state.last_update_ms = now_ms;
    }

    /// Reads the weight as of `now_ms`, applying expiration then blackout.
    /// Expired weights also reset `non_empty_since` so the blackout re-applies
    /// if reports resume.
    pub fn get_weight(
        &self,
        now_ms: u64,
        expiration_ms: u64,
        blackout_ms: u64,
        num_not_yet_usable: &mut u64,
        num_stale: &mut u64,
    ) -> f32 {
        let mut state = self.state.lock().unwrap();
        if state.last_update_ms <= now_ms && now_ms - state.last_update_ms >= expiration_ms {
            *num_stale += 1;
            state.non_empty_since_ms = INF_FUTURE;
            return 0.0;
        }
        if blackout_ms > 0
            && (state.non_empty_since_ms > now_ms
                || now_ms - state.non_empty_since_ms < blackout_ms)
        {
            *num_not_yet_usable += 1;
            return 0.0;
        }
        state.weight
    }

    /// Restarts the blackout; called when the endpoint's subchannel
    /// reconnects, since lingering reports from the previous connection may
    /// still arrive.
    pub fn reset_non_empty_since(&self) {
        self.state.lock().unwrap().non_empty_since_ms = INF_FUTURE;
    }
}

impl Drop for EndpointWeight {
    fn drop(&mut self) {
        let Some(store) = self.store.upgrade() else {
            return;
        };
        let mut map = store.map.lock().unwrap();
        if let Some(entry) = map.get(&self.key) {
            // Erase only if the store still identifies this exact instance; a
            // successor may have been inserted while the last reference was
            // going away.
            if std::ptr::eq(entry.as_ptr(), self) {
                map.remove(&self.key);
            }
        }
    }
}

/// Deduplicating registry of endpoint weights: at most one live
/// [`EndpointWeight`] per address set. Holds only weak references; ownership
/// lives in the endpoints of the current lists.
pub(crate) struct WeightStore {
    map: Mutex<BTreeMap<EndpointAddressSet, Weak<EndpointWeight>>>,
}

impl WeightStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            map: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn get_or_create(self: &Arc<Self>, key: &EndpointAddressSet) -> Arc<EndpointWeight> {
        let mut map = self.map.lock().unwrap();
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        let weight = Arc::new(EndpointWeight::new(Arc::downgrade(self), key.clone()));
        map.insert(key.clone(), Arc::downgrade(&weight));
        weight
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}
