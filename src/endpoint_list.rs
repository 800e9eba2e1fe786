use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{ConnectivityState, Subchannel, SubchannelPicker};
use crate::error::PolicyError;
use crate::weight::{EndpointAddressSet, EndpointWeight};

/// One endpoint in one list generation: the subchannel, a strong reference to
/// the shared weight record, and the last connectivity state observed for it.
pub(crate) struct WrrEndpoint {
    index: usize,
    key: EndpointAddressSet,
    weight: Arc<EndpointWeight>,
    subchannel: Arc<dyn Subchannel>,
    state: Mutex<Option<ConnectivityState>>,
}

impl WrrEndpoint {
    pub fn new(
        index: usize,
        key: EndpointAddressSet,
        weight: Arc<EndpointWeight>,
        subchannel: Arc<dyn Subchannel>,
    ) -> Self {
        Self {
            index,
            key,
            weight,
            subchannel,
            state: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> &EndpointAddressSet {
        &self.key
    }

    pub fn weight(&self) -> &Arc<EndpointWeight> {
        &self.weight
    }

    pub fn subchannel(&self) -> &Arc<dyn Subchannel> {
        &self.subchannel
    }

    /// `None` until the first notification arrives.
    pub fn connectivity_state(&self) -> Option<ConnectivityState> {
        *self.state.lock().unwrap()
    }

    /// Records a transition, returning the previous state.
    pub fn set_connectivity_state(&self, state: ConnectivityState) -> Option<ConnectivityState> {
        self.state.lock().unwrap().replace(state)
    }

    pub fn picker(&self) -> Arc<dyn SubchannelPicker> {
        self.subchannel.picker()
    }
}

#[derive(Default)]
pub(crate) struct StateCounters {
    pub num_ready: usize,
    pub num_connecting: usize,
    pub num_transient_failure: usize,
    pub last_failure: Option<PolicyError>,
}

/// Ordered endpoint collection for one list generation, with aggregate state
/// counters. Endpoints are sorted by address set so identical inputs produce
/// identical indexes.
pub(crate) struct EndpointList {
    endpoints: Vec<Arc<WrrEndpoint>>,
    resolution_note: String,
    counters: Mutex<StateCounters>,
}

impl EndpointList {
    pub fn new(endpoints: Vec<Arc<WrrEndpoint>>, resolution_note: String) -> Self {
        Self {
            endpoints,
            resolution_note,
            counters: Mutex::new(StateCounters::default()),
        }
    }

    pub fn endpoints(&self) -> &[Arc<WrrEndpoint>] {
        &self.endpoints
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn resolution_note(&self) -> &str {
        &self.resolution_note
    }

    pub fn counters(&self) -> MutexGuard<'_, StateCounters> {
        self.counters.lock().unwrap()
    }

    /// Adjusts counters for one child transition. IDLE counts as CONNECTING
    /// since an idle child is immediately told to reconnect.
    pub fn update_state_counters(
        &self,
        old_state: Option<ConnectivityState>,
        new_state: ConnectivityState,
    ) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(old_state) = old_state {
            match old_state {
                ConnectivityState::Ready => {
                    debug_assert!(counters.num_ready > 0);
                    counters.num_ready = counters.num_ready.saturating_sub(1);
                }
                ConnectivityState::Connecting | ConnectivityState::Idle => {
                    debug_assert!(counters.num_connecting > 0);
                    counters.num_connecting = counters.num_connecting.saturating_sub(1);
                }
                ConnectivityState::TransientFailure => {
                    debug_assert!(counters.num_transient_failure > 0);
                    counters.num_transient_failure =
                        counters.num_transient_failure.saturating_sub(1);
                }
            }
        }
        match new_state {
            ConnectivityState::Ready => counters.num_ready += 1,
            ConnectivityState::Connecting | ConnectivityState::Idle => {
                counters.num_connecting += 1
            }
            ConnectivityState::TransientFailure => counters.num_transient_failure += 1,
        }
    }

    /// True once every child has delivered its initial state notification.
    pub fn all_seen_initial_state(&self) -> bool {
        self.endpoints
            .iter()
            .all(|endpoint| endpoint.connectivity_state().is_some())
    }

    pub fn counters_string(&self) -> String {
        let counters = self.counters.lock().unwrap();
        format!(
            "num_children={} num_ready={} num_connecting={} num_transient_failure={}",
            self.endpoints.len(),
            counters.num_ready,
            counters.num_connecting,
            counters.num_transient_failure
        )
    }
}
