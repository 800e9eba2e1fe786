use std::collections::BTreeSet;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::channel::{
    BackendMetricReport, ChannelHelper, ConnectivityState, ConnectivityWatcher, OobMetricWatcher,
};
use crate::config::WrrConfig;
use crate::endpoint_list::{EndpointList, WrrEndpoint};
use crate::error::PolicyError;
use crate::picker::{FailurePicker, Picker, QueuePicker};
use crate::tel::WrrStats;
use crate::timer::Timers;
use crate::util::Clock;
use crate::weight::{EndpointAddressSet, EndpointWeight, WeightStore};

/// Wire-level name of this policy in the service config.
pub const POLICY_NAME: &str = "weighted_round_robin";

/// Weighted round-robin policy root. Owns the active and pending endpoint
/// lists, the shared weight store, and the sequence counter driving every
/// scheduler built for this policy.
///
/// Control-plane operations (updates, connectivity callbacks, list swaps,
/// state publication) are serialized under one mutex. Lock order, outermost
/// first: control mutex, weight-store map, picker timer, endpoint weight
/// state, picker scheduler.
pub struct WrrPolicy {
    helper: Arc<dyn ChannelHelper>,
    timers: Arc<dyn Timers>,
    clock: Arc<Clock>,
    stats: WrrStats,
    weight_store: Arc<WeightStore>,
    // Seeded randomly so co-located pickers with identical weight vectors do
    // not walk endpoints in lockstep.
    sequence: Arc<AtomicU32>,
    inner: Mutex<PolicyInner>,
}

struct PolicyInner {
    config: Arc<WrrConfig>,
    active: Option<Arc<EndpointList>>,
    /// Built on every address update; promoted to active by the swap rules.
    pending: Option<Arc<EndpointList>>,
    shutdown: bool,
}

impl WrrPolicy {
    pub fn new(helper: Arc<dyn ChannelHelper>, locality: impl Into<String>) -> Arc<Self> {
        let locality = locality.into();
        debug!("creating weighted_round_robin policy, locality={:?}", locality);
        let stats = WrrStats::new(helper.target(), locality);
        let timers = helper.timers();
        Arc::new(Self {
            helper,
            timers,
            clock: Arc::new(Clock::new()),
            stats,
            weight_store: WeightStore::new(),
            sequence: Arc::new(AtomicU32::new(rand::random())),
            inner: Mutex::new(PolicyInner {
                config: Arc::new(WrrConfig::default()),
                active: None,
                pending: None,
                shutdown: false,
            }),
        })
    }

    pub(crate) fn clock(&self) -> &Clock {
        &self.clock
    }

    pub(crate) fn clock_handle(&self) -> Arc<Clock> {
        self.clock.clone()
    }

    pub(crate) fn stats(&self) -> &WrrStats {
        &self.stats
    }

    pub(crate) fn timers(&self) -> &Arc<dyn Timers> {
        &self.timers
    }

    pub(crate) fn sequence_source(&self) -> Arc<AtomicU32> {
        self.sequence.clone()
    }

    /// Current config; for host inspection, not used on the pick path.
    pub fn config(&self) -> Arc<WrrConfig> {
        self.inner.lock().unwrap().config.clone()
    }

    /// Applies an address update. Endpoints are deduplicated and sorted by
    /// address set; the new list is staged as pending and promoted by the
    /// swap rules (immediately when empty or when there is no active list).
    pub fn update(
        self: &Arc<Self>,
        addresses: Result<Vec<EndpointAddressSet>, PolicyError>,
        config: Arc<WrrConfig>,
        resolution_note: impl Into<String>,
    ) -> Result<(), PolicyError> {
        let resolution_note = resolution_note.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return Ok(());
        }
        inner.config = config;
        let (ordered, address_error) = match addresses {
            Ok(list) => {
                debug!("received update with {} endpoints", list.len());
                let ordered: Vec<EndpointAddressSet> =
                    list.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
                (ordered, None)
            }
            Err(error) => {
                debug!("received update with address error: {}", error);
                // Keep the existing list, but report that the update was not
                // accepted.
                if inner.active.is_some() {
                    return Err(error);
                }
                (Vec::new(), Some(error))
            }
        };

        if inner.pending.is_some() {
            debug!("replacing previous pending endpoint list");
        }
        let no_endpoints = ordered.is_empty();
        let mut errors: Vec<String> = Vec::new();
        let mut endpoints: Vec<Arc<WrrEndpoint>> = Vec::new();
        for key in ordered {
            let weight = self.weight_store.get_or_create(&key);
            let subchannel = match self.helper.create_subchannel(&key) {
                Ok(subchannel) => subchannel,
                Err(error) => {
                    errors.push(format!("endpoint {key}: {error}"));
                    continue;
                }
            };
            if inner.config.enable_oob_load_report {
                subchannel.watch_oob_metrics(
                    inner.config.oob_reporting_period,
                    Box::new(OobReportHandler {
                        weight: weight.clone(),
                        error_utilization_penalty: inner.config.error_utilization_penalty,
                        clock: self.clock.clone(),
                    }),
                );
            }
            endpoints.push(Arc::new(WrrEndpoint::new(
                endpoints.len(),
                key,
                weight,
                subchannel,
            )));
        }
        let list = Arc::new(EndpointList::new(endpoints, resolution_note));
        for endpoint in list.endpoints() {
            endpoint.subchannel().watch_connectivity(Box::new(StateWatcher {
                policy: Arc::downgrade(self),
                list: Arc::downgrade(&list),
                index: endpoint.index(),
            }));
        }
        inner.pending = Some(list);

        // An empty address list is promoted immediately and reported as
        // failing. (A list emptied only by construction errors stays pending
        // so an active list keeps serving.)
        if no_endpoints {
            if inner.active.is_some() {
                debug!("replacing previous endpoint list");
            }
            inner.active = inner.pending.take();
            let status = address_error.unwrap_or(PolicyError::EmptyAddressList);
            let list = inner.active.clone().unwrap();
            self.report_transient_failure(&list, status.clone());
            return Err(status);
        }
        // Initial update: nothing to keep serving from, promote right away.
        if inner.active.is_none() {
            inner.active = inner.pending.take();
        }
        if !errors.is_empty() {
            return Err(PolicyError::ChildErrors(errors.join("; ")));
        }
        Ok(())
    }

    /// Forwards a backoff reset to every subchannel in both lists.
    pub fn reset_backoff(&self) {
        let inner = self.inner.lock().unwrap();
        for list in [&inner.active, &inner.pending].into_iter().flatten() {
            for endpoint in list.endpoints() {
                endpoint.subchannel().reset_backoff();
            }
        }
    }

    /// Drops both lists; every later operation is a no-op.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        debug!("shutting down");
        inner.shutdown = true;
        inner.active = None;
        inner.pending = None;
    }

    fn on_subchannel_state(
        self: &Arc<Self>,
        list: &Arc<EndpointList>,
        index: usize,
        new_state: ConnectivityState,
        status: Option<PolicyError>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.shutdown {
            return;
        }
        // Notifications for a list that has already been replaced are ignored.
        let is_active = inner.active.as_ref().is_some_and(|l| Arc::ptr_eq(l, list));
        let is_pending = inner.pending.as_ref().is_some_and(|l| Arc::ptr_eq(l, list));
        if !is_active && !is_pending {
            return;
        }
        let Some(endpoint) = list.endpoints().get(index) else {
            return;
        };
        let old_state = endpoint.set_connectivity_state(new_state);
        debug!(
            "connectivity changed for endpoint {} (index {} of {}): {} -> {}",
            endpoint.key(),
            index,
            list.len(),
            old_state.map_or("N/A".to_string(), |s| s.to_string()),
            new_state
        );
        match new_state {
            ConnectivityState::Idle => {
                debug!("endpoint {} reported IDLE; requesting connection", endpoint.key());
                endpoint.subchannel().request_connection();
            }
            ConnectivityState::Ready => {
                // A reconnect restarts the blackout: lingering reports from
                // the previous connection may still arrive. Skipped for the
                // initial notification and for a repeated READY.
                if old_state.is_some() && old_state != Some(ConnectivityState::Ready) {
                    endpoint.weight().reset_non_empty_since();
                }
            }
            _ => {}
        }
        if old_state != Some(new_state) {
            list.update_state_counters(old_state, new_state);
        }
        self.maybe_update_aggregated_state(&mut inner, list, status);
    }

    /// Runs the pending-to-active swap rules, then publishes the aggregated
    /// state if `list` is (now) the active list.
    fn maybe_update_aggregated_state(
        self: &Arc<Self>,
        inner: &mut PolicyInner,
        list: &Arc<EndpointList>,
        status_for_tf: Option<PolicyError>,
    ) {
        let is_pending = inner.pending.as_ref().is_some_and(|l| Arc::ptr_eq(l, list));
        if is_pending {
            let (pending_ready, pending_tf) = {
                let counters = list.counters();
                (counters.num_ready, counters.num_transient_failure)
            };
            let active_ready = inner
                .active
                .as_ref()
                .map_or(0, |active| active.counters().num_ready);
            // Promote when the active list has nothing READY, when the
            // pending list is usable and fully reported, or when the pending
            // list has no chance of becoming usable.
            let promote = active_ready == 0
                || (pending_ready > 0 && list.all_seen_initial_state())
                || pending_tf == list.len();
            if promote {
                debug!(
                    "swapping out endpoint list ({}) in favor of pending list ({})",
                    inner
                        .active
                        .as_ref()
                        .map_or("none".to_string(), |active| active.counters_string()),
                    list.counters_string()
                );
                inner.active = inner.pending.take();
            }
        }
        let Some(active) = inner.active.clone() else {
            return;
        };
        if !Arc::ptr_eq(&active, list) {
            return;
        }
        let (num_ready, num_connecting, num_transient_failure) = {
            let counters = active.counters();
            (
                counters.num_ready,
                counters.num_connecting,
                counters.num_transient_failure,
            )
        };
        // First matching rule wins: READY beats CONNECTING beats failure.
        if num_ready > 0 {
            debug!("reporting READY ({})", active.counters_string());
            let picker = Picker::new(self.clone(), inner.config.clone(), &active);
            self.helper
                .update_state(ConnectivityState::Ready, None, picker);
        } else if num_connecting > 0 {
            debug!("reporting CONNECTING ({})", active.counters_string());
            self.helper.update_state(
                ConnectivityState::Connecting,
                None,
                Arc::new(QueuePicker),
            );
        } else if num_transient_failure == active.len() {
            let status = {
                let mut counters = active.counters();
                if let Some(status) = status_for_tf {
                    counters.last_failure =
                        Some(PolicyError::AllBackendsFailing(status.to_string()));
                }
                counters
                    .last_failure
                    .clone()
                    .unwrap_or(PolicyError::AllBackendsFailing("unknown".to_string()))
            };
            self.report_transient_failure(&active, status);
        }
    }

    fn report_transient_failure(&self, list: &Arc<EndpointList>, status: PolicyError) {
        list.counters().last_failure = Some(status.clone());
        warn!(
            "reporting TRANSIENT_FAILURE (resolution_note={:?}): {}",
            list.resolution_note(),
            status
        );
        self.helper.update_state(
            ConnectivityState::TransientFailure,
            Some(status.clone()),
            Arc::new(FailurePicker::new(status)),
        );
    }
}

/// Routes one subchannel's connectivity notifications back into the policy.
struct StateWatcher {
    policy: Weak<WrrPolicy>,
    list: Weak<EndpointList>,
    index: usize,
}

impl ConnectivityWatcher for StateWatcher {
    fn on_state_change(&self, state: ConnectivityState, status: Option<PolicyError>) {
        let (Some(policy), Some(list)) = (self.policy.upgrade(), self.list.upgrade()) else {
            return;
        };
        policy.on_subchannel_state(&list, self.index, state, status);
    }
}

/// Feeds out-of-band metric reports into the endpoint weight.
struct OobReportHandler {
    weight: Arc<EndpointWeight>,
    error_utilization_penalty: f32,
    clock: Arc<Clock>,
}

impl OobMetricWatcher for OobReportHandler {
    fn on_report(&self, report: &BackendMetricReport) {
        self.weight.maybe_update_weight(
            report.qps,
            report.eps,
            report.utilization(),
            self.error_utilization_penalty,
            self.clock.now_ms(),
        );
    }
}
