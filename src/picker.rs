use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::channel::{
    BackendMetricReport, CallTracker, ConnectivityState, PickArgs, PickResult, SubchannelPicker,
};
use crate::config::WrrConfig;
use crate::endpoint_list::EndpointList;
use crate::error::PolicyError;
use crate::policy::WrrPolicy;
use crate::scheduler::StaticStrideScheduler;
use crate::timer::TimerHandle;
use crate::util::Clock;
use crate::weight::EndpointWeight;

struct PickerEndpoint {
    picker: Arc<dyn SubchannelPicker>,
    weight: Arc<EndpointWeight>,
}

/// The hot per-call object: a snapshot of the READY endpoints' child pickers
/// and weights, plus a scheduler that is rebuilt on a timer for as long as
/// the picker stays alive.
pub(crate) struct Picker {
    wrr: Arc<WrrPolicy>,
    config: Arc<WrrConfig>,
    endpoints: Vec<PickerEndpoint>,
    scheduler: Mutex<Option<Arc<StaticStrideScheduler>>>,
    // Acquired before `scheduler`; serializes rebuilds and timer re-arming.
    timer: Mutex<Option<TimerHandle>>,
    // Round-robin cursor for when no scheduler could be built.
    last_picked_index: AtomicUsize,
}

impl Picker {
    /// Snapshots the READY endpoints of `list`. Must only be called with at
    /// least one READY endpoint.
    pub fn new(wrr: Arc<WrrPolicy>, config: Arc<WrrConfig>, list: &EndpointList) -> Arc<Self> {
        let endpoints = list
            .endpoints()
            .iter()
            .filter(|endpoint| endpoint.connectivity_state() == Some(ConnectivityState::Ready))
            .map(|endpoint| PickerEndpoint {
                picker: endpoint.picker(),
                weight: endpoint.weight().clone(),
            })
            .collect::<Vec<_>>();
        let picker = Arc::new(Self {
            wrr,
            config,
            endpoints,
            scheduler: Mutex::new(None),
            timer: Mutex::new(None),
            last_picked_index: AtomicUsize::new(rand::random::<u32>() as usize),
        });
        debug!("created picker with {} ready endpoints", picker.endpoints.len());
        // Hold the timer lock across the initial build so the first callback
        // cannot observe an unset handle.
        let mut timer = picker.timer.lock().unwrap();
        picker.build_scheduler_and_start_timer(&mut timer);
        drop(timer);
        picker
    }

    fn pick_index(&self) -> usize {
        let scheduler = self.scheduler.lock().unwrap().clone();
        if let Some(scheduler) = scheduler {
            return scheduler.pick();
        }
        // No scheduler (fewer than two usable weights): plain round-robin.
        self.last_picked_index.fetch_add(1, Ordering::Relaxed) % self.endpoints.len()
    }

    /// Reads current weights, publishes a fresh scheduler (or none), and
    /// re-arms the update timer. Runs under the timer lock.
    fn build_scheduler_and_start_timer(self: &Arc<Self>, timer: &mut Option<TimerHandle>) {
        let now_ms = self.wrr.clock().now_ms();
        let expiration_ms = self.config.weight_expiration_period.as_millis() as u64;
        let blackout_ms = self.config.blackout_period.as_millis() as u64;
        let mut num_not_yet_usable = 0u64;
        let mut num_stale = 0u64;
        let mut weights = Vec::with_capacity(self.endpoints.len());
        for endpoint in &self.endpoints {
            let weight = endpoint.weight.get_weight(
                now_ms,
                expiration_ms,
                blackout_ms,
                &mut num_not_yet_usable,
                &mut num_stale,
            );
            self.wrr.stats().endpoint_weight(weight);
            weights.push(weight);
        }
        self.wrr.stats().weight_not_yet_usable(num_not_yet_usable);
        self.wrr.stats().weight_stale(num_stale);
        debug!("rebuilding scheduler with weights {:?}", weights);

        let sequence = self.wrr.sequence_source();
        let scheduler = StaticStrideScheduler::make(&weights, move || {
            sequence.fetch_add(1, Ordering::Relaxed)
        });
        if scheduler.is_none() {
            debug!("not enough usable weights, falling back to round robin");
            self.wrr.stats().rr_fallback();
        }
        *self.scheduler.lock().unwrap() = scheduler.map(Arc::new);

        // The handle is stored after run_after returns; the callback also
        // takes the timer lock, so it cannot run against a missing handle.
        let weak = Arc::downgrade(self);
        let handle = self.wrr.timers().run_after(
            self.config.weight_update_period,
            Box::new(move || {
                if let Some(picker) = weak.upgrade() {
                    let mut timer = picker.timer.lock().unwrap();
                    if timer.is_some() {
                        picker.build_scheduler_and_start_timer(&mut timer);
                    }
                }
            }),
        );
        *timer = Some(handle);
    }
}

impl SubchannelPicker for Picker {
    fn pick(&self, args: &PickArgs) -> PickResult {
        let index = self.pick_index();
        let endpoint = &self.endpoints[index];
        let mut result = endpoint.picker.pick(args);
        // Per-call load reporting, unless the OOB stream carries it.
        if !self.config.enable_oob_load_report {
            if let PickResult::Complete(complete) = &mut result {
                let child = complete.call_tracker.take();
                complete.call_tracker = Some(Box::new(WeightCallTracker {
                    weight: endpoint.weight.clone(),
                    error_utilization_penalty: self.config.error_utilization_penalty,
                    child,
                    clock: self.wrr.clock_handle(),
                }));
            }
        }
        result
    }
}

impl Drop for Picker {
    fn drop(&mut self) {
        let mut timer = self.timer.lock().unwrap();
        if let Some(handle) = timer.take() {
            self.wrr.timers().cancel(handle);
        }
    }
}

/// Feeds each completed call's load report into the endpoint weight,
/// delegating to the child tracker first.
struct WeightCallTracker {
    weight: Arc<EndpointWeight>,
    error_utilization_penalty: f32,
    child: Option<Box<dyn CallTracker>>,
    clock: Arc<Clock>,
}

impl CallTracker for WeightCallTracker {
    fn start(&mut self) {
        if let Some(child) = &mut self.child {
            child.start();
        }
    }

    fn finish(&mut self, metrics: Option<&BackendMetricReport>) {
        if let Some(child) = &mut self.child {
            child.finish(metrics);
        }
        let (mut qps, mut eps, mut utilization) = (0.0, 0.0, 0.0);
        if let Some(metrics) = metrics {
            qps = metrics.qps;
            eps = metrics.eps;
            utilization = metrics.utilization();
        }
        self.weight.maybe_update_weight(
            qps,
            eps,
            utilization,
            self.error_utilization_penalty,
            self.clock.now_ms(),
        );
    }
}

/// Published while the policy is CONNECTING.
pub(crate) struct QueuePicker;

impl SubchannelPicker for QueuePicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Queue
    }
}

/// Published while the policy is in TRANSIENT_FAILURE; fails every pick with
/// the stored status.
pub(crate) struct FailurePicker {
    status: PolicyError,
}

impl FailurePicker {
    pub fn new(status: PolicyError) -> Self {
        Self { status }
    }
}

impl SubchannelPicker for FailurePicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weight::{EndpointAddressSet, WeightStore};
    use std::sync::Mutex as StdMutex;

    struct RecordingTracker {
        events: Arc<StdMutex<Vec<&'static str>>>,
    }

    impl CallTracker for RecordingTracker {
        fn start(&mut self) {
            self.events.lock().unwrap().push("child_start");
        }
        fn finish(&mut self, _metrics: Option<&BackendMetricReport>) {
            self.events.lock().unwrap().push("child_finish");
        }
    }

    fn weight_for_test() -> Arc<EndpointWeight> {
        let store = WeightStore::new();
        store.get_or_create(&EndpointAddressSet::new(["10.0.0.1:80".parse().unwrap()]))
    }

    #[test]
    fn test_tracker_composes_with_child() {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let weight = weight_for_test();
        let mut tracker = WeightCallTracker {
            weight: weight.clone(),
            error_utilization_penalty: 1.0,
            child: Some(Box::new(RecordingTracker {
                events: events.clone(),
            })),
            clock: Arc::new(Clock::new()),
        };
        tracker.start();
        tracker.finish(Some(&BackendMetricReport {
            qps: 100.0,
            eps: 0.0,
            application_utilization: 0.5,
            cpu_utilization: 0.0,
        }));
        assert_eq!(*events.lock().unwrap(), vec!["child_start", "child_finish"]);
        let (mut nyu, mut stale) = (0, 0);
        let now_ms = tracker.clock.now_ms();
        assert_eq!(weight.get_weight(now_ms, 180_000, 0, &mut nyu, &mut stale), 200.0);
    }

    #[test]
    fn test_finish_without_metrics_is_noop() {
        let weight = weight_for_test();
        let mut tracker = WeightCallTracker {
            weight: weight.clone(),
            error_utilization_penalty: 1.0,
            child: None,
            clock: Arc::new(Clock::new()),
        };
        tracker.finish(None);
        let (mut nyu, mut stale) = (0, 0);
        assert_eq!(weight.get_weight(0, 180_000, 0, &mut nyu, &mut stale), 0.0);
    }

    #[test]
    fn test_queue_picker() {
        let picker = QueuePicker;
        assert!(matches!(picker.pick(&PickArgs::default()), PickResult::Queue));
    }

    #[test]
    fn test_failure_picker_replays_status() {
        let picker = FailurePicker::new(PolicyError::EmptyAddressList);
        match picker.pick(&PickArgs::default()) {
            PickResult::Fail(status) => assert_eq!(status, PolicyError::EmptyAddressList),
            _ => panic!("expected failing pick"),
        }
    }
}
