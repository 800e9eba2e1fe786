//! Fake collaborators for driving the policy in tests: a recording channel
//! helper, scriptable subchannels, and a manually fired timer service.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::channel::{
    BackendMetricReport, ChannelHelper, CompletePick, ConnectivityState, ConnectivityWatcher,
    OobMetricWatcher, PickArgs, PickResult, Subchannel, SubchannelPicker,
};
use crate::error::PolicyError;
use crate::timer::{TimerHandle, Timers};
use crate::weight::EndpointAddressSet;

pub(crate) struct FakeHelper {
    pub subchannels: Mutex<Vec<Arc<FakeSubchannel>>>,
    pub states: Mutex<Vec<(ConnectivityState, Option<PolicyError>, Arc<dyn SubchannelPicker>)>>,
    pub timers: Arc<FakeTimers>,
    /// Address sets for which create_subchannel fails.
    pub fail_addresses: Mutex<Vec<EndpointAddressSet>>,
}

impl FakeHelper {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subchannels: Mutex::new(Vec::new()),
            states: Mutex::new(Vec::new()),
            timers: FakeTimers::new(),
            fail_addresses: Mutex::new(Vec::new()),
        })
    }

    pub fn last_state(&self) -> Option<ConnectivityState> {
        self.states.lock().unwrap().last().map(|(state, _, _)| *state)
    }

    pub fn last_status(&self) -> Option<PolicyError> {
        self.states
            .lock()
            .unwrap()
            .last()
            .and_then(|(_, status, _)| status.clone())
    }

    pub fn last_picker(&self) -> Option<Arc<dyn SubchannelPicker>> {
        self.states
            .lock()
            .unwrap()
            .last()
            .map(|(_, _, picker)| picker.clone())
    }

    pub fn num_states(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    /// Drops every published picker; used to orphan the current one.
    pub fn clear_states(&self) {
        self.states.lock().unwrap().clear();
    }

    pub fn num_subchannels(&self) -> usize {
        self.subchannels.lock().unwrap().len()
    }

    /// Subchannel by creation order.
    pub fn sub(&self, index: usize) -> Arc<FakeSubchannel> {
        self.subchannels.lock().unwrap()[index].clone()
    }
}

impl ChannelHelper for FakeHelper {
    fn create_subchannel(
        &self,
        addresses: &EndpointAddressSet,
    ) -> Result<Arc<dyn Subchannel>, PolicyError> {
        if self.fail_addresses.lock().unwrap().contains(addresses) {
            return Err(PolicyError::Other("connection refused".to_string()));
        }
        let subchannel = FakeSubchannel::new(addresses.clone());
        self.subchannels.lock().unwrap().push(subchannel.clone());
        Ok(subchannel)
    }

    fn update_state(
        &self,
        state: ConnectivityState,
        status: Option<PolicyError>,
        picker: Arc<dyn SubchannelPicker>,
    ) {
        self.states.lock().unwrap().push((state, status, picker));
    }

    fn timers(&self) -> Arc<dyn Timers> {
        self.timers.clone()
    }

    fn target(&self) -> String {
        "dns:///test.example".to_string()
    }
}

pub(crate) struct FakeSubchannel {
    pub key: EndpointAddressSet,
    pub connect_requests: AtomicUsize,
    pub backoff_resets: AtomicUsize,
    watcher: Mutex<Option<Box<dyn ConnectivityWatcher>>>,
    oob: Mutex<Option<(Duration, Box<dyn OobMetricWatcher>)>>,
    picker: Arc<LeafPicker>,
}

impl FakeSubchannel {
    pub fn new(key: EndpointAddressSet) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<FakeSubchannel>| Self {
            key,
            connect_requests: AtomicUsize::new(0),
            backoff_resets: AtomicUsize::new(0),
            watcher: Mutex::new(None),
            oob: Mutex::new(None),
            picker: Arc::new(LeafPicker {
                subchannel: weak.clone(),
            }),
        })
    }

    /// Delivers a connectivity notification to the registered watcher.
    pub fn notify(&self, state: ConnectivityState, status: Option<PolicyError>) {
        let watcher = self.watcher.lock().unwrap();
        if let Some(watcher) = &*watcher {
            watcher.on_state_change(state, status);
        }
    }

    pub fn send_oob(&self, report: &BackendMetricReport) {
        let oob = self.oob.lock().unwrap();
        if let Some((_, watcher)) = &*oob {
            watcher.on_report(report);
        }
    }

    pub fn oob_period(&self) -> Option<Duration> {
        self.oob.lock().unwrap().as_ref().map(|(period, _)| *period)
    }
}

impl Subchannel for FakeSubchannel {
    fn watch_connectivity(&self, watcher: Box<dyn ConnectivityWatcher>) {
        *self.watcher.lock().unwrap() = Some(watcher);
    }

    fn request_connection(&self) {
        self.connect_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn reset_backoff(&self) {
        self.backoff_resets.fetch_add(1, Ordering::Relaxed);
    }

    fn watch_oob_metrics(&self, period: Duration, watcher: Box<dyn OobMetricWatcher>) {
        *self.oob.lock().unwrap() = Some((period, watcher));
    }

    fn picker(&self) -> Arc<dyn SubchannelPicker> {
        self.picker.clone()
    }
}

/// Leaf picker: completes every pick with its own subchannel and no tracker.
struct LeafPicker {
    subchannel: Weak<FakeSubchannel>,
}

impl SubchannelPicker for LeafPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        match self.subchannel.upgrade() {
            Some(subchannel) => PickResult::Complete(CompletePick {
                subchannel,
                call_tracker: None,
            }),
            None => PickResult::Fail(PolicyError::Other("subchannel gone".to_string())),
        }
    }
}

/// True when the picked subchannel is `expected`.
pub(crate) fn picked(result: &PickResult, expected: &Arc<FakeSubchannel>) -> bool {
    match result {
        PickResult::Complete(complete) => {
            Arc::as_ptr(&complete.subchannel) as *const () == Arc::as_ptr(expected) as *const ()
        }
        _ => false,
    }
}

struct ScheduledTimer {
    id: u64,
    #[allow(dead_code)]
    delay: Duration,
    callback: Box<dyn FnOnce() + Send>,
}

/// Timer service fired by hand from tests.
pub(crate) struct FakeTimers {
    next_id: AtomicU64,
    queue: Mutex<Vec<ScheduledTimer>>,
    cancelled: AtomicUsize,
}

impl FakeTimers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            queue: Mutex::new(Vec::new()),
            cancelled: AtomicUsize::new(0),
        })
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Fires every currently queued timer once; timers re-armed by the
    /// callbacks stay queued for the next round.
    pub fn fire_all_once(&self) {
        let drained: Vec<ScheduledTimer> = std::mem::take(&mut *self.queue.lock().unwrap());
        for timer in drained {
            (timer.callback)();
        }
    }

    /// Removes every queued callback without running it, simulating timers
    /// already dequeued by the event engine.
    pub fn steal_all(&self) -> Vec<Box<dyn FnOnce() + Send>> {
        std::mem::take(&mut *self.queue.lock().unwrap())
            .into_iter()
            .map(|timer| timer.callback)
            .collect()
    }
}

impl Timers for FakeTimers {
    fn run_after(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().unwrap().push(ScheduledTimer {
            id,
            delay,
            callback,
        });
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let mut queue = self.queue.lock().unwrap();
        let before = queue.len();
        queue.retain(|timer| timer.id != handle.0);
        if queue.len() < before {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }
}
