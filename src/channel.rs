//! Host-facing interfaces: what the policy needs from the channel it lives in
//! (subchannel creation, state publication, timers) and what it hands back
//! (pickers, call trackers).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PolicyError;
use crate::timer::Timers;
use crate::weight::EndpointAddressSet;

/// Connectivity of one subchannel, or of the policy as a whole.
///
/// There is deliberately no SHUTDOWN variant; a shutdown subchannel must not
/// report into the policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
        };
        f.write_str(name)
    }
}

/// Load signals reported by a backend, either per-call or on the out-of-band
/// stream.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackendMetricReport {
    pub qps: f64,
    pub eps: f64,
    pub application_utilization: f64,
    pub cpu_utilization: f64,
}

impl BackendMetricReport {
    /// Application utilization when strictly positive, else CPU utilization.
    pub fn utilization(&self) -> f64 {
        if self.application_utilization > 0.0 {
            self.application_utilization
        } else {
            self.cpu_utilization
        }
    }
}

/// Arguments for one pick; constructed by the call-routing layer and passed
/// through to the child picker untouched.
#[derive(Debug, Default)]
pub struct PickArgs {
    /// RPC method path.
    pub path: String,
}

pub enum PickResult {
    Complete(CompletePick),
    /// No subchannel usable yet; the call should wait for a new picker.
    Queue,
    Fail(PolicyError),
}

pub struct CompletePick {
    pub subchannel: Arc<dyn Subchannel>,
    pub call_tracker: Option<Box<dyn CallTracker>>,
}

pub trait SubchannelPicker: Send + Sync {
    fn pick(&self, args: &PickArgs) -> PickResult;
}

/// Observes one call's lifetime. `finish` receives the backend's load report
/// for the call, when the backend sent one.
pub trait CallTracker: Send {
    fn start(&mut self);
    fn finish(&mut self, metrics: Option<&BackendMetricReport>);
}

/// Receives connectivity transitions for one subchannel. Implementations of
/// [`Subchannel::watch_connectivity`] must deliver notifications
/// asynchronously, never from inside the registration call.
pub trait ConnectivityWatcher: Send + Sync {
    fn on_state_change(&self, state: ConnectivityState, status: Option<PolicyError>);
}

/// Receives out-of-band backend metric reports.
pub trait OobMetricWatcher: Send + Sync {
    fn on_report(&self, report: &BackendMetricReport);
}

/// One connection (or connection attempt) to one endpoint, owned by the host
/// channel.
pub trait Subchannel: Send + Sync {
    fn watch_connectivity(&self, watcher: Box<dyn ConnectivityWatcher>);
    fn request_connection(&self);
    fn reset_backoff(&self);
    fn watch_oob_metrics(&self, period: Duration, watcher: Box<dyn OobMetricWatcher>);
    /// Picker delegated to once this subchannel is READY.
    fn picker(&self) -> Arc<dyn SubchannelPicker>;
}

/// Capabilities the host channel provides to the policy.
///
/// `update_state` may be invoked while the policy holds its control lock;
/// implementations must not call back into the policy synchronously.
pub trait ChannelHelper: Send + Sync {
    fn create_subchannel(
        &self,
        addresses: &EndpointAddressSet,
    ) -> Result<Arc<dyn Subchannel>, PolicyError>;
    fn update_state(
        &self,
        state: ConnectivityState,
        status: Option<PolicyError>,
        picker: Arc<dyn SubchannelPicker>,
    );
    fn timers(&self) -> Arc<dyn Timers>;
    /// Target string, used as a telemetry label.
    fn target(&self) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_prefers_application() {
        let report = BackendMetricReport {
            qps: 10.0,
            eps: 0.0,
            application_utilization: 0.7,
            cpu_utilization: 0.2,
        };
        assert_eq!(report.utilization(), 0.7);
    }

    #[test]
    fn test_utilization_falls_back_to_cpu() {
        let report = BackendMetricReport {
            qps: 10.0,
            eps: 0.0,
            application_utilization: 0.0,
            cpu_utilization: 0.2,
        };
        assert_eq!(report.utilization(), 0.2);

        let negative = BackendMetricReport {
            application_utilization: -1.0,
            cpu_utilization: 0.3,
            ..Default::default()
        };
        assert_eq!(negative.utilization(), 0.3);
    }
}
