//! Metric emission. Instrument names match the wire-level policy name so
//! hosts can aggregate them across implementations.

use metrics::{counter, histogram};

/// Rebuilds that could not produce a scheduler and fell back to round-robin.
pub const METRIC_RR_FALLBACK: &str = "grpc.lb.wrr.rr_fallback";
/// Endpoints whose weight was unusable at rebuild time (no report yet, or
/// still inside the blackout period).
pub const METRIC_ENDPOINT_WEIGHT_NOT_YET_USABLE: &str =
    "grpc.lb.wrr.endpoint_weight_not_yet_usable";
/// Endpoints whose latest weight was older than the expiration period.
pub const METRIC_ENDPOINT_WEIGHT_STALE: &str = "grpc.lb.wrr.endpoint_weight_stale";
/// Per-endpoint weight samples, one per endpoint per rebuild.
pub const METRIC_ENDPOINT_WEIGHTS: &str = "grpc.lb.wrr.endpoint_weights";

const LABEL_TARGET: &str = "grpc.target";
const LABEL_LOCALITY: &str = "grpc.lb.locality";

#[derive(Debug, Clone)]
pub(crate) struct WrrStats {
    target: String,
    locality: String,
}

impl WrrStats {
    pub fn new(target: String, locality: String) -> Self {
        Self { target, locality }
    }

    pub fn rr_fallback(&self) {
        counter!(
            METRIC_RR_FALLBACK,
            LABEL_TARGET => self.target.clone(),
            LABEL_LOCALITY => self.locality.clone()
        )
        .increment(1);
    }

    pub fn weight_not_yet_usable(&self, count: u64) {
        counter!(
            METRIC_ENDPOINT_WEIGHT_NOT_YET_USABLE,
            LABEL_TARGET => self.target.clone(),
            LABEL_LOCALITY => self.locality.clone()
        )
        .increment(count);
    }

    pub fn weight_stale(&self, count: u64) {
        counter!(
            METRIC_ENDPOINT_WEIGHT_STALE,
            LABEL_TARGET => self.target.clone(),
            LABEL_LOCALITY => self.locality.clone()
        )
        .increment(count);
    }

    pub fn endpoint_weight(&self, weight: f32) {
        histogram!(
            METRIC_ENDPOINT_WEIGHTS,
            LABEL_TARGET => self.target.clone(),
            LABEL_LOCALITY => self.locality.clone()
        )
        .record(weight as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::Label;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_emitted_names_and_labels() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let stats = WrrStats::new("dns:///svc.example".to_string(), "us-east1-b".to_string());

        metrics::with_local_recorder(&recorder, || {
            stats.rr_fallback();
            stats.rr_fallback();
            stats.weight_not_yet_usable(3);
            stats.weight_stale(0);
            stats.endpoint_weight(200.0);
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let find = |name: &str| {
            snapshot
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .unwrap_or_else(|| panic!("missing metric {name}"))
        };

        let (key, _, _, value) = find(METRIC_RR_FALLBACK);
        assert!(matches!(value, DebugValue::Counter(2)));
        let labels: Vec<&Label> = key.key().labels().collect();
        assert!(labels
            .iter()
            .any(|l| l.key() == "grpc.target" && l.value() == "dns:///svc.example"));
        assert!(labels
            .iter()
            .any(|l| l.key() == "grpc.lb.locality" && l.value() == "us-east1-b"));

        let (_, _, _, value) = find(METRIC_ENDPOINT_WEIGHT_NOT_YET_USABLE);
        assert!(matches!(value, DebugValue::Counter(3)));

        let (_, _, _, value) = find(METRIC_ENDPOINT_WEIGHT_STALE);
        assert!(matches!(value, DebugValue::Counter(0)));

        let (_, _, _, value) = find(METRIC_ENDPOINT_WEIGHTS);
        match value {
            DebugValue::Histogram(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].into_inner(), 200.0);
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }
}
