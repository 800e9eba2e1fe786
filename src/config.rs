use std::time::Duration;

use serde::Deserialize;

use crate::error::PolicyError;

/// Config for the `weighted_round_robin` policy as it appears in the service
/// config JSON. Durations are decimal seconds with an `s` suffix ("10s",
/// "0.5s").
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WrrConfig {
    /// Subscribe to out-of-band metric reports instead of per-call trackers.
    pub enable_oob_load_report: bool,
    #[serde(deserialize_with = "duration_s::deserialize")]
    pub oob_reporting_period: Duration,
    /// Zero disables the blackout.
    #[serde(deserialize_with = "duration_s::deserialize")]
    pub blackout_period: Duration,
    #[serde(deserialize_with = "duration_s::deserialize")]
    pub weight_update_period: Duration,
    #[serde(deserialize_with = "duration_s::deserialize")]
    pub weight_expiration_period: Duration,
    pub error_utilization_penalty: f32,
}

impl Default for WrrConfig {
    fn default() -> Self {
        Self {
            enable_oob_load_report: false,
            oob_reporting_period: Duration::from_secs(10),
            blackout_period: Duration::from_secs(10),
            weight_update_period: Duration::from_secs(1),
            weight_expiration_period: Duration::from_secs(180),
            error_utilization_penalty: 1.0,
        }
    }
}

impl WrrConfig {
    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        let mut config: WrrConfig =
            serde_json::from_str(json).map_err(|e| PolicyError::InvalidConfig(e.to_string()))?;
        config.post_load()?;
        Ok(config)
    }

    /// Load-time bounds the schema cannot express: the update period has a
    /// 100 ms floor, the error utilization penalty must be non-negative.
    pub fn post_load(&mut self) -> Result<(), PolicyError> {
        self.weight_update_period = self.weight_update_period.max(Duration::from_millis(100));
        if self.error_utilization_penalty < 0.0 {
            return Err(PolicyError::InvalidConfig(
                "errorUtilizationPenalty must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_s {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid duration {s:?}")))
    }

    fn parse(s: &str) -> Option<Duration> {
        let seconds: f64 = s.strip_suffix('s')?.parse().ok()?;
        if !seconds.is_finite() || seconds < 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(seconds))
    }
}
