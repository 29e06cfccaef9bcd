//! Process configuration from `DESKHUB_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineSettings;
use crate::limits::MAX_BOOKING_SPAN_MS;
use crate::model::MINUTE;
use crate::payment::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub iot_webhook_secret: Option<String>,
    pub payment_webhook_secret: Option<String>,
    pub gateway_url: String,
    pub gateway_api_key: String,
    pub gateway_timeout: Duration,
    pub gateway_max_attempts: usize,
    pub gateway_retry_delay: Duration,
    pub overstay_watch_mins: i64,
    pub verification_freeze_mins: Option<i64>,
    pub sweep_interval: Duration,
    /// 64 hex chars. Unset means a per-process key.
    pub field_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| lookup(&format!("DESKHUB_{name}")).filter(|v| !v.trim().is_empty());
        let parsed = |name: &str| var(name).and_then(|v| v.trim().parse::<u64>().ok());
        // Verification windows are capped at the longest possible booking.
        let minutes = |name: &str| {
            parsed(name).map(|n| {
                i64::try_from(n)
                    .unwrap_or(i64::MAX)
                    .min(MAX_BOOKING_SPAN_MS / MINUTE)
            })
        };

        Self {
            port: var("PORT").and_then(|v| v.parse().ok()).unwrap_or(8080),
            bind: var("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(var("DATA_DIR").unwrap_or_else(|| "./data".into())),
            metrics_port: var("METRICS_PORT").and_then(|v| v.parse().ok()),
            compact_threshold: parsed("COMPACT_THRESHOLD").unwrap_or(1000),
            iot_webhook_secret: var("IOT_WEBHOOK_SECRET"),
            payment_webhook_secret: var("PAYMENT_WEBHOOK_SECRET"),
            gateway_url: var("GATEWAY_URL").unwrap_or_else(|| "http://localhost:8081".into()),
            gateway_api_key: var("GATEWAY_API_KEY").unwrap_or_else(|| "demo-key".into()),
            gateway_timeout: Duration::from_secs(parsed("GATEWAY_TIMEOUT_SECS").unwrap_or(30)),
            gateway_max_attempts: parsed("GATEWAY_MAX_ATTEMPTS").map_or(3, |n| n as usize),
            gateway_retry_delay: Duration::from_millis(
                parsed("GATEWAY_RETRY_DELAY_MS").unwrap_or(1000),
            ),
            overstay_watch_mins: minutes("OVERSTAY_WATCH_MINS").unwrap_or(60),
            verification_freeze_mins: minutes("VERIFICATION_FREEZE_MINS"),
            sweep_interval: Duration::from_secs(parsed("SWEEP_INTERVAL_SECS").unwrap_or(60).max(1)),
            field_key: var("FIELD_KEY"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("deskhub.wal")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            overstay_watch: self.overstay_watch_mins * MINUTE,
            freeze_after: self.verification_freeze_mins.map(|m| m * MINUTE),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.gateway_max_attempts, self.gateway_retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c.port, 8080);
        assert_eq!(c.bind, "0.0.0.0");
        assert_eq!(c.wal_path(), PathBuf::from("./data/deskhub.wal"));
        assert_eq!(c.metrics_port, None);
        assert_eq!(c.gateway_timeout, Duration::from_secs(30));
        assert_eq!(c.retry_policy(), RetryPolicy::new(3, Duration::from_secs(1)));
        assert_eq!(c.engine_settings(), EngineSettings::default());
        assert!(c.iot_webhook_secret.is_none());
    }

    #[test]
    fn overrides_and_bad_values() {
        let c = config(&[
            ("DESKHUB_PORT", "9000"),
            ("DESKHUB_METRICS_PORT", "9100"),
            ("DESKHUB_GATEWAY_MAX_ATTEMPTS", "5"),
            ("DESKHUB_OVERSTAY_WATCH_MINS", "0"),
            ("DESKHUB_VERIFICATION_FREEZE_MINS", "1440"),
            ("DESKHUB_COMPACT_THRESHOLD", "lots"),
            ("DESKHUB_IOT_WEBHOOK_SECRET", "  "),
        ]);
        assert_eq!(c.port, 9000);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.gateway_max_attempts, 5);
        assert_eq!(c.engine_settings().overstay_watch, 0);
        assert_eq!(c.engine_settings().freeze_after, Some(1440 * MINUTE));
        assert_eq!(c.compact_threshold, 1000);
        assert!(c.iot_webhook_secret.is_none());
    }

    #[test]
    fn huge_windows_are_capped() {
        let c = config(&[
            ("DESKHUB_OVERSTAY_WATCH_MINS", "18446744073709551615"),
            ("DESKHUB_VERIFICATION_FREEZE_MINS", "9223372036854775807"),
        ]);
        let settings = c.engine_settings();
        assert_eq!(settings.overstay_watch, MAX_BOOKING_SPAN_MS);
        assert_eq!(settings.freeze_after, Some(MAX_BOOKING_SPAN_MS));
    }
}
