use std::time::Duration;

use crate::Result;
use crate::config::Env;

const DEFAULT_METRICS_PORT: u16 = 2469;
const DEFAULT_LAG_REFRESH_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MetricsConfig {
    pub(crate) port: u16,
    /// How often the consumer lag gauge is refreshed.
    pub(crate) lag_refresh_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_METRICS_PORT,
            lag_refresh_interval: Duration::from_millis(DEFAULT_LAG_REFRESH_INTERVAL_MS),
        }
    }
}

impl MetricsConfig {
    pub(crate) fn from_env(env: &Env<'_>) -> Result<Self> {
        Ok(Self {
            port: env.parse("TABLESYNC_METRICS_PORT", DEFAULT_METRICS_PORT)?,
            lag_refresh_interval: env.millis(
                "TABLESYNC_LAG_REFRESH_INTERVAL_MS",
                DEFAULT_LAG_REFRESH_INTERVAL_MS,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::vars;

    #[test]
    fn test_metrics_config_from_env() {
        let map = vars(&[
            ("TABLESYNC_METRICS_PORT", "9090"),
            ("TABLESYNC_LAG_REFRESH_INTERVAL_MS", "250"),
        ]);
        let config = MetricsConfig::from_env(&Env(&map)).unwrap();
        assert_eq!(config.port, 9090);
        assert_eq!(config.lag_refresh_interval, Duration::from_millis(250));
    }
}
