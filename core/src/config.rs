//! Configuration file parsing (section 6): `alerts`, `performance_gates`,
//! `notifications`, `retry`. TOML is the primary format (matching the
//! teacher's config stack); a `.json`/`.yaml`/`.yml` extension selects the
//! matching parser instead.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::model::{AlertRule, PerformanceGate, RetryConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
    #[serde(default)]
    pub performance_gates: Vec<PerformanceGate>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationsConfig {
    #[serde(default)]
    pub email: Option<EmailConfig>,
    #[serde(default)]
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub to: Vec<String>,
    #[serde(default)]
    pub smtp_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
}

impl RunnerConfig {
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Validation(format!("failed to read config {}: {e}", path.display())))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&contents)
                .map_err(|e| CoreError::Validation(format!("invalid JSON config: {e}"))),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)
                .map_err(|e| CoreError::Validation(format!("invalid YAML config: {e}"))),
            _ => toml::from_str(&contents)
                .map_err(|e| CoreError::Validation(format!("invalid TOML config: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_toml_config() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [[alerts]]
            name = "high_cpu"
            condition = "cpu_max > 80"
            channels = ["stdout"]

            [[performance_gates]]
            metric_name = "execution_time_seconds"
            max_value = 30.0
            "#
        )
        .unwrap();

        let config = RunnerConfig::load(file.path()).unwrap();
        assert_eq!(config.alerts.len(), 1);
        assert_eq!(config.performance_gates.len(), 1);
    }

    #[test]
    fn loads_json_config_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            file,
            r#"{{"alerts": [], "performance_gates": [{{"metric_name": "cpu_max", "max_value": 90.0}}]}}"#
        )
        .unwrap();

        let config = RunnerConfig::load(file.path()).unwrap();
        assert_eq!(config.performance_gates.len(), 1);
    }

    #[test]
    fn missing_file_is_a_validation_error() {
        let err = RunnerConfig::load("/nonexistent/path.toml").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
