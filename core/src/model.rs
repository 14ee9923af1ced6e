//! Data model for the execution engine.
//!
//! Mirrors spec section 3. Timestamps are UTC and serialised as ISO-8601,
//! matching the wire protocol in section 6.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stable identifier linking all attempts of a single logical run.
pub type CorrelationId = Uuid;

/// One per child-process invocation, frozen once the child exits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    /// Assigned by the history store on save; `None` until persisted.
    pub id: Option<i64>,
    pub script_path: String,
    pub argv: Vec<String>,
    pub exit_code: i32,
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub stdout_text: String,
    pub stderr_text: String,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
    pub attempt_number: u32,
    pub timed_out: bool,
    pub cancelled: bool,
    pub correlation_id: CorrelationId,
    pub metrics: HashMap<String, f64>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// `success ⇔ exit_code = 0 ∧ ¬timed_out ∧ ¬cancelled`, computed rather than
    /// trusted, so callers can't construct an inconsistent record by hand.
    pub fn compute_success(exit_code: i32, timed_out: bool, cancelled: bool) -> bool {
        exit_code == 0 && !timed_out && !cancelled
    }
}

/// `{execution_id, name, value, observed_at}` — one row per sampled scalar.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub execution_id: i64,
    pub name: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
}

/// Input to the Execution Controller (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub script_path: String,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    #[serde(default = "default_true")]
    pub capture_output: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub stream_output: bool,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            script_path: String::new(),
            argv: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: None,
            capture_output: default_true(),
            log_level: default_log_level(),
            stream_output: false,
            retry: None,
        }
    }
}

/// The control-plane's view of a run (queue/lifecycle + embedded final record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub request: RunRequest,
    pub result: Option<ExecutionRecord>,
    pub error: Option<String>,
    pub correlation_id: CorrelationId,
    pub run_status: String,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Retry strategy enumeration (section 4.3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
    Fibonacci,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Empty means "any non-zero exit code except cancelled" per spec default.
    #[serde(default)]
    pub retry_on_exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_strategy() -> RetryStrategy {
    RetryStrategy::Fixed
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: default_strategy(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            jitter: true,
            retry_on_exit_codes: Vec::new(),
        }
    }
}

/// `{name, condition, severity, channels, throttle_seconds}` plus runtime state
/// owned by the evaluator (last-triggered timestamps live in `AlertEvaluator`,
/// not here, so rules stay plain data).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub condition: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_throttle")]
    pub throttle_seconds: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_throttle() -> u64 {
    0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// Produced by the evaluator, appended to a bounded history buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub rule_name: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub metric_snapshot: HashMap<String, f64>,
}

/// `{metric_name, max_value | min_value}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceGate {
    pub metric_name: String,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub min_value: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub metric_name: String,
    pub observed: f64,
    pub bound: f64,
    pub kind: GateKind,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum GateKind {
    Max,
    Min,
}
