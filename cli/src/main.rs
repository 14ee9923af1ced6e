//! `runner` — direct-invocation CLI driver for the script execution engine.
//!
//! Positional `<script_path> [args...]` plus the flags in section 6: retry
//! policy, alert/gate config, analyzer toggles, and JSON/JUnit report output.

mod report;

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use core_engine::alerts::{evaluate_gates, AlertEvaluator};
use core_engine::analyze::MetricAnalyzer;
use core_engine::config::RunnerConfig;
use core_engine::eventlog::NullSink;
use core_engine::executor::ExecutionController;
use core_engine::history::HistoryStore;
use core_engine::model::{GateKind, PerformanceGate, RetryStrategy, RunRequest};
use core_engine::notify::{SinkRegistry, StdoutSink, WebhookSink};
use core_engine::path_policy::PathPolicy;
use core_engine::retry::RetryDriver;

#[derive(Parser, Debug)]
#[command(name = "runner", about = "Run a script under supervision, with retry, alerting, and history")]
struct Cli {
    script_path: String,
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    #[arg(long)]
    timeout: Option<f64>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "runner_history.db")]
    history_db: PathBuf,
    #[arg(long)]
    json_output: Option<PathBuf>,
    #[arg(long)]
    junit_output: Option<PathBuf>,
    #[arg(long)]
    detect_anomalies: bool,
    #[arg(long)]
    analyze_trend: bool,
    #[arg(long)]
    detect_regression: bool,
    #[arg(long = "add-gate", value_parser = parse_gate)]
    add_gate: Vec<PerformanceGate>,
    #[arg(long)]
    fail_on_gate_failure: bool,
    #[arg(long)]
    retry_strategy: Option<String>,
    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long)]
    initial_delay: Option<f64>,
    #[arg(long)]
    max_delay: Option<f64>,
    #[arg(long)]
    alert_config: Option<String>,
    #[arg(long)]
    slack_webhook: Option<String>,
    #[arg(long)]
    email_to: Option<String>,
}

fn parse_gate(raw: &str) -> Result<PerformanceGate, String> {
    let (metric, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected <metric>:<value>, got {raw}"))?;
    let value: f64 = value
        .parse()
        .map_err(|_| format!("gate value must be numeric, got {value}"))?;
    Ok(PerformanceGate {
        metric_name: metric.to_string(),
        max_value: Some(value),
        min_value: None,
    })
}

fn retry_strategy_from_name(name: &str) -> Result<RetryStrategy> {
    match name {
        "fixed" => Ok(RetryStrategy::Fixed),
        "linear" => Ok(RetryStrategy::Linear),
        "exponential" => Ok(RetryStrategy::Exponential),
        "fibonacci" => Ok(RetryStrategy::Fibonacci),
        other => anyhow::bail!("unknown retry strategy: {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let exit_code = run(cli).await?;
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config = match &cli.config {
        Some(path) => RunnerConfig::load(path).context("failed to load config file")?,
        None => RunnerConfig::default(),
    };

    let mut retry_config = config.retry.clone().unwrap_or_default();
    if let Some(name) = &cli.retry_strategy {
        retry_config.strategy = retry_strategy_from_name(name)?;
    }
    if let Some(n) = cli.max_attempts {
        retry_config.max_attempts = n;
    }
    if let Some(d) = cli.initial_delay {
        retry_config.initial_delay = d;
    }
    if let Some(d) = cli.max_delay {
        retry_config.max_delay = d;
    }

    let allow_root = std::env::var("ALLOWED_SCRIPT_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default());
    let path_policy = PathPolicy::default_profile(allow_root);

    let request = RunRequest {
        script_path: cli.script_path.clone(),
        argv: cli.args.clone(),
        env: HashMap::new(),
        working_dir: None,
        timeout_seconds: cli.timeout,
        capture_output: true,
        log_level: "INFO".to_string(),
        stream_output: false,
        retry: Some(retry_config.clone()),
    };

    let controller = ExecutionController::new(path_policy);
    let driver = RetryDriver::new(controller);
    let (_handle, record) = driver.run(request, retry_config, std::sync::Arc::new(NullSink)).await;

    let history_path = std::env::var("HISTORY_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or(cli.history_db.clone());
    if let Ok(store) = HistoryStore::open(&history_path) {
        if let Err(e) = store.save_execution(&record) {
            tracing::warn!(error = %e, "failed to persist execution history");
        }
    } else {
        tracing::warn!(path = %history_path.display(), "failed to open history store");
    }

    let mut sinks = SinkRegistry::new();
    sinks.register(Box::new(StdoutSink));
    if let Some(url) = &cli.slack_webhook {
        sinks.register(Box::new(WebhookSink::new("slack", url.clone())));
    }
    if cli.email_to.is_some() {
        tracing::info!("email notification channel configured but no transport is wired in this build");
    }

    let evaluator = AlertEvaluator::new(sinks);
    let mut alert_rules = config.alerts.clone();
    if let Some(raw) = &cli.alert_config {
        if core_engine::condition::parse(raw).is_some() {
            alert_rules.push(core_engine::model::AlertRule {
                name: "cli_alert".to_string(),
                condition: raw.clone(),
                severity: core_engine::model::Severity::Warning,
                channels: vec!["stdout".to_string()],
                throttle_seconds: 0,
                enabled: true,
            });
        } else {
            tracing::warn!(condition = %raw, "malformed --alert-config condition, ignoring");
        }
    }
    evaluator.evaluate(&alert_rules, &record.metrics);

    let mut gates = config.performance_gates.clone();
    gates.extend(cli.add_gate.clone());
    let gate_results = evaluate_gates(&gates, &record.metrics);
    let any_gate_failed = gate_results.iter().any(|g| !g.passed);
    for gate in &gate_results {
        let verb = match gate.kind {
            GateKind::Max => "<=",
            GateKind::Min => ">=",
        };
        if !gate.passed {
            tracing::warn!(
                metric = %gate.metric_name,
                "gate failed: {} {} {} did not hold",
                gate.observed,
                verb,
                gate.bound
            );
        }
    }

    if cli.detect_anomalies || cli.analyze_trend || cli.detect_regression {
        run_analyzers(&history_path, &cli, &record.script_path);
    }

    if let Some(path) = &cli.json_output {
        report::write_json_report(path, &record, &gate_results)?;
    }
    if let Some(path) = &cli.junit_output {
        report::write_junit_report(path, &record, &gate_results)?;
    }

    println!(
        "{} exit_code={} success={} attempt={}",
        record.script_path, record.exit_code, record.success, record.attempt_number
    );

    if record.error.is_some() && (record.cancelled || record.timed_out || record.exit_code < 0) {
        return Ok(1);
    }
    if any_gate_failed && cli.fail_on_gate_failure {
        return Ok(2);
    }
    if record.exit_code != 0 {
        return Ok(record.exit_code);
    }
    Ok(0)
}

fn run_analyzers(history_path: &PathBuf, cli: &Cli, script_path: &str) {
    let Ok(store) = HistoryStore::open(history_path) else {
        return;
    };
    let Ok(values) = store.get_aggregated_metrics(script_path, "execution_time_seconds", 50) else {
        return;
    };
    let observations: Vec<core_engine::analyze::MetricObservation> = values
        .into_iter()
        .rev()
        .map(|v| core_engine::analyze::MetricObservation {
            value: v,
            observed_at: chrono::Utc::now(),
        })
        .collect();

    if cli.detect_anomalies {
        let findings = core_engine::analyze::ZScoreAnomalyDetector::default()
            .analyze("execution_time_seconds", &observations);
        for f in findings {
            println!("[anomaly] {}", f.message);
        }
    }
    if cli.analyze_trend {
        let findings = core_engine::analyze::LinearTrendAnalyzer::default()
            .analyze("execution_time_seconds", &observations);
        for f in findings {
            println!("[trend] {}", f.message);
        }
    }
    if cli.detect_regression {
        let findings = core_engine::analyze::BaselineRegressionDetector::default()
            .analyze("execution_time_seconds", &observations);
        for f in findings {
            println!("[regression] {}", f.message);
        }
    }
}
