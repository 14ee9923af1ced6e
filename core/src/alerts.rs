//! Alert / Performance-Gate Evaluator (C4).
//!
//! Evaluates predicate rules against a metrics map, honours per-rule
//! throttling, and dispatches notifications through the sink registry. A
//! malformed condition never aborts a run: it is logged and the rule is
//! dropped for that evaluation.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::condition::{self, TaskAttrContext};
use crate::model::{AlertEvent, AlertRule, GateKind, GateResult, PerformanceGate};
use crate::notify::SinkRegistry;

/// No task-attribute context is meaningful outside a workflow, so alert
/// conditions over plain metrics use this stub implementation.
struct NoTasks;
impl TaskAttrContext for NoTasks {
    fn exit_code(&self, _task_id: &str) -> Option<i32> {
        None
    }
    fn status(&self, _task_id: &str) -> Option<String> {
        None
    }
    fn duration(&self, _task_id: &str) -> Option<f64> {
        None
    }
}

pub struct AlertEvaluator {
    sinks: SinkRegistry,
    last_triggered: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertEvaluator {
    pub fn new(sinks: SinkRegistry) -> Self {
        Self {
            sinks,
            last_triggered: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluates every enabled rule against `metrics`. Returns the alerts
    /// that actually fired (i.e. were not throttled); a rule that matches
    /// but is throttled is counted (its last-triggered timestamp is left
    /// untouched) but produces no event.
    pub fn evaluate(&self, rules: &[AlertRule], metrics: &HashMap<String, f64>) -> Vec<AlertEvent> {
        let mut fired = Vec::new();
        let now = Utc::now();

        for rule in rules {
            if !rule.enabled {
                continue;
            }

            let matched = match condition::eval_str(&rule.condition, metrics, &NoTasks) {
                Some(result) => result,
                None => {
                    warn!(rule = %rule.name, condition = %rule.condition, "malformed alert condition, skipping");
                    continue;
                }
            };

            if !matched {
                continue;
            }

            let mut last = self.last_triggered.lock().unwrap();
            let throttled = last
                .get(&rule.name)
                .map(|t| (now - *t).num_seconds() < rule.throttle_seconds as i64)
                .unwrap_or(false);

            if throttled {
                continue;
            }

            last.insert(rule.name.clone(), now);
            drop(last);

            let event = AlertEvent {
                rule_name: rule.name.clone(),
                severity: rule.severity,
                timestamp: now,
                metric_snapshot: metrics.clone(),
            };
            self.sinks.dispatch(&rule.channels, &event);
            fired.push(event);
        }

        fired
    }
}

/// Evaluates performance gates; structurally identical to the alert
/// evaluator but without throttling or notification — the caller decides
/// whether a failing gate becomes a non-zero process exit.
pub fn evaluate_gates(gates: &[PerformanceGate], metrics: &HashMap<String, f64>) -> Vec<GateResult> {
    let mut results = Vec::new();
    for gate in gates {
        let Some(observed) = metrics.get(&gate.metric_name).copied() else {
            continue;
        };
        if let Some(max) = gate.max_value {
            results.push(GateResult {
                metric_name: gate.metric_name.clone(),
                observed,
                bound: max,
                kind: GateKind::Max,
                passed: observed <= max,
            });
        }
        if let Some(min) = gate.min_value {
            results.push(GateResult {
                metric_name: gate.metric_name.clone(),
                observed,
                bound: min,
                kind: GateKind::Min,
                passed: observed >= min,
            });
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;

    fn rule(name: &str, condition: &str, throttle: u64) -> AlertRule {
        AlertRule {
            name: name.to_string(),
            condition: condition.to_string(),
            severity: Severity::Warning,
            channels: vec!["stdout".to_string()],
            throttle_seconds: throttle,
            enabled: true,
        }
    }

    fn metrics(cpu_max: f64) -> HashMap<String, f64> {
        let mut m = HashMap::new();
        m.insert("cpu_max".to_string(), cpu_max);
        m
    }

    #[test]
    fn fires_once_then_throttles() {
        let mut sinks = SinkRegistry::new();
        sinks.register(Box::new(crate::notify::StdoutSink));
        let evaluator = AlertEvaluator::new(sinks);
        let rules = vec![rule("high_cpu", "cpu_max > 10", 3600)];

        let first = evaluator.evaluate(&rules, &metrics(20.0));
        assert_eq!(first.len(), 1);

        let second = evaluator.evaluate(&rules, &metrics(20.0));
        assert_eq!(second.len(), 0, "throttled, no second event");
    }

    #[test]
    fn malformed_condition_never_panics() {
        let evaluator = AlertEvaluator::new(SinkRegistry::new());
        let rules = vec![rule("bad", "not a condition", 0)];
        let fired = evaluator.evaluate(&rules, &metrics(1.0));
        assert!(fired.is_empty());
    }

    #[test]
    fn disabled_rule_never_evaluated() {
        let evaluator = AlertEvaluator::new(SinkRegistry::new());
        let mut r = rule("off", "cpu_max > 0", 0);
        r.enabled = false;
        assert!(evaluator.evaluate(&[r], &metrics(100.0)).is_empty());
    }

    #[test]
    fn gate_reports_pass_and_fail() {
        let gates = vec![PerformanceGate {
            metric_name: "cpu_max".to_string(),
            max_value: Some(50.0),
            min_value: None,
        }];
        let passing = evaluate_gates(&gates, &metrics(10.0));
        assert!(passing[0].passed);
        let failing = evaluate_gates(&gates, &metrics(90.0));
        assert!(!failing[0].passed);
    }
}
