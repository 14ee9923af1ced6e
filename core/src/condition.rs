//! Tiny predicate language shared by the alert/gate evaluator (C4) and the
//! workflow engine's `skip_if` (C6).
//!
//! Per the design notes, conditions are never handed to a general-purpose
//! evaluator or turned into exceptions: parsing produces a typed AST, and
//! evaluation returns `None` for "bad condition, log and drop" rather than
//! raising. Grammar:
//!
//!   <metric_name> <op> <numeric_literal>
//!   <task_id>.<attribute> <op> <numeric_literal | string_literal>
//!
//! where `op` is one of `==, !=, <, <=, >, >=` and `attribute` is one of
//! `exit_code, status, duration`.

use std::collections::HashMap;

use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn parse(s: &str) -> Option<Op> {
        match s {
            "==" => Some(Op::Eq),
            "!=" => Some(Op::Ne),
            "<" => Some(Op::Lt),
            "<=" => Some(Op::Le),
            ">" => Some(Op::Gt),
            ">=" => Some(Op::Ge),
            _ => None,
        }
    }

    fn apply(&self, a: f64, b: f64) -> bool {
        match self {
            Op::Eq => a == b,
            Op::Ne => a != b,
            Op::Lt => a < b,
            Op::Le => a <= b,
            Op::Gt => a > b,
            Op::Ge => a >= b,
        }
    }

    fn apply_str(&self, a: &str, b: &str) -> bool {
        match self {
            Op::Eq => a == b,
            Op::Ne => a != b,
            // Ordering ops on strings are not part of the grammar's intent;
            // treat as "never true" rather than guessing a lexicographic order.
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

/// A parsed, typed condition. Either a plain metric comparison (used by
/// alerts and performance gates) or a `task.attribute` comparison (used only
/// by `skip_if`).
#[derive(Debug, Clone)]
pub enum Condition {
    Metric {
        name: String,
        op: Op,
        value: Literal,
    },
    TaskAttr {
        task_id: String,
        attr: String,
        op: Op,
        value: Literal,
    },
}

fn pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][\w.]*)\s*(==|!=|<=|>=|<|>)\s*(.+?)\s*$").unwrap()
    })
}

fn parse_literal(raw: &str) -> Literal {
    let trimmed = raw.trim();
    if let Ok(n) = trimmed.parse::<f64>() {
        Literal::Number(n)
    } else {
        Literal::Text(trimmed.trim_matches(|c| c == '"' || c == '\'').to_string())
    }
}

/// Parses a condition string. Returns `None` on malformed syntax — the
/// caller logs and drops it, it never panics or propagates an error.
pub fn parse(condition: &str) -> Option<Condition> {
    let caps = pattern().captures(condition)?;
    let lhs = caps.get(1)?.as_str();
    let op = Op::parse(caps.get(2)?.as_str())?;
    let value = parse_literal(caps.get(3)?.as_str());

    if let Some((task_id, attr)) = lhs.split_once('.') {
        if matches!(attr, "exit_code" | "status" | "duration") {
            return Some(Condition::TaskAttr {
                task_id: task_id.to_string(),
                attr: attr.to_string(),
                op,
                value,
            });
        }
    }

    Some(Condition::Metric {
        name: lhs.to_string(),
        op,
        value,
    })
}

/// Context available when evaluating a `Condition::Metric`.
pub type MetricContext<'a> = &'a HashMap<String, f64>;

/// Context available when evaluating a `Condition::TaskAttr`: per-task
/// attribute values, keyed by task id then attribute name.
pub trait TaskAttrContext {
    fn exit_code(&self, task_id: &str) -> Option<i32>;
    fn status(&self, task_id: &str) -> Option<String>;
    fn duration(&self, task_id: &str) -> Option<f64>;
}

/// Evaluates a parsed condition. Returns `None` when the referenced metric
/// or task attribute is missing — "bad condition at eval time", not a panic.
pub fn eval(
    condition: &Condition,
    metrics: MetricContext,
    tasks: &dyn TaskAttrContext,
) -> Option<bool> {
    match condition {
        Condition::Metric { name, op, value } => {
            let observed = *metrics.get(name)?;
            let target = match value {
                Literal::Number(n) => *n,
                Literal::Text(_) => return None,
            };
            Some(op.apply(observed, target))
        }
        Condition::TaskAttr {
            task_id,
            attr,
            op,
            value,
        } => match attr.as_str() {
            "exit_code" => {
                let observed = tasks.exit_code(task_id)? as f64;
                let target = match value {
                    Literal::Number(n) => *n,
                    Literal::Text(_) => return None,
                };
                Some(op.apply(observed, target))
            }
            "duration" => {
                let observed = tasks.duration(task_id)?;
                let target = match value {
                    Literal::Number(n) => *n,
                    Literal::Text(_) => return None,
                };
                Some(op.apply(observed, target))
            }
            "status" => {
                let observed = tasks.status(task_id)?;
                let target = match value {
                    Literal::Text(s) => s.clone(),
                    Literal::Number(n) => n.to_string(),
                };
                Some(op.apply_str(&observed, &target))
            }
            _ => None,
        },
    }
}

/// Evaluates a raw condition string end-to-end, never raising — a malformed
/// condition is logged by the caller and treated as "does not match".
pub fn eval_str(condition: &str, metrics: MetricContext, tasks: &dyn TaskAttrContext) -> Option<bool> {
    let parsed = parse(condition)?;
    eval(&parsed, metrics, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoTasks;
    impl TaskAttrContext for NoTasks {
        fn exit_code(&self, _: &str) -> Option<i32> {
            None
        }
        fn status(&self, _: &str) -> Option<String> {
            None
        }
        fn duration(&self, _: &str) -> Option<f64> {
            None
        }
    }

    #[test]
    fn parses_metric_comparison() {
        let c = parse("cpu_max > 10").unwrap();
        matches!(c, Condition::Metric { .. });
    }

    #[test]
    fn evaluates_metric_threshold() {
        let mut m = HashMap::new();
        m.insert("cpu_max".to_string(), 20.0);
        let c = parse("cpu_max > 10").unwrap();
        assert_eq!(eval(&c, &m, &NoTasks), Some(true));
    }

    #[test]
    fn malformed_condition_is_none_not_panic() {
        assert!(parse("this is not a condition").is_none());
        assert_eq!(eval_str("garbage ~~ 1", &HashMap::new(), &NoTasks), None);
    }

    #[test]
    fn task_attr_condition_parses() {
        let c = parse("build.exit_code != 0").unwrap();
        match c {
            Condition::TaskAttr { task_id, attr, .. } => {
                assert_eq!(task_id, "build");
                assert_eq!(attr, "exit_code");
            }
            _ => panic!("expected TaskAttr"),
        }
    }

    struct OneTask;
    impl TaskAttrContext for OneTask {
        fn exit_code(&self, task_id: &str) -> Option<i32> {
            (task_id == "build").then_some(1)
        }
        fn status(&self, _: &str) -> Option<String> {
            None
        }
        fn duration(&self, _: &str) -> Option<f64> {
            None
        }
    }

    #[test]
    fn task_attr_condition_evaluates() {
        let c = parse("build.exit_code != 0").unwrap();
        assert_eq!(eval(&c, &HashMap::new(), &OneTask), Some(true));
    }
}
