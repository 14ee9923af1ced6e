//! Workflow definition parsing — the YAML/JSON document format from
//! section 6, turned into the `dag::TaskDef` list `Dag::build` consumes.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{CoreError, CoreResult};
use crate::model::{RetryConfig, RetryStrategy};

use super::dag::{Priority, TaskDef, TaskMetadata};

#[derive(Debug, Deserialize)]
pub struct WorkflowDef {
    pub id: String,
    #[serde(default)]
    pub config: WorkflowConfig,
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize, Default)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

fn default_max_parallel() -> usize {
    4
}

#[derive(Debug, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub script: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub skip_if: Option<String>,
    #[serde(default)]
    pub run_always: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_ordered_matrix")]
    pub matrix: Vec<(String, Vec<String>)>,
    #[serde(default)]
    pub metadata: TaskEntryMetadata,
}

/// Deserializes the `matrix` mapping preserving the order its keys were
/// written in, since that order becomes part of every expanded task's id
/// (`dag::expand_matrices`) and must match the workflow author's expectation
/// rather than an arbitrary `HashMap` order.
fn deserialize_ordered_matrix<'de, D>(
    deserializer: D,
) -> Result<Vec<(String, Vec<String>)>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct OrderedMapVisitor;

    impl<'de> serde::de::Visitor<'de> for OrderedMapVisitor {
        type Value = Vec<(String, Vec<String>)>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a mapping of matrix variable name to a list of values")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: serde::de::MapAccess<'de>,
        {
            let mut entries = Vec::new();
            while let Some((key, value)) = map.next_entry::<String, Vec<String>>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedMapVisitor)
}

#[derive(Debug, Deserialize, Default)]
pub struct TaskEntryMetadata {
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub priority: Option<PriorityEntry>,
    #[serde(default)]
    pub retry: Option<RetryEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityEntry {
    Low,
    Normal,
    High,
}

impl From<PriorityEntry> for Priority {
    fn from(p: PriorityEntry) -> Self {
        match p {
            PriorityEntry::Low => Priority::Low,
            PriorityEntry::Normal => Priority::Normal,
            PriorityEntry::High => Priority::High,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RetryEntry {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    /// Present in the wire format for documentation parity with the
    /// original profiler's backoff knob; this engine's strategies are
    /// selected by name elsewhere, so the multiplier only applies when
    /// `strategy` is exponential and is otherwise ignored.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub retry_on_exit_codes: Vec<i32>,
}

fn default_max_attempts() -> u32 {
    1
}
fn default_initial_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    60.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl From<RetryEntry> for RetryConfig {
    fn from(r: RetryEntry) -> Self {
        RetryConfig {
            max_attempts: r.max_attempts,
            strategy: RetryStrategy::Exponential,
            initial_delay: r.initial_delay,
            max_delay: r.max_delay,
            jitter: true,
            retry_on_exit_codes: r.retry_on_exit_codes,
        }
    }
}

pub fn parse_workflow_yaml(yaml: &str) -> CoreResult<(WorkflowDef, Vec<TaskDef>)> {
    let def: WorkflowDef = serde_yaml::from_str(yaml)
        .map_err(|e| CoreError::Validation(format!("invalid workflow definition: {e}")))?;

    if def.tasks.is_empty() {
        return Err(CoreError::Validation(
            "workflow definition has no tasks".to_string(),
        ));
    }

    let task_defs = def
        .tasks
        .iter()
        .map(|entry| TaskDef {
            id: entry.id.clone(),
            script_command: entry.script.clone(),
            depends_on: entry.depends_on.clone(),
            skip_if: entry.skip_if.clone(),
            run_always: entry.run_always,
            env: entry.env.clone(),
            outputs: entry.outputs.clone(),
            matrix: entry.matrix.clone(),
            metadata: TaskMetadata {
                timeout: entry.metadata.timeout,
                priority: entry
                    .metadata
                    .priority
                    .as_ref()
                    .map(|p| match p {
                        PriorityEntry::Low => Priority::Low,
                        PriorityEntry::Normal => Priority::Normal,
                        PriorityEntry::High => Priority::High,
                    })
                    .unwrap_or_default(),
                retry: entry.metadata.retry.as_ref().map(|r| RetryConfig {
                    max_attempts: r.max_attempts,
                    strategy: RetryStrategy::Exponential,
                    initial_delay: r.initial_delay,
                    max_delay: r.max_delay,
                    jitter: true,
                    retry_on_exit_codes: r.retry_on_exit_codes.clone(),
                }),
            },
        })
        .collect();

    Ok((def, task_defs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_workflow() {
        let yaml = r#"
id: build-and-test
config:
  max_parallel: 2
tasks:
  - id: build
    script: build.py
  - id: test
    script: test.py
    depends_on: [build]
    metadata:
      timeout: 30
      priority: high
"#;
        let (def, tasks) = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(def.id, "build-and-test");
        assert_eq!(def.config.max_parallel, 2);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].depends_on, vec!["build".to_string()]);
        assert_eq!(tasks[1].metadata.priority, Priority::High);
    }

    #[test]
    fn rejects_empty_task_list() {
        let yaml = "id: empty\ntasks: []\n";
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn parses_matrix_and_skip_if() {
        let yaml = r#"
id: matrix-wf
tasks:
  - id: t
    script: "run ${py}"
    matrix:
      py: ["3.8", "3.9"]
    skip_if: "build.exit_code != 0"
"#;
        let (_def, tasks) = parse_workflow_yaml(yaml).unwrap();
        assert_eq!(
            tasks[0].matrix,
            vec![("py".to_string(), vec!["3.8".to_string(), "3.9".to_string()])]
        );
        assert_eq!(tasks[0].skip_if.as_deref(), Some("build.exit_code != 0"));
    }
}
