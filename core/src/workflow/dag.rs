//! Task graph: matrix expansion, validation, Kahn's-algorithm cycle check.
//!
//! Built once per workflow submission and never mutated afterward (section
//! 3's DAG ownership note); the engine only reads from it.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{CoreError, CoreResult};
use crate::model::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl Priority {
    /// Lower numeric value sorts first, matching "lower numeric = higher
    /// priority" from section 4.6.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskMetadata {
    pub timeout: Option<f64>,
    pub priority: Priority,
    pub retry: Option<RetryConfig>,
}

/// A single node after matrix expansion — what the scheduler actually runs.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub script_command: String,
    pub depends_on: Vec<String>,
    pub skip_if: Option<String>,
    pub run_always: bool,
    pub env: HashMap<String, String>,
    pub outputs: Vec<String>,
    pub metadata: TaskMetadata,
}

/// Pre-expansion task as parsed from a workflow definition.
#[derive(Debug, Clone)]
pub struct TaskDef {
    pub id: String,
    pub script_command: String,
    pub depends_on: Vec<String>,
    pub skip_if: Option<String>,
    pub run_always: bool,
    pub env: HashMap<String, String>,
    pub outputs: Vec<String>,
    /// Declared variable order, not alphabetical — matrix task ids are built
    /// by interpolating values in this order, so it must match how the
    /// variables were written in the workflow definition.
    pub matrix: Vec<(String, Vec<String>)>,
    pub metadata: TaskMetadata,
}

pub struct Dag {
    pub name: String,
    pub tasks: HashMap<String, Task>,
    /// Insertion order, preserved so the scheduler can break priority ties
    /// by "first defined" per section 4.6.
    pub order: Vec<String>,
    pub forward_edges: HashMap<String, Vec<String>>,
    pub reverse_edges: HashMap<String, Vec<String>>,
}

impl Dag {
    pub fn build(name: impl Into<String>, defs: Vec<TaskDef>) -> CoreResult<Dag> {
        let expanded = expand_matrices(defs)?;

        let mut tasks = HashMap::new();
        let mut order = Vec::new();
        for task in expanded {
            if tasks.contains_key(&task.id) {
                return Err(CoreError::Validation(format!(
                    "duplicate task id after expansion: {}",
                    task.id
                )));
            }
            order.push(task.id.clone());
            tasks.insert(task.id.clone(), task);
        }

        for task in tasks.values() {
            for dep in &task.depends_on {
                if !tasks.contains_key(dep) {
                    return Err(CoreError::Validation(format!(
                        "task {} depends on unknown task {}",
                        task.id, dep
                    )));
                }
            }
        }

        let mut forward_edges: HashMap<String, Vec<String>> = HashMap::new();
        let mut reverse_edges: HashMap<String, Vec<String>> = HashMap::new();
        for task in tasks.values() {
            reverse_edges.entry(task.id.clone()).or_default();
            for dep in &task.depends_on {
                forward_edges.entry(dep.clone()).or_default().push(task.id.clone());
                reverse_edges.entry(task.id.clone()).or_default().push(dep.clone());
            }
        }

        assert_acyclic(&tasks, &reverse_edges)?;

        Ok(Dag {
            name: name.into(),
            tasks,
            order,
            forward_edges,
            reverse_edges,
        })
    }
}

/// Kahn's algorithm: repeatedly remove zero-in-degree nodes. If nodes remain
/// once no more can be removed, a cycle exists.
fn assert_acyclic(
    tasks: &HashMap<String, Task>,
    reverse_edges: &HashMap<String, Vec<String>>,
) -> CoreResult<()> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .keys()
        .map(|id| (id.as_str(), reverse_edges.get(id).map(|v| v.len()).unwrap_or(0)))
        .collect();

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0usize;
    let mut forward: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, deps) in reverse_edges {
        for dep in deps {
            forward.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }

    while let Some(id) = queue.pop_front() {
        visited += 1;
        if let Some(dependents) = forward.get(id) {
            for &d in dependents {
                let entry = in_degree.get_mut(d).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    queue.push_back(d);
                }
            }
        }
    }

    if visited != tasks.len() {
        return Err(CoreError::Validation(
            "workflow task graph contains a cycle".to_string(),
        ));
    }
    Ok(())
}

/// Cartesian-product expansion: a task with matrix `{a:[1,2], b:[x,y]}`
/// becomes four tasks with ids `base[1,x]`, `base[1,y]`, `base[2,x]`,
/// `base[2,y]`, each with the corresponding matrix values merged into `env`.
fn expand_matrices(defs: Vec<TaskDef>) -> CoreResult<Vec<Task>> {
    let mut expanded = Vec::new();
    for def in defs {
        if def.matrix.is_empty() {
            expanded.push(Task {
                id: def.id,
                script_command: def.script_command,
                depends_on: def.depends_on,
                skip_if: def.skip_if,
                run_always: def.run_always,
                env: def.env,
                outputs: def.outputs,
                metadata: def.metadata,
            });
            continue;
        }

        let combos = cartesian_product(&def.matrix);

        for combo in combos {
            let suffix = combo
                .iter()
                .map(|(_, v)| v.clone())
                .collect::<Vec<_>>()
                .join(",");
            let id = format!("{}[{}]", def.id, suffix);

            let mut env = def.env.clone();
            let mut script_command = def.script_command.clone();
            for (var, value) in &combo {
                env.insert((*var).clone(), value.clone());
                script_command = script_command.replace(&format!("${{{var}}}"), value);
            }

            expanded.push(Task {
                id,
                script_command,
                depends_on: def.depends_on.clone(),
                skip_if: def.skip_if.clone(),
                run_always: def.run_always,
                env,
                outputs: def.outputs.clone(),
                metadata: def.metadata.clone(),
            });
        }
    }
    Ok(expanded)
}

fn cartesian_product<'a>(matrix: &'a [(String, Vec<String>)]) -> Vec<Vec<(&'a String, String)>> {
    let mut result: Vec<Vec<(&String, String)>> = vec![Vec::new()];
    for (name, values) in matrix {
        let mut next = Vec::new();
        for partial in &result {
            for value in values {
                let mut extended = partial.clone();
                extended.push((name, value.clone()));
                next.push(extended);
            }
        }
        result = next;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_task(id: &str, depends_on: &[&str]) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            script_command: format!("echo {id}"),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            skip_if: None,
            run_always: false,
            env: HashMap::new(),
            outputs: Vec::new(),
            matrix: Vec::new(),
            metadata: TaskMetadata::default(),
        }
    }

    #[test]
    fn builds_a_valid_linear_dag() {
        let defs = vec![simple_task("a", &[]), simple_task("b", &["a"])];
        let dag = Dag::build("wf", defs).unwrap();
        assert_eq!(dag.tasks.len(), 2);
        assert_eq!(dag.reverse_edges["b"], vec!["a".to_string()]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let defs = vec![simple_task("a", &["missing"])];
        assert!(Dag::build("wf", defs).is_err());
    }

    #[test]
    fn rejects_cycles() {
        let defs = vec![simple_task("a", &["b"]), simple_task("b", &["a"])];
        assert!(Dag::build("wf", defs).is_err());
    }

    #[test]
    fn expands_matrix_into_cartesian_product() {
        let matrix = vec![
            ("py".to_string(), vec!["3.8".to_string(), "3.9".to_string()]),
            ("os".to_string(), vec!["linux".to_string(), "mac".to_string()]),
        ];

        let def = TaskDef {
            id: "t".to_string(),
            script_command: "run ${py} ${os}".to_string(),
            depends_on: Vec::new(),
            skip_if: None,
            run_always: false,
            env: HashMap::new(),
            outputs: Vec::new(),
            matrix,
            metadata: TaskMetadata::default(),
        };

        let dag = Dag::build("wf", vec![def]).unwrap();
        assert_eq!(dag.tasks.len(), 4);
        assert!(dag.tasks.contains_key("t[3.8,linux]"));
        assert!(dag.tasks.contains_key("t[3.9,mac]"));
        let task = &dag.tasks["t[3.8,linux]"];
        assert_eq!(task.env.get("py"), Some(&"3.8".to_string()));
        assert_eq!(task.script_command, "run 3.8 linux");
    }
}
