//! Workflow scheduler (section 4.6's execution phase).
//!
//! Single-threaded cooperative scheduling of task *selection*; task
//! *execution* runs concurrently up to `max_parallel`, each one delegating
//! through the execution controller (C2) with its own inline retry loop
//! (the same policy as the standalone retry driver, section 4.3).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::condition::{self, TaskAttrContext};
use crate::eventlog::{EventSink, NullSink};
use crate::executor::{ControlHandle, ExecutionController};
use crate::model::{ExecutionRecord, RunRequest};
use crate::path_policy::PathPolicy;
use crate::retry::{nominal_delay, should_retry, with_jitter};

use super::dag::{Dag, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub execution: Option<ExecutionRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Completed,
    Failed,
    Aborted,
}

pub struct WorkflowOutcome {
    pub status: WorkflowStatus,
    pub results: HashMap<String, TaskResult>,
}

/// Bridges finished task results into the `task.attribute` side of the
/// predicate grammar that `skip_if` can reference.
struct TaskResultsContext<'a> {
    results: &'a HashMap<String, TaskResult>,
}

impl<'a> TaskAttrContext for TaskResultsContext<'a> {
    fn exit_code(&self, task_id: &str) -> Option<i32> {
        self.results.get(task_id)?.execution.as_ref().map(|e| e.exit_code)
    }

    fn status(&self, task_id: &str) -> Option<String> {
        let result = self.results.get(task_id)?;
        Some(
            match result.status {
                TaskStatus::Completed => "completed",
                TaskStatus::Failed => "failed",
                TaskStatus::Skipped => "skipped",
                TaskStatus::Running => "running",
                TaskStatus::Pending => "pending",
            }
            .to_string(),
        )
    }

    fn duration(&self, task_id: &str) -> Option<f64> {
        self.results
            .get(task_id)?
            .execution
            .as_ref()
            .map(|e| e.duration_seconds)
    }
}

/// Mutable slot so the scheduler can cancel whichever attempt of a retrying
/// task happens to be in flight right now.
type HandleSlot = Arc<Mutex<Option<ControlHandle>>>;

pub struct WorkflowEngine {
    controller: Arc<ExecutionController>,
    max_parallel: usize,
}

impl WorkflowEngine {
    pub fn new(path_policy: PathPolicy, max_parallel: usize) -> Self {
        Self {
            controller: Arc::new(
                ExecutionController::new(path_policy)
                    .with_grace_period(std::time::Duration::from_secs(5)),
            ),
            max_parallel: max_parallel.max(1),
        }
    }

    /// Runs every task in `dag` to completion. `cancel` is polled at each
    /// scheduling step; when set, all running tasks are stopped and every
    /// remaining pending task is marked skipped, yielding `Aborted`.
    pub async fn run(
        &self,
        dag: &Dag,
        workflow_env: &HashMap<String, String>,
        cancel: Option<ControlHandle>,
    ) -> WorkflowOutcome {
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut running_handles: HashMap<String, HandleSlot> = HashMap::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        for id in &dag.order {
            results.insert(
                id.clone(),
                TaskResult {
                    task_id: id.clone(),
                    status: TaskStatus::Pending,
                    execution: None,
                },
            );
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<TaskResult>();
        let mut aborted = false;

        loop {
            if let Some(handle) = &cancel {
                if handle.is_cancel_requested() && !aborted {
                    aborted = true;
                    for slot in running_handles.values() {
                        if let Some(h) = slot.lock().unwrap().as_ref() {
                            h.cancel();
                        }
                    }
                    for result in results.values_mut() {
                        if result.status == TaskStatus::Pending {
                            result.status = TaskStatus::Skipped;
                        }
                    }
                }
            }

            if aborted && in_flight.is_empty() {
                break;
            }

            // Resolve ready/blocked transitions for every still-pending task.
            // Walk dag.order (declaration order, not a topological sort) and
            // loop to a fixed point: a transitive skip chain like a, b:a,
            // c:a, d:b must see b's just-computed Skipped status resolve d
            // in the same scheduling step, and nothing here guarantees d
            // comes after b in one unordered pass.
            loop {
                let mut changed = false;
                for id in &dag.order {
                    if results[id].status != TaskStatus::Pending {
                        continue;
                    }
                    let task = &dag.tasks[id];
                    let dep_statuses: Vec<TaskStatus> =
                        task.depends_on.iter().map(|d| results[d].status).collect();

                    let any_failed = dep_statuses
                        .iter()
                        .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Skipped));
                    let all_resolved = dep_statuses.iter().all(|s| {
                        matches!(s, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped)
                    });

                    if any_failed && !task.run_always {
                        results.get_mut(id).unwrap().status = TaskStatus::Skipped;
                        info!(task = %id, "skipped: upstream dependency did not complete");
                        changed = true;
                        continue;
                    }

                    if !all_resolved {
                        continue;
                    }

                    if let Some(skip_if) = &task.skip_if {
                        let ctx = TaskResultsContext { results: &results };
                        let empty_metrics = HashMap::new();
                        match condition::eval_str(skip_if, &empty_metrics, &ctx) {
                            Some(true) => {
                                results.get_mut(id).unwrap().status = TaskStatus::Skipped;
                                changed = true;
                            }
                            Some(false) => {}
                            None => {
                                warn!(task = %id, condition = %skip_if, "malformed skip_if, treated as false");
                            }
                        }
                    }
                }
                if !changed {
                    break;
                }
            }

            // Select up to max_parallel-running ready tasks, priority then
            // insertion order.
            let mut ready: Vec<&Task> = dag
                .order
                .iter()
                .filter(|id| results[*id].status == TaskStatus::Pending)
                .filter(|id| {
                    dag.tasks[*id]
                        .depends_on
                        .iter()
                        .all(|d| matches!(results[d].status, TaskStatus::Completed))
                })
                .map(|id| &dag.tasks[id])
                .collect();
            ready.sort_by_key(|t| t.metadata.priority.rank());

            let capacity = self.max_parallel.saturating_sub(in_flight.len());
            if !aborted {
                for task in ready.into_iter().take(capacity) {
                    in_flight.insert(task.id.clone());
                    results.get_mut(&task.id).unwrap().status = TaskStatus::Running;

                    let handle_slot: HandleSlot = Arc::new(Mutex::new(None));
                    running_handles.insert(task.id.clone(), handle_slot.clone());

                    let controller = self.controller.clone();
                    let tx = tx.clone();
                    let task_id = task.id.clone();
                    let mut env = workflow_env.clone();
                    env.extend(task.env.clone());
                    let mut argv = shell_words(&task.script_command);
                    let script_path = if argv.is_empty() {
                        String::new()
                    } else {
                        argv.remove(0)
                    };
                    let timeout_seconds = task.metadata.timeout;
                    let retry_config = task.metadata.retry.clone().unwrap_or_default();

                    let request = RunRequest {
                        script_path,
                        argv,
                        env,
                        working_dir: None,
                        timeout_seconds,
                        capture_output: true,
                        log_level: "INFO".to_string(),
                        stream_output: false,
                        retry: Some(retry_config.clone()),
                    };

                    tokio::spawn(async move {
                        let correlation_id = Uuid::new_v4();
                        let max_attempts = retry_config.max_attempts.max(1);
                        let sink: Arc<dyn EventSink> = Arc::new(NullSink);
                        let mut record = None;

                        for attempt in 1..=max_attempts {
                            let (handle, ticket) = controller.handle();
                            *handle_slot.lock().unwrap() = Some(handle.clone());

                            let attempt_record = controller
                                .run(request.clone(), ticket, correlation_id, attempt, sink.clone())
                                .await;

                            let retry_eligible =
                                attempt < max_attempts && should_retry(&attempt_record, &retry_config);
                            let cancel_requested = handle.is_cancel_requested();
                            record = Some(attempt_record);

                            if !retry_eligible || cancel_requested {
                                break;
                            }

                            let delay = with_jitter(
                                nominal_delay(
                                    retry_config.strategy,
                                    attempt,
                                    retry_config.initial_delay,
                                    retry_config.max_delay,
                                ),
                                retry_config.jitter,
                            );
                            if delay > 0.0 {
                                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                            }
                        }

                        let record = record.expect("at least one attempt always runs");
                        let status = if record.success {
                            TaskStatus::Completed
                        } else {
                            TaskStatus::Failed
                        };
                        let _ = tx.send(TaskResult {
                            task_id,
                            status,
                            execution: Some(record),
                        });
                    });
                }
            }

            let all_resolved = results.values().all(|r| r.status != TaskStatus::Pending);
            if in_flight.is_empty() && all_resolved {
                break;
            }

            if let Some(finished) = rx.recv().await {
                in_flight.remove(&finished.task_id);
                running_handles.remove(&finished.task_id);
                results.insert(finished.task_id.clone(), finished);
            }
        }

        let status = if aborted {
            WorkflowStatus::Aborted
        } else if results.values().any(|r| r.status == TaskStatus::Failed) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        WorkflowOutcome { status, results }
    }
}

/// Minimal shell-word splitter for `script_command` — no quoting semantics
/// beyond whitespace splitting, matching the task definition's documented
/// form (`script: <command line>`).
fn shell_words(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::dag::TaskDef;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    fn task(id: &str, script: String, depends_on: &[&str]) -> TaskDef {
        TaskDef {
            id: id.to_string(),
            script_command: script,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            skip_if: None,
            run_always: false,
            env: HashMap::new(),
            outputs: Vec::new(),
            matrix: Vec::new(),
            metadata: crate::workflow::dag::TaskMetadata::default(),
        }
    }

    #[tokio::test]
    async fn runs_linear_chain_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_script(dir.path(), "a.sh", "#!/bin/sh\nexit 0\n");
        let b = write_script(dir.path(), "b.sh", "#!/bin/sh\nexit 0\n");

        let dag = Dag::build("wf", vec![task("a", a, &[]), task("b", b, &["a"])]).unwrap();
        let engine = WorkflowEngine::new(PathPolicy::relaxed(dir.path()), 2);
        let outcome = engine.run(&dag, &HashMap::new(), None).await;

        assert_eq!(outcome.status, WorkflowStatus::Completed);
        assert_eq!(outcome.results["a"].status, TaskStatus::Completed);
        assert_eq!(outcome.results["b"].status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_dependency_skips_downstream() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_script(dir.path(), "a.sh", "#!/bin/sh\nexit 1\n");
        let b = write_script(dir.path(), "b.sh", "#!/bin/sh\nexit 0\n");

        let dag = Dag::build("wf", vec![task("a", a, &[]), task("b", b, &["a"])]).unwrap();
        let engine = WorkflowEngine::new(PathPolicy::relaxed(dir.path()), 2);
        let outcome = engine.run(&dag, &HashMap::new(), None).await;

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(outcome.results["a"].status, TaskStatus::Failed);
        assert_eq!(outcome.results["b"].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn transitive_skip_propagates_through_a_two_hop_chain() {
        // a fails; b and c depend on a directly; d depends on b. d must end
        // up Skipped within the same run even though the resolution pass
        // sees these tasks in declaration order, not dependency order.
        let dir = tempfile::tempdir().unwrap();
        let a = write_script(dir.path(), "a.sh", "#!/bin/sh\nexit 1\n");
        let b = write_script(dir.path(), "b.sh", "#!/bin/sh\nexit 0\n");
        let c = write_script(dir.path(), "c.sh", "#!/bin/sh\nexit 0\n");
        let d = write_script(dir.path(), "d.sh", "#!/bin/sh\nexit 0\n");

        let dag = Dag::build(
            "wf",
            vec![
                task("a", a, &[]),
                task("b", b, &["a"]),
                task("c", c, &["a"]),
                task("d", d, &["b"]),
            ],
        )
        .unwrap();
        let engine = WorkflowEngine::new(PathPolicy::relaxed(dir.path()), 2);
        let outcome = engine.run(&dag, &HashMap::new(), None).await;

        assert_eq!(outcome.status, WorkflowStatus::Failed);
        assert_eq!(outcome.results["a"].status, TaskStatus::Failed);
        assert_eq!(outcome.results["b"].status, TaskStatus::Skipped);
        assert_eq!(outcome.results["c"].status, TaskStatus::Skipped);
        assert_eq!(outcome.results["d"].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn matrix_expanded_tasks_all_run() {
        let dir = tempfile::tempdir().unwrap();
        let script_path = write_script(dir.path(), "m.sh", "#!/bin/sh\nexit 0\n");
        let matrix = vec![("v".to_string(), vec!["1".to_string(), "2".to_string()])];
        let def = TaskDef {
            id: "t".to_string(),
            script_command: script_path,
            depends_on: Vec::new(),
            skip_if: None,
            run_always: false,
            env: HashMap::new(),
            outputs: Vec::new(),
            matrix,
            metadata: crate::workflow::dag::TaskMetadata::default(),
        };
        let dag = Dag::build("wf", vec![def]).unwrap();
        let engine = WorkflowEngine::new(PathPolicy::relaxed(dir.path()), 2);
        let outcome = engine.run(&dag, &HashMap::new(), None).await;
        assert_eq!(outcome.status, WorkflowStatus::Completed);
        assert_eq!(outcome.results.len(), 2);
    }
}
