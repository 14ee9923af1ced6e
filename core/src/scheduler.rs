//! Recurring Scheduler (C9).
//!
//! Periodically walks a set of scheduled tasks; a task fires when its cron
//! expression says `next_run <= now` and every dependency's last run
//! succeeded. Firing submits through an internal callback rather than a
//! network call, per section 4.9.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tracing::{error, info};

use crate::error::{CoreError, CoreResult};
use crate::model::RunRequest;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastStatus {
    Never,
    Success,
    Error,
}

pub struct ScheduledTask {
    pub name: String,
    pub cron_expression: String,
    pub request: RunRequest,
    pub depends_on: Vec<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub last_status: LastStatus,
    pub run_count: u64,
    pub next_run: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>, request: RunRequest) -> CoreResult<Self> {
        let cron_expression = cron_expression.into();
        let next_run = compute_next_run(&cron_expression, Utc::now())?;
        Ok(Self {
            name: name.into(),
            cron_expression,
            request,
            depends_on: Vec::new(),
            last_run: None,
            last_status: LastStatus::Never,
            run_count: 0,
            next_run: Some(next_run),
        })
    }

    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }
}

fn compute_next_run(cron_expression: &str, from: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
    let cron = Cron::new(cron_expression)
        .parse()
        .map_err(|e| CoreError::Validation(format!("invalid cron expression {cron_expression}: {e}")))?;
    cron.find_next_occurrence(&from, false)
        .map_err(|e| CoreError::Validation(format!("cron expression {cron_expression} has no next occurrence: {e}")))
}

/// Holds the scheduled-task set and ticks it; firing delegates to a
/// caller-supplied submission closure so the scheduler stays decoupled from
/// the run registry / executor wiring (the control plane owns that).
pub struct Scheduler {
    tasks: Mutex<HashMap<String, ScheduledTask>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, task: ScheduledTask) {
        self.tasks.lock().unwrap().insert(task.name.clone(), task);
    }

    pub fn remove(&self, name: &str) {
        self.tasks.lock().unwrap().remove(name);
    }

    pub fn status_of(&self, name: &str) -> Option<LastStatus> {
        self.tasks.lock().unwrap().get(name).map(|t| t.last_status)
    }

    /// Runs one tick: fires every task whose `next_run <= now` and whose
    /// dependencies all last succeeded, via `submit`. `submit` returning
    /// `Err` records `last_status = error` without aborting the tick.
    pub async fn tick<F, Fut>(&self, submit: F)
    where
        F: Fn(RunRequest) -> Fut,
        Fut: std::future::Future<Output = CoreResult<()>>,
    {
        let now = Utc::now();
        let due: Vec<String> = {
            let tasks = self.tasks.lock().unwrap();
            tasks
                .values()
                .filter(|t| t.next_run.map(|n| n <= now).unwrap_or(false))
                .filter(|t| {
                    t.depends_on.iter().all(|dep| {
                        tasks
                            .get(dep)
                            .map(|d| d.last_status == LastStatus::Success)
                            .unwrap_or(false)
                    })
                })
                .map(|t| t.name.clone())
                .collect()
        };

        for name in due {
            let request = {
                let tasks = self.tasks.lock().unwrap();
                tasks.get(&name).map(|t| t.request.clone())
            };
            let Some(request) = request else { continue };

            let result = submit(request).await;
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(task) = tasks.get_mut(&name) {
                task.last_run = Some(now);
                task.run_count += 1;
                match result {
                    Ok(()) => {
                        task.last_status = LastStatus::Success;
                        info!(task = %name, "scheduled task fired");
                    }
                    Err(e) => {
                        task.last_status = LastStatus::Error;
                        error!(task = %name, error = %e, "scheduled task failed to queue");
                    }
                }
                match compute_next_run(&task.cron_expression, now) {
                    Ok(next) => task.next_run = Some(next),
                    Err(e) => {
                        error!(task = %name, error = %e, "failed to compute next run, disabling task");
                        task.next_run = None;
                    }
                }
            }
        }
    }

    /// Runs `tick` forever at `interval`, stopping when `shutdown` resolves.
    pub async fn run_forever<F, Fut>(&self, interval: Duration, submit: F, mut shutdown: tokio::sync::oneshot::Receiver<()>)
    where
        F: Fn(RunRequest) -> Fut,
        Fut: std::future::Future<Output = CoreResult<()>>,
    {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(&submit).await,
                _ = &mut shutdown => break,
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request() -> RunRequest {
        RunRequest {
            script_path: "job.py".to_string(),
            argv: vec![],
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: None,
            capture_output: true,
            log_level: "INFO".to_string(),
            stream_output: false,
            retry: None,
        }
    }

    #[tokio::test]
    async fn fires_task_whose_next_run_has_passed() {
        let scheduler = Scheduler::new();
        let mut task = ScheduledTask::new("every_minute", "* * * * *", request()).unwrap();
        task.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        scheduler.add(task);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        scheduler
            .tick(move |_req| {
                let fired = fired2.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status_of("every_minute"), Some(LastStatus::Success));
    }

    #[tokio::test]
    async fn records_error_status_when_submission_fails() {
        let scheduler = Scheduler::new();
        let mut task = ScheduledTask::new("flaky", "* * * * *", request()).unwrap();
        task.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        scheduler.add(task);

        scheduler
            .tick(|_req| async { Err(CoreError::Validation("bad path".to_string())) })
            .await;

        assert_eq!(scheduler.status_of("flaky"), Some(LastStatus::Error));
    }

    #[tokio::test]
    async fn dependency_must_have_succeeded_before_firing() {
        let scheduler = Scheduler::new();
        let mut upstream = ScheduledTask::new("upstream", "* * * * *", request()).unwrap();
        upstream.next_run = Some(Utc::now() + chrono::Duration::hours(1));
        upstream.last_status = LastStatus::Never;
        scheduler.add(upstream);

        let mut downstream = ScheduledTask::new("downstream", "* * * * *", request()).unwrap()
            .with_dependencies(vec!["upstream".to_string()]);
        downstream.next_run = Some(Utc::now() - chrono::Duration::seconds(1));
        scheduler.add(downstream);

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        scheduler
            .tick(move |_req| {
                let fired = fired2.clone();
                async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(fired.load(Ordering::SeqCst), 0, "downstream should not fire until upstream succeeds");
    }
}
