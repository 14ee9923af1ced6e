//! Execution Controller (C2).
//!
//! Runs exactly one child process and produces one `ExecutionRecord`. Owns
//! process lifecycle (spawn, supervise, timeout, cancel, stop vs. kill),
//! stdout/stderr capture, and composition with the Resource Sampler (C1).
//! `run()` is blocking for its caller; `cancel`/`stop`/`kill` are safe to
//! call from another thread/task and are idempotent after the first
//! effective call, per section 5's concurrency contract.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::eventlog::{Event, EventSink, NullSink};
use crate::model::{CorrelationId, ExecutionRecord, RunRequest};
use crate::path_policy::PathPolicy;
use crate::sampler::{ResourceSampler, DEFAULT_SAMPLE_INTERVAL};

/// Grace period between cooperative signal and forced kill.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Caps applied to captured output; exceeding either truncates and records
/// `metrics["output_truncated"] = 1` rather than failing the run.
const MAX_OUTPUT_LINES: usize = 100_000;
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// Dangerous environment variables stripped before execution per section 4.8.
pub const DANGEROUS_ENV_VARS: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "PYTHONPATH",
];

pub fn sanitize_env(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .filter(|(k, _)| !DANGEROUS_ENV_VARS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[derive(Default)]
struct ControlState {
    cancel_requested: AtomicBool,
    kill_requested: AtomicBool,
    child_pid: std::sync::Mutex<Option<i32>>,
    notify: Notify,
}

/// A handle that can cancel/stop/kill a run in progress from another thread.
#[derive(Clone)]
pub struct ControlHandle {
    state: Arc<ControlState>,
}

impl ControlHandle {
    fn signal_child(&self, sig: Signal) {
        if let Ok(guard) = self.state.child_pid.lock() {
            if let Some(pid) = *guard {
                send_signal_to_group(pid, sig);
            }
        }
    }

    /// Cooperative: signal the process group; the controller's grace timer
    /// force-kills if the child doesn't exit in time.
    pub fn cancel(&self) {
        self.state.cancel_requested.store(true, Ordering::SeqCst);
        self.signal_child(Signal::Term);
        self.state.notify.notify_waiters();
    }

    /// Semantically identical to `cancel`, spelled separately because it
    /// represents graceful user intent rather than an internal decision.
    pub fn stop(&self) {
        self.cancel();
    }

    /// Skip the grace period entirely.
    pub fn kill(&self) {
        self.state.kill_requested.store(true, Ordering::SeqCst);
        self.state.cancel_requested.store(true, Ordering::SeqCst);
        self.signal_child(Signal::Kill);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.cancel_requested.load(Ordering::SeqCst)
    }
}

/// A shared handle into one run's control state, created alongside a
/// `ControlHandle` by `ExecutionController::handle`.
pub struct RunTicket {
    state: Arc<ControlState>,
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal_to_group(pid: i32, sig: Signal) {
    use nix::sys::signal::{kill, Signal as NixSignal};
    use nix::unistd::Pid as NixPid;
    let nix_sig = match sig {
        Signal::Term => NixSignal::SIGTERM,
        Signal::Kill => NixSignal::SIGKILL,
    };
    // Negative pid addresses the whole process group we created via setsid.
    let _ = kill(NixPid::from_raw(-pid), nix_sig);
}

#[cfg(not(unix))]
fn send_signal_to_group(_pid: i32, _sig: Signal) {
    // No portable process-group signal outside Unix; callers fall back to
    // Child::kill, which only reaches the immediate child.
}

#[cfg(unix)]
fn new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(std::io::Error::from));
    }
}

#[cfg(not(unix))]
fn new_process_group(_cmd: &mut Command) {}

/// Outcome of the select-race between child exit / timeout / cancel.
enum Termination {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

pub struct ExecutionController {
    path_policy: PathPolicy,
    sample_interval: Duration,
    grace_period: Duration,
}

impl ExecutionController {
    pub fn new(path_policy: PathPolicy) -> Self {
        Self {
            path_policy,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Returns a control handle alongside the run ticket so the caller can
    /// cancel/stop/kill from another task while `run` is in flight.
    pub fn handle(&self) -> (ControlHandle, RunTicket) {
        let state = Arc::new(ControlState::default());
        (
            ControlHandle {
                state: state.clone(),
            },
            RunTicket { state },
        )
    }

    pub async fn run(
        &self,
        request: RunRequest,
        ticket: RunTicket,
        correlation_id: CorrelationId,
        attempt_number: u32,
        sink: Arc<dyn EventSink>,
    ) -> ExecutionRecord {
        let started_at = Utc::now();
        sink.publish(Event::start(correlation_id, attempt_number));

        // Cancel that arrives before spawn must be honoured.
        if ticket.state.cancel_requested.load(Ordering::SeqCst) {
            return cancelled_before_start(&request, started_at, correlation_id, attempt_number);
        }

        let resolved_path = match self.path_policy.validate(&request.script_path) {
            Ok(p) => p,
            Err(e) => {
                return spawn_failure(
                    &request,
                    started_at,
                    correlation_id,
                    attempt_number,
                    format!("spawn failed: {e}"),
                );
            }
        };

        let mut command = Command::new(&resolved_path);
        command.args(&request.argv);
        command.envs(sanitize_env(&request.env));
        if let Some(dir) = &request.working_dir {
            command.current_dir(dir);
        }
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        new_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return spawn_failure(
                    &request,
                    started_at,
                    correlation_id,
                    attempt_number,
                    format!("spawn failed: {e}"),
                );
            }
        };

        let pid = child.id().unwrap_or(0) as i32;
        *ticket.state.child_pid.lock().unwrap() = Some(pid);
        sink.publish(Event::subprocess_spawned(correlation_id, pid));

        let sampler = ResourceSampler::start(pid as u32, self.sample_interval);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(capture_stream(
            stdout,
            request.stream_output,
            sink.clone(),
        ));
        let stderr_task = tokio::spawn(capture_stream(
            stderr,
            request.stream_output,
            sink.clone(),
        ));

        let termination = self.race_to_termination(&mut child, &request, &ticket).await;

        let (stdout_text, stdout_lines, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr_text, stderr_lines, stderr_truncated) = stderr_task.await.unwrap_or_default();

        let aggregate = sampler.stop();
        sink.publish(Event::metric_summary(correlation_id));

        let finished_at = Utc::now();
        let duration_seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;

        let (exit_code, timed_out, cancelled, error) = match termination {
            Termination::Exited(status) => (status.code().unwrap_or(-1), false, false, None),
            Termination::TimedOut => (-1, true, false, None),
            Termination::Cancelled => {
                let err = if ticket.state.kill_requested.load(Ordering::SeqCst) {
                    "killed".to_string()
                } else {
                    "Run cancelled by user".to_string()
                };
                (-1, false, true, Some(err))
            }
        };

        let success = ExecutionRecord::compute_success(exit_code, timed_out, cancelled);

        let mut metrics: HashMap<String, f64> = aggregate
            .into_metrics()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        metrics.insert("execution_time_seconds".to_string(), duration_seconds);
        metrics.insert("stdout_lines".to_string(), stdout_lines as f64);
        metrics.insert("stderr_lines".to_string(), stderr_lines as f64);
        metrics.insert("exit_code".to_string(), exit_code as f64);
        if stdout_truncated || stderr_truncated {
            metrics.insert("output_truncated".to_string(), 1.0);
        }

        sink.publish(Event::finish(correlation_id, exit_code, success));
        sink.publish(Event::attempt_complete(correlation_id, attempt_number, success));

        ExecutionRecord {
            id: None,
            script_path: request.script_path.clone(),
            argv: request.argv.clone(),
            exit_code,
            success,
            started_at,
            finished_at,
            duration_seconds,
            stdout_text,
            stderr_text,
            stdout_lines,
            stderr_lines,
            attempt_number,
            timed_out,
            cancelled,
            correlation_id,
            metrics,
            error,
        }
    }

    /// Convenience for callers that don't need live event streaming.
    pub async fn run_silent(
        &self,
        request: RunRequest,
        ticket: RunTicket,
        correlation_id: CorrelationId,
        attempt_number: u32,
    ) -> ExecutionRecord {
        self.run(request, ticket, correlation_id, attempt_number, Arc::new(NullSink))
            .await
    }

    async fn race_to_termination(
        &self,
        child: &mut Child,
        request: &RunRequest,
        ticket: &RunTicket,
    ) -> Termination {
        let timeout_fut = async {
            match request.timeout_seconds {
                Some(secs) if secs > 0.0 => tokio::time::sleep(Duration::from_secs_f64(secs)).await,
                _ => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(s) => Termination::Exited(s),
                    Err(_) => unix_failure_status(),
                }
            }
            _ = timeout_fut => {
                self.terminate_with_grace(child).await;
                Termination::TimedOut
            }
            _ = wait_for_cancel(ticket) => {
                if ticket.state.kill_requested.load(Ordering::SeqCst) {
                    let _ = child.kill().await;
                } else {
                    self.terminate_with_grace(child).await;
                }
                Termination::Cancelled
            }
        }
    }

    async fn terminate_with_grace(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            send_signal_to_group(pid as i32, Signal::Term);
        }
        let grace = tokio::time::sleep(self.grace_period);
        tokio::select! {
            _ = child.wait() => {}
            _ = grace => {
                let _ = child.kill().await;
                let _ = child.wait().await;
            }
        }
    }
}

/// Resolves once a cancel has been requested, for racing against
/// child-exit and timeout in `tokio::select!`.
async fn wait_for_cancel(ticket: &RunTicket) {
    loop {
        let notified = ticket.state.notify.notified();
        if ticket.state.cancel_requested.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

#[cfg(unix)]
fn unix_failure_status() -> Termination {
    use std::os::unix::process::ExitStatusExt;
    Termination::Exited(std::process::ExitStatus::from_raw(-1))
}

#[cfg(not(unix))]
fn unix_failure_status() -> Termination {
    Termination::Exited(Default::default())
}

async fn capture_stream(
    stream: Option<impl AsyncRead + Unpin>,
    stream_output: bool,
    sink: Arc<dyn EventSink>,
) -> (String, u64, bool) {
    let Some(stream) = stream else {
        return (String::new(), 0, false);
    };
    let mut reader = BufReader::new(stream).lines();
    let mut buffer = String::new();
    let mut lines: u64 = 0;
    let mut truncated = false;

    while let Ok(Some(line)) = reader.next_line().await {
        lines += 1;
        if buffer.len() + line.len() + 1 > MAX_OUTPUT_BYTES || lines as usize > MAX_OUTPUT_LINES {
            truncated = true;
            continue;
        }
        if stream_output {
            sink.publish(Event::output_line(line.clone()));
        }
        buffer.push_str(&line);
        buffer.push('\n');
    }

    (buffer, lines, truncated)
}

fn cancelled_before_start(
    request: &RunRequest,
    started_at: DateTime<Utc>,
    correlation_id: Uuid,
    attempt_number: u32,
) -> ExecutionRecord {
    let finished_at = Utc::now();
    ExecutionRecord {
        id: None,
        script_path: request.script_path.clone(),
        argv: request.argv.clone(),
        exit_code: -1,
        success: false,
        started_at,
        finished_at,
        duration_seconds: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        stdout_text: String::new(),
        stderr_text: String::new(),
        stdout_lines: 0,
        stderr_lines: 0,
        attempt_number,
        timed_out: false,
        cancelled: true,
        correlation_id,
        metrics: HashMap::new(),
        error: Some("Run cancelled before start".to_string()),
    }
}

fn spawn_failure(
    request: &RunRequest,
    started_at: DateTime<Utc>,
    correlation_id: Uuid,
    attempt_number: u32,
    reason: String,
) -> ExecutionRecord {
    let finished_at = Utc::now();
    ExecutionRecord {
        id: None,
        script_path: request.script_path.clone(),
        argv: request.argv.clone(),
        exit_code: -1,
        success: false,
        started_at,
        finished_at,
        duration_seconds: (finished_at - started_at).num_milliseconds() as f64 / 1000.0,
        stdout_text: String::new(),
        stderr_text: String::new(),
        stdout_lines: 0,
        stderr_lines: 0,
        attempt_number,
        timed_out: false,
        cancelled: false,
        correlation_id,
        metrics: HashMap::new(),
        error: Some(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request_for(script: &std::path::Path, timeout: Option<f64>) -> RunRequest {
        RunRequest {
            script_path: script.to_str().unwrap().to_string(),
            argv: vec![],
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: timeout,
            capture_output: true,
            log_level: "INFO".to_string(),
            stream_output: false,
            retry: None,
        }
    }

    #[tokio::test]
    async fn runs_a_trivial_script_successfully() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
        let controller = ExecutionController::new(PathPolicy::relaxed(dir.path()));
        let (_handle, ticket) = controller.handle();
        let record = controller
            .run_silent(request_for(&script, Some(5.0)), ticket, Uuid::new_v4(), 1)
            .await;
        assert!(record.success);
        assert_eq!(record.exit_code, 0);
        assert!(record.started_at <= record.finished_at);
    }

    #[tokio::test]
    async fn cancel_before_start_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "ok.sh", "#!/bin/sh\nexit 0\n");
        let controller = ExecutionController::new(PathPolicy::relaxed(dir.path()));
        let (handle, ticket) = controller.handle();
        handle.cancel();
        let record = controller
            .run_silent(request_for(&script, None), ticket, Uuid::new_v4(), 1)
            .await;
        assert!(record.cancelled);
        assert_eq!(record.error.as_deref(), Some("Run cancelled before start"));
    }

    #[tokio::test]
    async fn timeout_terminates_and_flags_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleepy.sh", "#!/bin/sh\nsleep 10\n");
        let controller = ExecutionController::new(PathPolicy::relaxed(dir.path()));
        let (_handle, ticket) = controller.handle();
        let record = controller
            .run_silent(request_for(&script, Some(1.0)), ticket, Uuid::new_v4(), 1)
            .await;
        assert!(record.timed_out);
        assert!(!record.success);
        assert!(record.duration_seconds >= 1.0 && record.duration_seconds < 3.0);
    }

    #[tokio::test]
    async fn cancel_while_running_stops_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "sleepy.sh", "#!/bin/sh\nsleep 10\n");
        let controller = ExecutionController::new(PathPolicy::relaxed(dir.path()));
        let (handle, ticket) = controller.handle();

        let run = tokio::spawn(async move {
            controller
                .run_silent(request_for(&script, None), ticket, Uuid::new_v4(), 1)
                .await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop();
        let record = run.await.unwrap();
        assert!(record.cancelled);
    }

    #[test]
    fn sanitize_env_strips_dangerous_vars() {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/evil".to_string());
        env.insert("MY_VAR".to_string(), "ok".to_string());
        let sanitized = sanitize_env(&env);
        assert!(!sanitized.contains_key("PATH"));
        assert_eq!(sanitized.get("MY_VAR"), Some(&"ok".to_string()));
    }
}
