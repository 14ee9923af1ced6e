//! Resource Sampler (C1).
//!
//! Polls a running child process for CPU/memory/thread/fd/context-switch/IO
//! counters on a dedicated OS thread, distinct from any async event loop —
//! per section 5, the sampler boundary is thread-based, never cooperative.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Default polling interval. The source material disagreed between 0.1s and
/// 0.5s defaults (see DESIGN.md); 0.1s is the value named in section 4.1's
/// contract text, so it wins.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ResourceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub rss_mb: f64,
    pub num_threads: u64,
    pub num_fds: u64,
    pub ctx_switches_voluntary: u64,
    pub ctx_switches_involuntary: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Aggregated output of a sampling run, folded into the execution record's
/// metric map by the Execution Controller.
#[derive(Debug, Clone, Default)]
pub struct SamplerAggregate {
    pub cpu_max: f64,
    pub cpu_avg: f64,
    pub cpu_min: f64,
    pub memory_max_mb: f64,
    pub memory_avg_mb: f64,
    pub memory_min_mb: f64,
    pub num_threads_max: u64,
    pub num_fds_max: u64,
    pub ctx_switches_voluntary: u64,
    pub ctx_switches_involuntary: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl SamplerAggregate {
    pub fn into_metrics(self) -> Vec<(&'static str, f64)> {
        vec![
            ("cpu_max", self.cpu_max),
            ("cpu_avg", self.cpu_avg),
            ("cpu_min", self.cpu_min),
            ("memory_max_mb", self.memory_max_mb),
            ("memory_avg_mb", self.memory_avg_mb),
            ("memory_min_mb", self.memory_min_mb),
            ("num_threads_max", self.num_threads_max as f64),
            ("num_fds_max", self.num_fds_max as f64),
            (
                "context_switches_voluntary",
                self.ctx_switches_voluntary as f64,
            ),
            (
                "context_switches_involuntary",
                self.ctx_switches_involuntary as f64,
            ),
            ("read_bytes", self.read_bytes as f64),
            ("write_bytes", self.write_bytes as f64),
        ]
    }
}

fn take_sample(sys: &mut System, pid: Pid) -> Option<ResourceSnapshot> {
    sys.refresh_process_specifics(pid, ProcessRefreshKind::everything());
    let process = sys.process(pid)?;

    let disk = process.disk_usage();
    let (ctx_vol, ctx_invol, num_fds) = read_linux_proc_extras(pid.as_u32());

    Some(ResourceSnapshot {
        timestamp: Utc::now(),
        cpu_percent: process.cpu_usage() as f64,
        rss_mb: process.memory() as f64 / (1024.0 * 1024.0),
        num_threads: process.tasks().map(|t| t.len() as u64).unwrap_or(0),
        num_fds,
        ctx_switches_voluntary: ctx_vol,
        ctx_switches_involuntary: ctx_invol,
        read_bytes: disk.total_read_bytes,
        write_bytes: disk.total_written_bytes,
    })
}

#[cfg(target_os = "linux")]
fn read_linux_proc_extras(pid: u32) -> (u64, u64, u64) {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).unwrap_or_default();
    let mut voluntary = 0u64;
    let mut involuntary = 0u64;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("voluntary_ctxt_switches:") {
            voluntary = rest.trim().parse().unwrap_or(0);
        } else if let Some(rest) = line.strip_prefix("nonvoluntary_ctxt_switches:") {
            involuntary = rest.trim().parse().unwrap_or(0);
        }
    }
    let num_fds = std::fs::read_dir(format!("/proc/{pid}/fd"))
        .map(|entries| entries.count() as u64)
        .unwrap_or(0);
    (voluntary, involuntary, num_fds)
}

#[cfg(not(target_os = "linux"))]
fn read_linux_proc_extras(_pid: u32) -> (u64, u64, u64) {
    (0, 0, 0)
}

/// Owns the background sampling thread for one child process.
pub struct ResourceSampler {
    stop_flag: Arc<AtomicBool>,
    handle: JoinHandle<SamplerAggregate>,
}

impl ResourceSampler {
    /// Begins sampling `pid` at `interval`. Runs until `stop()` is called or
    /// the process disappears, whichever comes first.
    pub fn start(pid: u32, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();

        let handle = std::thread::spawn(move || {
            let mut sys = System::new();
            let sysinfo_pid = Pid::from_u32(pid);
            let mut samples: Vec<ResourceSnapshot> = Vec::new();
            let start = SystemTime::now();

            loop {
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                match take_sample(&mut sys, sysinfo_pid) {
                    Some(snapshot) => samples.push(snapshot),
                    // Missing-process / permission-denied: treat as clean
                    // termination, stop sampling, keep whatever we gathered.
                    None => break,
                }
                if SystemTime::now()
                    .duration_since(start)
                    .map(|d| d > Duration::from_secs(3600))
                    .unwrap_or(false)
                {
                    // Sampling an unusually long-running process: bound
                    // memory by stopping after an hour of samples at the
                    // finest interval (36000 samples); the caller's timeout
                    // will have fired long before this in practice.
                    break;
                }
                std::thread::sleep(interval);
            }

            aggregate(&samples)
        });

        Self { stop_flag, handle }
    }

    /// Stops sampling and returns the aggregated metrics. If the process
    /// died during sampling or no sample was ever taken, all numeric fields
    /// default to zero rather than being absent.
    pub fn stop(self) -> SamplerAggregate {
        self.stop_flag.store(true, Ordering::Relaxed);
        self.handle.join().unwrap_or_default()
    }
}

fn aggregate(samples: &[ResourceSnapshot]) -> SamplerAggregate {
    if samples.is_empty() {
        return SamplerAggregate::default();
    }

    let cpu_values: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
    let mem_values: Vec<f64> = samples.iter().map(|s| s.rss_mb).collect();

    SamplerAggregate {
        cpu_max: cpu_values.iter().cloned().fold(f64::MIN, f64::max),
        cpu_avg: cpu_values.iter().sum::<f64>() / cpu_values.len() as f64,
        cpu_min: cpu_values.iter().cloned().fold(f64::MAX, f64::min),
        memory_max_mb: mem_values.iter().cloned().fold(f64::MIN, f64::max),
        memory_avg_mb: mem_values.iter().sum::<f64>() / mem_values.len() as f64,
        memory_min_mb: mem_values.iter().cloned().fold(f64::MAX, f64::min),
        num_threads_max: samples.iter().map(|s| s.num_threads).max().unwrap_or(0),
        num_fds_max: samples.iter().map(|s| s.num_fds).max().unwrap_or(0),
        ctx_switches_voluntary: samples
            .last()
            .map(|s| s.ctx_switches_voluntary)
            .unwrap_or(0),
        ctx_switches_involuntary: samples
            .last()
            .map(|s| s.ctx_switches_involuntary)
            .unwrap_or(0),
        read_bytes: samples.last().map(|s| s.read_bytes).unwrap_or(0),
        write_bytes: samples.last().map(|s| s.write_bytes).unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_no_samples_is_all_zero() {
        let agg = aggregate(&[]);
        assert_eq!(agg.cpu_max, 0.0);
        assert_eq!(agg.memory_max_mb, 0.0);
    }

    #[test]
    fn sampler_on_short_lived_process_returns_some_metrics() {
        let mut child = std::process::Command::new("sleep")
            .arg("1")
            .spawn()
            .expect("spawn sleep");
        let sampler = ResourceSampler::start(child.id(), Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(200));
        let agg = sampler.stop();
        let _ = child.kill();
        let _ = child.wait();
        // A real process should yield at least a non-negative memory reading.
        assert!(agg.memory_max_mb >= 0.0);
    }
}
