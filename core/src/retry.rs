//! Retry Driver (C3).
//!
//! Wraps the Execution Controller with a retry policy: strategy, caps,
//! backoff, jitter. All attempts under one retry invocation share a single
//! correlation id; `attempt_number` increments from 1.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use uuid::Uuid;

use crate::eventlog::EventSink;
use crate::executor::{ControlHandle, ExecutionController, RunTicket};
use crate::model::{ExecutionRecord, RetryConfig, RetryStrategy, RunRequest};

/// Computes the nominal (pre-jitter) delay before `attempt + 1`, where
/// `attempt` is 1-indexed (the attempt that just finished).
pub fn nominal_delay(strategy: RetryStrategy, attempt: u32, initial: f64, max: f64) -> f64 {
    let raw = match strategy {
        RetryStrategy::Fixed => initial,
        RetryStrategy::Linear => initial * attempt as f64,
        RetryStrategy::Exponential => initial * 2f64.powi(attempt as i32 - 1),
        RetryStrategy::Fibonacci => initial * fibonacci(attempt) as f64,
    };
    raw.min(max)
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 1..n {
        let next = a + b;
        a = b;
        b = next;
    }
    a
}

/// Applies up to ±25% jitter unless disabled.
pub(crate) fn with_jitter(delay: f64, jitter_enabled: bool) -> f64 {
    if !jitter_enabled || delay <= 0.0 {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range(-0.25..=0.25);
    (delay * (1.0 + factor)).max(0.0)
}

pub(crate) fn should_retry(record: &ExecutionRecord, config: &RetryConfig) -> bool {
    if record.cancelled {
        return false;
    }
    if record.success {
        return false;
    }
    if config.retry_on_exit_codes.is_empty() {
        return record.exit_code != 0;
    }
    config.retry_on_exit_codes.contains(&record.exit_code)
}

pub struct RetryDriver {
    controller: ExecutionController,
}

impl RetryDriver {
    pub fn new(controller: ExecutionController) -> Self {
        Self { controller }
    }

    /// Returns a control handle for the attempt currently in flight and the
    /// final `ExecutionRecord`. Exceeding `max_attempts` is not an error: it
    /// is a failed run, reported like any other.
    pub async fn run(
        &self,
        request: RunRequest,
        config: RetryConfig,
        sink: Arc<dyn EventSink>,
    ) -> (ControlHandle, ExecutionRecord) {
        let correlation_id = Uuid::new_v4();
        let max_attempts = config.max_attempts.max(1);

        let mut last_handle: Option<ControlHandle> = None;
        let mut last_record: Option<ExecutionRecord> = None;

        for attempt in 1..=max_attempts {
            let (handle, ticket) = self.controller.handle();
            last_handle = Some(handle.clone());

            let record = self
                .controller
                .run(
                    request.clone(),
                    ticket,
                    correlation_id,
                    attempt,
                    sink.clone(),
                )
                .await;

            let retry_eligible = attempt < max_attempts && should_retry(&record, &config);
            let terminal = !retry_eligible;
            last_record = Some(record);

            if terminal {
                break;
            }
            if handle.is_cancel_requested() {
                break;
            }

            let delay = with_jitter(
                nominal_delay(config.strategy, attempt, config.initial_delay, config.max_delay),
                config.jitter,
            );
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        (
            last_handle.expect("at least one attempt always runs"),
            last_record.expect("at least one attempt always runs"),
        )
    }

    /// Identical retry loop to [`Self::run`], but publishes the
    /// currently-in-flight attempt's `ControlHandle` into `handle_slot` as
    /// each attempt starts. Callers that need to expose a single stable
    /// cancel/stop/kill point across retries (e.g. the run registry's active
    /// handle) read `handle_slot` instead of `run`'s one-shot return value.
    pub async fn run_tracked(
        &self,
        request: RunRequest,
        config: RetryConfig,
        sink: Arc<dyn EventSink>,
        handle_slot: Arc<Mutex<Option<ControlHandle>>>,
    ) -> ExecutionRecord {
        let correlation_id = Uuid::new_v4();
        let max_attempts = config.max_attempts.max(1);
        let mut last_record: Option<ExecutionRecord> = None;

        for attempt in 1..=max_attempts {
            let (handle, ticket) = self.controller.handle();
            *handle_slot.lock().unwrap() = Some(handle.clone());

            let record = self
                .controller
                .run(
                    request.clone(),
                    ticket,
                    correlation_id,
                    attempt,
                    sink.clone(),
                )
                .await;

            let retry_eligible = attempt < max_attempts && should_retry(&record, &config);
            let terminal = !retry_eligible;
            let cancelled = handle.is_cancel_requested();
            last_record = Some(record);

            if terminal || cancelled {
                break;
            }

            let delay = with_jitter(
                nominal_delay(config.strategy, attempt, config.initial_delay, config.max_delay),
                config.jitter,
            );
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        last_record.expect("at least one attempt always runs")
    }
}
