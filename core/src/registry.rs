//! Run Registry (C7).
//!
//! Two tiers per section 4.7: an in-memory index behind a mutex, rebuilt on
//! startup from a durable sidecar SQLite table (bounded prefetch), and the
//! sidecar itself, upserted on every state transition. Per-active-run side
//! data (cancel handle, event ring) lives only in the in-memory tier.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::error::{retry_on_locked, CoreError, CoreResult};
use crate::eventlog::EventRing;
use crate::executor::ControlHandle;
use crate::model::{RunRecord, RunStatus};

const PREFETCH_LIMIT: i64 = 200;

/// Matches the history store's busy-timeout: the registry sidecar is
/// written on every run state transition, so a brief writer overlap with
/// the CLI or another control-plane request must not fail the upsert.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A `ControlHandle` that gets replaced as retry attempts come and go;
/// cancel/stop/kill always resolve against whichever attempt is currently
/// in flight. Empty only in the brief window before the first attempt spawns.
pub type HandleSlot = Arc<Mutex<Option<ControlHandle>>>;

/// Side data for a run that is currently active, never persisted.
#[derive(Clone)]
pub struct ActiveRunHandle {
    pub cancel_handle: HandleSlot,
    pub event_ring: Arc<EventRing>,
}

impl ActiveRunHandle {
    /// No-op if the first attempt hasn't published a handle into the slot
    /// yet; callers register the active handle immediately before spawning
    /// the run so this window is microseconds, not a race worth guarding.
    pub fn cancel(&self) {
        if let Some(handle) = self.cancel_handle.lock().unwrap().as_ref() {
            handle.cancel();
        }
    }

    pub fn stop(&self) {
        self.cancel();
    }

    pub fn kill(&self) {
        if let Some(handle) = self.cancel_handle.lock().unwrap().as_ref() {
            handle.kill();
        }
    }
}

pub struct RunRegistry {
    conn: Mutex<Connection>,
    index: Mutex<HashMap<Uuid, RunRecord>>,
    active: Mutex<HashMap<Uuid, ActiveRunHandle>>,
}

impl RunRegistry {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| CoreError::Storage(format!("failed to open run registry db: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CoreError::Storage(format!("failed to set busy timeout: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Storage(format!("failed to open in-memory registry: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id              TEXT PRIMARY KEY,
                status          TEXT NOT NULL,
                started_at      TEXT NOT NULL,
                finished_at     TEXT,
                request_json    TEXT NOT NULL,
                result_json     TEXT,
                error           TEXT,
                correlation_id  TEXT NOT NULL,
                run_status      TEXT NOT NULL,
                error_summary_json TEXT
            );
            "#,
        )
        .map_err(|e| CoreError::Storage(format!("failed to initialize registry schema: {e}")))?;

        let registry = Self {
            conn: Mutex::new(conn),
            index: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        };
        registry.rebuild_index()?;
        Ok(registry)
    }

    /// Loads the most recent `PREFETCH_LIMIT` runs from the sidecar into the
    /// in-memory index. Called once at startup.
    fn rebuild_index(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id, status, started_at, finished_at, request_json, result_json, error, correlation_id, run_status, error_summary_json FROM runs ORDER BY started_at DESC LIMIT ?1")
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params![PREFETCH_LIMIT], row_to_record)
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let mut index = self.index.lock().unwrap();
        for row in rows {
            let record = row.map_err(|e| CoreError::Storage(e.to_string()))?;
            index.insert(record.run_id, record);
        }
        Ok(())
    }

    pub fn insert(&self, record: RunRecord) -> CoreResult<()> {
        self.upsert_durable(&record)?;
        self.index.lock().unwrap().insert(record.run_id, record);
        Ok(())
    }

    pub fn update(&self, record: RunRecord) -> CoreResult<()> {
        self.upsert_durable(&record)?;
        self.index.lock().unwrap().insert(record.run_id, record);
        Ok(())
    }

    fn upsert_durable(&self, record: &RunRecord) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let request_json = serde_json::to_string(&record.request)
            .map_err(|e| CoreError::Storage(format!("failed to serialize request: {e}")))?;
        let result_json = record
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::Storage(format!("failed to serialize result: {e}")))?;

        retry_on_locked(|| {
            conn.execute(
                r#"INSERT OR REPLACE INTO runs
                    (id, status, started_at, finished_at, request_json, result_json, error,
                     correlation_id, run_status, error_summary_json)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
                params![
                    record.run_id.to_string(),
                    record.status.as_str(),
                    record.started_at.to_rfc3339(),
                    record.finished_at.map(|t| t.to_rfc3339()),
                    request_json,
                    result_json,
                    record.error,
                    record.correlation_id.to_string(),
                    record.run_status,
                    record.error_summary,
                ],
            )
        })
        .map_err(|e| CoreError::Storage(format!("failed to upsert run record: {e}")))?;
        Ok(())
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunRecord> {
        self.index.lock().unwrap().get(&run_id).cloned()
    }

    /// Newest first, optionally filtered by status, honouring `limit`/`offset`.
    pub fn list(&self, limit: usize, offset: usize, status: Option<RunStatus>) -> Vec<RunRecord> {
        let index = self.index.lock().unwrap();
        let mut records: Vec<RunRecord> = index
            .values()
            .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.into_iter().skip(offset).take(limit).collect()
    }

    pub fn register_active(&self, run_id: Uuid, handle: ActiveRunHandle) {
        self.active.lock().unwrap().insert(run_id, handle);
    }

    pub fn active_handle(&self, run_id: Uuid) -> Option<ActiveRunHandle> {
        self.active.lock().unwrap().get(&run_id).cloned()
    }

    pub fn unregister_active(&self, run_id: Uuid) {
        self.active.lock().unwrap().remove(&run_id);
    }

    pub fn stats(&self) -> RegistryStats {
        let index = self.index.lock().unwrap();
        let total_runs = index.len();
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let mut runs_24h = 0;
        for record in index.values() {
            *by_status.entry(record.status.as_str().to_string()).or_insert(0) += 1;
            if record.started_at >= cutoff {
                runs_24h += 1;
            }
        }
        RegistryStats {
            total_runs,
            by_status,
            runs_24h,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RegistryStats {
    pub total_runs: usize,
    pub by_status: HashMap<String, usize>,
    pub runs_24h: usize,
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<RunRecord> {
    let id: String = row.get(0)?;
    let status: String = row.get(1)?;
    let started_at: String = row.get(2)?;
    let finished_at: Option<String> = row.get(3)?;
    let request_json: String = row.get(4)?;
    let result_json: Option<String> = row.get(5)?;
    let error: Option<String> = row.get(6)?;
    let correlation_id: String = row.get(7)?;
    let run_status: String = row.get(8)?;
    let error_summary: Option<String> = row.get(9)?;

    Ok(RunRecord {
        run_id: Uuid::parse_str(&id).unwrap_or_default(),
        status: parse_status(&status),
        started_at: parse_timestamp(&started_at),
        finished_at: finished_at.as_deref().map(parse_timestamp),
        request: serde_json::from_str(&request_json).unwrap_or_else(|_| crate::model::RunRequest {
            script_path: String::new(),
            argv: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            timeout_seconds: None,
            capture_output: true,
            log_level: "INFO".to_string(),
            stream_output: false,
            retry: None,
        }),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        error,
        correlation_id: Uuid::parse_str(&correlation_id).unwrap_or_default(),
        run_status,
        error_summary,
    })
}

fn parse_status(s: &str) -> RunStatus {
    match s {
        "queued" => RunStatus::Queued,
        "running" => RunStatus::Running,
        "completed" => RunStatus::Completed,
        "failed" => RunStatus::Failed,
        _ => RunStatus::Cancelled,
    }
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunRequest;

    fn sample_request() -> RunRequest {
        RunRequest {
            script_path: "build.py".to_string(),
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

    fn sample_record(status: RunStatus) -> RunRecord {
        RunRecord {
            run_id: Uuid::new_v4(),
            status,
            started_at: Utc::now(),
            finished_at: None,
            request: sample_request(),
            result: None,
            error: None,
            correlation_id: Uuid::new_v4(),
            run_status: status.as_str().to_string(),
            error_summary: None,
        }
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let registry = RunRegistry::open_in_memory().unwrap();
        let record = sample_record(RunStatus::Queued);
        let run_id = record.run_id;
        registry.insert(record).unwrap();
        let fetched = registry.get(run_id).unwrap();
        assert_eq!(fetched.status, RunStatus::Queued);
    }

    #[test]
    fn list_filters_by_status_and_orders_newest_first() {
        let registry = RunRegistry::open_in_memory().unwrap();
        registry.insert(sample_record(RunStatus::Completed)).unwrap();
        registry.insert(sample_record(RunStatus::Failed)).unwrap();
        let completed = registry.list(10, 0, Some(RunStatus::Completed));
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, RunStatus::Completed);
    }

    #[test]
    fn stats_counts_by_status() {
        let registry = RunRegistry::open_in_memory().unwrap();
        registry.insert(sample_record(RunStatus::Completed)).unwrap();
        registry.insert(sample_record(RunStatus::Completed)).unwrap();
        registry.insert(sample_record(RunStatus::Failed)).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.total_runs, 3);
        assert_eq!(stats.by_status["completed"], 2);
        assert_eq!(stats.by_status["failed"], 1);
    }

    #[test]
    fn active_handle_registration_roundtrips() {
        let registry = RunRegistry::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        assert!(registry.active_handle(run_id).is_none());
        registry.unregister_active(run_id);
    }
}
