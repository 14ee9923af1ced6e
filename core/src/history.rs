//! History Store (C5).
//!
//! Durable record of every execution plus its metrics, backed by a single
//! SQLite file. Schema per section 4.5: `executions` and `metrics` tables,
//! indexed on `(metric_name, execution_id)` and `(script_path, created_at)`
//! respectively. `execution_id` here is the store-assigned row id (the
//! model's `ExecutionRecord::id`), not the correlation id — one correlation
//! id can span several attempts, each getting its own row.
//!
//! Open question resolved here: retention cutoff is inclusive on
//! `created_at` (rows with `created_at <= cutoff` are archived), since every
//! read path in this module already orders and filters by `created_at`
//! (populated from `started_at`) rather than `finished_at`. See DESIGN.md.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{retry_on_locked, CoreError, CoreResult};
use crate::model::ExecutionRecord;

/// Lower bound from the store's durability contract: concurrent writers
/// (the CLI and the HTTP control plane against the same history file) must
/// not fail a write just because another process holds the lock briefly.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct HistoryStore {
    path: PathBuf,
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub execution_id: i64,
    pub script_path: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: i32,
    pub success: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub attempt_number: u32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Aggregations {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub stddev: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DatabaseStats {
    pub execution_count: i64,
    pub metric_count: i64,
    pub distinct_scripts: i64,
    pub oldest_execution: Option<DateTime<Utc>>,
    pub newest_execution: Option<DateTime<Utc>>,
    pub file_size_bytes: u64,
}

impl HistoryStore {
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .map_err(|e| CoreError::Storage(format!("failed to open history db: {e}")))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| CoreError::Storage(format!("failed to set busy timeout: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Storage(format!("failed to open in-memory db: {e}")))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> CoreResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                script_path     TEXT NOT NULL,
                argv_json       TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                finished_at     TEXT,
                duration_seconds REAL NOT NULL,
                exit_code       INTEGER NOT NULL,
                success         INTEGER NOT NULL,
                timed_out       INTEGER NOT NULL,
                cancelled       INTEGER NOT NULL,
                attempt_number  INTEGER NOT NULL,
                correlation_id  TEXT NOT NULL,
                stdout_text     TEXT NOT NULL,
                stderr_text     TEXT NOT NULL,
                stdout_lines    INTEGER NOT NULL,
                stderr_lines    INTEGER NOT NULL,
                error           TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_script_created
                ON executions(script_path, created_at);

            CREATE TABLE IF NOT EXISTS metrics (
                execution_id INTEGER NOT NULL,
                metric_name  TEXT NOT NULL,
                value        REAL NOT NULL,
                FOREIGN KEY(execution_id) REFERENCES executions(id)
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_name_execution
                ON metrics(metric_name, execution_id);
            "#,
        )
        .map_err(|e| CoreError::Storage(format!("failed to initialize schema: {e}")))?;
        Ok(())
    }

    /// Persists an execution and its metrics in one transaction so a crash
    /// mid-write never leaves metrics orphaned from their execution row.
    /// Returns the assigned row id.
    pub fn save_execution(&self, record: &ExecutionRecord) -> CoreResult<i64> {
        let mut conn = self.conn.lock().unwrap();
        let argv_json = serde_json::to_string(&record.argv)
            .map_err(|e| CoreError::Storage(format!("failed to serialize argv: {e}")))?;

        retry_on_locked(|| {
            let tx = conn.transaction()?;

            tx.execute(
                r#"INSERT INTO executions
                    (script_path, argv_json, created_at, finished_at, duration_seconds, exit_code,
                     success, timed_out, cancelled, attempt_number, correlation_id,
                     stdout_text, stderr_text, stdout_lines, stderr_lines, error)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
                params![
                    record.script_path,
                    argv_json,
                    record.started_at.to_rfc3339(),
                    record.finished_at.to_rfc3339(),
                    record.duration_seconds,
                    record.exit_code,
                    record.success,
                    record.timed_out,
                    record.cancelled,
                    record.attempt_number,
                    record.correlation_id.to_string(),
                    record.stdout_text,
                    record.stderr_text,
                    record.stdout_lines,
                    record.stderr_lines,
                    record.error,
                ],
            )?;

            let execution_id = tx.last_insert_rowid();

            for (name, value) in &record.metrics {
                tx.execute(
                    "INSERT INTO metrics (execution_id, metric_name, value) VALUES (?1, ?2, ?3)",
                    params![execution_id, name, value],
                )?;
            }

            tx.commit()?;
            Ok(execution_id)
        })
        .map_err(|e| CoreError::Storage(format!("failed to save execution: {e}")))
    }

    pub fn get_execution_history(
        &self,
        script_path: &str,
        limit: usize,
    ) -> CoreResult<Vec<HistoryEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"SELECT id, script_path, created_at, finished_at, exit_code, success,
                          timed_out, cancelled, attempt_number
                   FROM executions
                   WHERE script_path = ?1
                   ORDER BY created_at DESC
                   LIMIT ?2"#,
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params![script_path, limit as i64], Self::row_to_entry)
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<HistoryEntry> {
        let created_at: String = row.get(2)?;
        let finished_at: Option<String> = row.get(3)?;
        Ok(HistoryEntry {
            execution_id: row.get(0)?,
            script_path: row.get(1)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            finished_at: finished_at.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            exit_code: row.get(4)?,
            success: row.get(5)?,
            timed_out: row.get(6)?,
            cancelled: row.get(7)?,
            attempt_number: row.get(8)?,
        })
    }

    /// Returns the raw values of `metric_name` for `script_path`, most
    /// recent first, bounded by `limit`. Used by both `aggregations()` and
    /// the analyzer collaborators.
    pub fn get_aggregated_metrics(
        &self,
        script_path: &str,
        metric_name: &str,
        limit: usize,
    ) -> CoreResult<Vec<f64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"SELECT m.value
                   FROM metrics m
                   JOIN executions e ON e.id = m.execution_id
                   WHERE e.script_path = ?1 AND m.metric_name = ?2
                   ORDER BY e.created_at DESC
                   LIMIT ?3"#,
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params![script_path, metric_name, limit as i64], |r| {
                r.get::<_, f64>(0)
            })
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Storage(e.to_string()))
    }

    pub fn time_series(
        &self,
        script_path: &str,
        metric_name: &str,
        limit: usize,
    ) -> CoreResult<Vec<TimeSeriesPoint>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                r#"SELECT e.created_at, m.value
                   FROM metrics m
                   JOIN executions e ON e.id = m.execution_id
                   WHERE e.script_path = ?1 AND m.metric_name = ?2
                   ORDER BY e.created_at ASC
                   LIMIT ?3"#,
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let rows = stmt
            .query_map(params![script_path, metric_name, limit as i64], |r| {
                let ts: String = r.get(0)?;
                let value: f64 = r.get(1)?;
                Ok((ts, value))
            })
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let mut points = Vec::new();
        for row in rows {
            let (ts, value) = row.map_err(|e| CoreError::Storage(e.to_string()))?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            points.push(TimeSeriesPoint { timestamp, value });
        }
        Ok(points)
    }

    /// Full descriptive statistics over a metric's history, including the
    /// percentile family the spec lists explicitly (p50/p75/p90/p95/p99).
    pub fn aggregations(
        &self,
        script_path: &str,
        metric_name: &str,
        limit: usize,
    ) -> CoreResult<Option<Aggregations>> {
        let mut values = self.get_aggregated_metrics(script_path, metric_name, limit)?;
        if values.is_empty() {
            return Ok(None);
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let count = values.len();
        let min = values[0];
        let max = values[count - 1];
        let sum: f64 = values.iter().sum();
        let avg = sum / count as f64;
        let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / count as f64;
        let stddev = variance.sqrt();

        let percentile = |p: f64| -> f64 {
            if count == 1 {
                return values[0];
            }
            let rank = (p / 100.0) * (count - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                values[lo]
            } else {
                let frac = rank - lo as f64;
                values[lo] + (values[hi] - values[lo]) * frac
            }
        };

        Ok(Some(Aggregations {
            count,
            min,
            max,
            avg,
            median: percentile(50.0),
            p50: percentile(50.0),
            p75: percentile(75.0),
            p90: percentile(90.0),
            p95: percentile(95.0),
            p99: percentile(99.0),
            stddev,
        }))
    }

    pub fn database_stats(&self) -> CoreResult<DatabaseStats> {
        let conn = self.conn.lock().unwrap();

        let execution_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM executions", [], |r| r.get(0))
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let metric_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM metrics", [], |r| r.get(0))
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let distinct_scripts: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT script_path) FROM executions",
                [],
                |r| r.get(0),
            )
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        let oldest: Option<String> = conn
            .query_row("SELECT MIN(created_at) FROM executions", [], |r| r.get(0))
            .optional()
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .flatten();
        let newest: Option<String> = conn
            .query_row("SELECT MAX(created_at) FROM executions", [], |r| r.get(0))
            .optional()
            .map_err(|e| CoreError::Storage(e.to_string()))?
            .flatten();

        let file_size_bytes = if self.path == Path::new(":memory:") {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(DatabaseStats {
            execution_count,
            metric_count,
            distinct_scripts,
            oldest_execution: oldest.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            newest_execution: newest.and_then(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            file_size_bytes,
        })
    }

    /// Deletes executions (and their metrics) older than `retention_days`,
    /// inclusive of the cutoff instant itself.
    pub fn archive(&self, retention_days: i64) -> CoreResult<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let conn = self.conn.lock().unwrap();

        conn.execute(
            r#"DELETE FROM metrics WHERE execution_id IN
                (SELECT id FROM executions WHERE created_at <= ?1)"#,
            params![cutoff.to_rfc3339()],
        )
        .map_err(|e| CoreError::Storage(format!("failed to archive metrics: {e}")))?;

        let deleted = conn
            .execute(
                "DELETE FROM executions WHERE created_at <= ?1",
                params![cutoff.to_rfc3339()],
            )
            .map_err(|e| CoreError::Storage(format!("failed to archive executions: {e}")))?;

        Ok(deleted)
    }

    pub fn vacuum(&self) -> CoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("VACUUM")
            .map_err(|e| CoreError::Storage(format!("vacuum failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn sample_record(script: &str, exit_code: i32, metric_value: f64) -> ExecutionRecord {
        let mut metrics = HashMap::new();
        metrics.insert("cpu_max".to_string(), metric_value);
        let now = Utc::now();
        ExecutionRecord {
            id: None,
            script_path: script.to_string(),
            argv: vec![],
            exit_code,
            success: exit_code == 0,
            started_at: now,
            finished_at: now,
            duration_seconds: 1.0,
            stdout_text: String::new(),
            stderr_text: String::new(),
            stdout_lines: 0,
            stderr_lines: 0,
            attempt_number: 1,
            timed_out: false,
            cancelled: false,
            correlation_id: Uuid::new_v4(),
            metrics,
            error: None,
        }
    }

    #[test]
    fn save_and_fetch_roundtrip() {
        let store = HistoryStore::open_in_memory().unwrap();
        let record = sample_record("build.py", 0, 42.0);
        store.save_execution(&record).unwrap();

        let history = store.get_execution_history("build.py", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].exit_code, 0);

        let values = store.get_aggregated_metrics("build.py", "cpu_max", 10).unwrap();
        assert_eq!(values, vec![42.0]);
    }

    #[test]
    fn aggregations_compute_percentiles() {
        let store = HistoryStore::open_in_memory().unwrap();
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            store.save_execution(&sample_record("job.py", 0, v)).unwrap();
        }
        let agg = store.aggregations("job.py", "cpu_max", 100).unwrap().unwrap();
        assert_eq!(agg.count, 5);
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 50.0);
        assert!((agg.avg - 30.0).abs() < 1e-9);
        assert!((agg.median - 30.0).abs() < 1e-9);
    }

    #[test]
    fn archive_removes_rows_and_their_metrics() {
        let store = HistoryStore::open_in_memory().unwrap();
        let mut old = sample_record("old.py", 0, 1.0);
        old.started_at = Utc::now() - Duration::days(30);
        store.save_execution(&old).unwrap();
        store.save_execution(&sample_record("old.py", 0, 2.0)).unwrap();

        let deleted = store.archive(7).unwrap();
        assert_eq!(deleted, 1);

        let remaining = store.get_execution_history("old.py", 10).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn database_stats_reflects_contents() {
        let store = HistoryStore::open_in_memory().unwrap();
        store.save_execution(&sample_record("a.py", 0, 1.0)).unwrap();
        store.save_execution(&sample_record("b.py", 1, 2.0)).unwrap();
        let stats = store.database_stats().unwrap();
        assert_eq!(stats.execution_count, 2);
        assert_eq!(stats.distinct_scripts, 2);
        assert_eq!(stats.metric_count, 2);
    }
}
