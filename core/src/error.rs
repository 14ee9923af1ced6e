//! Error taxonomy for the execution engine.
//!
//! The spec's error design groups failures into a small set of kinds rather
//! than one error type per module: Validation, Spawn, Runtime, Timeout,
//! Cancelled, Storage, Collaborator. Only `Validation` ever aborts a caller
//! before work starts; everything else is folded into an `ExecutionRecord`
//! or logged and swallowed per the propagation policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Retries `f` a handful of times when SQLite reports the database as busy
/// or locked, on top of the connection's own busy-timeout. A busy-timeout
/// only covers contention on a single statement; a multi-statement
/// transaction can still observe a locked database on commit if another
/// writer's transaction overlaps it.
pub(crate) fn retry_on_locked<T>(
    mut f: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;
    loop {
        match f() {
            Err(rusqlite::Error::SqliteFailure(err, _))
                if attempt + 1 < MAX_ATTEMPTS
                    && matches!(
                        err.code,
                        rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                    ) =>
            {
                attempt += 1;
                std::thread::sleep(std::time::Duration::from_millis(20 * attempt as u64));
            }
            other => return other,
        }
    }
}
