//! Script path validation, shared by the Execution Controller (C2) and the
//! HTTP control plane's payload validation (C8).
//!
//! The default profile is deliberately strict (regular file, inside an
//! allow-root, `.py`/`.pyw` suffix only); the workflow executor constructs a
//! relaxed `PathPolicy` (empty suffix allow-list means "any suffix") since
//! section 4.2 explicitly permits that. The null-byte and allow-root-escape
//! checks are never relaxable.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct PathPolicy {
    pub allow_root: PathBuf,
    /// Empty means "any suffix is accepted".
    pub allowed_suffixes: Vec<String>,
}

impl PathPolicy {
    pub fn default_profile(allow_root: impl Into<PathBuf>) -> Self {
        Self {
            allow_root: allow_root.into(),
            allowed_suffixes: vec![".py".to_string(), ".pyw".to_string()],
        }
    }

    pub fn relaxed(allow_root: impl Into<PathBuf>) -> Self {
        Self {
            allow_root: allow_root.into(),
            allowed_suffixes: Vec::new(),
        }
    }

    /// Validates and canonicalises `raw_path`. Never returns a path that
    /// escapes `allow_root`, contains a null byte, or resolves through a
    /// symlink whose target escapes `allow_root`.
    pub fn validate(&self, raw_path: &str) -> CoreResult<PathBuf> {
        if raw_path.contains('\0') {
            return Err(CoreError::Validation(
                "script path contains a null byte".to_string(),
            ));
        }

        let candidate = Path::new(raw_path);
        std::fs::symlink_metadata(candidate).map_err(|e| {
            CoreError::Validation(format!("script path does not exist: {e}"))
        })?;

        let resolved = std::fs::canonicalize(candidate)
            .map_err(|e| CoreError::Validation(format!("failed to resolve script path: {e}")))?;

        let resolved_metadata = std::fs::metadata(&resolved)
            .map_err(|e| CoreError::Validation(format!("cannot stat resolved path: {e}")))?;
        if !resolved_metadata.is_file() {
            return Err(CoreError::Validation(
                "script path must be a regular file".to_string(),
            ));
        }

        let allow_root = std::fs::canonicalize(&self.allow_root)
            .map_err(|e| CoreError::Validation(format!("invalid allow-root: {e}")))?;
        if !resolved.starts_with(&allow_root) {
            return Err(CoreError::Validation(format!(
                "{} escapes the allowed root {}",
                resolved.display(),
                allow_root.display()
            )));
        }

        if !self.allowed_suffixes.is_empty() {
            let suffix_ok = self.allowed_suffixes.iter().any(|suffix| {
                raw_path.ends_with(suffix.as_str())
            });
            if !suffix_ok {
                return Err(CoreError::Validation(format!(
                    "script suffix not allowed, expected one of {:?}",
                    self.allowed_suffixes
                )));
            }
        }

        Ok(resolved)
    }
}

/// BLAKE3 hex digest of `bytes`, used to content-address uploaded scripts so
/// re-uploading identical content reuses the same stored file.
pub fn content_checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_null_byte() {
        let policy = PathPolicy::default_profile(".");
        let err = policy.validate("foo\0bar.py").unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn accepts_file_within_root() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ok.py");
        std::fs::File::create(&script)
            .unwrap()
            .write_all(b"print(1)")
            .unwrap();
        let policy = PathPolicy::default_profile(dir.path());
        let resolved = policy.validate(script.to_str().unwrap()).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&script).unwrap());
    }

    #[test]
    fn rejects_suffix_outside_profile() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ok.sh");
        std::fs::File::create(&script).unwrap();
        let policy = PathPolicy::default_profile(dir.path());
        assert!(policy.validate(script.to_str().unwrap()).is_err());
    }

    #[test]
    fn relaxed_policy_accepts_any_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("ok.sh");
        std::fs::File::create(&script).unwrap();
        let policy = PathPolicy::relaxed(dir.path());
        assert!(policy.validate(script.to_str().unwrap()).is_ok());
    }

    #[test]
    fn rejects_escape_from_allow_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let script = outside.path().join("ok.py");
        std::fs::File::create(&script).unwrap();
        let policy = PathPolicy::default_profile(dir.path());
        assert!(policy.validate(script.to_str().unwrap()).is_err());
    }
}
