//! Error types for rule loading and file resolution.

use std::path::PathBuf;

/// Errors raised while loading a rule set.
///
/// Any of these rejects the whole reload; the previously active rules stay in
/// place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("rule {rule_id}: invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        reason: String,
    },
    #[error("rule {rule_id}: invalid local path {path:?}: {reason}")]
    InvalidPath {
        rule_id: String,
        path: String,
        reason: String,
    },
    #[error("duplicate rule id {0}")]
    DuplicateRuleId(String),
    #[error("rule {rule_id}: invalid status code {status}")]
    InvalidStatus { rule_id: String, status: u16 },
}

/// Errors raised while loading a mapped file.
///
/// `Clone` because a single read result is shared by every caller waiting on
/// the same path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),
    #[error("file too large: {} ({size} bytes, limit {limit})", .path.display())]
    TooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("timed out reading {}", .0.display())]
    Timeout(PathBuf),
    #[error("failed to read {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },
}

impl FileError {
    pub(crate) fn from_io(path: PathBuf, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FileError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => FileError::PermissionDenied(path),
            _ => FileError::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    /// Short machine-readable name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            FileError::NotFound(_) => "not_found",
            FileError::PermissionDenied(_) => "permission_denied",
            FileError::TooLarge { .. } => "too_large",
            FileError::Timeout(_) => "timeout",
            FileError::Io { .. } => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let path = PathBuf::from("/tmp/missing.json");
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            FileError::from_io(path.clone(), &err),
            FileError::NotFound(path.clone())
        );

        let err = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert_eq!(FileError::from_io(path.clone(), &err).kind(), "permission_denied");

        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(FileError::from_io(path, &err).kind(), "io");
    }
}
