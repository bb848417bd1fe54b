//! Error kinds surfaced by the storage layer.
//!
//! Every backend reports failures through [`StorageError`]. Callers that sit
//! in front of an HTTP layer use [`StorageError::status_code`] and
//! [`StorageError::to_json`] to render the failure without knowing which
//! backend produced it.

use serde_json::json;
use std::io;
use thiserror::Error;

/// Coarse classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    NotFound,
    Conflict,
    Validation,
    Transport,
    Inconsistency,
    Internal,
}

#[derive(Debug, Error)]
pub enum StorageError {
    /// The caller has no access to the entity, or the path escapes the root.
    #[error("authorization error: {0}")]
    Authorization(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    Conflict(String),
    /// Malformed input, with a human readable reason.
    #[error("{0}")]
    Validation(String),
    #[error("remote storage returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("remote storage request failed: {0}")]
    Transport(String),
    #[error("storage inconsistency: {0}")]
    Inconsistency(String),
    #[error("invalid XML document: {0}")]
    Xml(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn forbidden(entity: impl AsRef<str>) -> Self {
        Self::Authorization(format!("no access to `{}`", entity.as_ref()))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authorization(_) => ErrorKind::Authorization,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Validation(_) | Self::Xml(_) | Self::Zip(_) | Self::Json(_) => {
                ErrorKind::Validation
            }
            Self::Status { status, .. } => match status {
                401 | 403 => ErrorKind::Authorization,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::Conflict,
                _ => ErrorKind::Transport,
            },
            Self::Transport(_) => ErrorKind::Transport,
            Self::Inconsistency(_) => ErrorKind::Inconsistency,
            Self::Io(err) if err.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) | Self::Sqlx(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status an outer façade should answer with.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Authorization => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Validation => 400,
            ErrorKind::Transport => 502,
            ErrorKind::Inconsistency | ErrorKind::Internal => 500,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": self.to_string(),
            "status": self.status_code()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_statuses_map_to_kinds() {
        let forbidden = StorageError::Status {
            status: 403,
            message: "denied".into(),
        };
        assert_eq!(forbidden.kind(), ErrorKind::Authorization);
        assert_eq!(forbidden.status_code(), 403);

        let missing = StorageError::Status {
            status: 404,
            message: "gone".into(),
        };
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let broken = StorageError::Status {
            status: 503,
            message: "unavailable".into(),
        };
        assert_eq!(broken.kind(), ErrorKind::Transport);
        assert_eq!(broken.status_code(), 502);
    }

    #[test]
    fn missing_files_are_not_found() {
        let err = StorageError::from(io::Error::new(io::ErrorKind::NotFound, "nope"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_json()["status"], 404);
    }
}
