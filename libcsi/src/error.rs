//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum,
//! which derives [`thiserror::Error`] for ergonomic error handling and also
//! implements [`Serialize`]/[`Deserialize`] so errors can travel across the
//! QUIC transport layer.
//!
//! Every variant maps onto exactly one RPC status [`Code`]; callers of the
//! plugin only ever observe the code plus the human-readable message.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Status codes of the plugin RPC surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Code {
    /// Missing required field or unsupported capability.
    InvalidArgument,
    /// The volume path does not exist.
    NotFound,
    /// I/O, mount, bind or session failure.
    Internal,
    /// The RPC is not supported by this plugin.
    Unimplemented,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::Internal => "Internal",
            Self::Unimplemented => "Unimplemented",
        })
    }
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested object or path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The RPC is intentionally not implemented.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// A bounded operation did not finish in time.
    #[error("timed out after {millis}ms: {what}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// The bound that was exceeded.
        millis: u64,
    },

    /// The external mount process or quota command returned an error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The RPC status code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::NotFound(_) => Code::NotFound,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::Timeout { .. }
            | Self::BackendError(_)
            | Self::TransportError(_)
            | Self::Internal(_) => Code::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::NotFound("Volume path not exists".into());
        assert_eq!(err.to_string(), "not found: Volume path not exists");
    }

    #[test]
    fn backend_failures_surface_as_internal() {
        let errs = [
            CsiError::MountFailed {
                path: "/mnt/a".into(),
                reason: "EPERM".into(),
            },
            CsiError::Timeout {
                what: "mount point check".into(),
                millis: 2000,
            },
            CsiError::backend("quota command exited with 1"),
        ];
        for err in errs {
            assert_eq!(err.code(), Code::Internal, "{err}");
        }
        assert_eq!(
            CsiError::Unimplemented(String::new()).code(),
            Code::Unimplemented
        );
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), Code::Internal);
    }
}
