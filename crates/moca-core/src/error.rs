// ── Core error types ──
//
// User-facing errors from moca-core. Callers never see raw driver status
// codes: the `From<DriverError>` impl translates gateway failures into
// the domain taxonomy, and never into success.

use std::time::Duration;

use thiserror::Error;

use crate::gateway::DriverError;

/// Unified error type for the core crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    // ── Hardware reachability ────────────────────────────────────────
    #[error("MoCA driver unavailable: {reason}")]
    DriverUnavailable { reason: String },

    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    // ── Caller errors ────────────────────────────────────────────────
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgument),

    #[error("An ACA session is already in progress")]
    AlreadyInProgress,

    #[error("Not ready: {what}")]
    NotReady { what: &'static str },

    #[error("No such MoCA node: {node}")]
    NoSuchNode { node: String },

    // ── Hardware failures (wrapped, not exposed raw) ─────────────────
    #[error("Driver error during {operation}: {message}")]
    Driver {
        operation: &'static str,
        message: String,
    },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Expected, recoverable conditions that callers poll and retry on.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AlreadyInProgress | Self::NotReady { .. })
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }
}

/// An input rejected before any hardware call was issued.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidArgument {
    #[error("interface index {0} out of range (0..=256)")]
    IfIndex(u32),

    #[error("node id {0} out of range (0..16)")]
    NodeId(u32),

    #[error("invalid probe type {0} (expected 0 = Quiet or 1 = EVM)")]
    ProbeType(u32),

    #[error("channel {channel} not supported (valid {min}..={max})")]
    Channel { channel: u32, min: u32, max: u32 },

    #[error("invalid MAC address '{0}'")]
    MacAddress(String),

    #[error("profile must hold exactly {expected} elements, got {got}")]
    ProfileLength { expected: usize, got: usize },

    #[error("invalid {field}: {reason}")]
    Field { field: &'static str, reason: String },
}

impl InvalidArgument {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Field {
            field,
            reason: reason.into(),
        }
    }
}

// ── Conversion from gateway errors ───────────────────────────────────

impl CoreError {
    /// Translate a gateway failure, tagging it with the operation name.
    pub(crate) fn from_driver(operation: &'static str, err: DriverError) -> Self {
        match err {
            DriverError::Unavailable(reason) => Self::DriverUnavailable { reason },
            DriverError::InProgress => Self::AlreadyInProgress,
            DriverError::NoSuchNode(node) => Self::NoSuchNode {
                node: node.to_string(),
            },
            DriverError::InvalidProbe(raw) => InvalidArgument::ProbeType(raw).into(),
            DriverError::InvalidChannel(channel) => InvalidArgument::Field {
                field: "channel",
                reason: format!("channel {channel} rejected by hardware"),
            }
            .into(),
            DriverError::Rejected(message) | DriverError::Failure(message) => {
                Self::Driver { operation, message }
            }
            DriverError::Malformed(message) => {
                Self::Internal(format!("{operation}: gateway returned malformed data: {message}"))
            }
        }
    }
}

impl From<DriverError> for CoreError {
    fn from(err: DriverError) -> Self {
        Self::from_driver("driver call", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_never_map_to_success_like_variants() {
        let mapped = CoreError::from_driver("start_aca", DriverError::InProgress);
        assert_eq!(mapped, CoreError::AlreadyInProgress);

        let mapped = CoreError::from_driver("read_stats", DriverError::Unavailable("gone".into()));
        assert!(matches!(mapped, CoreError::DriverUnavailable { .. }));

        let mapped = CoreError::from_driver("read_scmod", DriverError::Malformed("short".into()));
        assert!(matches!(mapped, CoreError::Internal(_)));
    }

    #[test]
    fn retryable_classification() {
        assert!(CoreError::AlreadyInProgress.is_retryable());
        assert!(CoreError::NotReady { what: "aca result" }.is_retryable());
        assert!(!CoreError::Internal("x".into()).is_retryable());
    }

    #[test]
    fn timeout_display_mentions_operation() {
        let err = CoreError::timeout("cancel_aca", Duration::from_millis(250));
        assert_eq!(err.to_string(), "cancel_aca timed out after 250ms");
    }
}
