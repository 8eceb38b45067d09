//! Daemon error types with miette diagnostics.

use miette::Diagnostic;
use thiserror::Error;

use moca_config::ConfigError;
use moca_core::CoreError;

/// Exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const UNAVAILABLE: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum DaemonError {
    #[error("Invalid configuration")]
    #[diagnostic(
        code(mocad::config),
        help(
            "Check the config file at {path}.\n\
             Values can also be overridden with MOCA_<SECTION>__<KEY> variables."
        )
    )]
    Config {
        path: String,
        #[source]
        source: ConfigError,
    },

    #[error("MoCA driver unavailable: {reason}")]
    #[diagnostic(code(mocad::unavailable))]
    Unavailable { reason: String },

    #[error("{operation} timed out")]
    #[diagnostic(
        code(mocad::timeout),
        help("Raise the matching *_ms value in the [controller] section.")
    )]
    Timeout { operation: String },

    #[error("Channel assessment ended in state {state}")]
    #[diagnostic(code(mocad::aca))]
    AcaFailed { state: String },

    #[error(transparent)]
    #[diagnostic(code(mocad::core))]
    Core(CoreError),

    #[error("failed to render output: {0}")]
    Render(String),
}

impl DaemonError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Core(CoreError::InvalidArgument(_)) => exit_code::USAGE,
            Self::Unavailable { .. } => exit_code::UNAVAILABLE,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            _ => exit_code::GENERAL,
        }
    }
}

// ── CoreError → DaemonError mapping ──────────────────────────────────

impl From<CoreError> for DaemonError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::DriverUnavailable { reason } => Self::Unavailable { reason },
            CoreError::Timeout { operation, .. } => Self::Timeout {
                operation: operation.into(),
            },
            other => Self::Core(other),
        }
    }
}

impl From<serde_json::Error> for DaemonError {
    fn from(err: serde_json::Error) -> Self {
        Self::Render(err.to_string())
    }
}

impl From<toml::ser::Error> for DaemonError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Render(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn core_errors_map_to_exit_codes() {
        let timeout: DaemonError = CoreError::Timeout {
            operation: "start_aca",
            after: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.exit_code(), exit_code::TIMEOUT);

        let busy: DaemonError = CoreError::AlreadyInProgress.into();
        assert_eq!(busy.exit_code(), exit_code::GENERAL);

        let gone: DaemonError = CoreError::DriverUnavailable {
            reason: "unplugged".into(),
        }
        .into();
        assert_eq!(gone.exit_code(), exit_code::UNAVAILABLE);
    }
}
