//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text and a process exit code.

use std::path::Path;

use miette::Diagnostic;
use thiserror::Error;

use pushok_config::ConfigError;
use pushok_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONFIG: i32 = 4;
    pub const CONNECTION: i32 = 7;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the hub: {message}")]
    #[diagnostic(
        code(pushok::hub_unreachable),
        help("Check [hub].host and [hub].port, and that the hub is powered and on the network.")
    )]
    HubUnreachable { message: String },

    #[error("MQTT broker error: {message}")]
    #[diagnostic(
        code(pushok::broker),
        help("Check [mqtt].host, [mqtt].port and the broker credentials.")
    )]
    Broker { message: String },

    // ── Authentication ───────────────────────────────────────────────
    #[error("Hub rejected the stored credentials: {message}")]
    #[diagnostic(
        code(pushok::auth_failed),
        help(
            "The user may have been removed from the hub.\n\
             Register again with: pushok-mqtt register"
        )
    )]
    AuthFailed { message: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("No hub credentials: {missing} is not set")]
    #[diagnostic(
        code(pushok::no_credentials),
        help(
            "Register with the hub first: pushok-mqtt register --host <HUB>\n\
             Config file: {path}"
        )
    )]
    NoCredentials { missing: String, path: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(pushok::validation), help("Config file: {path}"))]
    Validation {
        field: String,
        reason: String,
        path: String,
    },

    #[error("Configuration error: {message}")]
    #[diagnostic(code(pushok::config))]
    Config { message: String },

    // ── Other ────────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(pushok::internal))]
    Internal { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HubUnreachable { .. } | Self::Broker { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::NoCredentials { .. } | Self::Validation { .. } | Self::Config { .. } => {
                exit_code::CONFIG
            }
            Self::Internal { .. } | Self::Io(_) => exit_code::GENERAL,
        }
    }

    pub fn from_config(err: ConfigError, path: &Path) -> Self {
        let path = path.display().to_string();
        match err {
            ConfigError::NoCredentials { missing } => Self::NoCredentials { missing, path },
            ConfigError::Validation { field, reason } => Self::Validation {
                field,
                reason,
                path,
            },
            ConfigError::Io(e) => Self::Io(e),
            other => Self::Config {
                message: other.to_string(),
            },
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Transport { message } => Self::HubUnreachable { message },
            CoreError::Broker { message } => Self::Broker { message },
            CoreError::Authentication { message } => Self::AuthFailed { message },
            CoreError::Config { message } => Self::Config { message },
            err @ (CoreError::Translation { .. }
            | CoreError::AckTimeout { .. }
            | CoreError::Internal(_)) => Self::Internal {
                message: err.to_string(),
            },
        }
    }
}
