//! Vigil error abstractions.

use thiserror::Error;

/// Process exit code used when the configuration could not be loaded or is invalid.
pub const EXIT_CODE_BAD_CONFIG: i32 = 2;
/// Process exit code used when the local postgres setup does not match expectations.
pub const EXIT_CODE_PG_SETUP: i32 = 3;
/// Process exit code used when the monitor extension version differs from ours.
///
/// The supervisor treats this code as "restart me": the replacement process is
/// executed from the binary currently on disk, which may have been upgraded.
pub const EXIT_CODE_MONITOR_INCOMPATIBLE: i32 = 4;
/// Process exit code used for unexpected internal errors.
pub const EXIT_CODE_INTERNAL: i32 = 5;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// The configuration on disk is invalid or could not be read.
    #[error("configuration error: {0}")]
    BadConfig(String),
    /// The local postgres instance does not match our expectations.
    #[error("postgres setup error: {0}")]
    BadPgSetup(String),
    /// The monitor runs an extension version we do not speak.
    #[error("monitor extension version is {installed}, this build requires {required}")]
    MonitorIncompatible { installed: String, required: String },
    /// A node in the group reports a different database system identifier.
    ///
    /// Physical replication across different systems is impossible; resolving
    /// this requires operator action, never a retry.
    #[error("system identifier mismatch: {0}")]
    IdentityMismatch(String),
    /// Any other internal error.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// The process exit code matching this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::BadConfig(_) => EXIT_CODE_BAD_CONFIG,
            AppError::BadPgSetup(_) | AppError::IdentityMismatch(_) => EXIT_CODE_PG_SETUP,
            AppError::MonitorIncompatible { .. } => EXIT_CODE_MONITOR_INCOMPATIBLE,
            AppError::Internal(_) => EXIT_CODE_INTERNAL,
        }
    }
}
