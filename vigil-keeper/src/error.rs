//! Keeper error abstractions.

pub use vigil_core::error::{
    EXIT_CODE_BAD_CONFIG, EXIT_CODE_INTERNAL, EXIT_CODE_MONITOR_INCOMPATIBLE, EXIT_CODE_PG_SETUP,
};
pub use vigil_core::AppError;

/// The error type used to indicate that the keeper service must stop, along
/// with the process exit code the supervisor should observe.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {source}")]
pub struct FatalError {
    pub exit_code: i32,
    #[source]
    pub source: anyhow::Error,
}

impl FatalError {
    pub fn new(exit_code: i32, source: anyhow::Error) -> Self {
        Self { exit_code, source }
    }
}

impl From<AppError> for FatalError {
    fn from(err: AppError) -> Self {
        Self {
            exit_code: err.exit_code(),
            source: err.into(),
        }
    }
}

/// Extract the process exit code from a service error, defaulting to the
/// internal-error code when the error carries no explicit one.
pub fn exit_code_of(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<FatalError>() {
        Some(fatal) => fatal.exit_code,
        None => EXIT_CODE_INTERNAL,
    }
}
