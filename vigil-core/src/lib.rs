pub mod error;
pub mod nodestate;
pub mod protocol;

pub use error::AppError;
pub use nodestate::NodeState;
pub use protocol::Lsn;

/// The version of the monitor extension this build of vigil speaks.
///
/// The keeper refuses to run against a monitor whose installed extension
/// version differs, and exits so that its supervisor may re-execute an
/// upgraded binary.
pub const EXTENSION_VERSION: &str = "1.2";

/// Name of the monitor-side extension which implements the vigil protocol.
pub const EXTENSION_NAME: &str = "vigil";
