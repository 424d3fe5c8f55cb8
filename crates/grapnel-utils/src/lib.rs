//! # Grapnel Utilities
//!
//! Logging setup shared by the Grapnel binaries.

pub mod logging;

pub use logging::{init_logging, LogFormat, LogLevel, LoggingConfig, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
