//! Application bootstrap primitives.
//!
//! Everything a binary needs to set up before starting the buffering engine: currently, logging.
#![deny(missing_docs)]

pub mod logging;

/// Common imports.
pub mod prelude {
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration, LoggingGuard};
}
