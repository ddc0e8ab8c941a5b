//! # Mimesis Common
//!
//! Logging configuration shared by the Mimesis worker crates and the host tool.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
