//! Utility modules for tilepipe
//!
//! - Structured logging setup and configuration
//! - Bounded readiness polling

pub mod logging;
pub mod poll;

pub use logging::{init_logging, LoggingConfig};
pub use poll::poll_until;
