//! Observability: logging, metrics and health.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::*;
pub use logging::*;
pub use metrics::*;
