//! Process-wide tracing/logging setup shared by workers and tools.

pub mod logging;

pub use logging::{LogFormat, init, init_with};
