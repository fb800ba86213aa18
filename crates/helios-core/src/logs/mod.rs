//! Structured logging configuration.

pub mod logger;

pub use logger::configure_logger;
