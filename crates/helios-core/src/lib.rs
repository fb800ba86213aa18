//! `helios-core`: the request-dispatch engine behind the Helios reverse
//! proxy and load balancer.
//!
//! This crate is the hard engineering — the backend registry, pluggable
//! selection strategies, health supervision, the aggregate circuit breaker,
//! rate limiting, metrics, and the dispatcher that fuses them into a single
//! per-request pipeline. Everything outside that (the HTTP listener, TLS,
//! the admin API's route wiring, process startup) lives in the
//! `helios-gateway` binary crate and is built on top of this one.

pub mod config;
pub mod error;
pub mod logs;
pub mod models;
pub mod services;
pub mod utils;

pub use error::HeliosError;
