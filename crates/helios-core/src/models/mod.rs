//! Data model shared by every component of the dispatch pipeline.
//!
//! [`backend`] defines the Backend Record: the only piece of state that is
//! exclusively owned (the Backend Registry owns it; every other component
//! holds a borrowed [`std::sync::Arc`] handle valid only while the record
//! stays in the registry).

pub mod backend;

pub use backend::{Backend, BackendConfig, BackendInfo};
