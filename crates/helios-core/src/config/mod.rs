//! Configuration: the YAML schema, the loader, and exhaustive validation
//! that runs before any component is constructed.

pub mod settings;
pub mod validation;

pub use settings::{load_config, Config};
pub use validation::{validate, ValidationResult};
