pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{load_config, load_directory_source};
pub use models::*;
pub use validation::{ServerConfigValidator, ValidationError, ValidationResult};
