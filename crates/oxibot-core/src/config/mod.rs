//! Runtime configuration: [`schema::Config`] describes the shape, and
//! [`loader`] resolves it from a TOML file layered with environment
//! variable overrides.
//!
//! ```no_run
//! use oxibot_core::config;
//!
//! let cfg = config::load_config(None);
//! println!("default model: {}", cfg.agents.defaults.model);
//! ```

pub mod loader;
pub mod schema;

// Re-export key types
pub use loader::{get_config_path, load_config, save_config};
pub use schema::Config;
