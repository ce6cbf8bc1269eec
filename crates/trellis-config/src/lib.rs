//! Configuration system for trellis.
//!
//! Provides TOML-based configuration with:
//! - `[engine]` scheduling limits, default step timeout and condition policy
//! - `[registry]` duplicate registration policy
//! - `[state]` persistence directory and background sweep interval
//! - `[logging]` level and output format
//!
//! Config files are layered: user config dir first, then `./trellis.toml`,
//! then an explicitly requested file.

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    user_config_dir, user_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
