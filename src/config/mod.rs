//! Configuration module for the converge engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `converge.yaml` / `converge.json`
//! - Validation of configuration values
//! - Computing configuration hashes for plan staleness checks

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    Document, EngineSettings, ForEach, Lifecycle, ProviderConfig, ResourceBlock, StateBackend,
    StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
