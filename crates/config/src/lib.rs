// Configuration loading

pub mod settings;

pub use settings::{
    AdapterConfig, ConfigError, ServerType, DEFAULT_APP_LOC, DEFAULT_CONTEXT_NAME,
};
