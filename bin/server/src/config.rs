//! Centralized server configuration.
//!
//! Loaded via the `config` crate: an optional file named by
//! `PORTCULLIS_CONFIG` (toml, json, or yaml), overlaid by environment
//! variables prefixed `PORTCULLIS_` with `__` as the nesting separator.
//!
//! ```text
//! PORTCULLIS_AUTH__ENABLED=true
//! PORTCULLIS_AUTH__SESSION_SECRET=...
//! PORTCULLIS_AUTH__GITHUB__CLIENT_ID=...
//! PORTCULLIS_AUTH__PUBLIC_PATHS=/health,/docs/
//! ```
//!
//! See [`AuthConfig`] for every authentication setting.

use portcullis_access::AuthConfig;
use serde::Deserialize;

/// Environment variable naming an optional configuration file.
pub const CONFIG_FILE_VAR: &str = "PORTCULLIS_CONFIG";

const ENV_PREFIX: &str = "PORTCULLIS";

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Authentication configuration.
    #[serde(default)]
    pub auth: AuthConfig,
}

fn default_bind_address() -> String {
    "127.0.0.1:3000".to_string()
}

impl ServerConfig {
    /// Loads configuration from the optional file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file named by `PORTCULLIS_CONFIG` is missing
    /// or malformed, or if a value has the wrong type.
    pub fn load() -> Result<Self, config::ConfigError> {
        let file = std::env::var(CONFIG_FILE_VAR).ok();
        Self::load_from(file.as_deref(), environment())
    }

    fn load_from(
        file: Option<&str>,
        environment: config::Environment,
    ) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        builder
            .add_source(environment)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("auth.public_paths")
}
