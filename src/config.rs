use serde::Deserialize;

use crate::request::DEFAULT_BUFFER_SIZE;

/// Settings for the server binary.
///
/// Read from an optional `rawhttp.toml` next to the working directory, then
/// overridden by `RAWHTTP_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind. Defaults to "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind. Defaults to 42069.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Initial size of the per-connection read buffer.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Upper bound on connections handled at once. Unbounded when unset.
    #[serde(default)]
    pub max_connections: Option<usize>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl TryFrom<config::Config> for ServerConfig {
    type Error = config::ConfigError;

    fn try_from(config: config::Config) -> Result<Self, Self::Error> {
        config.try_deserialize()
    }
}

impl ServerConfig {
    pub fn new() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name("rawhttp").required(false))
            .add_source(config::Environment::with_prefix("RAWHTTP"))
            .build()?
            .try_into()
    }

    /// Parses `log_level`, falling back to INFO on unknown values.
    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    42069
}

fn default_read_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_buffer_size: default_read_buffer_size(),
            max_connections: None,
            log_level: default_log_level(),
        }
    }
}
