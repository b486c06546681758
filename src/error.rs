use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid schedule field '{field}': {message}")]
    InvalidField { field: String, message: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown callback '{0}'")]
    UnknownCallback(String),
    #[error("callback '{name}' failed: {source}")]
    CallbackFailed { name: String, source: anyhow::Error },
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read update directory {path}: {source}")]
    ReadDir { path: String, source: std::io::Error },
    #[error("failed to load plugin {path}: {message}")]
    Load { path: String, message: String },
}
