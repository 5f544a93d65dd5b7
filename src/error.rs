use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    ConfigValidation(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("forge error: {0}")]
    Forge(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("history error: {0}")]
    History(String),

    #[error("prompt error: {0}")]
    Prompt(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("status probe error: {0}")]
    Status(String),

    #[error("dispatcher error: {0}")]
    Dispatcher(String),

    #[error("{0} cancelled")]
    Cancelled(String),
}

pub type Result<T> = std::result::Result<T, Error>;
