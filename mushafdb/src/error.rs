use crate::remote::RemoteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MushafDbError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Item with key \"{key}\" not found in collection \"{collection}\"")]
    NotFound { collection: String, key: String },

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Write to '{collection}' still conflicted after {attempts} attempts")]
    Conflict { collection: String, attempts: u32 },

    /// The write was computed on top of an earlier write that failed.
    #[error("Write to '{collection}' was based on a failed write and was not applied")]
    Superseded { collection: String },

    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Migration v{version} failed for '{collection}': {message}")]
    Migration {
        collection: String,
        version: u32,
        message: String,
    },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Write queue is no longer running")]
    QueueClosed,

    #[error("{0}")]
    Other(String),
}

impl MushafDbError {
    /// HTTP status a web-facing caller should answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            MushafDbError::Validation(_) => 400,
            MushafDbError::Auth(_) => 401,
            MushafDbError::NotFound { .. } => 404,
            MushafDbError::Duplicate(_)
            | MushafDbError::Conflict { .. }
            | MushafDbError::Superseded { .. } => 409,
            MushafDbError::Remote(RemoteError::Conflict { .. }) => 409,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, MushafDbError>;
