use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Backend source '{name}' error: {message}")]
    Backend {
        name: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint error: {message}")]
    Checkpoint {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Checkpoint generation {generation} is corrupt: {message}")]
    CorruptCheckpoint {
        generation: u64,
        message: String,
    },

    #[error("Batch size mismatch: provider configured for {expected}, caller requested {requested}")]
    SizeMismatch {
        expected: usize,
        requested: usize,
    },

    #[error("No batch ready (non-blocking request)")]
    WouldBlock,

    #[error("Batch stream is not running")]
    NotRunning,

    #[error("Ring protocol violation: {message}")]
    Protocol {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, StreamError>;

// Convenience constructors
impl StreamError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn backend(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            name: name.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn backend_with_source(
        name: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            name: name.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: None,
        }
    }

    pub fn checkpoint_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Checkpoint {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn corrupt(generation: u64, message: impl Into<String>) -> Self {
        Self::CorruptCheckpoint {
            generation,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}
