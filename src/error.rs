//! Error taxonomy for the explorer

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExplorerError {
    /// Project list or explorer config could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown project '{0}'")]
    UnknownProject(String),

    /// Probing a project root failed. Never reported as "not runnable".
    #[error("Failed to detect project type at {}: {source}", path.display())]
    Detection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Test server error: {0}")]
    Server(String),

    #[error("Test load failed: {0}")]
    Load(String),

    #[error("Test run failed: {0}")]
    Run(String),

    #[error("Timed out after {0}ms")]
    Timeout(u64),

    #[error("Not Implemented")]
    NotImplemented,

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExplorerError>;
