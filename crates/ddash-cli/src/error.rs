//! Error types for the ddash CLI.

use ddash_proxy::ProxyError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("failed to read {}: {}", path.display(), source)]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {}", path.display(), source)]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write {}: {}", path.display(), source)]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to start proxy runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to wait for Ctrl-C: {0}")]
    Signal(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
