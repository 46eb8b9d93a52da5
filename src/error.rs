//! Fatal pipeline errors.
//!
//! Per-image problems never surface here: they are folded into the batch
//! report as [`crate::enrich::SkipReason`]s. Everything in [`PipelineError`]
//! ends the run.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to load detection model {}: {message}", path.display())]
    ModelLoad { path: PathBuf, message: String },

    #[error("failed to scan image directory {}: {message}", path.display())]
    Scan { path: PathBuf, message: String },

    #[error("failed to write staging artifact {}: {source}", path.display())]
    StagingWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed staging artifact {} (line {line}): {message}", path.display())]
    StagingRead {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("failed to prepare warehouse location {}: {source}", path.display())]
    WarehouseSetup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to ensure warehouse table '{table}': {source}")]
    Schema {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to query warehouse table '{table}': {source}")]
    Query {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("warehouse load into '{table}' rolled back: {message}")]
    LoadTransaction { table: String, message: String },
}

impl PipelineError {
    pub(crate) fn staging_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::StagingWrite {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn load(table: &str, message: impl std::fmt::Display) -> Self {
        PipelineError::LoadTransaction {
            table: table.to_string(),
            message: message.to_string(),
        }
    }
}
