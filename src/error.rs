//! Typed errors for the pipeline and the stamp cache.
//!
//! Stage bodies and collaborators return `anyhow::Error`; the pipeline wraps
//! those with the name of the stage that failed.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Failed to create stamp directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write stamp {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize stamp for stage '{stage}': {source}")]
    Serialize {
        stage: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to remove stamp {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid pipeline definition: {0}")]
    Definition(String),

    #[error("Stage '{stage}': failed to compute fingerprint: {source:#}")]
    Fingerprint {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage '{stage}' failed: {source:#}")]
    Stage {
        stage: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Stage '{stage}' finished but its output is missing: {}", path.display())]
    MissingArtifact { stage: String, path: PathBuf },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl PipelineError {
    /// Name of the stage the error belongs to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Fingerprint { stage, .. }
            | Self::Stage { stage, .. }
            | Self::MissingArtifact { stage, .. } => Some(stage),
            Self::Definition(_) | Self::Cache(_) => None,
        }
    }
}
