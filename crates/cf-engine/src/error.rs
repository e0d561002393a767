use cf_core::{RuleGroup, StoreError};

/// Errors surfaced by the rule manager and the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Source {id} is already registered for {group}")]
    DuplicateSource { group: RuleGroup, id: u32 },
    #[error("No source {id} in {group}")]
    UnknownSource { group: RuleGroup, id: u32 },
    #[error("Source {id} of {group} cannot be removed or changed")]
    NotRemovable { group: RuleGroup, id: u32 },
    #[error("Source {id} of {group} must be disabled first")]
    SourceInUse { group: RuleGroup, id: u32 },
    #[error("Source {id} could not be loaded: {source}")]
    Source {
        id: u32,
        #[source]
        source: StoreError,
    },
    #[error("Stats store: {0}")]
    Stats(#[from] crate::stats::StatsError),
    #[error("Background task failed: {0}")]
    Background(String),
}

impl EngineError {
    pub(crate) fn read(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Read {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn write(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Write {
            path: path.display().to_string(),
            source,
        }
    }
}
