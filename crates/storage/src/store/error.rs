#![forbid(unsafe_code)]

use ag_core::ids::{CollectionId, TagDefinitionId, TagsetId};
use ag_core::predicate::IndexConsistencyError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("unknown collection {0}")]
    UnknownCollection(CollectionId),
    #[error("unknown tagset {0}")]
    UnknownTagset(TagsetId),
    #[error("unknown tag definition {0}")]
    UnknownTagDefinition(TagDefinitionId),
    #[error("collection {0} already exists")]
    CollectionAlreadyExists(CollectionId),
    #[error("index consistency (vertex={vertex}): {source}")]
    IndexConsistency {
        vertex: String,
        source: IndexConsistencyError,
    },
    #[error("concurrent merge on tagset {tagset} (waited {waited_ms}ms)")]
    ConcurrentMergeConflict { tagset: TagsetId, waited_ms: u64 },
    #[error("query cancelled")]
    Cancelled,
    #[error("schema version mismatch (stored={stored}, expected={expected})")]
    SchemaMismatch { stored: i64, expected: i64 },
    #[error("grouping mismatch (stored={stored}, configured={configured})")]
    GroupingMismatch { stored: String, configured: String },
    #[error("corrupt row: {0}")]
    CorruptRow(&'static str),
}

impl IndexError {
    /// Stable machine-readable code for callers that branch on error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Sql(_) => "SQL",
            Self::Json(_) => "JSON",
            Self::Yaml(_) | Self::Config(_) => "CONFIG",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::UnknownCollection(_) => "UNKNOWN_COLLECTION",
            Self::UnknownTagset(_) => "UNKNOWN_TAGSET",
            Self::UnknownTagDefinition(_) => "UNKNOWN_TAG_DEFINITION",
            Self::CollectionAlreadyExists(_) => "COLLECTION_EXISTS",
            Self::IndexConsistency { .. } => "INDEX_CONSISTENCY",
            Self::ConcurrentMergeConflict { .. } => "CONCURRENT_MERGE_CONFLICT",
            Self::Cancelled => "CANCELLED",
            Self::SchemaMismatch { .. } | Self::GroupingMismatch { .. } => "RESET_REQUIRED",
            Self::CorruptRow(_) => "CORRUPT_ROW",
        }
    }
}
