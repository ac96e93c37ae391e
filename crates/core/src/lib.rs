#![forbid(unsafe_code)]

pub mod aggregate;
pub mod cancel;
pub mod ids;
pub mod model;
pub mod predicate;
pub mod tagset_diff;
pub mod update_log;

pub use aggregate::{GroupTree, GroupedQueryResult, QueryResultRow, TreeRowItem, group_rows};
pub use cancel::CancellationToken;
pub use ids::{
    CollectionId, DocumentId, IdError, PropertyDefinitionId, TagDefinitionId, TagInstanceId,
    TagsetId,
};
pub use model::{ModelError, PropertyDefinition, Span, TagDefinition, TagInstance, TagsetDefinition};
pub use predicate::{
    Comparator, FrequencyClause, FrequencyPredicate, IndexConsistencyError, PredicateParseError,
};
pub use tagset_diff::{diff_tagset_removal, diff_tagsets, full_reindex};
pub use update_log::UpdateLog;
