#![forbid(unsafe_code)]

use ag_core::UpdateLog;
use ag_core::ids::{CollectionId, DocumentId, TagsetId};
use ag_core::model::TagInstance;
use std::collections::BTreeMap;

/// One Update Log per affected tagset, for boundary calls that can touch
/// several tagsets at once.
pub type TagsetLogs = BTreeMap<TagsetId, UpdateLog>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateCollectionRequest {
    /// Caller-chosen id; a fresh one is generated when absent.
    pub id: Option<CollectionId>,
    pub name: String,
    pub description: String,
    pub document_id: DocumentId,
    pub document_version: String,
}

impl CreateCollectionRequest {
    pub fn new(name: impl Into<String>, document_id: DocumentId) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            document_id,
            document_version: String::new(),
        }
    }

    pub fn with_id(mut self, id: CollectionId) -> Self {
        self.id = Some(id);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionContents {
    pub id: CollectionId,
    pub name: String,
    pub description: String,
    pub document_id: DocumentId,
    pub document_version: String,
    /// Included tagsets and the version each was added at.
    pub tagsets: BTreeMap<TagsetId, u64>,
    /// Ordered by span start, then instance id.
    pub instances: Vec<TagInstance>,
}
