#![forbid(unsafe_code)]

use crate::ids::{PropertyDefinitionId, TagDefinitionId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Work order describing which definitions one synchronization touched.
///
/// The log performs no validation. Deletion is terminal: an identifier present
/// in both the updated and deleted set of a category is treated as deleted by
/// the consumer, see [`UpdateLog::effective_updated_tag_definitions`].
///
/// Sets are ordered by identifier bytes, so two logs with equal content iterate
/// identically regardless of insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateLog {
    #[serde(default)]
    updated_tag_definitions: BTreeSet<TagDefinitionId>,
    #[serde(default)]
    deleted_tag_definitions: BTreeSet<TagDefinitionId>,
    #[serde(default)]
    updated_property_definitions: BTreeSet<PropertyDefinitionId>,
    #[serde(default)]
    deleted_property_definitions: BTreeSet<PropertyDefinitionId>,
}

impl UpdateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_updated_tag_definition(&mut self, id: TagDefinitionId) {
        self.updated_tag_definitions.insert(id);
    }

    pub fn add_deleted_tag_definition(&mut self, id: TagDefinitionId) {
        self.deleted_tag_definitions.insert(id);
    }

    pub fn add_updated_property_definition(&mut self, id: PropertyDefinitionId) {
        self.updated_property_definitions.insert(id);
    }

    pub fn add_deleted_property_definitions(
        &mut self,
        ids: impl IntoIterator<Item = PropertyDefinitionId>,
    ) {
        self.deleted_property_definitions.extend(ids);
    }

    pub fn updated_tag_definitions(&self) -> &BTreeSet<TagDefinitionId> {
        &self.updated_tag_definitions
    }

    pub fn updated_tag_definitions_mut(&mut self) -> &mut BTreeSet<TagDefinitionId> {
        &mut self.updated_tag_definitions
    }

    pub fn deleted_tag_definitions(&self) -> &BTreeSet<TagDefinitionId> {
        &self.deleted_tag_definitions
    }

    pub fn deleted_tag_definitions_mut(&mut self) -> &mut BTreeSet<TagDefinitionId> {
        &mut self.deleted_tag_definitions
    }

    pub fn updated_property_definitions(&self) -> &BTreeSet<PropertyDefinitionId> {
        &self.updated_property_definitions
    }

    pub fn updated_property_definitions_mut(&mut self) -> &mut BTreeSet<PropertyDefinitionId> {
        &mut self.updated_property_definitions
    }

    pub fn deleted_property_definitions(&self) -> &BTreeSet<PropertyDefinitionId> {
        &self.deleted_property_definitions
    }

    pub fn deleted_property_definitions_mut(&mut self) -> &mut BTreeSet<PropertyDefinitionId> {
        &mut self.deleted_property_definitions
    }

    /// Unions a log produced by a nested merge step into this one.
    pub fn merge(&mut self, other: UpdateLog) {
        self.updated_tag_definitions
            .extend(other.updated_tag_definitions);
        self.deleted_tag_definitions
            .extend(other.deleted_tag_definitions);
        self.updated_property_definitions
            .extend(other.updated_property_definitions);
        self.deleted_property_definitions
            .extend(other.deleted_property_definitions);
    }

    pub fn is_empty(&self) -> bool {
        self.updated_tag_definitions.is_empty()
            && self.deleted_tag_definitions.is_empty()
            && self.updated_property_definitions.is_empty()
            && self.deleted_property_definitions.is_empty()
    }

    /// Updated tag definitions that are not also deleted, ascending.
    pub fn effective_updated_tag_definitions(&self) -> impl Iterator<Item = &TagDefinitionId> {
        self.updated_tag_definitions
            .difference(&self.deleted_tag_definitions)
    }

    /// Updated property definitions that are not also deleted, ascending.
    pub fn effective_updated_property_definitions(
        &self,
    ) -> impl Iterator<Item = &PropertyDefinitionId> {
        self.updated_property_definitions
            .difference(&self.deleted_property_definitions)
    }

    /// Number of update requests suppressed by a deletion in the same log.
    pub fn suppressed_updates(&self) -> usize {
        self.updated_tag_definitions
            .intersection(&self.deleted_tag_definitions)
            .count()
            + self
                .updated_property_definitions
                .intersection(&self.deleted_property_definitions)
                .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(n: u8) -> TagDefinitionId {
        TagDefinitionId::from_bytes([n; 16])
    }

    fn prop(n: u8) -> PropertyDefinitionId {
        PropertyDefinitionId::from_bytes([n; 16])
    }

    #[test]
    fn inserts_are_idempotent() {
        let mut log = UpdateLog::new();
        log.add_updated_tag_definition(tag(1));
        log.add_updated_tag_definition(tag(1));
        log.add_updated_property_definition(prop(2));
        log.add_updated_property_definition(prop(2));
        assert_eq!(log.updated_tag_definitions().len(), 1);
        assert_eq!(log.updated_property_definitions().len(), 1);
        assert!(!log.is_empty());
    }

    #[test]
    fn deletion_wins_over_update() {
        let mut log = UpdateLog::new();
        log.add_updated_tag_definition(tag(1));
        log.add_updated_tag_definition(tag(2));
        log.add_deleted_tag_definition(tag(1));
        log.add_updated_property_definition(prop(5));
        log.add_deleted_property_definitions([prop(5), prop(6)]);

        let tags = log
            .effective_updated_tag_definitions()
            .copied()
            .collect::<Vec<_>>();
        assert_eq!(tags, vec![tag(2)]);
        assert_eq!(log.effective_updated_property_definitions().count(), 0);
        assert_eq!(log.suppressed_updates(), 2);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut a = UpdateLog::new();
        a.add_updated_tag_definition(tag(3));
        a.add_updated_tag_definition(tag(1));
        a.add_deleted_property_definitions([prop(9), prop(4)]);

        let mut b = UpdateLog::new();
        b.add_deleted_property_definitions([prop(4)]);
        b.add_updated_tag_definition(tag(1));
        b.add_deleted_property_definitions([prop(9)]);
        b.add_updated_tag_definition(tag(3));

        assert_eq!(a, b);
        assert_eq!(
            a.updated_tag_definitions().iter().collect::<Vec<_>>(),
            b.updated_tag_definitions().iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn merge_unions_nested_logs() {
        let mut outer = UpdateLog::new();
        outer.add_updated_tag_definition(tag(1));

        let mut nested = UpdateLog::new();
        nested.add_deleted_tag_definition(tag(1));
        nested.add_updated_property_definition(prop(2));
        outer.merge(nested);

        outer.deleted_property_definitions_mut().insert(prop(3));

        assert!(outer.deleted_tag_definitions().contains(&tag(1)));
        assert!(outer.updated_property_definitions().contains(&prop(2)));
        assert!(outer.deleted_property_definitions().contains(&prop(3)));
        assert_eq!(outer.effective_updated_tag_definitions().count(), 0);
    }
}
