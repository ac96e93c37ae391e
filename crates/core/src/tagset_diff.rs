#![forbid(unsafe_code)]

//! Derives the [`UpdateLog`] that brings an index from one snapshot of a tagset
//! to another, e.g. the local state before a pull and the merged state after it.

use crate::model::{TagDefinition, TagsetDefinition};
use crate::update_log::UpdateLog;
use std::collections::BTreeSet;

/// Compares `before` and `after` snapshots of one tagset.
///
/// A tag whose path changes (renamed, moved to another parent, or left
/// without its deleted parent) also marks its descendants updated, since their
/// cached paths embed the ancestor chain.
pub fn diff_tagsets(before: &TagsetDefinition, after: &TagsetDefinition) -> UpdateLog {
    let mut log = UpdateLog::new();
    if before.version == after.version && before == after {
        return log;
    }

    for (id, old_tag) in &before.tags {
        match after.tags.get(id) {
            None => delete_tag(&mut log, old_tag),
            Some(new_tag) => diff_tag(&mut log, old_tag, new_tag),
        }
    }

    let mut reshaped = BTreeSet::new();
    for (id, new_tag) in &after.tags {
        match before.tags.get(id) {
            None => {
                log.add_updated_tag_definition(*id);
                for property_id in new_tag.properties.keys() {
                    log.add_updated_property_definition(*property_id);
                }
            }
            Some(old_tag)
                if old_tag.name != new_tag.name || old_tag.parent_id != new_tag.parent_id =>
            {
                reshaped.insert(*id);
            }
            Some(_) => {}
        }
        let orphaned = new_tag
            .parent_id
            .is_some_and(|parent| before.tags.contains_key(&parent) && !after.tags.contains_key(&parent));
        if orphaned {
            reshaped.insert(*id);
        }
    }

    for id in reshaped {
        for descendant in after.descendants(&id) {
            log.add_updated_tag_definition(descendant);
        }
    }

    log
}

/// Log that purges every tag and property of `tagset`.
pub fn diff_tagset_removal(tagset: &TagsetDefinition) -> UpdateLog {
    let mut log = UpdateLog::new();
    for tag in tagset.tags.values() {
        delete_tag(&mut log, tag);
    }
    log
}

/// Log that re-indexes every tag and property of `tagset`.
pub fn full_reindex(tagset: &TagsetDefinition) -> UpdateLog {
    let mut log = UpdateLog::new();
    for tag in tagset.tags.values() {
        log.add_updated_tag_definition(tag.id);
        for property_id in tag.properties.keys() {
            log.add_updated_property_definition(*property_id);
        }
    }
    log
}

fn delete_tag(log: &mut UpdateLog, tag: &TagDefinition) {
    log.add_deleted_tag_definition(tag.id);
    log.add_deleted_property_definitions(tag.properties.keys().copied());
}

fn diff_tag(log: &mut UpdateLog, old_tag: &TagDefinition, new_tag: &TagDefinition) {
    let mut tag_changed = old_tag.header_differs(new_tag);

    let removed = old_tag
        .properties
        .keys()
        .filter(|id| !new_tag.properties.contains_key(id))
        .copied()
        .collect::<Vec<_>>();
    if !removed.is_empty() {
        tag_changed = true;
        log.add_deleted_property_definitions(removed);
    }

    for (id, new_property) in &new_tag.properties {
        match old_tag.properties.get(id) {
            Some(old_property) if old_property == new_property => {}
            _ => {
                tag_changed = true;
                log.add_updated_property_definition(*id);
            }
        }
    }

    if tag_changed {
        log.add_updated_tag_definition(new_tag.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{PropertyDefinitionId, TagDefinitionId, TagsetId};
    use crate::model::PropertyDefinition;

    const TAGSET: TagsetId = TagsetId::from_bytes([0xAA; 16]);

    fn tag_id(n: u8) -> TagDefinitionId {
        TagDefinitionId::from_bytes([n; 16])
    }

    fn prop_id(n: u8) -> PropertyDefinitionId {
        PropertyDefinitionId::from_bytes([n; 16])
    }

    fn tag(n: u8, name: &str) -> TagDefinition {
        TagDefinition::try_new(tag_id(n), TAGSET, name, "#336699").expect("tag")
    }

    fn with_property(mut tag: TagDefinition, n: u8, name: &str, values: &[&str]) -> TagDefinition {
        let property = PropertyDefinition::try_new(
            prop_id(n),
            tag.id,
            name,
            values.iter().map(|v| v.to_string()).collect(),
        )
        .expect("property");
        tag.add_property(property).expect("add property");
        tag
    }

    fn tagset(version: u64, tags: Vec<TagDefinition>) -> TagsetDefinition {
        let mut tagset = TagsetDefinition::try_new(TAGSET, "Narratology", version).expect("tagset");
        for tag in tags {
            tagset.add_tag(tag).expect("add tag");
        }
        tagset
    }

    #[test]
    fn identical_snapshots_yield_empty_log() {
        let a = tagset(3, vec![tag(1, "Analepsis")]);
        assert!(diff_tagsets(&a, &a.clone()).is_empty());
    }

    #[test]
    fn version_bump_without_content_change_yields_empty_log() {
        let a = tagset(3, vec![tag(1, "Analepsis")]);
        let b = tagset(4, vec![tag(1, "Analepsis")]);
        assert!(diff_tagsets(&a, &b).is_empty());
    }

    #[test]
    fn removed_tag_deletes_its_properties() {
        let before = tagset(1, vec![with_property(tag(1, "Analepsis"), 10, "reach", &[])]);
        let after = tagset(2, vec![]);
        let log = diff_tagsets(&before, &after);
        assert!(log.deleted_tag_definitions().contains(&tag_id(1)));
        assert!(log.deleted_property_definitions().contains(&prop_id(10)));
        assert!(log.updated_tag_definitions().is_empty());
    }

    #[test]
    fn added_and_changed_tags_are_updated() {
        let before = tagset(1, vec![tag(1, "Analepsis"), tag(2, "Prolepsis")]);
        let mut recolored = tag(2, "Prolepsis");
        recolored.color = "#000000".to_string();
        let after = tagset(2, vec![tag(1, "Analepsis"), recolored, tag(3, "Ellipsis")]);

        let log = diff_tagsets(&before, &after);
        assert_eq!(
            log.updated_tag_definitions().iter().copied().collect::<Vec<_>>(),
            vec![tag_id(2), tag_id(3)]
        );
        assert!(log.deleted_tag_definitions().is_empty());
    }

    #[test]
    fn property_changes_mark_owner_updated() {
        let before = tagset(
            1,
            vec![with_property(
                with_property(tag(1, "Analepsis"), 10, "reach", &["short"]),
                11,
                "extent",
                &[],
            )],
        );
        let after = tagset(
            2,
            vec![with_property(tag(1, "Analepsis"), 10, "reach", &["short", "long"])],
        );

        let log = diff_tagsets(&before, &after);
        assert!(log.updated_property_definitions().contains(&prop_id(10)));
        assert!(log.deleted_property_definitions().contains(&prop_id(11)));
        assert!(log.updated_tag_definitions().contains(&tag_id(1)));
    }

    #[test]
    fn rename_propagates_to_descendants() {
        let child = tag(2, "Internal").with_parent(tag_id(1));
        let grandchild = tag(3, "Mixed").with_parent(tag_id(2));
        let before = tagset(1, vec![tag(1, "Analepsis"), child.clone(), grandchild.clone()]);
        let after = tagset(2, vec![tag(1, "Flashback"), child, grandchild]);

        let log = diff_tagsets(&before, &after);
        assert_eq!(log.updated_tag_definitions().len(), 3);
    }

    #[test]
    fn reparent_propagates_to_descendants() {
        let child = tag(3, "Internal").with_parent(tag_id(2));
        let before = tagset(1, vec![tag(1, "Analepsis"), tag(2, "Prolepsis"), child.clone()]);
        let moved = tag(2, "Prolepsis").with_parent(tag_id(1));
        let after = tagset(2, vec![tag(1, "Analepsis"), moved, child]);

        let log = diff_tagsets(&before, &after);
        assert_eq!(
            log.updated_tag_definitions().iter().copied().collect::<Vec<_>>(),
            vec![tag_id(2), tag_id(3)]
        );
    }

    #[test]
    fn deleted_parent_marks_surviving_subtree() {
        let child = tag(2, "Internal").with_parent(tag_id(1));
        let grandchild = tag(3, "Mixed").with_parent(tag_id(2));
        let before = tagset(1, vec![tag(1, "Prolepsis"), child.clone(), grandchild.clone()]);
        let after = tagset(2, vec![child, grandchild]);

        let log = diff_tagsets(&before, &after);
        assert!(log.deleted_tag_definitions().contains(&tag_id(1)));
        assert_eq!(
            log.updated_tag_definitions().iter().copied().collect::<Vec<_>>(),
            vec![tag_id(2), tag_id(3)]
        );
    }

    #[test]
    fn removal_and_reindex_cover_everything() {
        let ts = tagset(
            1,
            vec![with_property(tag(1, "Analepsis"), 10, "reach", &[]), tag(2, "Prolepsis")],
        );
        let removal = diff_tagset_removal(&ts);
        assert_eq!(removal.deleted_tag_definitions().len(), 2);
        assert_eq!(removal.deleted_property_definitions().len(), 1);

        let reindex = full_reindex(&ts);
        assert_eq!(reindex.updated_tag_definitions().len(), 2);
        assert_eq!(reindex.updated_property_definitions().len(), 1);
    }
}
