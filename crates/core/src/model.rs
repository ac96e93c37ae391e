#![forbid(unsafe_code)]

use crate::ids::{PropertyDefinitionId, TagDefinitionId, TagInstanceId, TagsetId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Parent chains longer than this are treated as corrupt.
pub const MAX_TAG_DEPTH: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("name must not be empty")]
    EmptyName,
    #[error("name is too long")]
    NameTooLong,
    #[error("name contains control characters")]
    ContainsControl,
    #[error("span end ({end}) precedes start ({start})")]
    InvalidSpan { start: u64, end: u64 },
    #[error("tag {0} does not belong to this tagset")]
    ForeignTag(TagDefinitionId),
    #[error("property {0} does not belong to this tag")]
    ForeignProperty(PropertyDefinitionId),
}

fn validate_name(value: &str) -> Result<(), ModelError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ModelError::EmptyName);
    }
    if trimmed.len() > 256 {
        return Err(ModelError::NameTooLong);
    }
    if trimmed.chars().any(|c| c.is_control()) {
        return Err(ModelError::ContainsControl);
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDefinition {
    pub id: PropertyDefinitionId,
    pub tag_id: TagDefinitionId,
    pub name: String,
    pub possible_values: Vec<String>,
}

impl PropertyDefinition {
    pub fn try_new(
        id: PropertyDefinitionId,
        tag_id: TagDefinitionId,
        name: impl Into<String>,
        possible_values: Vec<String>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            id,
            tag_id,
            name: name.trim().to_string(),
            possible_values,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub id: TagDefinitionId,
    pub tagset_id: TagsetId,
    pub parent_id: Option<TagDefinitionId>,
    pub name: String,
    pub color: String,
    #[serde(default)]
    pub properties: BTreeMap<PropertyDefinitionId, PropertyDefinition>,
}

impl TagDefinition {
    pub fn try_new(
        id: TagDefinitionId,
        tagset_id: TagsetId,
        name: impl Into<String>,
        color: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            id,
            tagset_id,
            parent_id: None,
            name: name.trim().to_string(),
            color: color.into(),
            properties: BTreeMap::new(),
        })
    }

    pub fn with_parent(mut self, parent_id: TagDefinitionId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn add_property(&mut self, property: PropertyDefinition) -> Result<(), ModelError> {
        if property.tag_id != self.id {
            return Err(ModelError::ForeignProperty(property.id));
        }
        self.properties.insert(property.id, property);
        Ok(())
    }

    /// True when name, color or parent differ. Properties are compared separately.
    pub fn header_differs(&self, other: &TagDefinition) -> bool {
        self.name != other.name || self.color != other.color || self.parent_id != other.parent_id
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagsetDefinition {
    pub id: TagsetId,
    pub name: String,
    /// Version marker compared during merges.
    pub version: u64,
    #[serde(default)]
    pub tags: BTreeMap<TagDefinitionId, TagDefinition>,
}

impl TagsetDefinition {
    pub fn try_new(id: TagsetId, name: impl Into<String>, version: u64) -> Result<Self, ModelError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            id,
            name: name.trim().to_string(),
            version,
            tags: BTreeMap::new(),
        })
    }

    pub fn add_tag(&mut self, tag: TagDefinition) -> Result<(), ModelError> {
        if tag.tagset_id != self.id {
            return Err(ModelError::ForeignTag(tag.id));
        }
        self.tags.insert(tag.id, tag);
        Ok(())
    }

    pub fn tag(&self, id: &TagDefinitionId) -> Option<&TagDefinition> {
        self.tags.get(id)
    }

    /// Tag names from the root down to `id`, joined with `/`.
    pub fn tag_path(&self, id: &TagDefinitionId) -> Option<String> {
        let mut names = Vec::new();
        let mut seen = BTreeSet::new();
        let mut current = Some(*id);
        while let Some(tag_id) = current {
            if !seen.insert(tag_id) || names.len() >= MAX_TAG_DEPTH {
                break;
            }
            let Some(tag) = self.tags.get(&tag_id) else {
                if names.is_empty() {
                    return None;
                }
                break;
            };
            names.push(tag.name.as_str());
            current = tag.parent_id;
        }
        names.reverse();
        Some(names.join("/"))
    }

    /// `root` plus every tag below it.
    pub fn descendants(&self, root: &TagDefinitionId) -> BTreeSet<TagDefinitionId> {
        let mut out = BTreeSet::new();
        if !self.tags.contains_key(root) {
            return out;
        }
        out.insert(*root);
        let mut frontier = vec![*root];
        while let Some(parent) = frontier.pop() {
            for tag in self.tags.values() {
                if tag.parent_id == Some(parent) && out.insert(tag.id) {
                    frontier.push(tag.id);
                }
            }
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn try_new(start: u64, end: u64) -> Result<Self, ModelError> {
        if end < start {
            return Err(ModelError::InvalidSpan { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One application of a tag to a document span.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInstance {
    pub id: TagInstanceId,
    pub tag_id: TagDefinitionId,
    pub span: Span,
    #[serde(default)]
    pub properties: BTreeMap<PropertyDefinitionId, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_id(n: u8) -> TagDefinitionId {
        TagDefinitionId::from_bytes([n; 16])
    }

    fn tagset() -> TagsetDefinition {
        let tagset_id = TagsetId::from_bytes([9; 16]);
        let mut tagset = TagsetDefinition::try_new(tagset_id, "Emotions", 1).expect("tagset");
        tagset
            .add_tag(TagDefinition::try_new(tag_id(1), tagset_id, "Emotion", "#ff0000").expect("tag"))
            .expect("add");
        tagset
            .add_tag(
                TagDefinition::try_new(tag_id(2), tagset_id, "Joy", "#00ff00")
                    .expect("tag")
                    .with_parent(tag_id(1)),
            )
            .expect("add");
        tagset
            .add_tag(
                TagDefinition::try_new(tag_id(3), tagset_id, "Delight", "#0000ff")
                    .expect("tag")
                    .with_parent(tag_id(2)),
            )
            .expect("add");
        tagset
    }

    #[test]
    fn names_are_validated() {
        let tagset_id = TagsetId::from_bytes([1; 16]);
        assert_eq!(
            TagDefinition::try_new(tag_id(1), tagset_id, "  ", "#fff").unwrap_err(),
            ModelError::EmptyName
        );
        assert_eq!(
            TagDefinition::try_new(tag_id(1), tagset_id, "bad\u{0007}", "#fff").unwrap_err(),
            ModelError::ContainsControl
        );
        assert_eq!(
            TagsetDefinition::try_new(tagset_id, "x".repeat(300), 0).unwrap_err(),
            ModelError::NameTooLong
        );
    }

    #[test]
    fn foreign_tags_are_rejected() {
        let mut tagset = tagset();
        let other = TagDefinition::try_new(tag_id(8), TagsetId::from_bytes([2; 16]), "Other", "#000")
            .expect("tag");
        assert_eq!(tagset.add_tag(other).unwrap_err(), ModelError::ForeignTag(tag_id(8)));
    }

    #[test]
    fn tag_path_walks_parents() {
        let tagset = tagset();
        assert_eq!(tagset.tag_path(&tag_id(3)).as_deref(), Some("Emotion/Joy/Delight"));
        assert_eq!(tagset.tag_path(&tag_id(1)).as_deref(), Some("Emotion"));
        assert_eq!(tagset.tag_path(&tag_id(7)), None);
    }

    #[test]
    fn tag_path_survives_parent_cycles() {
        let mut tagset = tagset();
        if let Some(root) = tagset.tags.get_mut(&tag_id(1)) {
            root.parent_id = Some(tag_id(3));
        }
        let path = tagset.tag_path(&tag_id(3)).expect("path");
        assert_eq!(path.split('/').count(), 3);
    }

    #[test]
    fn descendants_include_root_and_subtree() {
        let tagset = tagset();
        let below_joy = tagset.descendants(&tag_id(2));
        assert_eq!(below_joy.into_iter().collect::<Vec<_>>(), vec![tag_id(2), tag_id(3)]);
        assert_eq!(tagset.descendants(&tag_id(1)).len(), 3);
        assert!(tagset.descendants(&tag_id(42)).is_empty());
    }

    #[test]
    fn span_order_is_checked() {
        assert_eq!(
            Span::try_new(5, 2).unwrap_err(),
            ModelError::InvalidSpan { start: 5, end: 2 }
        );
        let span = Span::try_new(2, 5).expect("span");
        assert_eq!(span.len(), 3);
        assert!(Span::try_new(4, 4).expect("span").is_empty());
    }
}
