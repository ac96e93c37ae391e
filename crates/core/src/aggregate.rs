#![forbid(unsafe_code)]

use crate::ids::{CollectionId, DocumentId, TagDefinitionId};
use crate::model::Span;
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashMap;

/// One occurrence matched by a query.
///
/// `frequency` is 1 for a concrete tag instance and the vertex count when the
/// row stands for a pre-aggregated occurrence group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueryResultRow {
    pub document_id: DocumentId,
    pub collection_id: Option<CollectionId>,
    pub tag_id: TagDefinitionId,
    pub tag_name: String,
    pub tag_path: String,
    pub span: Option<Span>,
    pub frequency: u64,
}

/// Contract between query results and hierarchical presentation.
pub trait TreeRowItem {
    fn tree_key(&self) -> Cow<'_, str>;
    fn frequency(&self) -> u64;
    fn rows(&self) -> &[QueryResultRow];
}

impl TreeRowItem for QueryResultRow {
    fn tree_key(&self) -> Cow<'_, str> {
        match self.span {
            Some(span) => Cow::Owned(format!("{}@{}..{}", self.document_id, span.start, span.end)),
            None => Cow::Owned(self.document_id.to_hex()),
        }
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn rows(&self) -> &[QueryResultRow] {
        std::slice::from_ref(self)
    }
}

/// Rows sharing one caller-chosen key plus their cached total frequency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupedQueryResult {
    tree_key: String,
    rows: Vec<QueryResultRow>,
    frequency: u64,
}

impl GroupedQueryResult {
    pub fn new(tree_key: impl Into<String>) -> Self {
        Self {
            tree_key: tree_key.into(),
            rows: Vec::new(),
            frequency: 0,
        }
    }

    /// Replaces the member rows and recomputes the total eagerly. Rows keep the
    /// order they are given in.
    pub fn set_rows(&mut self, rows: impl IntoIterator<Item = QueryResultRow>) {
        self.rows = rows.into_iter().collect();
        self.frequency = total_frequency(&self.rows);
    }

    pub fn set_tree_key(&mut self, tree_key: impl Into<String>) {
        self.tree_key = tree_key.into();
    }

    pub fn into_rows(self) -> Vec<QueryResultRow> {
        self.rows
    }
}

impl TreeRowItem for GroupedQueryResult {
    fn tree_key(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.tree_key)
    }

    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn rows(&self) -> &[QueryResultRow] {
        &self.rows
    }
}

fn total_frequency(rows: &[QueryResultRow]) -> u64 {
    rows.iter()
        .fold(0u64, |acc, row| acc.saturating_add(row.frequency))
}

/// Groups rows by `key_fn`, keeping groups in first-seen order and rows in
/// input order within each group.
pub fn group_rows<F>(
    rows: impl IntoIterator<Item = QueryResultRow>,
    mut key_fn: F,
) -> Vec<GroupedQueryResult>
where
    F: FnMut(&QueryResultRow) -> String,
{
    let mut order: Vec<(String, Vec<QueryResultRow>)> = Vec::new();
    let mut slots: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let key = key_fn(&row);
        match slots.get(&key).copied() {
            Some(slot) => order[slot].1.push(row),
            None => {
                slots.insert(key.clone(), order.len());
                order.push((key, vec![row]));
            }
        }
    }

    order
        .into_iter()
        .map(|(key, rows)| {
            let mut group = GroupedQueryResult::new(key);
            group.set_rows(rows);
            group
        })
        .collect()
}

/// Two-level grouping: an outer group whose children regroup the same rows.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupTree {
    group: GroupedQueryResult,
    children: Vec<GroupedQueryResult>,
}

impl GroupTree {
    pub fn build<O, I>(
        rows: impl IntoIterator<Item = QueryResultRow>,
        outer_key: O,
        mut inner_key: I,
    ) -> Vec<GroupTree>
    where
        O: FnMut(&QueryResultRow) -> String,
        I: FnMut(&QueryResultRow) -> String,
    {
        group_rows(rows, outer_key)
            .into_iter()
            .map(|group| {
                let children = group_rows(group.rows.iter().cloned(), &mut inner_key);
                GroupTree { group, children }
            })
            .collect()
    }

    pub fn group(&self) -> &GroupedQueryResult {
        &self.group
    }

    pub fn children(&self) -> &[GroupedQueryResult] {
        &self.children
    }
}

impl TreeRowItem for GroupTree {
    fn tree_key(&self) -> Cow<'_, str> {
        self.group.tree_key()
    }

    fn frequency(&self) -> u64 {
        self.group.frequency
    }

    fn rows(&self) -> &[QueryResultRow] {
        &self.group.rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(doc: u8, tag: u8, start: u64, frequency: u64) -> QueryResultRow {
        QueryResultRow {
            document_id: DocumentId::from_bytes([doc; 16]),
            collection_id: None,
            tag_id: TagDefinitionId::from_bytes([tag; 16]),
            tag_name: format!("tag{tag}"),
            tag_path: format!("root/tag{tag}"),
            span: Some(Span::try_new(start, start + 4).expect("span")),
            frequency,
        }
    }

    #[test]
    fn frequency_sums_member_counts() {
        let mut group = GroupedQueryResult::new("Joy");
        group.set_rows(vec![row(1, 1, 0, 3), row(1, 1, 10, 2)]);
        assert_eq!(group.frequency(), 5);
        assert_eq!(group.rows().len(), 2);

        group.set_rows(Vec::new());
        assert_eq!(group.frequency(), 0);
        assert!(group.rows().is_empty());
    }

    #[test]
    fn caller_mutation_after_assignment_does_not_leak() {
        let mut source = vec![row(1, 1, 0, 4)];
        let mut group = GroupedQueryResult::new("Joy");
        group.set_rows(source.clone());
        source.push(row(1, 1, 8, 9));
        source[0].frequency = 100;
        assert_eq!(group.frequency(), 4);
        assert_eq!(group.rows()[0].frequency, 4);
    }

    #[test]
    fn tree_key_is_opaque_and_settable() {
        let mut group = GroupedQueryResult::new("first");
        group.set_tree_key("second");
        assert_eq!(group.tree_key(), "second");
    }

    #[test]
    fn grouping_keeps_discovery_order() {
        let rows = vec![row(2, 1, 0, 1), row(1, 1, 5, 1), row(2, 2, 9, 1), row(1, 3, 1, 1)];
        let groups = group_rows(rows, |r| r.document_id.to_hex());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].tree_key(), DocumentId::from_bytes([2; 16]).to_hex());
        assert_eq!(
            groups[0].rows().iter().map(|r| r.tag_name.as_str()).collect::<Vec<_>>(),
            vec!["tag1", "tag2"]
        );
        assert_eq!(groups[1].frequency(), 2);
    }

    #[test]
    fn tree_regroups_children() {
        let rows = vec![row(1, 1, 0, 1), row(2, 1, 4, 1), row(1, 1, 8, 1), row(1, 2, 0, 1)];
        let tree = GroupTree::build(rows, |r| r.tag_path.clone(), |r| r.document_id.to_hex());
        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0].tree_key(), "root/tag1");
        assert_eq!(tree[0].frequency(), 3);
        assert_eq!(tree[0].children().len(), 2);
        assert_eq!(tree[0].children()[0].frequency(), 2);
        assert_eq!(tree[1].rows().len(), 1);
    }

    #[test]
    fn leaf_rows_expose_themselves() {
        let leaf = row(1, 1, 3, 1);
        assert_eq!(leaf.rows().len(), 1);
        assert!(leaf.tree_key().ends_with("@3..7"));
        assert_eq!(TreeRowItem::frequency(&leaf), 1);
    }
}
