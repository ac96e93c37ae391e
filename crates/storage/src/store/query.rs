#![forbid(unsafe_code)]

use super::{BlobId, IndexError, OccurrenceIndex, get_id, get_opt_id};
use ag_core::aggregate::{GroupTree, GroupedQueryResult, QueryResultRow, group_rows};
use ag_core::cancel::CancellationToken;
use ag_core::ids::{CollectionId, DocumentId, PropertyDefinitionId, TagDefinitionId, TagsetId};
use ag_core::model::Span;
use ag_core::predicate::{FrequencyPredicate, IndexConsistencyError};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, instrument};

/// How matched rows are bucketed into [`GroupedQueryResult`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    /// Tree key is the tag path.
    #[default]
    Tag,
    /// Tree key is the document id.
    Document,
    /// Tree key is `<tag path>@<document id>`.
    TagAndDocument,
    /// Tree key is the collection id, empty for rows without one.
    Collection,
}

impl GroupBy {
    fn key(self, row: &QueryResultRow) -> String {
        match self {
            Self::Tag => row.tag_path.clone(),
            Self::Document => row.document_id.to_hex(),
            Self::TagAndDocument => format!("{}@{}", row.tag_path, row.document_id),
            Self::Collection => row
                .collection_id
                .map(|id| id.to_hex())
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowMode {
    /// One row per tag instance, frequency 1.
    #[default]
    Occurrences,
    /// One row per matched vertex, carrying the vertex frequency.
    Vertices,
}

/// Compiled traversal over the occurrence graph.
///
/// Empty tag and document sets mean "no restriction".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccurrenceQuery {
    pub tagset: Option<TagsetId>,
    pub tags: BTreeSet<TagDefinitionId>,
    /// Also match every tag below the listed ones.
    pub include_descendants: bool,
    pub documents: BTreeSet<DocumentId>,
    /// Vertex must carry a property edge for this definition.
    pub property: Option<PropertyDefinitionId>,
    pub predicate: Option<FrequencyPredicate>,
    pub group_by: GroupBy,
    pub row_mode: RowMode,
}

impl OccurrenceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_tagset(mut self, tagset: TagsetId) -> Self {
        self.tagset = Some(tagset);
        self
    }

    pub fn with_tag(mut self, tag: TagDefinitionId) -> Self {
        self.tags.insert(tag);
        self
    }

    pub fn with_descendants(mut self) -> Self {
        self.include_descendants = true;
        self
    }

    pub fn in_document(mut self, document: DocumentId) -> Self {
        self.documents.insert(document);
        self
    }

    pub fn with_property(mut self, property: PropertyDefinitionId) -> Self {
        self.property = Some(property);
        self
    }

    pub fn with_predicate(mut self, predicate: FrequencyPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn group_by(mut self, group_by: GroupBy) -> Self {
        self.group_by = group_by;
        self
    }

    pub fn rows(mut self, row_mode: RowMode) -> Self {
        self.row_mode = row_mode;
        self
    }
}

/// Finite, single-pass sequence of grouped results. Re-issue the query to
/// read them again.
#[derive(Debug)]
pub struct QueryResults {
    groups: std::vec::IntoIter<GroupedQueryResult>,
}

impl QueryResults {
    fn new(groups: Vec<GroupedQueryResult>) -> Self {
        Self {
            groups: groups.into_iter(),
        }
    }
}

impl Iterator for QueryResults {
    type Item = GroupedQueryResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.groups.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.groups.size_hint()
    }
}

impl ExactSizeIterator for QueryResults {}

impl OccurrenceIndex {
    /// Evaluates `query` against one committed snapshot of the index.
    ///
    /// Vertices are visited by frequency descending, then tag id and group key
    /// ascending; `token` is checked before each visit.
    #[instrument(skip_all, fields(group_by = ?query.group_by))]
    pub fn query(
        &self,
        query: &OccurrenceQuery,
        token: &CancellationToken,
    ) -> Result<QueryResults, IndexError> {
        let rows = self.read_snapshot(|tx| {
            let mut seen = HashSet::new();
            collect_rows(tx, query, token, &mut seen)
        })?;
        let groups = group_rows(rows, |row| query.group_by.key(row));
        debug!(groups = groups.len(), "query evaluated");
        Ok(QueryResults::new(groups))
    }

    /// Runs `query` and groups the rows two levels deep.
    #[instrument(skip_all, fields(outer = ?outer, inner = ?inner))]
    pub fn query_tree(
        &self,
        query: &OccurrenceQuery,
        outer: GroupBy,
        inner: GroupBy,
        token: &CancellationToken,
    ) -> Result<Vec<GroupTree>, IndexError> {
        let rows = self.read_snapshot(|tx| {
            let mut seen = HashSet::new();
            collect_rows(tx, query, token, &mut seen)
        })?;
        Ok(GroupTree::build(
            rows,
            |row| outer.key(row),
            |row| inner.key(row),
        ))
    }

    /// Union of several queries over one snapshot, e.g. disjunctive frequency
    /// ranges. A vertex matched by an earlier query is not repeated; grouping
    /// follows the first query.
    #[instrument(skip_all, fields(queries = queries.len()))]
    pub fn query_union(
        &self,
        queries: &[OccurrenceQuery],
        token: &CancellationToken,
    ) -> Result<QueryResults, IndexError> {
        let Some(first) = queries.first() else {
            return Ok(QueryResults::new(Vec::new()));
        };
        let rows = self.read_snapshot(|tx| {
            let mut seen = HashSet::new();
            let mut rows = Vec::new();
            for query in queries {
                rows.extend(collect_rows(tx, query, token, &mut seen)?);
            }
            Ok(rows)
        })?;
        let groups = group_rows(rows, |row| first.group_by.key(row));
        debug!(groups = groups.len(), "union evaluated");
        Ok(QueryResults::new(groups))
    }
}

struct Vertex {
    tag_id: TagDefinitionId,
    group_key: Vec<u8>,
    document_id: DocumentId,
    collection_id: Option<CollectionId>,
    tag_name: String,
    tag_path: String,
    freq: Option<i64>,
}

impl Vertex {
    fn label(&self) -> String {
        format!("{}/{}", self.tag_id, hex::encode(&self.group_key))
    }
}

/// Polled before every vertex visit.
trait Interrupt {
    fn interrupted(&self) -> bool;
}

impl Interrupt for CancellationToken {
    fn interrupted(&self) -> bool {
        self.is_cancelled()
    }
}

fn collect_rows<I: Interrupt>(
    conn: &Connection,
    query: &OccurrenceQuery,
    token: &I,
    seen: &mut HashSet<(TagDefinitionId, Vec<u8>)>,
) -> Result<Vec<QueryResultRow>, IndexError> {
    let tags = resolve_tags(conn, query)?;
    let mut out = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT tag_id, group_key, document_id, collection_id, tag_name, tag_path, freq \
         FROM occurrence_vertices \
         WHERE (?1 IS NULL OR tagset_id = ?1) \
         ORDER BY freq DESC, tag_id ASC, group_key ASC",
    )?;
    let mut rows = stmt.query(params![query.tagset.as_ref().map(|id| id.blob())])?;
    while let Some(row) = rows.next()? {
        if token.interrupted() {
            return Err(IndexError::Cancelled);
        }
        let vertex = Vertex {
            tag_id: get_id(row, 0)?,
            group_key: row.get(1)?,
            document_id: get_id(row, 2)?,
            collection_id: get_opt_id(row, 3)?,
            tag_name: row.get(4)?,
            tag_path: row.get(5)?,
            freq: row.get(6)?,
        };

        if tags.as_ref().is_some_and(|tags| !tags.contains(&vertex.tag_id)) {
            continue;
        }
        if !query.documents.is_empty() && !query.documents.contains(&vertex.document_id) {
            continue;
        }
        if let Some(property) = query.property {
            if !has_property_edge(conn, &vertex, property)? {
                continue;
            }
        }
        if let Some(predicate) = query.predicate {
            let matched = predicate
                .evaluate(vertex.freq)
                .map_err(|source| IndexError::IndexConsistency {
                    vertex: vertex.label(),
                    source,
                })?;
            if !matched {
                continue;
            }
        }
        if !seen.insert((vertex.tag_id, vertex.group_key.clone())) {
            continue;
        }

        match query.row_mode {
            RowMode::Vertices => out.push(vertex_row(&vertex)?),
            RowMode::Occurrences => occurrence_rows(conn, &vertex, &mut out)?,
        }
    }

    Ok(out)
}

fn resolve_tags(
    conn: &Connection,
    query: &OccurrenceQuery,
) -> Result<Option<BTreeSet<TagDefinitionId>>, IndexError> {
    if query.tags.is_empty() {
        return Ok(None);
    }
    if !query.include_descendants {
        return Ok(Some(query.tags.clone()));
    }

    let mut stmt = conn.prepare(
        "WITH RECURSIVE subtree(id) AS ( \
           SELECT ?1 \
           UNION \
           SELECT t.id FROM tag_definitions t JOIN subtree s ON t.parent_id = s.id \
         ) \
         SELECT id FROM subtree",
    )?;
    let mut out = BTreeSet::new();
    for root in &query.tags {
        let mut rows = stmt.query(params![root.blob()])?;
        while let Some(row) = rows.next()? {
            out.insert(get_id(row, 0)?);
        }
    }
    Ok(Some(out))
}

fn has_property_edge(
    conn: &Connection,
    vertex: &Vertex,
    property: PropertyDefinitionId,
) -> Result<bool, IndexError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM occurrence_property_edges WHERE tag_id=?1 AND group_key=?2 AND property_id=?3",
            params![vertex.tag_id.blob(), vertex.group_key, property.blob()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn vertex_row(vertex: &Vertex) -> Result<QueryResultRow, IndexError> {
    let frequency = match vertex.freq {
        None => Err(IndexConsistencyError::MissingFrequency),
        Some(freq) => u64::try_from(freq).map_err(|_| IndexConsistencyError::NegativeFrequency(freq)),
    }
    .map_err(|source| IndexError::IndexConsistency {
        vertex: vertex.label(),
        source,
    })?;

    Ok(QueryResultRow {
        document_id: vertex.document_id,
        collection_id: vertex.collection_id,
        tag_id: vertex.tag_id,
        tag_name: vertex.tag_name.clone(),
        tag_path: vertex.tag_path.clone(),
        span: None,
        frequency,
    })
}

fn occurrence_rows(
    conn: &Connection,
    vertex: &Vertex,
    out: &mut Vec<QueryResultRow>,
) -> Result<(), IndexError> {
    let mut stmt = conn.prepare_cached(
        "SELECT collection_id, span_start, span_end FROM occurrence_rows \
         WHERE tag_id=?1 AND group_key=?2 \
         ORDER BY span_start ASC, span_end ASC, instance_id ASC",
    )?;
    let mut rows = stmt.query(params![vertex.tag_id.blob(), vertex.group_key])?;
    while let Some(row) = rows.next()? {
        let start = u64::try_from(row.get::<_, i64>(1)?)
            .map_err(|_| IndexError::CorruptRow("negative span start"))?;
        let end = u64::try_from(row.get::<_, i64>(2)?)
            .map_err(|_| IndexError::CorruptRow("negative span end"))?;
        let span =
            Span::try_new(start, end).map_err(|_| IndexError::CorruptRow("inverted span"))?;
        out.push(QueryResultRow {
            document_id: vertex.document_id,
            collection_id: Some(get_id(row, 0)?),
            tag_id: vertex.tag_id,
            tag_name: vertex.tag_name.clone(),
            tag_path: vertex.tag_path.clone(),
            span: Some(span),
            frequency: 1,
        });
    }
    Ok(())
}
