#![forbid(unsafe_code)]

//! Incremental maintenance of the occurrence graph from Update Logs.
//!
//! A log is applied in four steps inside one write transaction: deleted
//! properties, deleted tags, updated properties, updated tags. Each step walks
//! its identifiers in ascending byte order. Deletions are idempotent and every
//! frequency is recomputed from the catalog, never adjusted by a delta, so a
//! log can be re-applied after a failure without double counting.

use super::catalog::load_tagset;
use super::{BlobId, IndexError, OccurrenceIndex, TagsetLogs, get_id, to_sqlite_i64};
use crate::config::GroupingKey;
use crate::locks::TagsetLockGuard;
use ag_core::UpdateLog;
use ag_core::ids::{CollectionId, DocumentId, PropertyDefinitionId, TagDefinitionId, TagInstanceId, TagsetId};
use ag_core::model::{TagDefinition, TagsetDefinition};
use ag_core::tagset_diff::full_reindex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    TagDefinition,
    PropertyDefinition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InconsistencyReason {
    /// The definition is absent from the catalog.
    NotFound,
    /// The definition exists but belongs to another tagset.
    ForeignTagset,
}

/// Soft failure: one log entry could not be resolved and was skipped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LogInconsistency {
    pub kind: DefinitionKind,
    /// Hex form of the offending identifier.
    pub id: String,
    pub reason: InconsistencyReason,
}

impl LogInconsistency {
    fn tag(id: TagDefinitionId, reason: InconsistencyReason) -> Self {
        Self {
            kind: DefinitionKind::TagDefinition,
            id: id.to_hex(),
            reason,
        }
    }

    fn property(id: PropertyDefinitionId, reason: InconsistencyReason) -> Self {
        Self {
            kind: DefinitionKind::PropertyDefinition,
            id: id.to_hex(),
            reason,
        }
    }
}

impl fmt::Display for LogInconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            DefinitionKind::TagDefinition => "tag definition",
            DefinitionKind::PropertyDefinition => "property definition",
        };
        let reason = match self.reason {
            InconsistencyReason::NotFound => "not found",
            InconsistencyReason::ForeignTagset => "belongs to another tagset",
        };
        write!(f, "{kind} {} {reason}", self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub property_edges_removed: u64,
    pub vertices_removed: u64,
    pub property_edges_refreshed: u64,
    pub vertices_rebuilt: u64,
    pub document_vertices_recomputed: u64,
    /// Updates dropped because the same id was also deleted.
    pub suppressed_updates: u64,
    pub warnings: Vec<LogInconsistency>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl OccurrenceIndex {
    /// Applies `log` for `tagset`, waiting for the tagset's write lock.
    #[instrument(skip(self, log), fields(tagset = %tagset))]
    pub fn reconcile(&self, tagset: TagsetId, log: &UpdateLog) -> Result<ReconcileReport, IndexError> {
        let guard = self.lock_tagset(tagset)?;
        self.reconcile_locked(&guard, log)
    }

    /// Same as [`OccurrenceIndex::reconcile`] for a caller already holding the
    /// tagset's lock.
    pub fn reconcile_locked(
        &self,
        guard: &TagsetLockGuard<'_>,
        log: &UpdateLog,
    ) -> Result<ReconcileReport, IndexError> {
        if !guard.issued_by(&self.locks) {
            return Err(IndexError::InvalidInput("lock guard belongs to another index"));
        }
        let tagset = guard.tagset();
        let grouping = self.config.grouping;
        let report = self.write(|tx| apply_log(tx, tagset, grouping, log))?;
        emit_report(tagset, &report);
        Ok(report)
    }

    /// Applies per-tagset logs in ascending tagset order.
    pub fn reconcile_all(
        &self,
        logs: &TagsetLogs,
    ) -> Result<BTreeMap<TagsetId, ReconcileReport>, IndexError> {
        let mut out = BTreeMap::new();
        for (tagset, log) in logs {
            out.insert(*tagset, self.reconcile(*tagset, log)?);
        }
        Ok(out)
    }

    /// Re-indexes every tag of the tagset from scratch and drops vertices of
    /// tags the catalog no longer knows.
    #[instrument(skip(self), fields(tagset = %tagset))]
    pub fn rebuild_tagset(&self, tagset: TagsetId) -> Result<ReconcileReport, IndexError> {
        let _guard = self.lock_tagset(tagset)?;
        let grouping = self.config.grouping;
        let report = self.write(|tx| {
            let definition = load_tagset(tx, tagset)?.ok_or(IndexError::UnknownTagset(tagset))?;
            let mut log = full_reindex(&definition);
            for stale in stale_vertex_tags(tx, &definition)? {
                log.add_deleted_tag_definition(stale);
            }
            apply_log(tx, tagset, grouping, &log)
        })?;
        info!(
            tagset = %tagset,
            vertices = report.vertices_rebuilt,
            "tagset rebuilt"
        );
        emit_report(tagset, &report);
        Ok(report)
    }
}

fn emit_report(tagset: TagsetId, report: &ReconcileReport) {
    for warning in &report.warnings {
        warn!(
            tagset = %tagset,
            kind = ?warning.kind,
            id = %warning.id,
            reason = ?warning.reason,
            "update log entry skipped: {warning}"
        );
    }
    debug!(
        tagset = %tagset,
        vertices_removed = report.vertices_removed,
        vertices_rebuilt = report.vertices_rebuilt,
        property_edges_removed = report.property_edges_removed,
        property_edges_refreshed = report.property_edges_refreshed,
        documents = report.document_vertices_recomputed,
        suppressed = report.suppressed_updates,
        "reconciliation committed"
    );
}

fn apply_log(
    conn: &Connection,
    tagset: TagsetId,
    grouping: GroupingKey,
    log: &UpdateLog,
) -> Result<ReconcileReport, IndexError> {
    let mut report = ReconcileReport {
        suppressed_updates: log.suppressed_updates() as u64,
        ..ReconcileReport::default()
    };

    // Updates to these are no-ops: their edges go away with the owner's vertices.
    let orphaned = orphaned_properties(conn, log.deleted_tag_definitions())?;

    for property_id in log.deleted_property_definitions() {
        let removed = conn.execute(
            "DELETE FROM occurrence_property_edges WHERE property_id=?1",
            params![property_id.blob()],
        )?;
        report.property_edges_removed += removed as u64;
    }
    debug!(
        count = log.deleted_property_definitions().len(),
        edges = report.property_edges_removed,
        "deleted property definitions applied"
    );

    let mut documents = BTreeSet::new();
    for tag_id in log.deleted_tag_definitions() {
        documents.extend(vertex_documents(conn, *tag_id)?);
        let (vertices, edges) = drop_tag_vertices(conn, *tag_id)?;
        report.vertices_removed += vertices;
        report.property_edges_removed += edges;
    }
    report.document_vertices_recomputed += recompute_documents(conn, &documents)?;
    debug!(
        count = log.deleted_tag_definitions().len(),
        vertices = report.vertices_removed,
        "deleted tag definitions applied"
    );

    for property_id in log.effective_updated_property_definitions() {
        if orphaned.contains(property_id) {
            continue;
        }
        let found = conn
            .query_row(
                "SELECT p.name, t.tagset_id FROM property_definitions p \
                 JOIN tag_definitions t ON t.id = p.tag_id WHERE p.id=?1",
                params![property_id.blob()],
                |row| Ok((row.get::<_, String>(0)?, get_id::<TagsetId>(row, 1)?)),
            )
            .optional()?;
        match found {
            None => report.warnings.push(LogInconsistency::property(
                *property_id,
                InconsistencyReason::NotFound,
            )),
            Some((_, owner)) if owner != tagset => report.warnings.push(
                LogInconsistency::property(*property_id, InconsistencyReason::ForeignTagset),
            ),
            Some((name, _)) => {
                let refreshed = conn.execute(
                    "UPDATE occurrence_property_edges SET property_name=?1 WHERE property_id=?2",
                    params![name, property_id.blob()],
                )?;
                report.property_edges_refreshed += refreshed as u64;
            }
        }
    }
    debug!(
        edges = report.property_edges_refreshed,
        "updated property definitions applied"
    );

    let mut updated = log.effective_updated_tag_definitions().peekable();
    if updated.peek().is_some() {
        let definition = load_tagset(conn, tagset)?;
        let mut documents = BTreeSet::new();
        for tag_id in updated {
            let resolved = definition
                .as_ref()
                .and_then(|d| d.tag(tag_id).map(|tag| (d, tag)));
            let Some((definition, tag)) = resolved else {
                let reason = if tag_exists(conn, *tag_id)? {
                    InconsistencyReason::ForeignTagset
                } else {
                    InconsistencyReason::NotFound
                };
                report.warnings.push(LogInconsistency::tag(*tag_id, reason));
                continue;
            };

            documents.extend(vertex_documents(conn, *tag_id)?);
            drop_tag_vertices(conn, *tag_id)?;
            let rebuilt = build_tag_vertices(
                conn,
                definition,
                tag,
                grouping,
                log.deleted_property_definitions(),
                &mut documents,
            )?;
            report.vertices_rebuilt += rebuilt;
        }
        report.document_vertices_recomputed += recompute_documents(conn, &documents)?;
    }
    debug!(
        vertices = report.vertices_rebuilt,
        warnings = report.warnings.len(),
        "updated tag definitions applied"
    );

    Ok(report)
}

fn orphaned_properties(
    conn: &Connection,
    deleted_tags: &BTreeSet<TagDefinitionId>,
) -> Result<BTreeSet<PropertyDefinitionId>, IndexError> {
    let mut out = BTreeSet::new();
    let mut from_edges =
        conn.prepare("SELECT DISTINCT property_id FROM occurrence_property_edges WHERE tag_id=?1")?;
    let mut from_catalog = conn.prepare("SELECT id FROM property_definitions WHERE tag_id=?1")?;
    for tag_id in deleted_tags {
        for stmt in [&mut from_edges, &mut from_catalog] {
            let mut rows = stmt.query(params![tag_id.blob()])?;
            while let Some(row) = rows.next()? {
                out.insert(get_id(row, 0)?);
            }
        }
    }
    Ok(out)
}

fn tag_exists(conn: &Connection, id: TagDefinitionId) -> Result<bool, IndexError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM tag_definitions WHERE id=?1",
            params![id.blob()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn vertex_documents(conn: &Connection, tag_id: TagDefinitionId) -> Result<Vec<DocumentId>, IndexError> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT document_id FROM occurrence_vertices WHERE tag_id=?1")?;
    let mut rows = stmt.query(params![tag_id.blob()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(get_id(row, 0)?);
    }
    Ok(out)
}

/// Removes every vertex of `tag_id` with its rows and edges. Returns the
/// number of vertices and property edges removed.
fn drop_tag_vertices(conn: &Connection, tag_id: TagDefinitionId) -> Result<(u64, u64), IndexError> {
    let edges = conn.execute(
        "DELETE FROM occurrence_property_edges WHERE tag_id=?1",
        params![tag_id.blob()],
    )?;
    conn.execute(
        "DELETE FROM occurrence_rows WHERE tag_id=?1",
        params![tag_id.blob()],
    )?;
    let vertices = conn.execute(
        "DELETE FROM occurrence_vertices WHERE tag_id=?1",
        params![tag_id.blob()],
    )?;
    Ok((vertices as u64, edges as u64))
}

struct Member {
    instance_id: TagInstanceId,
    collection_id: CollectionId,
    span_start: i64,
    span_end: i64,
}

struct Group {
    document_id: DocumentId,
    collection_id: Option<CollectionId>,
    members: Vec<Member>,
}

/// Regroups the live instances of `tag` and writes one vertex per group.
fn build_tag_vertices(
    conn: &Connection,
    tagset: &TagsetDefinition,
    tag: &TagDefinition,
    grouping: GroupingKey,
    deleted_properties: &BTreeSet<PropertyDefinitionId>,
    documents: &mut BTreeSet<DocumentId>,
) -> Result<u64, IndexError> {
    let mut groups: BTreeMap<[u8; 16], Group> = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT i.id, i.collection_id, c.document_id, i.span_start, i.span_end \
         FROM tag_instances i \
         JOIN collections c ON c.id = i.collection_id \
         JOIN collection_tagsets ct ON ct.collection_id = i.collection_id AND ct.tagset_id = ?2 \
         WHERE i.tag_id=?1 \
         ORDER BY i.id ASC",
    )?;
    let mut rows = stmt.query(params![tag.id.blob(), tagset.id.blob()])?;
    while let Some(row) = rows.next()? {
        let collection_id = get_id::<CollectionId>(row, 1)?;
        let document_id = get_id::<DocumentId>(row, 2)?;
        let (key, group_collection) = match grouping {
            GroupingKey::Document => (*document_id.as_bytes(), None),
            GroupingKey::Collection => (*collection_id.as_bytes(), Some(collection_id)),
        };
        groups
            .entry(key)
            .or_insert_with(|| Group {
                document_id,
                collection_id: group_collection,
                members: Vec::new(),
            })
            .members
            .push(Member {
                instance_id: get_id(row, 0)?,
                collection_id,
                span_start: row.get(3)?,
                span_end: row.get(4)?,
            });
    }

    let path = tagset.tag_path(&tag.id).unwrap_or_else(|| tag.name.clone());
    let mut property_stmt = conn.prepare(
        "SELECT property_id, values_json FROM tag_instance_properties WHERE instance_id=?1",
    )?;

    for (key, group) in &groups {
        let freq = to_sqlite_i64(group.members.len() as u64)?;
        conn.execute(
            "INSERT INTO occurrence_vertices(tag_id, group_key, tagset_id, document_id, collection_id, tag_name, tag_color, tag_path, freq) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                tag.id.blob(),
                &key[..],
                tagset.id.blob(),
                group.document_id.blob(),
                group.collection_id.as_ref().map(|id| id.blob()),
                tag.name,
                tag.color,
                path,
                freq,
            ],
        )?;

        let mut value_counts: BTreeMap<PropertyDefinitionId, u64> = BTreeMap::new();
        for member in &group.members {
            conn.execute(
                "INSERT INTO occurrence_rows(tag_id, group_key, instance_id, document_id, collection_id, span_start, span_end) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tag.id.blob(),
                    &key[..],
                    member.instance_id.blob(),
                    group.document_id.blob(),
                    member.collection_id.blob(),
                    member.span_start,
                    member.span_end,
                ],
            )?;

            let mut rows = property_stmt.query(params![member.instance_id.blob()])?;
            while let Some(row) = rows.next()? {
                let property_id = get_id::<PropertyDefinitionId>(row, 0)?;
                let values: Vec<String> = serde_json::from_str(&row.get::<_, String>(1)?)?;
                *value_counts.entry(property_id).or_default() += values.len() as u64;
            }
        }

        for (property_id, value_count) in value_counts {
            if deleted_properties.contains(&property_id) {
                continue;
            }
            let Some(property) = tag.properties.get(&property_id) else {
                continue;
            };
            conn.execute(
                "INSERT INTO occurrence_property_edges(tag_id, group_key, property_id, property_name, value_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tag.id.blob(),
                    &key[..],
                    property_id.blob(),
                    property.name,
                    to_sqlite_i64(value_count)?,
                ],
            )?;
        }

        documents.insert(group.document_id);
    }

    Ok(groups.len() as u64)
}

/// Recomputes each document vertex from its occurrence vertices; documents
/// left without occurrences lose their vertex.
fn recompute_documents(conn: &Connection, documents: &BTreeSet<DocumentId>) -> Result<u64, IndexError> {
    for document_id in documents {
        let (count, total) = conn.query_row(
            "SELECT COUNT(1), COALESCE(SUM(freq), 0) FROM occurrence_vertices WHERE document_id=?1",
            params![document_id.blob()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        if count == 0 {
            conn.execute(
                "DELETE FROM document_vertices WHERE document_id=?1",
                params![document_id.blob()],
            )?;
        } else {
            conn.execute(
                "INSERT INTO document_vertices(document_id, freq) VALUES (?1, ?2) \
                 ON CONFLICT(document_id) DO UPDATE SET freq=excluded.freq",
                params![document_id.blob(), total],
            )?;
        }
    }
    Ok(documents.len() as u64)
}

/// Tags with vertices under `tagset` that the catalog no longer lists.
fn stale_vertex_tags(
    conn: &Connection,
    tagset: &TagsetDefinition,
) -> Result<Vec<TagDefinitionId>, IndexError> {
    let mut stmt =
        conn.prepare("SELECT DISTINCT tag_id FROM occurrence_vertices WHERE tagset_id=?1")?;
    let mut rows = stmt.query(params![tagset.id.blob()])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let tag_id = get_id::<TagDefinitionId>(row, 0)?;
        if !tagset.tags.contains_key(&tag_id) {
            out.push(tag_id);
        }
    }
    Ok(out)
}
