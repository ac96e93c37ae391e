#![forbid(unsafe_code)]

//! Definition and collection tables. Every mutating call returns the Update
//! Log the index has to consume to catch up with the change.

use super::{
    BlobId, CollectionContents, CreateCollectionRequest, IndexError, OccurrenceIndex, TagsetLogs,
    from_sqlite_u64, get_id, get_opt_id, now_ms, to_sqlite_i64,
};
use ag_core::UpdateLog;
use ag_core::ids::{
    CollectionId, DocumentId, PropertyDefinitionId, TagDefinitionId, TagInstanceId, TagsetId,
};
use ag_core::model::{PropertyDefinition, Span, TagDefinition, TagInstance, TagsetDefinition};
use ag_core::tagset_diff::{diff_tagset_removal, diff_tagsets, full_reindex};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

impl OccurrenceIndex {
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub fn create_collection(
        &self,
        request: CreateCollectionRequest,
    ) -> Result<CollectionId, IndexError> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(IndexError::InvalidInput("collection name must not be empty"));
        }
        let id = request.id.unwrap_or_else(CollectionId::generate);

        self.write(|tx| {
            let insert = tx.execute(
                "INSERT INTO collections(id, name, description, document_id, document_version, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.blob(),
                    name,
                    request.description,
                    request.document_id.blob(),
                    request.document_version,
                    now_ms(),
                ],
            );
            match insert {
                Ok(_) => Ok(()),
                Err(err) if is_constraint_violation(&err) => {
                    Err(IndexError::CollectionAlreadyExists(id))
                }
                Err(err) => Err(err.into()),
            }
        })?;

        debug!(collection = %id, "collection created");
        Ok(id)
    }

    /// Drops the collection with its instances. The returned logs mark every
    /// tag that had instances in it, keyed by the tag's tagset.
    #[instrument(skip(self))]
    pub fn delete_collection(&self, id: CollectionId) -> Result<TagsetLogs, IndexError> {
        self.write(|tx| {
            ensure_collection_tx(tx, id)?;
            let touched = tags_with_instances(tx, id)?;
            tx.execute("DELETE FROM collections WHERE id=?1", params![id.blob()])?;

            let mut logs = TagsetLogs::new();
            for (tagset_id, tag_id) in touched {
                logs.entry(tagset_id)
                    .or_default()
                    .add_updated_tag_definition(tag_id);
            }
            Ok(logs)
        })
    }

    #[instrument(skip(self))]
    pub fn add_tagset(
        &self,
        collection: CollectionId,
        tagset: TagsetId,
        version: u64,
    ) -> Result<UpdateLog, IndexError> {
        let version = to_sqlite_i64(version)?;
        self.write(|tx| {
            ensure_collection_tx(tx, collection)?;
            if !tagset_exists(tx, tagset)? {
                return Err(IndexError::UnknownTagset(tagset));
            }
            tx.execute(
                "INSERT INTO collection_tagsets(collection_id, tagset_id, tagset_version) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(collection_id, tagset_id) DO UPDATE SET tagset_version=excluded.tagset_version",
                params![collection.blob(), tagset.blob(), version],
            )?;
            scoped_log(tx, collection, tagset)
        })
    }

    /// Instances stay in the collection but stop counting for the tagset.
    #[instrument(skip(self))]
    pub fn remove_tagset(
        &self,
        collection: CollectionId,
        tagset: TagsetId,
    ) -> Result<UpdateLog, IndexError> {
        self.write(|tx| {
            ensure_collection_tx(tx, collection)?;
            let removed = tx.execute(
                "DELETE FROM collection_tagsets WHERE collection_id=?1 AND tagset_id=?2",
                params![collection.blob(), tagset.blob()],
            )?;
            if removed == 0 {
                return Ok(UpdateLog::new());
            }
            scoped_log(tx, collection, tagset)
        })
    }

    #[instrument(skip(self, instance), fields(instance = %instance.id, tag = %instance.tag_id))]
    pub fn add_tag_instance(
        &self,
        collection: CollectionId,
        instance: &TagInstance,
    ) -> Result<UpdateLog, IndexError> {
        self.write(|tx| {
            ensure_collection_tx(tx, collection)?;
            let tagset_id = tx
                .query_row(
                    "SELECT tagset_id FROM tag_definitions WHERE id=?1",
                    params![instance.tag_id.blob()],
                    |row| get_id::<TagsetId>(row, 0),
                )
                .optional()?
                .ok_or(IndexError::UnknownTagDefinition(instance.tag_id))?;

            let included = tx
                .query_row(
                    "SELECT 1 FROM collection_tagsets WHERE collection_id=?1 AND tagset_id=?2",
                    params![collection.blob(), tagset_id.blob()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !included {
                return Err(IndexError::InvalidInput(
                    "tag's tagset is not included in the collection",
                ));
            }

            for property_id in instance.properties.keys() {
                let owner = tx
                    .query_row(
                        "SELECT tag_id FROM property_definitions WHERE id=?1",
                        params![property_id.blob()],
                        |row| get_id::<TagDefinitionId>(row, 0),
                    )
                    .optional()?;
                if owner != Some(instance.tag_id) {
                    return Err(IndexError::InvalidInput(
                        "property does not belong to the instance's tag",
                    ));
                }
            }

            let insert = tx.execute(
                "INSERT INTO tag_instances(id, collection_id, tag_id, span_start, span_end) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    instance.id.blob(),
                    collection.blob(),
                    instance.tag_id.blob(),
                    to_sqlite_i64(instance.span.start)?,
                    to_sqlite_i64(instance.span.end)?,
                ],
            );
            match insert {
                Ok(_) => {}
                Err(err) if is_constraint_violation(&err) => {
                    return Err(IndexError::InvalidInput("tag instance already exists"));
                }
                Err(err) => return Err(err.into()),
            }

            for (property_id, values) in &instance.properties {
                tx.execute(
                    "INSERT INTO tag_instance_properties(instance_id, property_id, values_json) \
                     VALUES (?1, ?2, ?3)",
                    params![
                        instance.id.blob(),
                        property_id.blob(),
                        serde_json::to_string(values)?,
                    ],
                )?;
            }

            let mut log = UpdateLog::new();
            log.add_updated_tag_definition(instance.tag_id);
            Ok(log)
        })
    }

    pub fn open_collection(&self, id: CollectionId) -> Result<CollectionContents, IndexError> {
        self.read_snapshot(|tx| {
            let header = tx
                .query_row(
                    "SELECT name, description, document_id, document_version FROM collections WHERE id=?1",
                    params![id.blob()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            get_id::<DocumentId>(row, 2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?
                .ok_or(IndexError::UnknownCollection(id))?;
            let (name, description, document_id, document_version) = header;

            let mut tagsets = BTreeMap::new();
            let mut stmt = tx.prepare(
                "SELECT tagset_id, tagset_version FROM collection_tagsets WHERE collection_id=?1",
            )?;
            let mut rows = stmt.query(params![id.blob()])?;
            while let Some(row) = rows.next()? {
                tagsets.insert(get_id::<TagsetId>(row, 0)?, from_sqlite_u64(row.get(1)?)?);
            }

            let mut instances = Vec::new();
            let mut stmt = tx.prepare(
                "SELECT id, tag_id, span_start, span_end FROM tag_instances \
                 WHERE collection_id=?1 ORDER BY span_start ASC, span_end ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![id.blob()])?;
            while let Some(row) = rows.next()? {
                let instance_id = get_id::<TagInstanceId>(row, 0)?;
                let span = Span::try_new(
                    from_sqlite_u64(row.get(2)?)?,
                    from_sqlite_u64(row.get(3)?)?,
                )
                .map_err(|_| IndexError::CorruptRow("tag instance span"))?;
                instances.push(TagInstance {
                    id: instance_id,
                    tag_id: get_id(row, 1)?,
                    span,
                    properties: instance_properties(tx, instance_id)?,
                });
            }

            Ok(CollectionContents {
                id,
                name,
                description,
                document_id,
                document_version,
                tagsets,
                instances,
            })
        })
    }

    /// Stores `tagset` and returns the log that moves the index from the
    /// previously stored state to the new one.
    #[instrument(skip(self, tagset), fields(tagset = %tagset.id, version = tagset.version))]
    pub fn upsert_tagset(&self, tagset: &TagsetDefinition) -> Result<UpdateLog, IndexError> {
        check_tagset_shape(tagset)?;
        let version = to_sqlite_i64(tagset.version)?;

        self.write(|tx| {
            let previous = load_tagset(tx, tagset.id)?;

            for tag_id in tagset.tags.keys() {
                let owner = tx
                    .query_row(
                        "SELECT tagset_id FROM tag_definitions WHERE id=?1",
                        params![tag_id.blob()],
                        |row| get_id::<TagsetId>(row, 0),
                    )
                    .optional()?;
                if owner.is_some_and(|owner| owner != tagset.id) {
                    return Err(IndexError::InvalidInput("tag belongs to another tagset"));
                }
            }

            tx.execute(
                "INSERT INTO tagsets(id, name, version) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(id) DO UPDATE SET name=excluded.name, version=excluded.version",
                params![tagset.id.blob(), tagset.name, version],
            )?;

            if let Some(previous) = &previous {
                for tag_id in previous.tags.keys() {
                    if !tagset.tags.contains_key(tag_id) {
                        tx.execute(
                            "DELETE FROM tag_definitions WHERE id=?1",
                            params![tag_id.blob()],
                        )?;
                    }
                }
            }

            for tag in tagset.tags.values() {
                write_tag(tx, tag, previous.as_ref().and_then(|p| p.tag(&tag.id)))?;
            }

            Ok(match &previous {
                Some(previous) => diff_tagsets(previous, tagset),
                None => full_reindex(tagset),
            })
        })
    }

    /// Removes the tagset, its tags, properties and instances.
    #[instrument(skip(self))]
    pub fn delete_tagset(&self, id: TagsetId) -> Result<UpdateLog, IndexError> {
        self.write(|tx| {
            let tagset = load_tagset(tx, id)?.ok_or(IndexError::UnknownTagset(id))?;
            tx.execute(
                "DELETE FROM collection_tagsets WHERE tagset_id=?1",
                params![id.blob()],
            )?;
            tx.execute("DELETE FROM tagsets WHERE id=?1", params![id.blob()])?;
            Ok(diff_tagset_removal(&tagset))
        })
    }

    pub fn tagset(&self, id: TagsetId) -> Result<Option<TagsetDefinition>, IndexError> {
        self.read_snapshot(|tx| load_tagset(tx, id))
    }
}

fn check_tagset_shape(tagset: &TagsetDefinition) -> Result<(), IndexError> {
    for (id, tag) in &tagset.tags {
        if tag.id != *id || tag.tagset_id != tagset.id {
            return Err(IndexError::InvalidInput("tag is keyed or owned inconsistently"));
        }
        if tag.parent_id == Some(tag.id) {
            return Err(IndexError::InvalidInput("tag must not be its own parent"));
        }
        for (property_id, property) in &tag.properties {
            if property.id != *property_id || property.tag_id != tag.id {
                return Err(IndexError::InvalidInput(
                    "property is keyed or owned inconsistently",
                ));
            }
        }
    }
    Ok(())
}

fn write_tag(
    conn: &Connection,
    tag: &TagDefinition,
    previous: Option<&TagDefinition>,
) -> Result<(), IndexError> {
    conn.execute(
        "INSERT INTO tag_definitions(id, tagset_id, parent_id, name, color) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(id) DO UPDATE SET parent_id=excluded.parent_id, name=excluded.name, color=excluded.color",
        params![
            tag.id.blob(),
            tag.tagset_id.blob(),
            tag.parent_id.as_ref().map(|id| id.blob()),
            tag.name,
            tag.color,
        ],
    )?;

    if let Some(previous) = previous {
        for property_id in previous.properties.keys() {
            if !tag.properties.contains_key(property_id) {
                conn.execute(
                    "DELETE FROM property_definitions WHERE id=?1",
                    params![property_id.blob()],
                )?;
            }
        }
    }

    for property in tag.properties.values() {
        conn.execute(
            "INSERT INTO property_definitions(id, tag_id, name, possible_values_json) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET tag_id=excluded.tag_id, name=excluded.name, \
             possible_values_json=excluded.possible_values_json",
            params![
                property.id.blob(),
                property.tag_id.blob(),
                property.name,
                serde_json::to_string(&property.possible_values)?,
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn load_tagset(
    conn: &Connection,
    id: TagsetId,
) -> Result<Option<TagsetDefinition>, IndexError> {
    let Some((name, version)) = conn
        .query_row(
            "SELECT name, version FROM tagsets WHERE id=?1",
            params![id.blob()],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?
    else {
        return Ok(None);
    };

    let mut tags = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT id, parent_id, name, color FROM tag_definitions WHERE tagset_id=?1 ORDER BY id",
    )?;
    let mut rows = stmt.query(params![id.blob()])?;
    while let Some(row) = rows.next()? {
        let tag_id = get_id::<TagDefinitionId>(row, 0)?;
        tags.insert(
            tag_id,
            TagDefinition {
                id: tag_id,
                tagset_id: id,
                parent_id: get_opt_id(row, 1)?,
                name: row.get(2)?,
                color: row.get(3)?,
                properties: BTreeMap::new(),
            },
        );
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.tag_id, p.name, p.possible_values_json FROM property_definitions p \
         JOIN tag_definitions t ON t.id = p.tag_id \
         WHERE t.tagset_id=?1 ORDER BY p.id",
    )?;
    let mut rows = stmt.query(params![id.blob()])?;
    while let Some(row) = rows.next()? {
        let property = PropertyDefinition {
            id: get_id(row, 0)?,
            tag_id: get_id(row, 1)?,
            name: row.get(2)?,
            possible_values: serde_json::from_str(&row.get::<_, String>(3)?)?,
        };
        if let Some(tag) = tags.get_mut(&property.tag_id) {
            tag.properties.insert(property.id, property);
        }
    }

    Ok(Some(TagsetDefinition {
        id,
        name,
        version: from_sqlite_u64(version)?,
        tags,
    }))
}

fn instance_properties(
    conn: &Connection,
    instance_id: TagInstanceId,
) -> Result<BTreeMap<PropertyDefinitionId, Vec<String>>, IndexError> {
    let mut out = BTreeMap::new();
    let mut stmt = conn.prepare(
        "SELECT property_id, values_json FROM tag_instance_properties WHERE instance_id=?1",
    )?;
    let mut rows = stmt.query(params![instance_id.blob()])?;
    while let Some(row) = rows.next()? {
        let values: Vec<String> = serde_json::from_str(&row.get::<_, String>(1)?)?;
        out.insert(get_id(row, 0)?, values);
    }
    Ok(out)
}

fn ensure_collection_tx(conn: &Connection, id: CollectionId) -> Result<(), IndexError> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM collections WHERE id=?1",
            params![id.blob()],
            |_| Ok(()),
        )
        .optional()?
        .is_some();
    if !exists {
        return Err(IndexError::UnknownCollection(id));
    }
    Ok(())
}

fn tagset_exists(conn: &Connection, id: TagsetId) -> Result<bool, IndexError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM tagsets WHERE id=?1",
            params![id.blob()],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// `(tagset, tag)` pairs with at least one instance in `collection`.
fn tags_with_instances(
    conn: &Connection,
    collection: CollectionId,
) -> Result<BTreeSet<(TagsetId, TagDefinitionId)>, IndexError> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT t.tagset_id, t.id FROM tag_instances i \
         JOIN tag_definitions t ON t.id = i.tag_id \
         WHERE i.collection_id=?1",
    )?;
    let mut rows = stmt.query(params![collection.blob()])?;
    let mut out = BTreeSet::new();
    while let Some(row) = rows.next()? {
        out.insert((get_id(row, 0)?, get_id(row, 1)?));
    }
    Ok(out)
}

/// Log that re-aggregates the tags of `tagset` used in `collection`.
fn scoped_log(
    conn: &Connection,
    collection: CollectionId,
    tagset: TagsetId,
) -> Result<UpdateLog, IndexError> {
    let mut log = UpdateLog::new();
    for (owner, tag_id) in tags_with_instances(conn, collection)? {
        if owner == tagset {
            log.add_updated_tag_definition(tag_id);
        }
    }
    Ok(log)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, message) => {
            code.code == ErrorCode::ConstraintViolation
                || message.as_deref().is_some_and(|value| {
                    value.contains("UNIQUE constraint failed")
                        || value.contains("PRIMARY KEY constraint failed")
                })
        }
        _ => false,
    }
}
