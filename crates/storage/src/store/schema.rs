#![forbid(unsafe_code)]

use super::{IndexError, now_ms};
use crate::config::GroupingKey;
use rusqlite::{Connection, OptionalExtension, params};

pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) fn install(conn: &Connection, grouping: GroupingKey) -> Result<(), IndexError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
          schema_version INTEGER NOT NULL,
          grouping TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tagsets (
          id BLOB PRIMARY KEY,
          name TEXT NOT NULL,
          version INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tag_definitions (
          id BLOB PRIMARY KEY,
          tagset_id BLOB NOT NULL,
          parent_id BLOB,
          name TEXT NOT NULL,
          color TEXT NOT NULL,
          FOREIGN KEY(tagset_id) REFERENCES tagsets(id) ON DELETE CASCADE,
          CHECK(parent_id IS NULL OR parent_id <> id)
        );

        CREATE INDEX IF NOT EXISTS idx_tag_definitions_tagset
          ON tag_definitions(tagset_id, id);
        CREATE INDEX IF NOT EXISTS idx_tag_definitions_parent
          ON tag_definitions(parent_id);

        CREATE TABLE IF NOT EXISTS property_definitions (
          id BLOB PRIMARY KEY,
          tag_id BLOB NOT NULL,
          name TEXT NOT NULL,
          possible_values_json TEXT NOT NULL,
          FOREIGN KEY(tag_id) REFERENCES tag_definitions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_property_definitions_tag
          ON property_definitions(tag_id, id);

        CREATE TABLE IF NOT EXISTS collections (
          id BLOB PRIMARY KEY,
          name TEXT NOT NULL,
          description TEXT NOT NULL,
          document_id BLOB NOT NULL,
          document_version TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS collection_tagsets (
          collection_id BLOB NOT NULL,
          tagset_id BLOB NOT NULL,
          tagset_version INTEGER NOT NULL,
          PRIMARY KEY(collection_id, tagset_id),
          FOREIGN KEY(collection_id) REFERENCES collections(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_collection_tagsets_tagset
          ON collection_tagsets(tagset_id, collection_id);

        CREATE TABLE IF NOT EXISTS tag_instances (
          id BLOB PRIMARY KEY,
          collection_id BLOB NOT NULL,
          tag_id BLOB NOT NULL,
          span_start INTEGER NOT NULL,
          span_end INTEGER NOT NULL,
          FOREIGN KEY(collection_id) REFERENCES collections(id) ON DELETE CASCADE,
          FOREIGN KEY(tag_id) REFERENCES tag_definitions(id) ON DELETE CASCADE,
          CHECK(span_end >= span_start)
        );

        CREATE INDEX IF NOT EXISTS idx_tag_instances_tag
          ON tag_instances(tag_id, collection_id);
        CREATE INDEX IF NOT EXISTS idx_tag_instances_collection
          ON tag_instances(collection_id);

        CREATE TABLE IF NOT EXISTS tag_instance_properties (
          instance_id BLOB NOT NULL,
          property_id BLOB NOT NULL,
          values_json TEXT NOT NULL,
          PRIMARY KEY(instance_id, property_id),
          FOREIGN KEY(instance_id) REFERENCES tag_instances(id) ON DELETE CASCADE,
          FOREIGN KEY(property_id) REFERENCES property_definitions(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS occurrence_vertices (
          tag_id BLOB NOT NULL,
          group_key BLOB NOT NULL,
          tagset_id BLOB NOT NULL,
          document_id BLOB NOT NULL,
          collection_id BLOB,
          tag_name TEXT NOT NULL,
          tag_color TEXT NOT NULL,
          tag_path TEXT NOT NULL,
          freq INTEGER,
          PRIMARY KEY(tag_id, group_key)
        );

        CREATE INDEX IF NOT EXISTS idx_occurrence_vertices_freq
          ON occurrence_vertices(freq DESC, tag_id, group_key);
        CREATE INDEX IF NOT EXISTS idx_occurrence_vertices_document
          ON occurrence_vertices(document_id);

        CREATE TABLE IF NOT EXISTS occurrence_rows (
          tag_id BLOB NOT NULL,
          group_key BLOB NOT NULL,
          instance_id BLOB NOT NULL,
          document_id BLOB NOT NULL,
          collection_id BLOB NOT NULL,
          span_start INTEGER NOT NULL,
          span_end INTEGER NOT NULL,
          PRIMARY KEY(tag_id, group_key, instance_id),
          FOREIGN KEY(tag_id, group_key)
            REFERENCES occurrence_vertices(tag_id, group_key)
            ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS occurrence_property_edges (
          tag_id BLOB NOT NULL,
          group_key BLOB NOT NULL,
          property_id BLOB NOT NULL,
          property_name TEXT NOT NULL,
          value_count INTEGER NOT NULL,
          PRIMARY KEY(tag_id, group_key, property_id),
          FOREIGN KEY(tag_id, group_key)
            REFERENCES occurrence_vertices(tag_id, group_key)
            ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_occurrence_property_edges_property
          ON occurrence_property_edges(property_id);

        CREATE TABLE IF NOT EXISTS document_vertices (
          document_id BLOB PRIMARY KEY,
          freq INTEGER NOT NULL
        );
        "#,
    )?;

    let stored = conn
        .query_row(
            "SELECT schema_version, grouping FROM meta WHERE singleton=1",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    let now_ms = now_ms();
    match stored {
        None => {
            conn.execute(
                "INSERT INTO meta(singleton, schema_version, grouping, created_at_ms, updated_at_ms) \
                 VALUES (1, ?1, ?2, ?3, ?3)",
                params![SCHEMA_VERSION, grouping.as_str(), now_ms],
            )?;
        }
        Some((version, _)) if version != SCHEMA_VERSION => {
            return Err(IndexError::SchemaMismatch {
                stored: version,
                expected: SCHEMA_VERSION,
            });
        }
        Some((_, stored_grouping)) if stored_grouping != grouping.as_str() => {
            return Err(IndexError::GroupingMismatch {
                stored: stored_grouping,
                configured: grouping.as_str().to_string(),
            });
        }
        Some(_) => {
            conn.execute(
                "UPDATE meta SET updated_at_ms=?1 WHERE singleton=1",
                params![now_ms],
            )?;
        }
    }

    Ok(())
}
