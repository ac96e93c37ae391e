#![forbid(unsafe_code)]
#![allow(dead_code)]

use ag_core::UpdateLog;
use ag_core::ids::{
    CollectionId, DocumentId, PropertyDefinitionId, TagDefinitionId, TagInstanceId, TagsetId,
};
use ag_core::model::{PropertyDefinition, Span, TagDefinition, TagInstance, TagsetDefinition};
use ag_storage::{CreateCollectionRequest, IndexConfig, OccurrenceIndex};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub const NARRATOLOGY: TagsetId = TagsetId::from_bytes([0x01; 16]);
pub const EMOTIONS: TagsetId = TagsetId::from_bytes([0x02; 16]);

pub const ANALEPSIS: TagDefinitionId = TagDefinitionId::from_bytes([0x10; 16]);
pub const PROLEPSIS: TagDefinitionId = TagDefinitionId::from_bytes([0x11; 16]);
pub const INTERNAL_PROLEPSIS: TagDefinitionId = TagDefinitionId::from_bytes([0x12; 16]);
pub const JOY: TagDefinitionId = TagDefinitionId::from_bytes([0x20; 16]);

pub const REACH: PropertyDefinitionId = PropertyDefinitionId::from_bytes([0x30; 16]);
pub const INTENSITY: PropertyDefinitionId = PropertyDefinitionId::from_bytes([0x31; 16]);

pub const NOVEL: DocumentId = DocumentId::from_bytes([0x40; 16]);
pub const STORY: DocumentId = DocumentId::from_bytes([0x41; 16]);

pub const FIRST_READING: CollectionId = CollectionId::from_bytes([0x50; 16]);
pub const SECOND_READING: CollectionId = CollectionId::from_bytes([0x51; 16]);
pub const STORY_READING: CollectionId = CollectionId::from_bytes([0x52; 16]);

pub fn temp_storage_dir(label: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be monotonic enough for tests")
        .as_nanos();
    path.push(format!(
        "annograph-{label}-{}-{nanos}",
        std::process::id()
    ));
    std::fs::create_dir_all(&path).expect("temp storage dir must be creatable");
    path
}

pub fn open_index(label: &str) -> OccurrenceIndex {
    open_index_with(label, |_| {})
}

pub fn open_index_with(label: &str, tweak: impl FnOnce(&mut IndexConfig)) -> OccurrenceIndex {
    let mut config = IndexConfig::new(temp_storage_dir(label));
    tweak(&mut config);
    OccurrenceIndex::open(config).expect("fresh index should open")
}

pub fn tag(tagset: TagsetId, id: TagDefinitionId, name: &str) -> TagDefinition {
    TagDefinition::try_new(id, tagset, name, "#6699cc").expect("valid tag")
}

pub fn with_property(
    mut tag: TagDefinition,
    id: PropertyDefinitionId,
    name: &str,
    values: &[&str],
) -> TagDefinition {
    let property = PropertyDefinition::try_new(
        id,
        tag.id,
        name,
        values.iter().map(|v| v.to_string()).collect(),
    )
    .expect("valid property");
    tag.add_property(property).expect("property belongs to tag");
    tag
}

pub fn tagset(id: TagsetId, name: &str, version: u64, tags: Vec<TagDefinition>) -> TagsetDefinition {
    let mut tagset = TagsetDefinition::try_new(id, name, version).expect("valid tagset");
    for tag in tags {
        tagset.add_tag(tag).expect("tag belongs to tagset");
    }
    tagset
}

/// Analepsis, Prolepsis (with `reach`) and Internal prolepsis below Prolepsis.
pub fn narratology(version: u64) -> TagsetDefinition {
    tagset(
        NARRATOLOGY,
        "Narratology",
        version,
        vec![
            tag(NARRATOLOGY, ANALEPSIS, "Analepsis"),
            with_property(
                tag(NARRATOLOGY, PROLEPSIS, "Prolepsis"),
                REACH,
                "reach",
                &["short", "long"],
            ),
            tag(NARRATOLOGY, INTERNAL_PROLEPSIS, "Internal").with_parent(PROLEPSIS),
        ],
    )
}

pub fn emotions(version: u64) -> TagsetDefinition {
    tagset(
        EMOTIONS,
        "Emotions",
        version,
        vec![with_property(tag(EMOTIONS, JOY, "Joy"), INTENSITY, "intensity", &[])],
    )
}

pub fn create_collection(
    index: &OccurrenceIndex,
    id: CollectionId,
    document: DocumentId,
    tagsets: &[TagsetId],
) {
    index
        .create_collection(
            CreateCollectionRequest::new(format!("reading {id}"), document).with_id(id),
        )
        .expect("collection should be created");
    for tagset in tagsets {
        index
            .add_tagset(id, *tagset, 1)
            .expect("tagset should be added");
    }
}

pub fn instance_id(tag: TagDefinitionId, collection: CollectionId, seq: u16) -> TagInstanceId {
    let mut bytes = [0u8; 16];
    bytes[0] = tag.as_bytes()[0];
    bytes[1] = collection.as_bytes()[0];
    bytes[2..4].copy_from_slice(&seq.to_be_bytes());
    TagInstanceId::from_bytes(bytes)
}

/// Adds `count` instances of `tag` to `collection` at consecutive spans and
/// returns the merged log.
pub fn annotate(
    index: &OccurrenceIndex,
    collection: CollectionId,
    tag: TagDefinitionId,
    count: u16,
    properties: &[(PropertyDefinitionId, &str)],
) -> UpdateLog {
    let mut log = UpdateLog::new();
    for seq in 0..count {
        let start = u64::from(seq) * 10;
        let instance = TagInstance {
            id: instance_id(tag, collection, seq),
            tag_id: tag,
            span: Span::try_new(start, start + 5).expect("valid span"),
            properties: properties
                .iter()
                .map(|(id, value)| (*id, vec![value.to_string()]))
                .collect::<BTreeMap<_, _>>(),
        };
        log.merge(
            index
                .add_tag_instance(collection, &instance)
                .expect("instance should be added"),
        );
    }
    log
}

/// Narratology indexed over the novel: Analepsis 12x in the first reading,
/// Prolepsis 2x in each reading (4 in total).
pub fn seeded_narratology(label: &str) -> OccurrenceIndex {
    let index = open_index(label);
    let mut log = index
        .upsert_tagset(&narratology(1))
        .expect("tagset should be stored");
    create_collection(&index, FIRST_READING, NOVEL, &[NARRATOLOGY]);
    create_collection(&index, SECOND_READING, NOVEL, &[NARRATOLOGY]);
    log.merge(annotate(&index, FIRST_READING, ANALEPSIS, 12, &[]));
    log.merge(annotate(
        &index,
        FIRST_READING,
        PROLEPSIS,
        2,
        &[(REACH, "short")],
    ));
    log.merge(annotate(&index, SECOND_READING, PROLEPSIS, 2, &[]));
    let report = index
        .reconcile(NARRATOLOGY, &log)
        .expect("initial reconcile should succeed");
    assert!(report.is_clean(), "seed produced warnings: {:?}", report.warnings);
    index
}

/// `(tag, group key, freq)` triples plus document vertices, in key order.
pub fn dump_index(index: &OccurrenceIndex) -> (Vec<(Vec<u8>, Vec<u8>, Option<i64>)>, Vec<(Vec<u8>, i64)>) {
    let conn = rusqlite::Connection::open(index.db_path()).expect("db opens");
    let mut stmt = conn
        .prepare("SELECT tag_id, group_key, freq FROM occurrence_vertices ORDER BY tag_id, group_key")
        .expect("prepare");
    let vertices = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    let mut stmt = conn
        .prepare("SELECT document_id, freq FROM document_vertices ORDER BY document_id")
        .expect("prepare");
    let documents = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows");
    (vertices, documents)
}

pub fn vertex_freq(index: &OccurrenceIndex, tag: TagDefinitionId) -> Vec<Option<i64>> {
    let conn = rusqlite::Connection::open(index.db_path()).expect("db opens");
    let mut stmt = conn
        .prepare("SELECT freq FROM occurrence_vertices WHERE tag_id=?1 ORDER BY group_key")
        .expect("prepare");
    stmt.query_map([&tag.as_bytes()[..]], |row| row.get(0))
        .expect("query")
        .collect::<Result<Vec<_>, _>>()
        .expect("rows")
}
