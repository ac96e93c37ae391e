#![forbid(unsafe_code)]

use super::{IndexError, OccurrenceIndex, get_id};
use ag_core::ids::{DocumentId, TagDefinitionId};
use rusqlite::Connection;
use serde::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct VertexRef {
    pub tag_id: TagDefinitionId,
    /// Hex form of the document or collection id the vertex groups by.
    pub group_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrequencyMismatch {
    pub vertex: VertexRef,
    pub stored: i64,
    pub counted: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DocumentMismatch {
    pub document_id: DocumentId,
    /// `None` when occurrences exist but the document vertex does not.
    pub stored: Option<i64>,
    pub computed: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub missing_frequency: Vec<VertexRef>,
    pub frequency_mismatches: Vec<FrequencyMismatch>,
    pub document_mismatches: Vec<DocumentMismatch>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing_frequency.is_empty()
            && self.frequency_mismatches.is_empty()
            && self.document_mismatches.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub tagsets: u64,
    pub collections: u64,
    pub tag_instances: u64,
    pub vertices: u64,
    pub rows: u64,
    pub property_edges: u64,
    pub document_vertices: u64,
}

impl OccurrenceIndex {
    /// Cross-checks stored frequencies against the rows and vertices they
    /// summarize.
    pub fn validate(&self) -> Result<ValidationReport, IndexError> {
        self.read_snapshot(|tx| {
            let mut report = ValidationReport::default();
            check_vertices(tx, &mut report)?;
            check_documents(tx, &mut report)?;
            Ok(report)
        })
    }

    pub fn stats(&self) -> Result<IndexStats, IndexError> {
        self.read_snapshot(|tx| {
            Ok(IndexStats {
                tagsets: count(tx, "tagsets")?,
                collections: count(tx, "collections")?,
                tag_instances: count(tx, "tag_instances")?,
                vertices: count(tx, "occurrence_vertices")?,
                rows: count(tx, "occurrence_rows")?,
                property_edges: count(tx, "occurrence_property_edges")?,
                document_vertices: count(tx, "document_vertices")?,
            })
        })
    }
}

fn check_vertices(conn: &Connection, report: &mut ValidationReport) -> Result<(), IndexError> {
    let mut stmt = conn.prepare(
        "SELECT v.tag_id, v.group_key, v.freq, \
           (SELECT COUNT(1) FROM occurrence_rows r WHERE r.tag_id = v.tag_id AND r.group_key = v.group_key) \
         FROM occurrence_vertices v ORDER BY v.tag_id, v.group_key",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let vertex = VertexRef {
            tag_id: get_id(row, 0)?,
            group_key: hex::encode(row.get::<_, Vec<u8>>(1)?),
        };
        let counted = row.get::<_, i64>(3)?;
        match row.get::<_, Option<i64>>(2)? {
            None => report.missing_frequency.push(vertex),
            Some(stored) if stored != counted => {
                report.frequency_mismatches.push(FrequencyMismatch {
                    vertex,
                    stored,
                    counted,
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn check_documents(conn: &Connection, report: &mut ValidationReport) -> Result<(), IndexError> {
    let mut stmt = conn.prepare(
        "SELECT d.document_id, d.freq, \
           COALESCE((SELECT SUM(v.freq) FROM occurrence_vertices v WHERE v.document_id = d.document_id), 0) \
         FROM document_vertices d \
         UNION ALL \
         SELECT v.document_id, NULL, COALESCE(SUM(v.freq), 0) \
         FROM occurrence_vertices v \
         WHERE NOT EXISTS (SELECT 1 FROM document_vertices d WHERE d.document_id = v.document_id) \
         GROUP BY v.document_id \
         ORDER BY 1",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let stored = row.get::<_, Option<i64>>(1)?;
        let computed = row.get::<_, i64>(2)?;
        if stored != Some(computed) {
            report.document_mismatches.push(DocumentMismatch {
                document_id: get_id(row, 0)?,
                stored,
                computed,
            });
        }
    }
    Ok(())
}

fn count(conn: &Connection, table: &'static str) -> Result<u64, IndexError> {
    let total = conn.query_row(&format!("SELECT COUNT(1) FROM {table}"), [], |row| {
        row.get::<_, i64>(0)
    })?;
    u64::try_from(total).map_err(|_| IndexError::CorruptRow("negative count"))
}
