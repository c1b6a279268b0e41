//! Artifact storage (spec.md §3/§4.E): blobs are written with rusqlite's
//! incremental-blob API, keyed by the row created from the upload
//! stream's JSON header.

use crate::error::{classify, TaskDbError, TaskDbResult};
use rusqlite::{blob::Blob, params, Connection, DatabaseName};
use sai_lib::model::ArtifactRow;

/// Header that precedes the binary blob on the secondary upload stream
/// (spec.md §4.E). Creates the row (zero-filled blob of `len` bytes),
/// returning its rowid so the caller can stream bytes into it via
/// [`open_blob_for_write`].
pub fn create_artifact_row(conn: &Connection, header: &ArtifactRow) -> TaskDbResult<i64> {
    conn.execute(
        "INSERT INTO artifacts (task_uuid, blob_filename, artifact_up_nonce, artifact_down_nonce,
            timestamp, len, blob)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ZEROBLOB(?6))",
        params![
            header.task_uuid,
            header.blob_filename,
            header.artifact_up_nonce,
            header.artifact_down_nonce,
            header.timestamp,
            header.len,
        ],
    )
    .map_err(classify)?;
    Ok(conn.last_insert_rowid())
}

pub fn open_blob_for_write<'a>(conn: &'a Connection, rowid: i64) -> TaskDbResult<Blob<'a>> {
    conn.blob_open(DatabaseName::Main, "artifacts", "blob", rowid, false)
        .map_err(classify)
}

pub fn open_blob_for_read<'a>(conn: &'a Connection, rowid: i64) -> TaskDbResult<Blob<'a>> {
    conn.blob_open(DatabaseName::Main, "artifacts", "blob", rowid, true)
        .map_err(classify)
}

pub fn find_by_down_nonce(
    conn: &Connection,
    task_uuid: &str,
    down_nonce: &str,
    filename: &str,
) -> TaskDbResult<(i64, ArtifactRow)> {
    let mut stmt = conn.prepare(
        "SELECT rowid, task_uuid, blob_filename, artifact_up_nonce, artifact_down_nonce, timestamp, len
         FROM artifacts
         WHERE task_uuid = ?1 AND artifact_down_nonce = ?2 AND blob_filename = ?3",
    )?;
    let mut rows = stmt.query(params![task_uuid, down_nonce, filename])?;
    if let Some(row) = rows.next()? {
        let rowid: i64 = row.get(0)?;
        let artifact = ArtifactRow {
            task_uuid: row.get(1)?,
            blob_filename: row.get(2)?,
            artifact_up_nonce: row.get(3)?,
            artifact_down_nonce: row.get(4)?,
            timestamp: row.get(5)?,
            len: row.get(6)?,
        };
        Ok((rowid, artifact))
    } else {
        Err(TaskDbError::NoSuchArtifact(filename.to_string()))
    }
}

pub fn clear_artifacts_for_task(conn: &Connection, task_uuid: &str) -> TaskDbResult<()> {
    conn.execute("DELETE FROM artifacts WHERE task_uuid = ?1", params![task_uuid])
        .map_err(classify)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(crate::schema::PER_EVENT_SCHEMA).unwrap();
        conn
    }

    #[test]
    fn write_then_read_blob_roundtrips() {
        let conn = fresh_conn();
        let task_uuid = "a".repeat(64);
        let payload = b"some artifact bytes";
        let header = ArtifactRow {
            task_uuid: task_uuid.clone(),
            blob_filename: "out.tar.gz".into(),
            artifact_up_nonce: "up".into(),
            artifact_down_nonce: "down".into(),
            timestamp: 123,
            len: payload.len() as i64,
        };
        let rowid = create_artifact_row(&conn, &header).unwrap();
        {
            let mut blob = open_blob_for_write(&conn, rowid).unwrap();
            blob.write_all(payload).unwrap();
        }

        let (found_rowid, found) = find_by_down_nonce(&conn, &task_uuid, "down", "out.tar.gz").unwrap();
        assert_eq!(found_rowid, rowid);
        assert_eq!(found.len, payload.len() as i64);

        let mut blob = open_blob_for_read(&conn, found_rowid).unwrap();
        let mut buf = Vec::new();
        blob.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn missing_artifact_is_domain_error() {
        let conn = fresh_conn();
        let err = find_by_down_nonce(&conn, &"a".repeat(64), "nope", "x").unwrap_err();
        assert!(matches!(err, TaskDbError::NoSuchArtifact(_)));
    }
}
