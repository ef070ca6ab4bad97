// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The segment database (spec.md §4.4, §6 "Catalog schema"), grounded on
//! `original_source/bdd.py`'s `DBInterface`. Both the manager and the
//! replication agent open their own `Catalog` against the same sqlite file
//! (spec.md §5: "a single transactional connection per query ... writes are
//! serialized by the underlying DB").
//!
//! A poisoned mutex means another thread panicked while holding the
//! connection, which this crate treats as unrecoverable.
#![allow(clippy::expect_used)]

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{FraicapError, Result};
use crate::types::{CopyStatus, CopyWorklistEntry, Segment, SegmentStatus};

const TABLE: &str = "tramos";
const META_TABLE: &str = "fraicap_meta";

/// Handle to the segment database (table `tramos`, spec.md §6).
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open (creating if absent) the sqlite file at `path` and ensure the
    /// schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(FraicapError::from)?;
        let catalog = Self { conn: Mutex::new(conn) };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                num_folio   TEXT PRIMARY KEY,
                timestamp   INTEGER NOT NULL,
                estado      INTEGER NOT NULL,
                dir         TEXT NOT NULL,
                duracion    INTEGER NOT NULL,
                distancia   REAL NOT NULL,
                lon_ini     REAL NOT NULL,
                lat_ini     REAL NOT NULL,
                lon_fin     REAL NOT NULL,
                lat_fin     REAL NOT NULL,
                copiado     INTEGER
            );
            CREATE TABLE IF NOT EXISTS {META_TABLE} (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"
        ))
        .map_err(FraicapError::from)?;
        Ok(())
    }

    /// The system identifier used to build folios and directory layouts.
    /// Falls back to `None` (caller supplies a default and warns) if unset.
    pub fn get_system_id(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        conn.query_row(
            &format!("SELECT value FROM {META_TABLE} WHERE key = 'sys_id'"),
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(FraicapError::from)
    }

    pub fn set_system_id(&self, sys_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        conn.execute(
            &format!(
                "INSERT INTO {META_TABLE} (key, value) VALUES ('sys_id', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            params![sys_id],
        )
        .map_err(FraicapError::from)?;
        Ok(())
    }

    /// Upsert a finalized segment's row, keyed on folio (spec.md §8
    /// idempotence: "Finalizing the same segment twice writes the same row").
    pub fn save_capture(&self, timestamp: i64, segment: &Segment) -> Result<()> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        conn.execute(
            &format!(
                "INSERT INTO {TABLE}
                    (num_folio, timestamp, estado, dir, duracion, distancia,
                     lon_ini, lat_ini, lon_fin, lat_fin, copiado)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(num_folio) DO UPDATE SET
                    timestamp = excluded.timestamp,
                    estado = excluded.estado,
                    dir = excluded.dir,
                    duracion = excluded.duracion,
                    distancia = excluded.distancia,
                    lon_ini = excluded.lon_ini,
                    lat_ini = excluded.lat_ini,
                    lon_fin = excluded.lon_fin,
                    lat_fin = excluded.lat_fin"
            ),
            params![
                segment.folio,
                timestamp,
                segment.status.code(),
                segment.directory,
                segment.duration_s,
                segment.distance_m,
                segment.start.lon,
                segment.start.lat,
                segment.end.lon,
                segment.end.lat,
                segment.copy_status.map(|c| c.code()),
            ],
        )
        .map_err(FraicapError::from)?;
        Ok(())
    }

    /// Every segment whose status != CAPTURING and copy status isn't
    /// COPIED_OK (spec.md §3 "Copy worklist entry").
    pub fn get_copy_pending(&self) -> Result<Vec<CopyWorklistEntry>> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT dir, num_folio FROM {TABLE}
             WHERE estado != ?1 AND (copiado IS NULL OR copiado != ?2)"
        ))?;
        let rows = stmt
            .query_map(
                params![SegmentStatus::Capturing.code(), CopyStatus::CopiedOk.code()],
                |row| {
                    Ok(CopyWorklistEntry {
                        directory: row.get(0)?,
                        folio: row.get(1)?,
                    })
                },
            )
            .map_err(FraicapError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(FraicapError::from)?);
        }
        Ok(out)
    }

    /// Mark a folio as successfully replicated (spec.md §4.7 step 4 "On success").
    pub fn mark_copied(&self, folio: &str) -> Result<()> {
        let conn = self.conn.lock().expect("catalog connection poisoned");
        conn.execute(
            &format!("UPDATE {TABLE} SET copiado = ?1 WHERE num_folio = ?2"),
            params![CopyStatus::CopiedOk.code(), folio],
        )
        .map_err(FraicapError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::types::Coordinates;

    fn sample_segment(folio: &str) -> Segment {
        Segment {
            folio: folio.to_owned(),
            directory: format!("/data/001/2026.01.01/10.00.00/{folio}"),
            init_timestamp: 1000,
            duration_s: 30,
            distance_m: 120.5,
            start: Coordinates { lat: -37.0, lon: -73.0, ..Default::default() },
            end: Coordinates { lat: -37.01, lon: -73.01, ..Default::default() },
            status: SegmentStatus::CapOk,
            copy_status: None,
        }
    }

    #[test]
    fn save_then_finalize_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("cat.db")).unwrap();
        let seg = sample_segment("A001-260101100000");
        catalog.save_capture(1000, &seg).unwrap();
        catalog.save_capture(1000, &seg).unwrap();

        let pending = catalog.get_copy_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].folio, seg.folio);
    }

    #[test]
    fn capturing_segments_are_excluded_from_worklist() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("cat.db")).unwrap();
        let mut seg = sample_segment("A001-260101100001");
        seg.status = SegmentStatus::Capturing;
        catalog.save_capture(1000, &seg).unwrap();

        assert!(catalog.get_copy_pending().unwrap().is_empty());
    }

    #[test]
    fn mark_copied_removes_from_worklist() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("cat.db")).unwrap();
        let seg = sample_segment("A001-260101100002");
        catalog.save_capture(1000, &seg).unwrap();
        catalog.mark_copied(&seg.folio).unwrap();

        assert!(catalog.get_copy_pending().unwrap().is_empty());
    }

    #[test]
    fn system_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("cat.db")).unwrap();
        assert_eq!(catalog.get_system_id().unwrap(), None);
        catalog.set_system_id("042").unwrap();
        assert_eq!(catalog.get_system_id().unwrap(), Some("042".to_owned()));
    }
}
