// src/db/models.rs

//! Data models for installed-package database entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading, updating, and deleting records.

use crate::error::{Error, Result};
use crate::package::{FileState, PackageHeader};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::str::FromStr;

/// Basenames per `IN (...)` query when looking up file owners
const BASENAME_CHUNK: usize = 500;

fn conversion_error(column: usize, message: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())),
    )
}

/// One installed package instance
#[derive(Debug, Clone)]
pub struct InstalledPackage {
    /// Database instance number, assigned on insert
    pub instance: Option<i64>,
    pub header: PackageHeader,
    /// One state per entry of `header.files`
    pub file_states: Vec<FileState>,
    /// Transaction that installed this instance
    pub install_tid: i64,
}

const PACKAGE_COLUMNS: &str = "instance, install_tid, header";

impl InstalledPackage {
    /// Create a record with every file in the Normal state
    pub fn new(header: PackageHeader, install_tid: i64) -> Self {
        let file_states = vec![FileState::Normal; header.files.len()];
        Self {
            instance: None,
            header,
            file_states,
            install_tid,
        }
    }

    /// Insert this record plus its file, provide, and trigger indices
    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        let header_json = serde_json::to_string(&self.header)?;
        let install_time = self.header.install_time.unwrap_or(self.install_tid);

        conn.execute(
            "INSERT INTO packages (name, epoch, version, release, arch, os, color, install_time, install_tid, header)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                &self.header.name,
                &self.header.epoch,
                &self.header.version,
                &self.header.release,
                &self.header.arch,
                &self.header.os,
                self.header.color() as i64,
                install_time,
                self.install_tid,
                header_json,
            ],
        )?;
        let instance = conn.last_insert_rowid();

        {
            let mut stmt = conn.prepare(
                "INSERT INTO files (instance, file_index, dirname, basename, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (index, file) in self.header.files.iter().enumerate() {
                let state = self.file_states.get(index).copied().unwrap_or_default();
                stmt.execute(params![
                    instance,
                    index as i64,
                    self.header.dirname(index),
                    &file.basename,
                    state.as_i64(),
                ])?;
            }
        }

        {
            let mut stmt =
                conn.prepare("INSERT INTO provides (instance, name, flags, version) VALUES (?1, ?2, ?3, ?4)")?;
            let self_provide = self.header.self_provide();
            for provide in std::iter::once(&self_provide).chain(self.header.provides.iter()) {
                stmt.execute(params![instance, &provide.name, provide.flags.0 as i64, &provide.version])?;
            }
        }

        {
            let mut stmt = conn.prepare("INSERT INTO trigger_names (instance, name) VALUES (?1, ?2)")?;
            for name in self.header.trigger_names() {
                stmt.execute(params![instance, name])?;
            }
        }

        self.instance = Some(instance);
        Ok(instance)
    }

    /// Find an installed instance
    pub fn find_by_instance(conn: &Connection, instance: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM packages WHERE instance = ?1",
            PACKAGE_COLUMNS
        ))?;
        let package = stmt.query_row([instance], Self::from_row).optional()?;

        match package {
            Some(mut package) => {
                package.load_file_states(conn)?;
                Ok(Some(package))
            }
            None => Ok(None),
        }
    }

    /// Find all installed instances of a name
    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        Self::query(
            conn,
            &format!(
                "SELECT {} FROM packages WHERE name = ?1 ORDER BY instance",
                PACKAGE_COLUMNS
            ),
            [name],
        )
    }

    /// Number of installed instances of a name
    pub fn count_by_name(conn: &Connection, name: &str) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM packages WHERE name = ?1", [name], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Installed packages that carry a trigger watching `name`
    pub fn find_triggered_by(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        Self::query(
            conn,
            &format!(
                "SELECT {} FROM packages WHERE instance IN
                    (SELECT instance FROM trigger_names WHERE name = ?1)
                 ORDER BY instance",
                PACKAGE_COLUMNS
            ),
            [name],
        )
    }

    /// Installed packages named `name` or providing it
    pub fn find_by_capability(conn: &Connection, name: &str) -> Result<Vec<Self>> {
        Self::query(
            conn,
            &format!(
                "SELECT {} FROM packages WHERE instance IN
                    (SELECT instance FROM provides WHERE name = ?1)
                 ORDER BY instance",
                PACKAGE_COLUMNS
            ),
            [name],
        )
    }

    /// List all installed packages
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        Self::query(
            conn,
            &format!("SELECT {} FROM packages ORDER BY name, instance", PACKAGE_COLUMNS),
            params![],
        )
    }

    /// Remove an instance (files, provides and trigger names cascade)
    pub fn delete(conn: &Connection, instance: i64) -> Result<()> {
        let removed = conn.execute("DELETE FROM packages WHERE instance = ?1", [instance])?;
        if removed == 0 {
            return Err(Error::Transaction(format!(
                "package instance {} is not installed",
                instance
            )));
        }
        Ok(())
    }

    fn query<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(sql)?;
        let mut packages = stmt
            .query_map(params, Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for package in &mut packages {
            package.load_file_states(conn)?;
        }
        Ok(packages)
    }

    fn load_file_states(&mut self, conn: &Connection) -> Result<()> {
        let Some(instance) = self.instance else {
            return Ok(());
        };

        let mut stmt = conn.prepare("SELECT file_index, state FROM files WHERE instance = ?1")?;
        let rows = stmt.query_map([instance], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;

        let mut states = vec![FileState::Normal; self.header.files.len()];
        for row in rows {
            let (index, state) = row?;
            if let Some(slot) = states.get_mut(index as usize) {
                *slot = FileState::from_i64(state);
            }
        }
        self.file_states = states;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let header_json: String = row.get(2)?;
        let header: PackageHeader =
            serde_json::from_str(&header_json).map_err(|e| conversion_error(2, e.to_string()))?;

        Ok(Self {
            instance: Some(row.get(0)?),
            file_states: Vec::new(),
            header,
            install_tid: row.get(1)?,
        })
    }
}

/// One row of the file ownership index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFile {
    pub instance: i64,
    pub file_index: usize,
    pub dirname: String,
    pub basename: String,
    pub state: FileState,
}

impl InstalledFile {
    /// All installed files whose basename is one of `basenames`
    ///
    /// Results are ordered by instance, then file index.
    pub fn find_by_basenames(conn: &Connection, basenames: &[&str]) -> Result<Vec<Self>> {
        let mut found = Vec::new();

        for chunk in basenames.chunks(BASENAME_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT instance, file_index, dirname, basename, state FROM files
                 WHERE basename IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), Self::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            found.extend(rows);
        }

        found.sort_by_key(|f| (f.instance, f.file_index));
        found.dedup_by_key(|f| (f.instance, f.file_index));
        Ok(found)
    }

    /// Owners of an exact path
    pub fn find_by_path(conn: &Connection, dirname: &str, basename: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT instance, file_index, dirname, basename, state FROM files
             WHERE dirname = ?1 AND basename = ?2 ORDER BY instance",
        )?;
        let files = stmt
            .query_map([dirname, basename], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    /// Update the persisted state of one file
    pub fn set_state(conn: &Connection, instance: i64, file_index: usize, state: FileState) -> Result<()> {
        conn.execute(
            "UPDATE files SET state = ?1 WHERE instance = ?2 AND file_index = ?3",
            params![state.as_i64(), instance, file_index as i64],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            instance: row.get(0)?,
            file_index: row.get::<_, i64>(1)? as usize,
            dirname: row.get(2)?,
            basename: row.get(3)?,
            state: FileState::from_i64(row.get(4)?),
        })
    }
}

/// Changeset status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetStatus {
    Pending,
    Applied,
    Failed,
    RolledBack,
}

impl ChangesetStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ChangesetStatus::Pending => "pending",
            ChangesetStatus::Applied => "applied",
            ChangesetStatus::Failed => "failed",
            ChangesetStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for ChangesetStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangesetStatus::Pending),
            "applied" => Ok(ChangesetStatus::Applied),
            "failed" => Ok(ChangesetStatus::Failed),
            "rolled_back" => Ok(ChangesetStatus::RolledBack),
            _ => Err(format!("Invalid changeset status: {}", s)),
        }
    }
}

/// History record of one executed transaction
#[derive(Debug, Clone)]
pub struct Changeset {
    pub id: Option<i64>,
    pub tid: i64,
    pub description: String,
    pub status: ChangesetStatus,
    pub element_count: i64,
    pub failed_count: i64,
    pub created_at: Option<String>,
    pub finished_at: Option<String>,
}

const CHANGESET_COLUMNS: &str =
    "id, tid, description, status, element_count, failed_count, created_at, finished_at";

impl Changeset {
    pub fn new(tid: i64, description: String) -> Self {
        Self {
            id: None,
            tid,
            description,
            status: ChangesetStatus::Pending,
            element_count: 0,
            failed_count: 0,
            created_at: None,
            finished_at: None,
        }
    }

    pub fn insert(&mut self, conn: &Connection) -> Result<i64> {
        conn.execute(
            "INSERT INTO changesets (tid, description, status, element_count) VALUES (?1, ?2, ?3, ?4)",
            params![self.tid, &self.description, self.status.as_str(), self.element_count],
        )?;

        let id = conn.last_insert_rowid();
        self.id = Some(id);
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets WHERE id = ?1",
            CHANGESET_COLUMNS
        ))?;
        let changeset = stmt.query_row([id], Self::from_row).optional()?;
        Ok(changeset)
    }

    pub fn find_by_tid(conn: &Connection, tid: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets WHERE tid = ?1 ORDER BY id",
            CHANGESET_COLUMNS
        ))?;
        let changesets = stmt
            .query_map([tid], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(changesets)
    }

    /// List all changesets, newest first
    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM changesets ORDER BY id DESC",
            CHANGESET_COLUMNS
        ))?;
        let changesets = stmt
            .query_map([], Self::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(changesets)
    }

    /// Record the final status and failure tally
    pub fn finish(&mut self, conn: &Connection, status: ChangesetStatus, failed_count: i64) -> Result<()> {
        let id = self
            .id
            .ok_or_else(|| Error::InitError("Cannot update changeset without ID".to_string()))?;

        conn.execute(
            "UPDATE changesets SET status = ?1, failed_count = ?2, finished_at = CURRENT_TIMESTAMP
             WHERE id = ?3",
            params![status.as_str(), failed_count, id],
        )?;

        self.status = status;
        self.failed_count = failed_count;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get(3)?;
        let status = status_str
            .parse::<ChangesetStatus>()
            .map_err(|e| conversion_error(3, e))?;

        Ok(Self {
            id: Some(row.get(0)?),
            tid: row.get(1)?,
            description: row.get(2)?,
            status,
            element_count: row.get(4)?,
            failed_count: row.get(5)?,
            created_at: row.get(6)?,
            finished_at: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::package::{Dependency, FileRecord, Scriptlet, TriggerSense};
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, Connection) {
        let temp_file = NamedTempFile::new().unwrap();
        let conn = Connection::open(temp_file.path()).unwrap();
        conn.execute("PRAGMA foreign_keys = ON", []).unwrap();
        schema::migrate(&conn).unwrap();
        (temp_file, conn)
    }

    fn header(name: &str) -> PackageHeader {
        let mut h = PackageHeader::new(name, "1.0", "1", "x86_64");
        h.add_file(&format!("/usr/bin/{}", name), FileRecord::regular(10, 0o755, None));
        h.add_file("/etc/shared.conf", FileRecord::regular(3, 0o644, None));
        h
    }

    #[test]
    fn test_installed_package_crud() {
        let (_temp, conn) = create_test_db();

        let mut package = InstalledPackage::new(header("foo"), 100);
        let instance = package.insert(&conn).unwrap();
        assert_eq!(package.instance, Some(instance));

        let found = InstalledPackage::find_by_instance(&conn, instance).unwrap().unwrap();
        assert_eq!(found.header.name, "foo");
        assert_eq!(found.install_tid, 100);
        assert_eq!(found.file_states, vec![FileState::Normal, FileState::Normal]);

        assert_eq!(InstalledPackage::count_by_name(&conn, "foo").unwrap(), 1);
        assert_eq!(InstalledPackage::list_all(&conn).unwrap().len(), 1);

        InstalledPackage::delete(&conn, instance).unwrap();
        assert!(InstalledPackage::find_by_instance(&conn, instance).unwrap().is_none());
        let orphans: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_delete_missing_instance_fails() {
        let (_temp, conn) = create_test_db();
        assert!(InstalledPackage::delete(&conn, 42).is_err());
    }

    #[test]
    fn test_find_by_basenames_orders_by_instance() {
        let (_temp, conn) = create_test_db();

        let a = InstalledPackage::new(header("a"), 1).insert(&conn).unwrap();
        let b = InstalledPackage::new(header("b"), 1).insert(&conn).unwrap();

        let found = InstalledFile::find_by_basenames(&conn, &["shared.conf", "a"]).unwrap();
        let keys: Vec<(i64, usize)> = found.iter().map(|f| (f.instance, f.file_index)).collect();
        assert_eq!(keys, vec![(a, 0), (a, 1), (b, 1)]);
        assert_eq!(found[1].dirname, "/etc/");
    }

    #[test]
    fn test_file_state_update() {
        let (_temp, conn) = create_test_db();
        let instance = InstalledPackage::new(header("foo"), 1).insert(&conn).unwrap();

        InstalledFile::set_state(&conn, instance, 1, FileState::Replaced).unwrap();

        let found = InstalledPackage::find_by_instance(&conn, instance).unwrap().unwrap();
        assert_eq!(found.file_states[1], FileState::Replaced);
        let owners = InstalledFile::find_by_path(&conn, "/etc/", "shared.conf").unwrap();
        assert_eq!(owners[0].state, FileState::Replaced);
    }

    #[test]
    fn test_trigger_and_capability_lookup() {
        let (_temp, conn) = create_test_db();

        let mut watcher = header("watcher");
        watcher.add_trigger(
            TriggerSense::In,
            Dependency::unversioned("libfoo"),
            Scriptlet::shell("true"),
        );
        InstalledPackage::new(watcher, 1).insert(&conn).unwrap();

        let mut provider = header("foo-libs");
        provider.provides.push(Dependency::unversioned("libfoo"));
        InstalledPackage::new(provider, 1).insert(&conn).unwrap();

        let triggered = InstalledPackage::find_triggered_by(&conn, "libfoo").unwrap();
        assert_eq!(triggered.len(), 1);
        assert_eq!(triggered[0].header.name, "watcher");

        let providers = InstalledPackage::find_by_capability(&conn, "libfoo").unwrap();
        assert_eq!(providers[0].header.name, "foo-libs");
        // Every package provides its own name
        assert_eq!(InstalledPackage::find_by_capability(&conn, "watcher").unwrap().len(), 1);
    }

    #[test]
    fn test_changeset_lifecycle() {
        let (_temp, conn) = create_test_db();

        let mut changeset = Changeset::new(77, "install foo".to_string());
        changeset.element_count = 2;
        let id = changeset.insert(&conn).unwrap();

        let found = Changeset::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(found.status, ChangesetStatus::Pending);
        assert_eq!(found.element_count, 2);

        changeset.finish(&conn, ChangesetStatus::Failed, 1).unwrap();
        let found = Changeset::find_by_tid(&conn, 77).unwrap();
        assert_eq!(found[0].status, ChangesetStatus::Failed);
        assert_eq!(found[0].failed_count, 1);
        assert!(found[0].finished_at.is_some());
        assert_eq!(Changeset::list_all(&conn).unwrap().len(), 1);
    }
}
