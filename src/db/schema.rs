// src/db/schema.rs

//! Database schema definitions and migrations
//!
//! This module defines the SQLite schema for the installed-package database
//! and provides a migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    debug!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!("Schema migration complete. Now at version {}", SCHEMA_VERSION);
    Ok(())
}

fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        2 => migrate_v2(conn),
        _ => Err(Error::InitError(format!("Unknown migration version: {}", version))),
    }
}

/// Initial schema - Version 1
///
/// - packages: one row per installed instance, with the full record as JSON
/// - files: per-file ownership index (dirname/basename) and file state
/// - provides: capability index used by trigger matching
/// - trigger_names: names watched by each package's triggers
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        CREATE TABLE packages (
            instance INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            epoch INTEGER,
            version TEXT NOT NULL,
            release TEXT NOT NULL,
            arch TEXT NOT NULL,
            os TEXT NOT NULL,
            color INTEGER NOT NULL DEFAULT 0,
            install_time INTEGER NOT NULL,
            install_tid INTEGER NOT NULL,
            header TEXT NOT NULL
        );

        CREATE INDEX idx_packages_name ON packages(name);

        CREATE TABLE files (
            instance INTEGER NOT NULL,
            file_index INTEGER NOT NULL,
            dirname TEXT NOT NULL,
            basename TEXT NOT NULL,
            state INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (instance, file_index),
            FOREIGN KEY (instance) REFERENCES packages(instance) ON DELETE CASCADE
        );

        CREATE INDEX idx_files_basename ON files(basename);

        CREATE TABLE provides (
            instance INTEGER NOT NULL,
            name TEXT NOT NULL,
            flags INTEGER NOT NULL DEFAULT 0,
            version TEXT,
            FOREIGN KEY (instance) REFERENCES packages(instance) ON DELETE CASCADE
        );

        CREATE INDEX idx_provides_name ON provides(name);

        CREATE TABLE trigger_names (
            instance INTEGER NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY (instance) REFERENCES packages(instance) ON DELETE CASCADE
        );

        CREATE INDEX idx_trigger_names_name ON trigger_names(name);
        ",
    )?;

    info!("Schema version 1 created successfully");
    Ok(())
}

/// Schema Version 2: transaction history
///
/// One changeset per executed transaction, keyed by transaction id.
fn migrate_v2(conn: &Connection) -> Result<()> {
    debug!("Migrating to schema version 2");

    conn.execute_batch(
        "
        CREATE TABLE changesets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tid INTEGER NOT NULL,
            description TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('pending', 'applied', 'failed', 'rolled_back')),
            element_count INTEGER NOT NULL DEFAULT 0,
            failed_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            finished_at TEXT
        );

        CREATE INDEX idx_changesets_tid ON changesets(tid);
        CREATE INDEX idx_changesets_status ON changesets(status);
        ",
    )?;

    info!("Schema version 2 applied successfully");
    Ok(())
}
