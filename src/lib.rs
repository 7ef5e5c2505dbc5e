// src/lib.rs

//! pkgtx: transaction execution engine for a Linux package manager
//!
//! Given an ordered set of package installs and erases, decides what to do
//! with every file each package touches, then drives each package through
//! its install or erase lifecycle, with rollback of partially applied runs.
//!
//! # Architecture
//!
//! - Database-first: installed packages and history live in SQLite
//! - Fingerprints: files are identified by (device, inode) of their directory
//!   plus basename, so aliased paths compare equal
//! - Overlap resolution: every file gets one `FileAction` before anything
//!   is changed; disk space is checked per filesystem
//! - Package state machine: scriptlets, triggers, payload extraction and the
//!   database update, staged per package
//! - Formats: RPM (read) and a native tar-based format (read and write)

pub mod config;
pub mod db;
mod error;
pub mod filesystem;
pub mod fingerprint;
pub mod package;
pub mod progress;
pub mod psm;
pub mod transaction;
pub mod version;

pub use config::{ProblemFilter, TransactionConfig, TransactionFlags};
pub use error::{Error, Result};
pub use transaction::{RunReport, Transaction};
