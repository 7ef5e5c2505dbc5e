// src/transaction/element.rs

//! Transaction elements: one package's worth of install or erase work

use crate::db::models::InstalledPackage;
use crate::error::Result;
use crate::package::{self, FileState, PackageHeader};
use std::fmt;
use std::path::{Path, PathBuf};

/// Index of an element in its transaction (also its ordinal position)
pub type ElementId = usize;

/// What an element does to its package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Goal {
    Install,
    Erase,
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Goal::Install => write!(f, "install"),
            Goal::Erase => write!(f, "erase"),
        }
    }
}

/// Move files under `old_prefix` to `new_prefix` at install time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub old_prefix: String,
    pub new_prefix: String,
}

impl Relocation {
    pub fn new(old_prefix: impl Into<String>, new_prefix: impl Into<String>) -> Self {
        Self {
            old_prefix: normalize_prefix(&old_prefix.into()),
            new_prefix: normalize_prefix(&new_prefix.into()),
        }
    }

    /// Parse the `OLD=NEW` command-line form
    pub fn parse(arg: &str) -> Option<Self> {
        let (old, new) = arg.split_once('=')?;
        if !old.starts_with('/') || !new.starts_with('/') {
            return None;
        }
        Some(Self::new(old, new))
    }

    /// Relocate one directory name (with trailing '/')
    pub fn apply(&self, dirname: &str) -> Option<String> {
        let prefix = format!("{}/", self.old_prefix.trim_end_matches('/'));
        if self.old_prefix == "/" {
            return Some(format!("{}{}", self.new_prefix.trim_end_matches('/'), dirname));
        }
        if dirname == prefix || dirname.starts_with(&prefix) {
            let rest = &dirname[prefix.len() - 1..];
            Some(format!("{}{}", self.new_prefix.trim_end_matches('/'), rest))
        } else {
            None
        }
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One package being installed or removed
#[derive(Debug, Clone)]
pub struct TransactionElement {
    pub header: PackageHeader,
    pub goal: Goal,
    /// Package file providing the payload (installs only)
    pub package_path: Option<PathBuf>,
    /// Database instance: the record being erased, or the record an
    /// install added once it has run
    pub db_instance: Option<i64>,
    /// Persisted file states of the record being erased
    pub installed_states: Vec<FileState>,
    pub relocations: Vec<Relocation>,
    /// For the erase half of an upgrade: the install element replacing it
    pub upgrade_of: Option<ElementId>,
    /// Repackaged copy written before erasing
    pub repackaged: Option<PathBuf>,
    pub done: bool,
    pub failed: bool,
    /// Not executed because a linked element failed
    pub linked_failed: bool,
}

impl TransactionElement {
    /// Install element from a package file
    pub fn install(path: &Path) -> Result<Self> {
        let header = package::read_header(path)?;
        Ok(Self::install_header(header, Some(path.to_path_buf())))
    }

    /// Install element from an already-read header
    ///
    /// Without a package path only the database record is added.
    pub fn install_header(header: PackageHeader, package_path: Option<PathBuf>) -> Self {
        Self {
            header,
            goal: Goal::Install,
            package_path,
            db_instance: None,
            installed_states: Vec::new(),
            relocations: Vec::new(),
            upgrade_of: None,
            repackaged: None,
            done: false,
            failed: false,
            linked_failed: false,
        }
    }

    /// Erase element for an installed record
    pub fn erase(package: InstalledPackage) -> Self {
        Self {
            header: package.header,
            goal: Goal::Erase,
            package_path: None,
            db_instance: package.instance,
            installed_states: package.file_states,
            relocations: Vec::new(),
            upgrade_of: None,
            repackaged: None,
            done: false,
            failed: false,
            linked_failed: false,
        }
    }

    pub fn with_relocation(mut self, relocation: Relocation) -> Self {
        self.relocations.push(relocation);
        self
    }

    pub fn nevra(&self) -> String {
        self.header.nevra()
    }

    /// Directory table after relocation
    pub fn relocated_dirnames(&self) -> Vec<String> {
        self.header
            .dirnames
            .iter()
            .map(|dir| {
                self.relocations
                    .iter()
                    .find_map(|r| r.apply(dir))
                    .unwrap_or_else(|| dir.clone())
            })
            .collect()
    }

    /// Relocation prefixes after relocation, as exported to scriptlets
    pub fn relocated_prefixes(&self) -> Vec<String> {
        self.header
            .prefixes
            .iter()
            .map(|prefix| {
                let dir = format!("{}/", prefix.trim_end_matches('/'));
                self.relocations
                    .iter()
                    .find_map(|r| r.apply(&dir))
                    .map(|d| normalize_prefix(&d))
                    .unwrap_or_else(|| prefix.clone())
            })
            .collect()
    }

    /// Relocations that name a path the package does not declare relocatable
    pub fn invalid_relocations(&self) -> Vec<&Relocation> {
        self.relocations
            .iter()
            .filter(|r| {
                !self
                    .header
                    .prefixes
                    .iter()
                    .any(|p| normalize_prefix(p) == r.old_prefix)
            })
            .collect()
    }
}
