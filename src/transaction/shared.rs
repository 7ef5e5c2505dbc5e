// src/transaction/shared.rs

//! Overlap discovery: which files share a fingerprint, inside the
//! transaction and against the installed-package database

use crate::db::models::InstalledFile;
use crate::error::Result;
use crate::fingerprint::{Fingerprint, FingerprintCache};
use crate::transaction::element::ElementId;
use crate::transaction::fileinfo::FileInfoSet;
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};

/// Every (element, file) claiming each fingerprint, in transaction order
#[derive(Debug, Default)]
pub struct SharedFileIndex {
    claims: HashMap<Fingerprint, Vec<(ElementId, usize)>>,
}

impl SharedFileIndex {
    /// Index all non-excluded files of all elements
    pub fn build(file_sets: &[FileInfoSet]) -> Self {
        let mut claims: HashMap<Fingerprint, Vec<(ElementId, usize)>> = HashMap::new();

        for (element, set) in file_sets.iter().enumerate() {
            for (file, fingerprint) in set.fingerprints.iter().enumerate() {
                if set.actions[file].is_exclusion() {
                    continue;
                }
                claims
                    .entry(fingerprint.clone())
                    .or_default()
                    .push((element, file));
            }
        }

        Self { claims }
    }

    pub fn claims(&self, fingerprint: &Fingerprint) -> &[(ElementId, usize)] {
        self.claims.get(fingerprint).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of fingerprints claimed by more than one file
    pub fn overlap_count(&self) -> usize {
        self.claims.values().filter(|c| c.len() > 1).count()
    }
}

/// A file of the current element that an installed package also owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedFileInfo {
    pub other_instance: i64,
    pub other_file: usize,
    pub file: usize,
    /// The other package is being erased in this transaction
    pub is_removed: bool,
}

/// Look up every installed file sharing a fingerprint with `set`
///
/// One batched query per element; results are sorted by the other
/// package's instance so files shared with one package are contiguous.
pub fn find_installed_overlaps(
    conn: &Connection,
    cache: &mut FingerprintCache,
    set: &FileInfoSet,
    own_instance: Option<i64>,
    removed: &HashSet<i64>,
) -> Result<Vec<SharedFileInfo>> {
    let mut by_fingerprint: HashMap<&Fingerprint, Vec<usize>> = HashMap::new();
    let mut basenames: Vec<&str> = Vec::new();
    let mut seen = HashSet::new();

    for (file, fingerprint) in set.fingerprints.iter().enumerate() {
        if set.actions[file].is_skip() {
            continue;
        }
        by_fingerprint.entry(fingerprint).or_default().push(file);
        let basename = set.files[file].basename.as_str();
        if seen.insert(basename) {
            basenames.push(basename);
        }
    }

    if basenames.is_empty() {
        return Ok(Vec::new());
    }

    let mut shared = Vec::new();
    for installed in InstalledFile::find_by_basenames(conn, &basenames)? {
        if Some(installed.instance) == own_instance {
            continue;
        }
        let fingerprint = cache.lookup(&installed.dirname, &installed.basename);
        if let Some(files) = by_fingerprint.get(&fingerprint) {
            for &file in files {
                shared.push(SharedFileInfo {
                    other_instance: installed.instance,
                    other_file: installed.file_index,
                    file,
                    is_removed: removed.contains(&installed.instance),
                });
            }
        }
    }

    shared.sort_by_key(|s| (s.other_instance, s.file));
    Ok(shared)
}

/// Split sorted shared records into runs with the same other package
pub fn runs(shared: &[SharedFileInfo]) -> impl Iterator<Item = &[SharedFileInfo]> {
    shared.chunk_by(|a, b| a.other_instance == b.other_instance)
}
