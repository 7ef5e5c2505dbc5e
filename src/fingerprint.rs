// src/fingerprint.rs

//! File fingerprints
//!
//! A fingerprint identifies a file path by the (device, inode) of the closest
//! existing directory above it, plus whatever path remains below that
//! directory and the basename. Two path strings that reach the same directory
//! through symlinks, bind mounts, or `.`/`..` noise get equal fingerprints.

use crate::package::FileRecord;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::rc::Rc;
use tracing::trace;

/// Identity of one directory, as seen by `stat`
#[derive(Debug, PartialEq, Eq)]
pub struct DirIdentity {
    pub path: String,
    pub dev: u64,
    pub ino: u64,
    /// Synthetic entry for a root that could not be stat'ed
    pub fake: bool,
}

/// Content-independent identity of a file path
#[derive(Debug, Clone)]
pub struct Fingerprint {
    entry: Rc<DirIdentity>,
    subdir: Option<String>,
    basename: String,
}

impl Fingerprint {
    pub fn dir(&self) -> &DirIdentity {
        &self.entry
    }

    /// Path components between the identified directory and the basename
    pub fn subdir(&self) -> Option<&str> {
        self.subdir.as_deref()
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    /// Device of the identified directory (0 for synthetic entries)
    pub fn dev(&self) -> u64 {
        self.entry.dev
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.entry.dev == other.entry.dev
            && self.entry.ino == other.entry.ino
            && self.subdir == other.subdir
            && self.basename == other.basename
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entry.dev.hash(state);
        self.entry.ino.hash(state);
        self.subdir.hash(state);
        self.basename.hash(state);
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entry.path.trim_end_matches('/'))?;
        if let Some(subdir) = &self.subdir {
            write!(f, "/{}", subdir)?;
        }
        write!(f, "/{}", self.basename)
    }
}

/// Lexically clean an absolute path: collapse `//`, drop `.`, resolve `..`
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

/// Memoized directory identity lookups for one transaction
pub struct FingerprintCache {
    root: PathBuf,
    entries: HashMap<String, Rc<DirIdentity>>,
    missing: HashSet<String>,
    stat_calls: usize,
}

impl FingerprintCache {
    /// Cache resolving package paths beneath `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: HashMap::new(),
            missing: HashSet::new(),
            stat_calls: 0,
        }
    }

    /// Number of `stat` calls issued so far
    pub fn stat_calls(&self) -> usize {
        self.stat_calls
    }

    fn absolute(dir: &str) -> String {
        if dir.starts_with('/') {
            clean_path(dir)
        } else {
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
            clean_path(&format!("{}/{}", cwd.to_string_lossy(), dir))
        }
    }

    fn on_disk(&self, dir: &str) -> PathBuf {
        self.root.join(dir.trim_start_matches('/'))
    }

    /// Identity of `dir`, stat'ing it at most once
    fn identify(&mut self, dir: &str) -> Option<Rc<DirIdentity>> {
        if let Some(entry) = self.entries.get(dir) {
            return Some(Rc::clone(entry));
        }
        if self.missing.contains(dir) {
            return None;
        }

        self.stat_calls += 1;
        match std::fs::metadata(self.on_disk(dir)) {
            Ok(meta) if meta.is_dir() => {
                let entry = Rc::new(DirIdentity {
                    path: dir.to_string(),
                    dev: meta.dev(),
                    ino: meta.ino(),
                    fake: false,
                });
                self.entries.insert(dir.to_string(), Rc::clone(&entry));
                Some(entry)
            }
            _ => {
                self.missing.insert(dir.to_string());
                None
            }
        }
    }

    /// Fingerprint of `basename` inside `dir`
    pub fn lookup(&mut self, dir: &str, basename: &str) -> Fingerprint {
        let clean = Self::absolute(dir);
        let mut current = clean.as_str();

        let entry = loop {
            if let Some(entry) = self.identify(current) {
                break entry;
            }
            if current == "/" {
                trace!("Install root {} is missing, using a synthetic entry", self.root.display());
                let entry = Rc::new(DirIdentity {
                    path: "/".to_string(),
                    dev: 0,
                    ino: 0,
                    fake: true,
                });
                self.entries.insert("/".to_string(), Rc::clone(&entry));
                break entry;
            }
            current = parent_of(current);
        };

        let rest = clean[entry.path.len()..].trim_matches('/');
        Fingerprint {
            subdir: if rest.is_empty() { None } else { Some(rest.to_string()) },
            basename: basename.to_string(),
            entry,
        }
    }

    /// Fingerprints for a whole file list, reusing the directory walk for
    /// consecutive files that share a directory index
    pub fn lookup_all(&mut self, dirnames: &[String], files: &[FileRecord]) -> Vec<Fingerprint> {
        let mut fingerprints: Vec<Fingerprint> = Vec::with_capacity(files.len());
        let mut previous: Option<u32> = None;

        for file in files {
            let fingerprint = match (previous, fingerprints.last()) {
                (Some(index), Some(last)) if index == file.dir_index => Fingerprint {
                    entry: Rc::clone(&last.entry),
                    subdir: last.subdir.clone(),
                    basename: file.basename.clone(),
                },
                _ => {
                    let dir = dirnames
                        .get(file.dir_index as usize)
                        .map(String::as_str)
                        .unwrap_or("/");
                    self.lookup(dir, &file.basename)
                }
            };
            previous = Some(file.dir_index);
            fingerprints.push(fingerprint);
        }

        fingerprints
    }

    /// Mount point of the filesystem holding `dir`: the highest ancestor
    /// still on the same device
    pub fn mount_point(&mut self, dir: &str) -> Option<String> {
        let clean = Self::absolute(dir);
        let start = self.lookup(&clean, "");
        if start.entry.fake {
            return None;
        }

        let mut mount = start.entry.path.clone();
        while mount != "/" {
            let parent = parent_of(&mount).to_string();
            match self.identify(&parent) {
                Some(entry) if entry.dev == start.entry.dev => mount = parent,
                _ => break,
            }
        }
        Some(mount)
    }

    /// On-disk location of a package directory under the root
    pub fn host_path(&self, dir: &str) -> PathBuf {
        self.on_disk(dir)
    }
}
