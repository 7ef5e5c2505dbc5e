// src/package/header.rs

//! In-memory package record
//!
//! A `PackageHeader` is the validated metadata of one package: identity, the
//! file list (split into a directory table plus per-file basenames, like the
//! on-disk RPM layout), dependencies, lifecycle scriptlets and triggers. The
//! same structure is persisted verbatim (as JSON) for installed packages.

use crate::error::{Error, Result};
use crate::version::{ranges_overlap, DepFlags, Evr};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Per-file attribute bits (values match the RPM file flag tag)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileFlags(pub u32);

impl FileFlags {
    pub const NONE: FileFlags = FileFlags(0);
    pub const CONFIG: FileFlags = FileFlags(1 << 0);
    pub const DOC: FileFlags = FileFlags(1 << 1);
    pub const MISSINGOK: FileFlags = FileFlags(1 << 3);
    pub const NOREPLACE: FileFlags = FileFlags(1 << 4);
    pub const GHOST: FileFlags = FileFlags(1 << 6);
    pub const LICENSE: FileFlags = FileFlags(1 << 7);
    pub const README: FileFlags = FileFlags(1 << 8);

    pub fn contains(self, other: FileFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_config(self) -> bool {
        self.contains(Self::CONFIG)
    }

    pub fn is_doc(self) -> bool {
        self.contains(Self::DOC)
    }
}

impl std::ops::BitOr for FileFlags {
    type Output = FileFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FileFlags(self.0 | rhs.0)
    }
}

/// Persisted state of an installed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileState {
    #[default]
    Normal,
    Replaced,
    NotInstalled,
    NetShared,
    WrongColor,
}

impl FileState {
    pub fn as_i64(self) -> i64 {
        match self {
            FileState::Normal => 0,
            FileState::Replaced => 1,
            FileState::NotInstalled => 2,
            FileState::NetShared => 3,
            FileState::WrongColor => 4,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => FileState::Replaced,
            2 => FileState::NotInstalled,
            3 => FileState::NetShared,
            4 => FileState::WrongColor,
            _ => FileState::Normal,
        }
    }
}

/// One file entry of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub basename: String,
    pub dir_index: u32,
    pub size: u64,
    pub mode: u32,
    #[serde(default)]
    pub flags: FileFlags,
    #[serde(default = "default_owner")]
    pub user: String,
    #[serde(default = "default_owner")]
    pub group: String,
    /// SHA-256 hex digest of the content (regular files only)
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub link_to: Option<String>,
    /// Multilib color bits (1 = 32-bit ELF, 2 = 64-bit ELF)
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub mtime: i64,
}

fn default_owner() -> String {
    "root".to_string()
}

fn default_os() -> String {
    "linux".to_string()
}

impl FileRecord {
    /// A regular file with the given content digest
    pub fn regular(size: u64, mode: u32, digest: Option<String>) -> Self {
        Self {
            basename: String::new(),
            dir_index: 0,
            size,
            mode: S_IFREG | (mode & 0o7777),
            flags: FileFlags::NONE,
            user: default_owner(),
            group: default_owner(),
            digest,
            link_to: None,
            color: 0,
            lang: None,
            mtime: 0,
        }
    }

    pub fn directory(mode: u32) -> Self {
        Self {
            mode: S_IFDIR | (mode & 0o7777),
            ..Self::regular(0, 0, None)
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        let target = target.into();
        Self {
            size: target.len() as u64,
            mode: S_IFLNK | 0o777,
            link_to: Some(target),
            ..Self::regular(0, 0, None)
        }
    }

    pub fn with_flags(mut self, flags: FileFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    pub fn with_owner(mut self, user: impl Into<String>, group: impl Into<String>) -> Self {
        self.user = user.into();
        self.group = group.into();
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    /// Whether two packages ship the same bytes with the same metadata here
    pub fn same_content(&self, other: &FileRecord) -> bool {
        if self.mode != other.mode || self.user != other.user || self.group != other.group {
            return false;
        }
        if self.is_symlink() {
            return self.link_to == other.link_to;
        }
        if self.is_regular() {
            return self.size == other.size && self.digest == other.digest;
        }
        true
    }
}

/// A named, optionally versioned capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    #[serde(default)]
    pub flags: DepFlags,
    #[serde(default)]
    pub version: Option<String>,
}

impl Dependency {
    pub fn unversioned(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags: DepFlags::ANY,
            version: None,
        }
    }

    pub fn versioned(name: impl Into<String>, flags: DepFlags, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            flags,
            version: Some(version.into()),
        }
    }

    pub fn evr(&self) -> Evr {
        self.version.as_deref().map(Evr::parse).unwrap_or_default()
    }

    /// Whether this dependency and `other` name the same thing with
    /// overlapping version ranges
    pub fn overlaps(&self, other: &Dependency) -> bool {
        self.name == other.name && ranges_overlap(self.flags, &self.evr(), other.flags, &other.evr())
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(version) = &self.version {
            let op = match self.flags.0 & 0x0e {
                0x02 => "<",
                0x0a => "<=",
                0x08 => "=",
                0x0c => ">=",
                0x04 => ">",
                _ => "",
            };
            write!(f, " {} {}", op, version)?;
        }
        Ok(())
    }
}

/// Lifecycle points that can carry a scriptlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScriptletKind {
    PreTrans,
    PreInstall,
    PostInstall,
    PreErase,
    PostErase,
    PostTrans,
}

impl ScriptletKind {
    pub fn tag_name(self) -> &'static str {
        match self {
            ScriptletKind::PreTrans => "%pretrans",
            ScriptletKind::PreInstall => "%pre",
            ScriptletKind::PostInstall => "%post",
            ScriptletKind::PreErase => "%preun",
            ScriptletKind::PostErase => "%postun",
            ScriptletKind::PostTrans => "%posttrans",
        }
    }
}

/// Script body plus the interpreter that runs it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Scriptlet {
    /// Interpreter and its leading arguments; empty means `/bin/sh`
    #[serde(default)]
    pub interpreter: Vec<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl Scriptlet {
    pub fn shell(body: impl Into<String>) -> Self {
        Self {
            interpreter: Vec::new(),
            body: Some(body.into()),
        }
    }
}

/// When a trigger fires relative to the source package's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSense {
    /// Source package is being installed
    In,
    /// Source package is about to be erased
    Un,
    /// Source package has been erased
    PostUn,
}

impl TriggerSense {
    pub fn tag_name(self) -> &'static str {
        match self {
            TriggerSense::In => "%triggerin",
            TriggerSense::Un => "%triggerun",
            TriggerSense::PostUn => "%triggerpostun",
        }
    }
}

/// A trigger condition and the index of the embedded script it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub sense: TriggerSense,
    pub condition: Dependency,
    pub script: usize,
}

/// Validated metadata of one package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHeader {
    pub name: String,
    #[serde(default)]
    pub epoch: Option<u32>,
    pub version: String,
    pub release: String,
    pub arch: String,
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default)]
    pub summary: Option<String>,
    /// Relocatable path prefixes; empty means not relocatable
    #[serde(default)]
    pub prefixes: Vec<String>,
    /// Directory table, every entry ends with '/'
    #[serde(default)]
    pub dirnames: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
    #[serde(default)]
    pub provides: Vec<Dependency>,
    #[serde(default)]
    pub requires: Vec<Dependency>,
    #[serde(default)]
    pub scriptlets: BTreeMap<ScriptletKind, Scriptlet>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default)]
    pub trigger_scripts: Vec<Scriptlet>,
    #[serde(default)]
    pub install_time: Option<i64>,
}

impl PackageHeader {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        release: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            epoch: None,
            version: version.into(),
            release: release.into(),
            arch: arch.into(),
            os: default_os(),
            summary: None,
            prefixes: Vec::new(),
            dirnames: Vec::new(),
            files: Vec::new(),
            provides: Vec::new(),
            requires: Vec::new(),
            scriptlets: BTreeMap::new(),
            triggers: Vec::new(),
            trigger_scripts: Vec::new(),
            install_time: None,
        }
    }

    pub fn evr(&self) -> Evr {
        Evr::new(self.epoch, self.version.clone(), Some(self.release.clone()))
    }

    /// name-[epoch:]version-release.arch
    pub fn nevra(&self) -> String {
        format!("{}-{}.{}", self.name, self.evr(), self.arch)
    }

    /// Add a file at an absolute path, splitting it into the directory table
    pub fn add_file(&mut self, path: &str, mut record: FileRecord) -> usize {
        let (dirname, basename) = split_path(path);
        let dir_index = match self.dirnames.iter().position(|d| *d == dirname) {
            Some(index) => index,
            None => {
                self.dirnames.push(dirname);
                self.dirnames.len() - 1
            }
        };
        record.basename = basename;
        record.dir_index = dir_index as u32;
        self.files.push(record);
        self.files.len() - 1
    }

    pub fn dirname(&self, index: usize) -> &str {
        self.dirnames
            .get(self.files[index].dir_index as usize)
            .map(String::as_str)
            .unwrap_or("/")
    }

    /// Reject file entries that point outside the directory table
    pub fn validate(&self) -> Result<()> {
        if let Some(file) = self
            .files
            .iter()
            .find(|f| f.dir_index as usize >= self.dirnames.len())
        {
            return Err(Error::PackageFormat(format!(
                "{}: file {} has directory index {} but only {} directories",
                self.nevra(),
                file.basename,
                file.dir_index,
                self.dirnames.len()
            )));
        }
        Ok(())
    }

    pub fn file_path(&self, index: usize) -> String {
        format!("{}{}", self.dirname(index), self.files[index].basename)
    }

    /// Union of all file colors
    pub fn color(&self) -> u32 {
        self.files.iter().fold(0, |acc, f| acc | f.color)
    }

    pub fn scriptlet(&self, kind: ScriptletKind) -> Option<&Scriptlet> {
        self.scriptlets.get(&kind)
    }

    pub fn set_scriptlet(&mut self, kind: ScriptletKind, scriptlet: Scriptlet) {
        self.scriptlets.insert(kind, scriptlet);
    }

    /// Add a trigger and its script, returning the script index
    pub fn add_trigger(&mut self, sense: TriggerSense, condition: Dependency, script: Scriptlet) -> usize {
        self.trigger_scripts.push(script);
        let index = self.trigger_scripts.len() - 1;
        self.triggers.push(Trigger {
            sense,
            condition,
            script: index,
        });
        index
    }

    /// The implicit `name = EVR` provide every package carries
    pub fn self_provide(&self) -> Dependency {
        Dependency::versioned(self.name.clone(), DepFlags::EQUAL, self.evr().to_string())
    }

    /// Whether this package (by name or any provide) satisfies `dep`
    pub fn satisfies(&self, dep: &Dependency) -> bool {
        self.self_provide().overlaps(dep) || self.provides.iter().any(|p| p.overlaps(dep))
    }

    /// Distinct names that this package's triggers watch
    pub fn trigger_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.triggers.iter().map(|t| t.condition.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Split an absolute path into ("/dir/", "base")
pub fn split_path(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(pos) => (path[..=pos].to_string(), path[pos + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}
