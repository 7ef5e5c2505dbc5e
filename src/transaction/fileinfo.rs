// src/transaction/fileinfo.rs

//! Per-element file arrays and the file action verdicts

use crate::fingerprint::Fingerprint;
use crate::package::{FileRecord, FileState};
use crate::transaction::element::{Goal, TransactionElement};
use std::fmt;

/// Disk action decided for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileAction {
    /// Not decided yet
    #[default]
    Unknown,
    Create,
    /// Leave whatever is on disk alone
    Skip,
    SkipNetShared,
    SkipColor,
    SkipLanguage,
    SkipDoc,
    SkipConfig,
    /// Keep the existing file under a backup suffix, then write the new one
    Backup,
    /// Keep the existing file, write the new one as `.rpmnew`
    AlternateName,
    Erase,
}

impl FileAction {
    /// Whether the file is left untouched
    pub fn is_skip(self) -> bool {
        match self {
            FileAction::Skip
            | FileAction::SkipNetShared
            | FileAction::SkipColor
            | FileAction::SkipLanguage
            | FileAction::SkipDoc
            | FileAction::SkipConfig => true,
            FileAction::Unknown
            | FileAction::Create
            | FileAction::Backup
            | FileAction::AlternateName
            | FileAction::Erase => false,
        }
    }

    /// Skips decided by the exclusion pass rather than by overlap
    pub fn is_exclusion(self) -> bool {
        matches!(
            self,
            FileAction::SkipNetShared
                | FileAction::SkipLanguage
                | FileAction::SkipDoc
                | FileAction::SkipConfig
        )
    }

    /// Whether the action writes package content to disk
    pub fn writes(self) -> bool {
        matches!(
            self,
            FileAction::Unknown | FileAction::Create | FileAction::Backup | FileAction::AlternateName
        )
    }

    /// State an installed file is recorded with after this action
    pub fn install_state(self) -> FileState {
        match self {
            FileAction::SkipNetShared => FileState::NetShared,
            FileAction::SkipColor => FileState::WrongColor,
            FileAction::SkipLanguage | FileAction::SkipDoc | FileAction::SkipConfig => {
                FileState::NotInstalled
            }
            FileAction::Unknown
            | FileAction::Create
            | FileAction::Skip
            | FileAction::Backup
            | FileAction::AlternateName
            | FileAction::Erase => FileState::Normal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::Unknown => "unknown",
            FileAction::Create => "create",
            FileAction::Skip => "skip",
            FileAction::SkipNetShared => "skip-netshared",
            FileAction::SkipColor => "skip-color",
            FileAction::SkipLanguage => "skip-language",
            FileAction::SkipDoc => "skip-doc",
            FileAction::SkipConfig => "skip-config",
            FileAction::Backup => "backup",
            FileAction::AlternateName => "alternate-name",
            FileAction::Erase => "erase",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An installed file that loses ownership to a new package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacedFile {
    pub instance: i64,
    pub file_index: usize,
}

/// Parallel per-file arrays for one element
#[derive(Debug, Clone, Default)]
pub struct FileInfoSet {
    /// Directory table after relocation
    pub dirnames: Vec<String>,
    pub files: Vec<FileRecord>,
    pub actions: Vec<FileAction>,
    /// Empty until the fingerprint pass
    pub fingerprints: Vec<Fingerprint>,
    /// Size of the installed file each file replaces (0 when none)
    pub replaced_sizes: Vec<u64>,
    /// Whether an installed package already owned the path
    pub owned_before: Vec<bool>,
    /// Persisted states (erase elements only)
    pub states: Vec<FileState>,
    pub replaced: Vec<ReplacedFile>,
    /// Resolved numeric owner per file, filled in just before extraction
    pub owners: Vec<(u32, u32)>,
}

impl FileInfoSet {
    /// Arrays for an element, with relocations applied
    pub fn for_element(element: &TransactionElement) -> Self {
        let count = element.header.files.len();
        let states = match element.goal {
            Goal::Erase => {
                let mut states = element.installed_states.clone();
                states.resize(count, FileState::Normal);
                states
            }
            Goal::Install => Vec::new(),
        };

        Self {
            dirnames: element.relocated_dirnames(),
            files: element.header.files.clone(),
            actions: vec![FileAction::Unknown; count],
            fingerprints: Vec::new(),
            replaced_sizes: vec![0; count],
            owned_before: vec![false; count],
            states,
            replaced: Vec::new(),
            owners: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn dirname(&self, index: usize) -> &str {
        self.dirnames
            .get(self.files[index].dir_index as usize)
            .map(String::as_str)
            .unwrap_or("/")
    }

    /// Install path of a file after relocation
    pub fn path(&self, index: usize) -> String {
        format!("{}{}", self.dirname(index), self.files[index].basename)
    }

    /// Persisted state of a file being erased (Normal for installs)
    pub fn state(&self, index: usize) -> FileState {
        self.states.get(index).copied().unwrap_or_default()
    }

    /// States to persist for an installed record
    pub fn install_states(&self) -> Vec<FileState> {
        self.actions.iter().map(|a| a.install_state()).collect()
    }

    /// Suffix a backup of file `index` gets
    pub fn backup_suffix(&self, index: usize, goal: Goal) -> &'static str {
        match goal {
            Goal::Erase => ".rpmsave",
            Goal::Install if self.owned_before[index] => ".rpmsave",
            Goal::Install => ".rpmorig",
        }
    }

    /// Release scratch arrays no longer needed once the element has run
    pub fn release_scratch(&mut self) {
        self.fingerprints = Vec::new();
        self.owners = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::PackageHeader;

    #[test]
    fn test_skip_classification() {
        assert!(FileAction::SkipColor.is_skip());
        assert!(!FileAction::SkipColor.is_exclusion());
        assert!(FileAction::SkipDoc.is_exclusion());
        assert!(!FileAction::Backup.is_skip());
        assert!(FileAction::AlternateName.writes());
        assert!(!FileAction::Erase.writes());
    }

    #[test]
    fn test_install_states_follow_actions() {
        assert_eq!(FileAction::SkipNetShared.install_state(), FileState::NetShared);
        assert_eq!(FileAction::SkipColor.install_state(), FileState::WrongColor);
        assert_eq!(FileAction::SkipLanguage.install_state(), FileState::NotInstalled);
        assert_eq!(FileAction::Skip.install_state(), FileState::Normal);
    }

    #[test]
    fn test_for_element_sizes_arrays() {
        let mut h = PackageHeader::new("foo", "1.0", "1", "noarch");
        h.add_file("/usr/bin/foo", FileRecord::regular(1, 0o755, None));
        h.add_file("/etc/foo.conf", FileRecord::regular(1, 0o644, None));

        let set = FileInfoSet::for_element(&TransactionElement::install_header(h, None));
        assert_eq!(set.len(), 2);
        assert_eq!(set.actions, vec![FileAction::Unknown; 2]);
        assert_eq!(set.path(1), "/etc/foo.conf");
        assert_eq!(set.backup_suffix(1, Goal::Install), ".rpmorig");
        assert_eq!(set.backup_suffix(1, Goal::Erase), ".rpmsave");
    }
}
