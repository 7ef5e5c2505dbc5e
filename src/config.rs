// src/config.rs

//! Transaction configuration
//!
//! There are no configuration files: every knob lives in `TransactionConfig`,
//! which the CLI fills from its flags and library callers build directly.

use std::path::PathBuf;

/// Behavior switches for one transaction run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFlags {
    /// Classify and report, but never touch the filesystem, database or scripts
    pub test: bool,
    pub no_scripts: bool,
    pub no_triggers: bool,
    /// Skip files flagged as documentation
    pub no_docs: bool,
    /// Skip files flagged as configuration
    pub no_configs: bool,
    /// Update the database without touching package files
    pub just_db: bool,
    /// Write a package of every erased instance before removing it
    pub repackage: bool,
    /// Stop at the first failed element and reverse what was applied
    pub rollback_on_failure: bool,
    pub no_multilib_merge: bool,
}

/// Problem kinds the caller has chosen to ignore
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProblemFilter {
    pub ignore_arch: bool,
    pub ignore_os: bool,
    pub replace_pkg: bool,
    pub old_package: bool,
    pub replace_new_files: bool,
    pub replace_old_files: bool,
    pub disk_space: bool,
    pub disk_nodes: bool,
    pub force_relocate: bool,
}

/// Everything a transaction run needs besides its elements and database
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Install root; every package path is resolved beneath it
    pub root: PathBuf,
    pub flags: TransactionFlags,
    pub filter: ProblemFilter,
    /// Path prefixes shared over the network; files beneath them are left alone
    pub netshared_paths: Vec<String>,
    /// Languages to install (`None` installs every language)
    pub install_langs: Option<Vec<String>>,
    /// Multilib colors active in this transaction (0 disables color resolution)
    pub color: u32,
    /// Color that wins a multilib conflict
    pub prefer_color: u32,
    /// Where repackaged erased instances are written
    pub repackage_dir: Option<PathBuf>,
    /// Scriptlet stdout/stderr sink; inherited when unset
    pub script_log: Option<PathBuf>,
    /// Whether scriptlets `chroot` into a non-`/` root
    pub script_chroot: bool,
    pub platform_arch: String,
    pub platform_os: String,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            flags: TransactionFlags::default(),
            filter: ProblemFilter::default(),
            netshared_paths: Vec::new(),
            install_langs: None,
            color: 0,
            prefer_color: 2,
            repackage_dir: None,
            script_log: None,
            script_chroot: true,
            platform_arch: std::env::consts::ARCH.to_string(),
            platform_os: std::env::consts::OS.to_string(),
        }
    }
}

impl TransactionConfig {
    /// Config rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Whether the install root is the real `/`
    pub fn is_real_root(&self) -> bool {
        self.root.as_os_str().is_empty() || self.root == std::path::Path::new("/")
    }

    /// Map a package path (`/usr/bin/foo`) to its location under the root
    pub fn root_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// Repackaging is forced on when rollback needs the copies
    pub fn repackage_enabled(&self) -> bool {
        self.flags.repackage || self.flags.rollback_on_failure
    }

    /// Directory repackaged instances are written to
    pub fn repackage_path(&self) -> PathBuf {
        self.repackage_dir
            .clone()
            .unwrap_or_else(|| self.root_path("/var/spool/repackage"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_path_joins_below_root() {
        let config = TransactionConfig::with_root("/mnt/sysimage");
        assert_eq!(
            config.root_path("/usr/bin/foo"),
            PathBuf::from("/mnt/sysimage/usr/bin/foo")
        );
        assert!(!config.is_real_root());
        assert!(TransactionConfig::default().is_real_root());
    }

    #[test]
    fn test_rollback_implies_repackage() {
        let mut config = TransactionConfig::default();
        assert!(!config.repackage_enabled());
        config.flags.rollback_on_failure = true;
        assert!(config.repackage_enabled());
        assert_eq!(
            config.repackage_path(),
            PathBuf::from("/var/spool/repackage")
        );
    }
}
