// src/transaction/problems.rs

//! Problems collected while checking and resolving a transaction

use crate::config::ProblemFilter;
use std::fmt;
use tracing::debug;

/// Kind of a transaction problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    /// Package architecture is not compatible with the platform
    BadArch,
    BadOs,
    /// Identical package already installed
    PkgInstalled,
    /// A newer version of the package is installed
    OldPackage,
    /// Relocation of a path the package does not allow
    BadRelocate,
    /// Two packages in the transaction install different files at one path
    NewFileConflict,
    /// A package conflicts with a file of an installed package
    FileConflict,
    DiskSpace,
    DiskNodes,
    /// A pre-transaction scriptlet failed
    BadPreTrans,
}

impl ProblemKind {
    /// Whether the caller's filter ignores this kind
    pub fn is_filtered(self, filter: &ProblemFilter) -> bool {
        match self {
            ProblemKind::BadArch => filter.ignore_arch,
            ProblemKind::BadOs => filter.ignore_os,
            ProblemKind::PkgInstalled => filter.replace_pkg,
            ProblemKind::OldPackage => filter.old_package,
            ProblemKind::BadRelocate => filter.force_relocate,
            ProblemKind::NewFileConflict => filter.replace_new_files,
            ProblemKind::FileConflict => filter.replace_old_files,
            ProblemKind::DiskSpace => filter.disk_space,
            ProblemKind::DiskNodes => filter.disk_nodes,
            ProblemKind::BadPreTrans => false,
        }
    }
}

/// One reported problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub kind: ProblemKind,
    /// NEVRA of the offending package
    pub package: String,
    /// NEVRA of the other package involved, if any
    pub alt_package: Option<String>,
    /// Path, mount point, or other detail
    pub detail: Option<String>,
    /// Bytes or inodes short, where relevant
    pub amount: u64,
}

impl Problem {
    pub fn new(kind: ProblemKind, package: impl Into<String>) -> Self {
        Self {
            kind,
            package: package.into(),
            alt_package: None,
            detail: None,
            amount: 0,
        }
    }

    pub fn with_alt(mut self, alt: impl Into<String>) -> Self {
        self.alt_package = Some(alt.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_amount(mut self, amount: u64) -> Self {
        self.amount = amount;
        self
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let detail = self.detail.as_deref().unwrap_or("");
        let alt = self.alt_package.as_deref().unwrap_or("");
        match self.kind {
            ProblemKind::BadArch => write!(f, "package {} is intended for a different architecture", self.package),
            ProblemKind::BadOs => write!(f, "package {} is intended for a different operating system", self.package),
            ProblemKind::PkgInstalled => write!(f, "package {} is already installed", self.package),
            ProblemKind::OldPackage => write!(
                f,
                "package {} (which is newer than {}) is already installed",
                alt, self.package
            ),
            ProblemKind::BadRelocate => write!(f, "path {} in package {} is not relocatable", detail, self.package),
            ProblemKind::NewFileConflict => write!(
                f,
                "file {} conflicts between attempted installs of {} and {}",
                detail, self.package, alt
            ),
            ProblemKind::FileConflict => write!(
                f,
                "file {} from install of {} conflicts with file from package {}",
                detail, self.package, alt
            ),
            ProblemKind::DiskSpace => write!(
                f,
                "installing package {} needs {}KB on the {} filesystem",
                self.package,
                self.amount.div_ceil(1024),
                detail
            ),
            ProblemKind::DiskNodes => write!(
                f,
                "installing package {} needs {} inodes on the {} filesystem",
                self.package, self.amount, detail
            ),
            ProblemKind::BadPreTrans => write!(f, "%pretrans of {} failed: {}", self.package, detail),
        }
    }
}

/// Growable problem list that drops kinds the caller filters out
#[derive(Debug, Clone, Default)]
pub struct ProblemSet {
    filter: ProblemFilter,
    problems: Vec<Problem>,
}

impl ProblemSet {
    pub fn new(filter: ProblemFilter) -> Self {
        Self {
            filter,
            problems: Vec::new(),
        }
    }

    /// Record a problem unless its kind is filtered
    pub fn push(&mut self, problem: Problem) {
        if problem.kind.is_filtered(&self.filter) {
            debug!("Ignoring filtered problem: {}", problem);
            return;
        }
        self.problems.push(problem);
    }

    pub fn len(&self) -> usize {
        self.problems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Problem> {
        self.problems.iter()
    }

    pub fn count(&self, kind: ProblemKind) -> usize {
        self.problems.iter().filter(|p| p.kind == kind).count()
    }

    pub fn to_vec(&self) -> Vec<Problem> {
        self.problems.clone()
    }

    pub fn clear(&mut self) {
        self.problems.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filtered_problems_are_dropped() {
        let filter = ProblemFilter {
            replace_new_files: true,
            ..ProblemFilter::default()
        };
        let mut set = ProblemSet::new(filter);

        set.push(Problem::new(ProblemKind::NewFileConflict, "a-1-1.noarch").with_detail("/x"));
        set.push(Problem::new(ProblemKind::FileConflict, "a-1-1.noarch").with_detail("/y"));

        assert_eq!(set.len(), 1);
        assert_eq!(set.count(ProblemKind::FileConflict), 1);
    }

    #[test]
    fn test_pretrans_failures_cannot_be_filtered() {
        let filter = ProblemFilter {
            ignore_arch: true,
            ignore_os: true,
            replace_pkg: true,
            old_package: true,
            replace_new_files: true,
            replace_old_files: true,
            disk_space: true,
            disk_nodes: true,
            force_relocate: true,
        };
        assert!(!ProblemKind::BadPreTrans.is_filtered(&filter));
    }

    #[test]
    fn test_display_mentions_both_packages() {
        let p = Problem::new(ProblemKind::NewFileConflict, "b-1-1.x86_64")
            .with_alt("a-1-1.x86_64")
            .with_detail("/usr/bin/tool");
        let text = p.to_string();
        assert!(text.contains("/usr/bin/tool"));
        assert!(text.contains("a-1-1.x86_64"));
        assert!(text.contains("b-1-1.x86_64"));
    }
}
