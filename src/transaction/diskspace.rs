// src/transaction/diskspace.rs

//! Per-filesystem disk space accounting

use crate::fingerprint::FingerprintCache;
use crate::transaction::element::ElementId;
use crate::transaction::fileinfo::FileAction;
use crate::transaction::problems::{Problem, ProblemKind, ProblemSet};
use nix::sys::statvfs::statvfs;
use tracing::{debug, warn};

/// Space bookkeeping for one mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpaceInfo {
    pub dev: u64,
    /// Mount point, as a path below the install root
    pub mount_point: String,
    pub block_size: u64,
    /// Available blocks (negative when unknown)
    pub bavail: i64,
    /// Available inodes (negative when the filesystem does not report them)
    pub iavail: i64,
    pub bneeded: i64,
    pub ineeded: i64,
    /// Last element whose files were charged here
    pub last_element: Option<ElementId>,
}

impl DiskSpaceInfo {
    /// Entry with fixed capacity, for callers that do not want `statvfs`
    pub fn fixed(dev: u64, mount_point: impl Into<String>, block_size: u64, bavail: i64, iavail: i64) -> Self {
        Self {
            dev,
            mount_point: mount_point.into(),
            block_size: block_size.max(1),
            bavail,
            iavail,
            bneeded: 0,
            ineeded: 0,
            last_element: None,
        }
    }

    fn blocks(&self, size: u64) -> i64 {
        size.div_ceil(self.block_size) as i64
    }
}

/// Filesystem reserved-block margin: need * 21 / 20
fn with_margin(needed: i64) -> i64 {
    needed * 21 / 20
}

/// Running `needed` counters for every filesystem the transaction touches
#[derive(Debug, Default)]
pub struct DiskSpaceTracker {
    entries: Vec<DiskSpaceInfo>,
    /// Devices that could not be measured
    unknown: Vec<u64>,
}

impl DiskSpaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filesystem explicitly (replaces any entry for its device)
    pub fn insert(&mut self, info: DiskSpaceInfo) {
        self.entries.retain(|e| e.dev != info.dev);
        self.entries.push(info);
    }

    pub fn entries(&self) -> &[DiskSpaceInfo] {
        &self.entries
    }

    /// Find or measure the filesystem holding package directory `dir`
    fn entry_for(&mut self, cache: &mut FingerprintCache, dev: u64, dir: &str) -> Option<&mut DiskSpaceInfo> {
        if dev == 0 || self.unknown.contains(&dev) {
            return None;
        }

        if let Some(pos) = self.entries.iter().position(|e| e.dev == dev) {
            return self.entries.get_mut(pos);
        }

        let mount_point = cache.mount_point(dir)?;
        let host_path = cache.host_path(&mount_point);
        match statvfs(host_path.as_path()) {
            Ok(stat) => {
                let iavail = if stat.files() == 0 && stat.files_free() == 0 {
                    -1
                } else {
                    stat.files_available() as i64
                };
                let info = DiskSpaceInfo::fixed(
                    dev,
                    mount_point,
                    stat.block_size() as u64,
                    stat.blocks_available() as i64,
                    iavail,
                );
                debug!(
                    "Filesystem {} (dev {}): {} blocks of {} bytes available",
                    info.mount_point, dev, info.bavail, info.block_size
                );
                self.entries.push(info);
                self.entries.last_mut()
            }
            Err(e) => {
                warn!("Cannot measure filesystem holding {}: {}", host_path.display(), e);
                self.unknown.push(dev);
                None
            }
        }
    }

    /// Charge one file's action to its filesystem
    ///
    /// `prev_size` is the size of the installed file being replaced and
    /// `fixup_size` the size of an earlier claim this file supersedes.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        cache: &mut FingerprintCache,
        dev: u64,
        dir: &str,
        element: ElementId,
        action: FileAction,
        size: u64,
        prev_size: u64,
        fixup_size: u64,
    ) {
        let Some(info) = self.entry_for(cache, dev, dir) else {
            return;
        };
        apply(info, element, action, size, prev_size, fixup_size);
    }

    /// Report filesystems whose needs exceed what is available, once each
    pub fn check(&self, elements: &[String], problems: &mut ProblemSet) {
        for info in &self.entries {
            let Some(element) = info.last_element else {
                continue;
            };
            let nevra = elements.get(element).cloned().unwrap_or_default();

            if info.bavail >= 0 && with_margin(info.bneeded) > info.bavail {
                let short = (with_margin(info.bneeded) - info.bavail) as u64 * info.block_size;
                problems.push(
                    Problem::new(ProblemKind::DiskSpace, nevra.clone())
                        .with_detail(info.mount_point.clone())
                        .with_amount(short),
                );
            }

            if info.iavail >= 0 && with_margin(info.ineeded) > info.iavail {
                let short = (with_margin(info.ineeded) - info.iavail) as u64;
                problems.push(
                    Problem::new(ProblemKind::DiskNodes, nevra)
                        .with_detail(info.mount_point.clone())
                        .with_amount(short),
                );
            }
        }
    }
}

fn apply(info: &mut DiskSpaceInfo, element: ElementId, action: FileAction, size: u64, prev_size: u64, fixup_size: u64) {
    let blocks = info.blocks(size);

    match action {
        FileAction::Backup | FileAction::AlternateName => {
            info.ineeded += 1;
            info.bneeded += blocks;
        }
        FileAction::Create => {
            info.bneeded += blocks;
            info.ineeded += 1;
            info.bneeded -= info.blocks(prev_size);
        }
        FileAction::Erase => {
            info.ineeded -= 1;
            info.bneeded -= blocks;
        }
        FileAction::Unknown
        | FileAction::Skip
        | FileAction::SkipNetShared
        | FileAction::SkipColor
        | FileAction::SkipLanguage
        | FileAction::SkipDoc
        | FileAction::SkipConfig => return,
    }

    if fixup_size > 0 {
        info.bneeded -= info.blocks(fixup_size);
    }
    info.last_element = Some(element);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProblemFilter;

    fn tracker(bavail: i64, iavail: i64) -> DiskSpaceTracker {
        let mut tracker = DiskSpaceTracker::new();
        tracker.insert(DiskSpaceInfo::fixed(7, "/", 4096, bavail, iavail));
        tracker
    }

    fn root_fs(tracker: &DiskSpaceTracker) -> &DiskSpaceInfo {
        &tracker.entries()[0]
    }

    fn charge(tracker: &mut DiskSpaceTracker, element: ElementId, action: FileAction, size: u64, prev: u64, fixup: u64) {
        let info = tracker.entries.iter_mut().find(|e| e.dev == 7).unwrap();
        apply(info, element, action, size, prev, fixup);
    }

    #[test]
    fn test_creates_sum_block_rounded_sizes() {
        let mut t = tracker(1000, 1000);
        for size in [1u64, 4096, 4097, 10_000] {
            charge(&mut t, 0, FileAction::Create, size, 0, 0);
        }
        let info = root_fs(&t);
        assert_eq!(info.bneeded, 1 + 1 + 2 + 3);
        assert_eq!(info.ineeded, 4);
    }

    #[test]
    fn test_replace_charges_delta_and_erase_refunds() {
        let mut t = tracker(1000, 1000);
        charge(&mut t, 0, FileAction::Create, 3 * 4096, 4096, 0);
        assert_eq!(root_fs(&t).bneeded, 2);

        charge(&mut t, 1, FileAction::Erase, 4096, 0, 0);
        let info = root_fs(&t);
        assert_eq!(info.bneeded, 1);
        assert_eq!(info.ineeded, 0);
        assert_eq!(info.last_element, Some(1));
    }

    #[test]
    fn test_skips_are_not_charged() {
        let mut t = tracker(1000, 1000);
        charge(&mut t, 0, FileAction::SkipDoc, 4096, 0, 0);
        charge(&mut t, 0, FileAction::Skip, 4096, 0, 0);
        let info = root_fs(&t);
        assert_eq!((info.bneeded, info.ineeded), (0, 0));
        assert_eq!(info.last_element, None);
    }

    #[test]
    fn test_fixup_removes_superseded_claim() {
        let mut t = tracker(1000, 1000);
        charge(&mut t, 0, FileAction::Create, 4096, 0, 0);
        charge(&mut t, 1, FileAction::Create, 8192, 0, 4096);
        assert_eq!(root_fs(&t).bneeded, 2);
    }

    #[test]
    fn test_check_reports_once_per_filesystem_with_margin() {
        let mut t = tracker(20, 100);
        // 20 blocks needed plus 5% margin (21) exceeds 20 available
        for _ in 0..20 {
            charge(&mut t, 0, FileAction::Create, 4096, 0, 0);
        }
        charge(&mut t, 1, FileAction::Create, 0, 0, 0);

        let mut problems = ProblemSet::new(ProblemFilter::default());
        t.check(&["a-1-1.noarch".to_string(), "b-1-1.noarch".to_string()], &mut problems);

        assert_eq!(problems.len(), 1);
        let problem = problems.iter().next().unwrap();
        assert_eq!(problem.kind, ProblemKind::DiskSpace);
        assert_eq!(problem.package, "b-1-1.noarch");
        assert_eq!(problem.amount, 4096);
    }

    #[test]
    fn test_check_reports_inode_exhaustion() {
        let mut t = tracker(1000, 1);
        charge(&mut t, 0, FileAction::Create, 1, 0, 0);
        charge(&mut t, 0, FileAction::Create, 1, 0, 0);

        let mut problems = ProblemSet::new(ProblemFilter::default());
        t.check(&["a-1-1.noarch".to_string()], &mut problems);
        assert_eq!(problems.count(ProblemKind::DiskNodes), 1);
        assert_eq!(problems.count(ProblemKind::DiskSpace), 0);
    }

    #[test]
    fn test_measures_filesystem_on_first_charge() {
        let root = tempfile::TempDir::new().unwrap();
        let mut cache = FingerprintCache::new(root.path());
        let dev = cache.lookup("/", "file").dev();

        let mut t = DiskSpaceTracker::new();
        t.update(&mut cache, dev, "/", 0, FileAction::Create, 10, 0, 0);

        let info = root_fs(&t);
        assert_eq!(info.dev, dev);
        assert!(info.block_size > 0);
        assert_eq!(info.bneeded, 1);
        assert_eq!(info.last_element, Some(0));
    }
}
