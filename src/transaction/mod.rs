// src/transaction/mod.rs

//! Transaction runner
//!
//! A `Transaction` holds an ordered list of elements. `run` checks them,
//! fingerprints and classifies every file, verifies disk space, and only
//! then drives each element through the package state machine. Nothing is
//! mutated unless every check passes.

pub mod diskspace;
pub mod element;
pub mod fileinfo;
pub mod problems;
pub mod resolver;
pub mod rollback;
pub mod sanity;
pub mod shared;

use crate::config::TransactionConfig;
use crate::db::models::{Changeset, ChangesetStatus, InstalledPackage};
use crate::error::{Error, Result};
use crate::fingerprint::FingerprintCache;
use crate::package::{PackageHeader, ScriptletKind};
use crate::progress::{CallbackEvent, CallbackKind, TransactionCallback};
use crate::psm::scriptlet::ScriptRunner;
use crate::psm::Psm;
use diskspace::{DiskSpaceInfo, DiskSpaceTracker};
use element::{ElementId, Goal, TransactionElement};
use fileinfo::FileInfoSet;
use problems::{Problem, ProblemKind, ProblemSet};
use resolver::OverlapResolver;
use rusqlite::Connection;
use shared::SharedFileIndex;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Outcome of `Transaction::run`
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Every unfiltered problem found, even when the run succeeded
    pub problems: Vec<Problem>,
    pub completed: usize,
    pub failed: usize,
    /// Elements skipped because the element they are linked to failed
    pub linked_skipped: usize,
    /// Checks failed and nothing was changed
    pub aborted: bool,
    pub rolled_back: bool,
}

impl RunReport {
    pub fn success(&self) -> bool {
        !self.aborted && self.failed == 0 && self.linked_skipped == 0
    }
}

/// An ordered set of install and erase elements
pub struct Transaction {
    config: TransactionConfig,
    elements: Vec<TransactionElement>,
    file_sets: Vec<FileInfoSet>,
    problems: ProblemSet,
    disk: DiskSpaceTracker,
    tid: i64,
}

impl Transaction {
    pub fn new(config: TransactionConfig) -> Self {
        let problems = ProblemSet::new(config.filter.clone());
        Self {
            config,
            elements: Vec::new(),
            file_sets: Vec::new(),
            problems,
            disk: DiskSpaceTracker::new(),
            tid: chrono::Utc::now().timestamp(),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Transaction id stamped on records this run installs
    pub fn tid(&self) -> i64 {
        self.tid
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn add_element(&mut self, element: TransactionElement) -> ElementId {
        self.elements.push(element);
        self.elements.len() - 1
    }

    /// Add an install of the package file at `path`
    pub fn add_install(&mut self, path: &Path) -> Result<ElementId> {
        let element = TransactionElement::install(path)?;
        debug!("Adding install of {}", element.nevra());
        Ok(self.add_element(element))
    }

    /// Add an install from a header; without a path only the record is added
    pub fn add_install_header(&mut self, header: PackageHeader, package_path: Option<PathBuf>) -> ElementId {
        self.add_element(TransactionElement::install_header(header, package_path))
    }

    /// Add an erase of an installed record
    pub fn add_erase(&mut self, package: InstalledPackage) -> ElementId {
        debug!("Adding erase of {}", package.header.nevra());
        self.add_element(TransactionElement::erase(package))
    }

    /// Add erases of every installed instance named `name`
    pub fn add_erase_name(&mut self, conn: &Connection, name: &str) -> Result<Vec<ElementId>> {
        let installed = InstalledPackage::find_by_name(conn, name)?;
        if installed.is_empty() {
            return Err(Error::Transaction(format!("package {} is not installed", name)));
        }
        Ok(installed.into_iter().map(|p| self.add_erase(p)).collect())
    }

    /// Add an install of `path` plus erases of the instances it replaces
    ///
    /// Installed same-name instances of the same color (or either
    /// uncolored) are erased after the new package is installed. An
    /// identical NEVRA is left for the install to replace in place.
    pub fn add_upgrade(&mut self, conn: &Connection, path: &Path) -> Result<ElementId> {
        let id = self.add_install(path)?;
        let header = &self.elements[id].header;
        let nevra = header.nevra();
        let color = header.color();

        let mut replaced = Vec::new();
        for installed in InstalledPackage::find_by_name(conn, &header.name)? {
            if installed.header.nevra() == nevra {
                continue;
            }
            let other = installed.header.color();
            if color != 0 && other != 0 && color & other == 0 {
                continue;
            }
            replaced.push(installed);
        }

        for installed in replaced {
            debug!("{} replaces {}", nevra, installed.header.nevra());
            let erase = self.add_erase(installed);
            self.elements[erase].upgrade_of = Some(id);
        }
        Ok(id)
    }

    pub fn element_mut(&mut self, id: ElementId) -> Option<&mut TransactionElement> {
        self.elements.get_mut(id)
    }

    pub fn elements(&self) -> &[TransactionElement] {
        &self.elements
    }

    /// File arrays of an element (filled in by `run`)
    pub fn file_set(&self, id: ElementId) -> Option<&FileInfoSet> {
        self.file_sets.get(id)
    }

    pub fn problems(&self) -> &ProblemSet {
        &self.problems
    }

    pub fn disk_usage(&self) -> &[DiskSpaceInfo] {
        self.disk.entries()
    }

    /// Register a filesystem with known capacity instead of measuring it
    pub fn set_disk_space(&mut self, info: DiskSpaceInfo) {
        self.disk.insert(info);
    }

    /// Check, classify and execute every element
    pub fn run(&mut self, conn: &mut Connection, callback: &mut dyn TransactionCallback) -> Result<RunReport> {
        info!("Running transaction {} with {} elements", self.tid, self.elements.len());
        self.problems.clear();
        self.file_sets = self.elements.iter().map(FileInfoSet::for_element).collect();

        if !self.prepare(conn, callback)? {
            warn!("Transaction {} aborted with {} problems", self.tid, self.problems.len());
            return Ok(RunReport {
                problems: self.problems.to_vec(),
                aborted: true,
                ..RunReport::default()
            });
        }

        let test = self.config.flags.test;
        let mut changeset = if test {
            None
        } else {
            let description = self
                .elements
                .iter()
                .map(|e| format!("{} {}", e.goal, e.nevra()))
                .collect::<Vec<_>>()
                .join(", ");
            let mut changeset = Changeset::new(self.tid, description);
            changeset.element_count = self.elements.len() as i64;
            changeset.insert(conn)?;
            Some(changeset)
        };

        let mut report = self.execute(conn, callback)?;
        report.problems = self.problems.to_vec();

        if report.failed > 0 && self.config.flags.rollback_on_failure && !test {
            self.rollback(conn, callback)?;
            report.rolled_back = true;
        }

        if let Some(changeset) = changeset.as_mut() {
            let status = if report.rolled_back {
                ChangesetStatus::RolledBack
            } else if report.failed > 0 {
                ChangesetStatus::Failed
            } else {
                ChangesetStatus::Applied
            };
            changeset.finish(conn, status, report.failed as i64)?;
        }

        info!(
            "Transaction {} finished: {} completed, {} failed, {} skipped",
            self.tid, report.completed, report.failed, report.linked_skipped
        );
        Ok(report)
    }

    /// Every check that runs before mutation; false when problems remain
    fn prepare(&mut self, conn: &mut Connection, callback: &mut dyn TransactionCallback) -> Result<bool> {
        let Self {
            config,
            elements,
            file_sets,
            problems,
            disk,
            ..
        } = self;

        for element in elements.iter().filter(|e| e.goal == Goal::Install) {
            sanity::check_relocations(element, problems);
        }
        sanity::check_elements(conn, config, elements, problems)?;
        if !problems.is_empty() {
            return Ok(false);
        }

        if !config.flags.test && !config.flags.no_scripts {
            let runner = ScriptRunner::new(config)?;
            let psm = Psm::new(conn, config, &runner, callback, 0);
            for element in elements.iter().filter(|e| e.goal == Goal::Install) {
                if let Err(e) = psm.run_trans_script(element, ScriptletKind::PreTrans) {
                    error!("%pretrans of {} failed: {}", element.nevra(), e);
                    problems.push(Problem::new(ProblemKind::BadPreTrans, element.nevra()).with_detail(e.to_string()));
                }
            }
            if !problems.is_empty() {
                return Ok(false);
            }
        }

        for (element, set) in elements.iter().zip(file_sets.iter_mut()) {
            if element.goal == Goal::Install {
                resolver::skip_files(config, set);
            }
        }

        let total = elements.len() as u64;
        callback.notify(&CallbackEvent::new(CallbackKind::TransStart, "", 0, total));
        let mut cache = FingerprintCache::new(&config.root);
        for (done, set) in file_sets.iter_mut().enumerate() {
            set.fingerprints = cache.lookup_all(&set.dirnames, &set.files);
            callback.notify(&CallbackEvent::new(CallbackKind::TransProgress, "", done as u64 + 1, total));
        }

        let index = SharedFileIndex::build(file_sets);
        debug!("{} paths are claimed more than once", index.overlap_count());
        OverlapResolver::new(conn, config, &mut cache, &index, problems, disk).resolve(elements, file_sets)?;
        callback.notify(&CallbackEvent::new(CallbackKind::TransStop, "", total, total));

        let names: Vec<String> = elements.iter().map(TransactionElement::nevra).collect();
        disk.check(&names, problems);

        for problem in problems.iter() {
            warn!("{}", problem);
        }
        Ok(problems.is_empty())
    }

    /// The main loop: repackage erases, run every element, then %posttrans
    fn execute(&mut self, conn: &mut Connection, callback: &mut dyn TransactionCallback) -> Result<RunReport> {
        let Self {
            config,
            elements,
            file_sets,
            tid,
            ..
        } = self;
        let runner = ScriptRunner::new(config)?;
        let mut report = RunReport::default();

        if config.repackage_enabled() {
            let mut psm = Psm::new(conn, config, &runner, callback, *tid);
            for element in elements.iter_mut().filter(|e| e.goal == Goal::Erase) {
                if let Err(e) = psm.repackage(element) {
                    error!("Cannot repackage {}: {}", element.nevra(), e);
                    element.failed = true;
                }
            }
        }

        let total = elements.len() as u64;
        for id in 0..elements.len() {
            if elements[id].linked_failed {
                info!("Skipping {}: the element it is linked to failed", elements[id].nevra());
                report.linked_skipped += 1;
                continue;
            }
            if elements[id].failed {
                report.failed += 1;
                mark_linked(elements, id);
                if config.flags.rollback_on_failure {
                    break;
                }
                continue;
            }

            let result = {
                let mut psm = Psm::new(conn, config, &runner, callback, *tid);
                match elements[id].goal {
                    Goal::Install => psm.install(&mut elements[id], &mut file_sets[id]),
                    Goal::Erase => psm.erase(&mut elements[id], &mut file_sets[id]),
                }
            };
            callback.notify(&CallbackEvent::new(
                CallbackKind::TransProgress,
                elements[id].nevra(),
                id as u64 + 1,
                total,
            ));

            match result {
                Ok(()) => {
                    elements[id].done = true;
                    report.completed += 1;
                }
                Err(e) => {
                    error!("{} of {} failed: {}", elements[id].goal, elements[id].nevra(), e);
                    elements[id].failed = true;
                    report.failed += 1;
                    mark_linked(elements, id);
                    if config.flags.rollback_on_failure {
                        break;
                    }
                }
            }
        }

        if !config.flags.test && !config.flags.no_scripts {
            let psm = Psm::new(conn, config, &runner, callback, *tid);
            for element in elements.iter().filter(|e| e.goal == Goal::Install && e.done) {
                if let Err(e) = psm.run_trans_script(element, ScriptletKind::PostTrans) {
                    warn!("%posttrans of {} failed: {}", element.nevra(), e);
                }
            }
        }

        Ok(report)
    }

    /// Reverse every element this run applied
    fn rollback(&mut self, conn: &mut Connection, callback: &mut dyn TransactionCallback) -> Result<()> {
        let applied: Vec<&TransactionElement> = self.elements.iter().filter(|e| e.done).collect();
        info!("Rolling back {} applied elements of transaction {}", applied.len(), self.tid);
        if applied.is_empty() {
            return Ok(());
        }

        let mut reverse = Transaction::new(rollback::rollback_config(&self.config));
        for element in rollback::reverse_elements(conn, &applied)? {
            reverse.add_element(element);
        }
        for info in self.disk.entries() {
            reverse.set_disk_space(DiskSpaceInfo::fixed(
                info.dev,
                info.mount_point.clone(),
                info.block_size,
                info.bavail,
                info.iavail,
            ));
        }

        let report = reverse.run(conn, callback)?;
        if !report.success() {
            return Err(Error::Rollback(format!(
                "rollback of transaction {} left {} elements unapplied",
                self.tid,
                report.failed + report.linked_skipped
            )));
        }
        Ok(())
    }
}

/// Erase halves of an upgrade are skipped when their install half fails
fn mark_linked(elements: &mut [TransactionElement], failed: ElementId) {
    for element in elements.iter_mut() {
        if element.upgrade_of == Some(failed) && !element.done {
            warn!("Not erasing {}: its replacement failed", element.nevra());
            element.linked_failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::package::{FileRecord, Scriptlet};
    use crate::progress::RecordingCallback;
    use tempfile::{NamedTempFile, TempDir};

    fn setup() -> (TempDir, NamedTempFile, Connection, TransactionConfig) {
        let root = TempDir::new().unwrap();
        let db = NamedTempFile::new().unwrap();
        let conn = Connection::open(db.path()).unwrap();
        schema::migrate(&conn).unwrap();
        let mut config = TransactionConfig::with_root(root.path());
        config.script_chroot = false;
        (root, db, conn, config)
    }

    #[test]
    fn test_bad_arch_aborts_without_changes() {
        let (_root, _db, mut conn, mut config) = setup();
        config.platform_arch = "x86_64".to_string();
        let mut tx = Transaction::new(config);
        tx.add_install_header(PackageHeader::new("foo", "1", "1", "s390x"), None);

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert!(report.aborted);
        assert_eq!(report.problems[0].kind, ProblemKind::BadArch);
        assert_eq!(InstalledPackage::count_by_name(&conn, "foo").unwrap(), 0);
        assert!(Changeset::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_failed_pretrans_is_a_problem() {
        let (_root, _db, mut conn, config) = setup();
        let mut header = PackageHeader::new("foo", "1", "1", "noarch");
        header.set_scriptlet(ScriptletKind::PreTrans, Scriptlet::shell("exit 1"));
        let mut tx = Transaction::new(config);
        tx.add_install_header(header, None);

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert!(report.aborted);
        assert_eq!(report.problems[0].kind, ProblemKind::BadPreTrans);
    }

    #[test]
    fn test_record_only_install_and_changeset() {
        let (_root, _db, mut conn, config) = setup();
        let mut tx = Transaction::new(config);
        tx.add_install_header(PackageHeader::new("foo", "1", "1", "noarch"), None);

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert!(report.success());
        assert_eq!(report.completed, 1);
        let history = Changeset::list_all(&conn).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ChangesetStatus::Applied);
        assert_eq!(history[0].tid, tx.tid());
    }

    #[test]
    fn test_failed_install_skips_linked_erase() {
        let (_root, _db, mut conn, config) = setup();
        let mut old = InstalledPackage::new(PackageHeader::new("foo", "1", "1", "noarch"), 1);
        old.insert(&conn).unwrap();

        let mut header = PackageHeader::new("foo", "2", "1", "noarch");
        header.set_scriptlet(ScriptletKind::PreInstall, Scriptlet::shell("exit 3"));
        let mut tx = Transaction::new(config);
        let install = tx.add_install_header(header, None);
        let erase = tx.add_erase(old);
        tx.element_mut(erase).unwrap().upgrade_of = Some(install);

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.linked_skipped, 1);
        assert!(tx.elements()[erase].linked_failed);
        let left = InstalledPackage::find_by_name(&conn, "foo").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].header.version, "1");
        assert_eq!(Changeset::list_all(&conn).unwrap()[0].status, ChangesetStatus::Failed);
    }

    #[test]
    fn test_test_mode_classifies_but_records_nothing() {
        let (root, _db, mut conn, mut config) = setup();
        config.flags.test = true;
        let mut header = PackageHeader::new("foo", "1", "1", "noarch");
        header.add_file("/usr/bin/foo", FileRecord::regular(3, 0o755, None));
        let mut tx = Transaction::new(config);
        let id = tx.add_install_header(header, None);

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert!(report.success());
        assert_eq!(tx.file_set(id).unwrap().actions, vec![fileinfo::FileAction::Create]);
        assert_eq!(InstalledPackage::count_by_name(&conn, "foo").unwrap(), 0);
        assert!(!root.path().join("usr/bin/foo").exists());
        assert!(Changeset::list_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_rollback_erases_completed_installs() {
        let (_root, _db, mut conn, mut config) = setup();
        config.flags.rollback_on_failure = true;
        let mut broken = PackageHeader::new("bar", "1", "1", "noarch");
        broken.set_scriptlet(ScriptletKind::PreInstall, Scriptlet::shell("exit 1"));

        let mut tx = Transaction::new(config);
        tx.add_install_header(PackageHeader::new("foo", "1", "1", "noarch"), None);
        tx.add_install_header(broken, None);
        tx.add_install_header(PackageHeader::new("baz", "1", "1", "noarch"), None);

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert!(report.rolled_back);
        assert_eq!(report.completed, 1);
        assert!(!tx.elements()[2].done);
        assert_eq!(InstalledPackage::list_all(&conn).unwrap().len(), 0);
        let history = Changeset::list_all(&conn).unwrap();
        assert!(history.iter().any(|c| c.status == ChangesetStatus::RolledBack));
    }

    #[test]
    fn test_upgrade_links_erases_to_install() {
        let (_root, _db, mut conn, config) = setup();
        let pkgs = TempDir::new().unwrap();
        InstalledPackage::new(PackageHeader::new("foo", "1", "1", "noarch"), 1)
            .insert(&conn)
            .unwrap();
        let header = PackageHeader::new("foo", "2", "1", "noarch");
        let path = pkgs.path().join("foo-2-1.noarch.pkg.tar.zst");
        crate::package::native::NativeWriter::create(&path, &header)
            .unwrap()
            .finish()
            .unwrap();

        let mut tx = Transaction::new(config);
        let id = tx.add_upgrade(&conn, &path).unwrap();
        assert_eq!(tx.len(), 2);
        assert_eq!(tx.elements()[1].goal, Goal::Erase);
        assert_eq!(tx.elements()[1].upgrade_of, Some(id));

        let report = tx.run(&mut conn, &mut RecordingCallback::default()).unwrap();
        assert!(report.success());
        let left = InstalledPackage::find_by_name(&conn, "foo").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].header.version, "2");
    }
}
