// src/psm/mod.rs

//! Package state machine
//!
//! Drives one element through its stages (init, pre, process, post, fini):
//! scriptlets and triggers around the file work, and the database update
//! that records the outcome. The file work itself lives in `fsm`.

pub mod fsm;
pub mod reaper;
pub mod repackage;
pub mod scriptlet;
pub mod triggers;

use crate::config::TransactionConfig;
use crate::db;
use crate::db::models::{InstalledFile, InstalledPackage};
use crate::error::{Error, Result};
use crate::package::{self, FileState, PackageHeader, ScriptletKind, TriggerSense};
use crate::progress::{CallbackEvent, CallbackKind, TransactionCallback};
use crate::transaction::element::{Goal, TransactionElement};
use crate::transaction::fileinfo::FileInfoSet;
use rusqlite::Connection;
use scriptlet::{ScriptRequest, ScriptRunner, ScriptSlot};
use std::fmt;
use std::fs::File;
use tracing::{debug, info, warn};
use triggers::TriggerContext;

/// What a state machine run does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsmGoal {
    Install,
    Erase,
    Repackage,
}

impl fmt::Display for PsmGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsmGoal::Install => write!(f, "install"),
            PsmGoal::Erase => write!(f, "erase"),
            PsmGoal::Repackage => write!(f, "repackage"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsmStage {
    Init,
    Pre,
    Process,
    Post,
    Fini,
}

/// Runs elements against the root, the database and the script runner
pub struct Psm<'a> {
    conn: &'a mut Connection,
    config: &'a TransactionConfig,
    runner: &'a ScriptRunner<'a>,
    callback: &'a mut dyn TransactionCallback,
    /// Transaction id stamped on installed records
    tid: i64,
}

impl<'a> Psm<'a> {
    pub fn new(
        conn: &'a mut Connection,
        config: &'a TransactionConfig,
        runner: &'a ScriptRunner<'a>,
        callback: &'a mut dyn TransactionCallback,
        tid: i64,
    ) -> Self {
        Self {
            conn,
            config,
            runner,
            callback,
            tid,
        }
    }

    fn stage(&self, goal: PsmGoal, stage: PsmStage, nevra: &str) {
        debug!("psm {} {:?}: {}", goal, stage, nevra);
    }

    fn notify(&mut self, kind: CallbackKind, key: &str, amount: u64, total: u64) -> Option<File> {
        self.callback.notify(&CallbackEvent::new(kind, key, amount, total))
    }

    fn scripts_enabled(&self) -> bool {
        !self.config.flags.test && !self.config.flags.no_scripts
    }

    fn triggers_enabled(&self) -> bool {
        !self.config.flags.test && !self.config.flags.no_triggers
    }

    fn triggers(&self, goal: Goal, count_correction: i64) -> TriggerContext<'_, 'a> {
        TriggerContext {
            conn: &*self.conn,
            runner: self.runner,
            goal,
            count_correction,
        }
    }

    fn run_script(
        &self,
        goal: Goal,
        header: &PackageHeader,
        kind: ScriptletKind,
        arg: i64,
        prefixes: &[String],
    ) -> Result<()> {
        let Some(script) = header.scriptlet(kind) else {
            return Ok(());
        };
        let nevra = header.nevra();
        let request = ScriptRequest {
            package: &nevra,
            slot: ScriptSlot::Lifecycle(kind),
            script,
            args: vec![arg],
            prefixes,
        };
        self.runner.run_for(goal, &request)
    }

    /// Run a transaction-wide scriptlet (`%pretrans`/`%posttrans`) of an
    /// install element, returning any failure to the caller
    pub fn run_trans_script(&self, element: &TransactionElement, kind: ScriptletKind) -> Result<()> {
        if !self.scripts_enabled() {
            return Ok(());
        }
        let Some(script) = element.header.scriptlet(kind) else {
            return Ok(());
        };
        let arg = InstalledPackage::count_by_name(&*self.conn, &element.header.name)? + 1;
        let nevra = element.nevra();
        let prefixes = element.relocated_prefixes();
        let request = ScriptRequest {
            package: &nevra,
            slot: ScriptSlot::Lifecycle(kind),
            script,
            args: vec![arg],
            prefixes: &prefixes,
        };
        self.runner.run(&request)
    }

    /// Install one element
    pub fn install(&mut self, element: &mut TransactionElement, set: &mut FileInfoSet) -> Result<()> {
        let nevra = element.nevra();
        let prefixes = element.relocated_prefixes();

        self.stage(PsmGoal::Install, PsmStage::Init, &nevra);
        let script_arg = InstalledPackage::count_by_name(&*self.conn, &element.header.name)? + 1;
        let previous = InstalledPackage::find_by_name(&*self.conn, &element.header.name)?
            .into_iter()
            .find(|p| p.header.nevra() == nevra)
            .and_then(|p| p.instance);
        self.notify(CallbackKind::InstStart, &nevra, 0, set.len() as u64);

        self.stage(PsmGoal::Install, PsmStage::Pre, &nevra);
        if self.scripts_enabled() {
            self.run_script(Goal::Install, &element.header, ScriptletKind::PreInstall, script_arg, &prefixes)?;
        }

        self.stage(PsmGoal::Install, PsmStage::Process, &nevra);
        let unpack = !self.config.flags.test && !self.config.flags.just_db;
        match (&element.package_path, unpack) {
            (Some(path), true) => {
                let supplied = self.notify(CallbackKind::InstOpenFile, &nevra, 0, 0);
                let file = match supplied {
                    Some(file) => file,
                    None => File::open(path)?,
                };
                let result = self.unpack(element, set, file);
                self.notify(CallbackKind::InstCloseFile, &nevra, 0, 0);
                if let Err(e) = result {
                    self.notify(CallbackKind::UnpackError, &nevra, 0, 0);
                    return Err(e);
                }
            }
            _ => {
                self.notify(CallbackKind::InstProgress, &nevra, 0, 100);
                self.notify(CallbackKind::InstProgress, &nevra, 100, 100);
            }
        }

        self.stage(PsmGoal::Install, PsmStage::Post, &nevra);
        if !self.config.flags.test {
            let instance = self.record_install(element, set, previous)?;
            element.db_instance = Some(instance);

            if self.scripts_enabled() {
                self.run_script(Goal::Install, &element.header, ScriptletKind::PostInstall, script_arg, &prefixes)?;
            }
            if self.triggers_enabled() {
                let triggers = self.triggers(Goal::Install, 0);
                triggers.run_out(&element.header, Some(instance), TriggerSense::In)?;
                triggers.run_in(&element.header, Some(instance), TriggerSense::In)?;
            }
        }

        self.stage(PsmGoal::Install, PsmStage::Fini, &nevra);
        set.release_scratch();
        self.notify(CallbackKind::InstStop, &nevra, set.len() as u64, set.len() as u64);
        Ok(())
    }

    fn unpack(&mut self, element: &TransactionElement, set: &mut FileInfoSet, file: File) -> Result<()> {
        let nevra = element.nevra();
        let mut payload = package::open_payload(file)?;
        fsm::remap_owners(set);

        let callback = &mut *self.callback;
        let mut installer = fsm::FileInstaller::new(self.config, &element.header, set);
        let total = installer.total_size();
        if total == 0 {
            callback.notify(&CallbackEvent::new(CallbackKind::InstProgress, &nevra, 0, 100));
        }
        installer.install(&mut *payload, &mut |done, total| {
            callback.notify(&CallbackEvent::new(CallbackKind::InstProgress, &nevra, done, total));
        })?;
        if total == 0 {
            callback.notify(&CallbackEvent::new(CallbackKind::InstProgress, &nevra, 100, 100));
        }
        Ok(())
    }

    /// Database half of an install: the new record replaces any previous
    /// record of the same NEVRA, and files taken over are marked replaced
    fn record_install(&mut self, element: &TransactionElement, set: &FileInfoSet, previous: Option<i64>) -> Result<i64> {
        let mut header = element.header.clone();
        header.dirnames = set.dirnames.clone();
        header.prefixes = element.relocated_prefixes();
        header.install_time = Some(chrono::Utc::now().timestamp());
        if !self.config.flags.no_multilib_merge {
            self.merge_multilib(&mut header)?;
        }

        let mut record = InstalledPackage::new(header, self.tid);
        record.file_states = set.install_states();

        let replaced = set.replaced.clone();
        let instance = db::transaction(self.conn, |tx| {
            if let Some(previous) = previous {
                InstalledPackage::delete(tx, previous)?;
            }
            let instance = record.insert(tx)?;
            for file in &replaced {
                InstalledFile::set_state(tx, file.instance, file.file_index, FileState::Replaced)?;
            }
            Ok(instance)
        })?;

        info!("Recorded {} as instance {}", element.nevra(), instance);
        Ok(instance)
    }

    /// Carry over dependencies a colored sibling (same EVR, other arch) declares
    fn merge_multilib(&self, header: &mut PackageHeader) -> Result<()> {
        if header.color() == 0 {
            return Ok(());
        }
        let evr = header.evr();
        for sibling in InstalledPackage::find_by_name(&*self.conn, &header.name)? {
            let other = &sibling.header;
            if other.arch == header.arch || other.color() == 0 || other.evr() != evr {
                continue;
            }
            for provide in &other.provides {
                if !header.provides.contains(provide) {
                    header.provides.push(provide.clone());
                }
            }
            for require in &other.requires {
                if !header.requires.contains(require) {
                    header.requires.push(require.clone());
                }
            }
            debug!("Merged dependencies of {} into {}", other.nevra(), header.nevra());
        }
        Ok(())
    }

    /// Erase one element
    pub fn erase(&mut self, element: &mut TransactionElement, set: &mut FileInfoSet) -> Result<()> {
        let nevra = element.nevra();
        let instance = element
            .db_instance
            .ok_or_else(|| Error::Transaction(format!("{} has no installed record", nevra)))?;
        let prefixes = element.header.prefixes.clone();

        self.stage(PsmGoal::Erase, PsmStage::Init, &nevra);
        let script_arg = InstalledPackage::count_by_name(&*self.conn, &element.header.name)? - 1;
        self.notify(CallbackKind::UninstStart, &nevra, 0, set.len() as u64);

        self.stage(PsmGoal::Erase, PsmStage::Pre, &nevra);
        if self.triggers_enabled() {
            let triggers = self.triggers(Goal::Erase, -1);
            triggers.run_in(&element.header, Some(instance), TriggerSense::Un)?;
            triggers.run_out(&element.header, Some(instance), TriggerSense::Un)?;
        }
        if self.scripts_enabled() {
            self.run_script(Goal::Erase, &element.header, ScriptletKind::PreErase, script_arg, &prefixes)?;
        }

        self.stage(PsmGoal::Erase, PsmStage::Process, &nevra);
        if !self.config.flags.test && !self.config.flags.just_db {
            let callback = &mut *self.callback;
            fsm::erase_files(self.config, set, &mut |done, total| {
                callback.notify(&CallbackEvent::new(CallbackKind::UninstProgress, &nevra, done, total));
            });
        }

        self.stage(PsmGoal::Erase, PsmStage::Post, &nevra);
        if !self.config.flags.test {
            if self.scripts_enabled() {
                self.run_script(Goal::Erase, &element.header, ScriptletKind::PostErase, script_arg, &prefixes)?;
            }
            if self.triggers_enabled() {
                self.triggers(Goal::Erase, -1)
                    .run_out(&element.header, Some(instance), TriggerSense::PostUn)?;
            }
            InstalledPackage::delete(&*self.conn, instance)?;
            info!("Removed {} (instance {})", nevra, instance);
        }

        self.stage(PsmGoal::Erase, PsmStage::Fini, &nevra);
        set.release_scratch();
        self.notify(CallbackKind::UninstStop, &nevra, set.len() as u64, set.len() as u64);
        Ok(())
    }

    /// Save an element's installed files as a package before it is erased
    pub fn repackage(&mut self, element: &mut TransactionElement) -> Result<()> {
        let nevra = element.nevra();
        self.stage(PsmGoal::Repackage, PsmStage::Init, &nevra);
        if self.config.flags.test {
            return Ok(());
        }

        self.notify(CallbackKind::RepackageStart, &nevra, 0, 0);
        self.stage(PsmGoal::Repackage, PsmStage::Process, &nevra);
        let callback = &mut *self.callback;
        let result = repackage::repackage(self.config, &element.header, &element.installed_states, &mut |done, total| {
            callback.notify(&CallbackEvent::new(CallbackKind::RepackageProgress, &nevra, done, total));
        });

        self.stage(PsmGoal::Repackage, PsmStage::Fini, &nevra);
        match result {
            Ok(path) => {
                element.repackaged = Some(path);
                self.notify(CallbackKind::RepackageStop, &nevra, 0, 0);
                Ok(())
            }
            Err(e) => {
                warn!("Repackaging {} failed: {}", nevra, e);
                self.notify(CallbackKind::RepackageStop, &nevra, 0, 0);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::package::native::NativeWriter;
    use crate::package::{FileRecord, Scriptlet};
    use crate::progress::RecordingCallback;
    use crate::transaction::fileinfo::FileAction;
    use tempfile::{NamedTempFile, TempDir};

    struct Fixture {
        root: TempDir,
        _db: NamedTempFile,
        conn: Connection,
        config: TransactionConfig,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let db = NamedTempFile::new().unwrap();
        let conn = Connection::open(db.path()).unwrap();
        schema::migrate(&conn).unwrap();
        let mut config = TransactionConfig::with_root(root.path());
        config.script_chroot = false;
        Fixture {
            root,
            _db: db,
            conn,
            config,
        }
    }

    fn build(dir: &std::path::Path, header: &PackageHeader, content: &[(&str, &[u8])]) -> std::path::PathBuf {
        let path = dir.join(format!("{}.pkg.tar.zst", header.nevra()));
        let mut writer = NativeWriter::create(&path, header).unwrap();
        for (member, data) in content {
            writer.append_data(member, 0o644, data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_install_then_erase_round() {
        let mut fx = fixture();
        let log = fx.root.path().join("scripts.log");
        let mut header = PackageHeader::new("foo", "1.0", "1", "noarch");
        header.add_file("/usr/share/foo/data", FileRecord::regular(5, 0o644, None));
        header.set_scriptlet(
            ScriptletKind::PostInstall,
            Scriptlet::shell(format!("echo post $1 >> {}", log.display())),
        );
        header.set_scriptlet(
            ScriptletKind::PostErase,
            Scriptlet::shell(format!("echo postun $1 >> {}", log.display())),
        );
        let pkgs = TempDir::new().unwrap();
        let path = build(pkgs.path(), &header, &[("/usr/share/foo/data", b"data\n")]);

        let mut element = TransactionElement::install(&path).unwrap();
        let mut set = FileInfoSet::for_element(&element);
        set.actions = vec![FileAction::Create];

        let runner = ScriptRunner::new(&fx.config).unwrap();
        let mut callback = RecordingCallback::default();
        {
            let mut psm = Psm::new(&mut fx.conn, &fx.config, &runner, &mut callback, 42);
            psm.install(&mut element, &mut set).unwrap();
        }
        assert!(fx.root.path().join("usr/share/foo/data").exists());
        let instance = element.db_instance.unwrap();
        let record = InstalledPackage::find_by_instance(&fx.conn, instance).unwrap().unwrap();
        assert_eq!(record.install_tid, 42);
        assert!(record.header.install_time.is_some());
        assert!(callback
            .for_key(CallbackKind::InstProgress, "foo-1.0-1.noarch")
            .iter()
            .any(|e| e.amount == 5 && e.total == 5));

        let mut erase = TransactionElement::erase(record);
        let mut erase_set = FileInfoSet::for_element(&erase);
        erase_set.actions = vec![FileAction::Erase];
        {
            let mut psm = Psm::new(&mut fx.conn, &fx.config, &runner, &mut callback, 43);
            psm.erase(&mut erase, &mut erase_set).unwrap();
        }
        assert!(!fx.root.path().join("usr/share/foo/data").exists());
        assert_eq!(InstalledPackage::count_by_name(&fx.conn, "foo").unwrap(), 0);
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "post 1\npostun 0\n");
    }

    #[test]
    fn test_failing_pre_script_stops_install() {
        let mut fx = fixture();
        let mut header = PackageHeader::new("foo", "1.0", "1", "noarch");
        header.set_scriptlet(ScriptletKind::PreInstall, Scriptlet::shell("exit 7"));
        let mut element = TransactionElement::install_header(header, None);
        let mut set = FileInfoSet::for_element(&element);

        let runner = ScriptRunner::new(&fx.config).unwrap();
        let mut callback = RecordingCallback::default();
        let mut psm = Psm::new(&mut fx.conn, &fx.config, &runner, &mut callback, 1);
        let err = psm.install(&mut element, &mut set).unwrap_err();

        assert!(matches!(err, Error::Scriptlet { .. }));
        assert!(element.db_instance.is_none());
    }

    #[test]
    fn test_headers_without_payload_record_only_and_report_progress() {
        let mut fx = fixture();
        let mut element = TransactionElement::install_header(PackageHeader::new("meta", "1", "1", "noarch"), None);
        let mut set = FileInfoSet::for_element(&element);

        let runner = ScriptRunner::new(&fx.config).unwrap();
        let mut callback = RecordingCallback::default();
        {
            let mut psm = Psm::new(&mut fx.conn, &fx.config, &runner, &mut callback, 1);
            psm.install(&mut element, &mut set).unwrap();
        }

        let progress: Vec<(u64, u64)> = callback
            .for_key(CallbackKind::InstProgress, "meta-1-1.noarch")
            .iter()
            .map(|e| (e.amount, e.total))
            .collect();
        assert_eq!(progress, vec![(0, 100), (100, 100)]);
        assert_eq!(InstalledPackage::count_by_name(&fx.conn, "meta").unwrap(), 1);
    }

    #[test]
    fn test_reinstall_replaces_previous_record() {
        let mut fx = fixture();
        InstalledPackage::new(PackageHeader::new("foo", "1", "1", "noarch"), 1)
            .insert(&fx.conn)
            .unwrap();

        let mut element = TransactionElement::install_header(PackageHeader::new("foo", "1", "1", "noarch"), None);
        let mut set = FileInfoSet::for_element(&element);
        let runner = ScriptRunner::new(&fx.config).unwrap();
        let mut callback = RecordingCallback::default();
        {
            let mut psm = Psm::new(&mut fx.conn, &fx.config, &runner, &mut callback, 2);
            psm.install(&mut element, &mut set).unwrap();
        }
        let all = InstalledPackage::find_by_name(&fx.conn, "foo").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].install_tid, 2);
    }

    #[test]
    fn test_multilib_merge_copies_sibling_provides() {
        let mut fx = fixture();
        let mut sibling = PackageHeader::new("libfoo", "1", "1", "i686");
        sibling.add_file("/usr/lib/libfoo.so", FileRecord::regular(1, 0o755, None).with_color(1));
        sibling.provides.push(crate::package::Dependency::unversioned("libfoo.so"));
        InstalledPackage::new(sibling, 1).insert(&fx.conn).unwrap();

        let mut header = PackageHeader::new("libfoo", "1", "1", "x86_64");
        header.add_file("/usr/lib64/libfoo.so", FileRecord::regular(1, 0o755, None).with_color(2));
        let mut element = TransactionElement::install_header(header, None);
        let mut set = FileInfoSet::for_element(&element);
        set.actions = vec![FileAction::Create];

        let runner = ScriptRunner::new(&fx.config).unwrap();
        let mut callback = RecordingCallback::default();
        {
            let mut psm = Psm::new(&mut fx.conn, &fx.config, &runner, &mut callback, 2);
            psm.install(&mut element, &mut set).unwrap();
        }
        let record = InstalledPackage::find_by_instance(&fx.conn, element.db_instance.unwrap())
            .unwrap()
            .unwrap();
        assert!(record.header.provides.iter().any(|p| p.name == "libfoo.so"));
    }
}
