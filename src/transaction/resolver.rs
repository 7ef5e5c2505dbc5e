// src/transaction/resolver.rs

//! File disposition: exclusion pass and overlap resolution
//!
//! Every file of every element gets exactly one `FileAction`. Overlaps with
//! installed packages are handled first (one batched database lookup per
//! element), then overlaps between elements of this transaction, walking
//! the shared-file index backwards from the current element to find the
//! most recent claim on the same path.

use crate::config::TransactionConfig;
use crate::db::models::InstalledPackage;
use crate::error::{Error, Result};
use crate::filesystem::{exists_on_disk, file_digest, FileKind};
use crate::fingerprint::FingerprintCache;
use crate::package::{FileFlags, FileRecord, FileState};
use crate::transaction::diskspace::DiskSpaceTracker;
use crate::transaction::element::{ElementId, Goal, TransactionElement};
use crate::transaction::fileinfo::{FileAction, FileInfoSet, ReplacedFile};
use crate::transaction::problems::{Problem, ProblemKind, ProblemSet};
use crate::transaction::shared::{find_installed_overlaps, runs, SharedFileIndex, SharedFileInfo};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;
use tracing::{debug, trace};

/// Mark files excluded by configuration before any overlap handling
pub fn skip_files(config: &TransactionConfig, set: &mut FileInfoSet) {
    for index in 0..set.len() {
        let path = set.path(index);
        let file = &set.files[index];

        let action = if is_netshared(&config.netshared_paths, &path) {
            FileAction::SkipNetShared
        } else if !lang_wanted(config.install_langs.as_deref(), file.lang.as_deref()) {
            FileAction::SkipLanguage
        } else if config.flags.no_docs && file.flags.is_doc() {
            FileAction::SkipDoc
        } else if config.flags.no_configs && file.flags.is_config() {
            FileAction::SkipConfig
        } else {
            continue;
        };

        trace!("{} excluded: {}", path, action);
        set.actions[index] = action;
    }

    // Directories left with nothing but excluded entries are excluded too
    let dirs: Vec<(usize, Vec<usize>)> = {
        let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
        for index in 0..set.len() {
            children.entry(set.dirname(index)).or_default().push(index);
        }
        (0..set.len())
            .filter(|&dir| set.files[dir].is_dir())
            .filter_map(|dir| {
                let dir_path = format!("{}/", set.path(dir));
                let kids: Vec<usize> = children
                    .get(dir_path.as_str())?
                    .iter()
                    .copied()
                    .filter(|&k| k != dir)
                    .collect();
                (!kids.is_empty()).then_some((dir, kids))
            })
            .collect()
    };

    loop {
        let mut changed = false;
        for (dir, kids) in &dirs {
            if set.actions[*dir].is_skip() {
                continue;
            }
            if kids.iter().all(|&k| set.actions[k].is_skip()) {
                set.actions[*dir] = set.actions[kids[0]];
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

fn is_netshared(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        !prefix.is_empty() && (path == prefix || path.starts_with(&format!("{}/", prefix)))
    })
}

fn lang_wanted(langs: Option<&[String]>, file_lang: Option<&str>) -> bool {
    let (Some(langs), Some(file_lang)) = (langs, file_lang) else {
        return true;
    };
    if file_lang.is_empty() {
        return true;
    }

    file_lang.split('|').any(|lang| {
        lang == "C"
            || langs.iter().any(|wanted| {
                wanted == "all" || lang == wanted || lang.starts_with(&format!("{}_", wanted))
            })
    })
}

/// Decide what to do with a config file an installed package already owns
pub fn decide_file_fate(disk_path: &Path, old: &FileRecord, new: &FileRecord) -> FileAction {
    let Some(disk_kind) = FileKind::on_disk(disk_path) else {
        return if new.flags.contains(FileFlags::MISSINGOK) {
            FileAction::Skip
        } else {
            FileAction::Create
        };
    };

    let save = if new.flags.contains(FileFlags::NOREPLACE) {
        FileAction::AlternateName
    } else {
        FileAction::Backup
    };
    let db_kind = FileKind::from_mode(old.mode);
    let new_kind = FileKind::from_mode(new.mode);

    if new_kind == FileKind::Directory {
        return FileAction::Create;
    }
    if disk_kind != new_kind && db_kind != FileKind::Regular && db_kind != FileKind::Symlink {
        return save;
    } else if new_kind != db_kind && disk_kind != db_kind {
        return save;
    } else if db_kind != new_kind {
        return FileAction::Create;
    } else if db_kind != FileKind::Symlink && db_kind != FileKind::Regular {
        return FileAction::Create;
    }

    if db_kind == FileKind::Regular {
        let Ok(on_disk) = file_digest(disk_path) else {
            return FileAction::Create;
        };
        if old.digest.as_deref() == Some(on_disk.as_str()) {
            return FileAction::Create;
        }
        if old.digest.is_some() && old.digest == new.digest {
            return FileAction::Skip;
        }
    } else {
        let Ok(target) = std::fs::read_link(disk_path) else {
            return FileAction::Create;
        };
        let target = target.to_string_lossy();
        if old.link_to.as_deref() == Some(target.as_ref()) {
            return FileAction::Create;
        }
        if old.link_to == new.link_to {
            return FileAction::Skip;
        }
    }

    save
}

/// Whether a new file of `new_color` beats an earlier one of `old_color`
fn new_color_wins(new_color: u32, old_color: u32, prefer: u32) -> bool {
    let new_preferred = new_color & prefer != 0;
    let old_preferred = old_color & prefer != 0;
    if new_preferred != old_preferred {
        return new_preferred;
    }
    new_color > old_color
}

/// Classifies every file of every element and charges disk space
pub struct OverlapResolver<'a> {
    conn: &'a Connection,
    config: &'a TransactionConfig,
    cache: &'a mut FingerprintCache,
    index: &'a SharedFileIndex,
    problems: &'a mut ProblemSet,
    disk: &'a mut DiskSpaceTracker,
    installed: HashMap<i64, Rc<InstalledPackage>>,
}

impl<'a> OverlapResolver<'a> {
    pub fn new(
        conn: &'a Connection,
        config: &'a TransactionConfig,
        cache: &'a mut FingerprintCache,
        index: &'a SharedFileIndex,
        problems: &'a mut ProblemSet,
        disk: &'a mut DiskSpaceTracker,
    ) -> Self {
        Self {
            conn,
            config,
            cache,
            index,
            problems,
            disk,
            installed: HashMap::new(),
        }
    }

    /// Resolve every element, in transaction order
    pub fn resolve(&mut self, elements: &[TransactionElement], file_sets: &mut [FileInfoSet]) -> Result<()> {
        let removed: HashSet<i64> = elements
            .iter()
            .filter(|e| e.goal == Goal::Erase)
            .filter_map(|e| e.db_instance)
            .collect();

        for id in 0..elements.len() {
            self.resolve_installed(id, elements, &mut file_sets[id], &removed)?;
            self.resolve_overlapped(id, elements, file_sets);
            debug!(
                "Resolved {} {} ({} files)",
                elements[id].goal,
                elements[id].nevra(),
                file_sets[id].len()
            );
        }
        Ok(())
    }

    fn installed_package(&mut self, instance: i64) -> Result<Rc<InstalledPackage>> {
        if let Some(package) = self.installed.get(&instance) {
            return Ok(Rc::clone(package));
        }
        let package = InstalledPackage::find_by_instance(self.conn, instance)?
            .ok_or_else(|| Error::Transaction(format!("installed instance {} vanished", instance)))?;
        let package = Rc::new(package);
        self.installed.insert(instance, Rc::clone(&package));
        Ok(package)
    }

    /// Overlaps between one element and the installed database
    fn resolve_installed(
        &mut self,
        id: ElementId,
        elements: &[TransactionElement],
        set: &mut FileInfoSet,
        removed: &HashSet<i64>,
    ) -> Result<()> {
        let element = &elements[id];
        let own_instance = match element.goal {
            Goal::Erase => element.db_instance,
            Goal::Install => None,
        };
        let shared = find_installed_overlaps(self.conn, self.cache, set, own_instance, removed)?;

        for run in runs(&shared) {
            let other = self.installed_package(run[0].other_instance)?;
            let being_removed = run[0].is_removed;

            match element.goal {
                Goal::Install => self.handle_installed_files(element, set, &other, run, !being_removed),
                Goal::Erase if !being_removed => handle_removed_files(set, &other, run),
                Goal::Erase => {}
            }
        }
        Ok(())
    }

    /// An element being installed shares files with an installed package
    fn handle_installed_files(
        &mut self,
        element: &TransactionElement,
        set: &mut FileInfoSet,
        other: &InstalledPackage,
        run: &[SharedFileInfo],
        report_conflicts: bool,
    ) {
        for shared in run {
            let (file, other_file) = (shared.file, shared.other_file);
            let Some(old) = other.header.files.get(other_file) else {
                continue;
            };
            let new = &set.files[file];
            let is_config = new.flags.is_config() || old.flags.is_config();
            set.owned_before[file] = true;

            if set.actions[file].is_skip() {
                continue;
            }
            if other.file_states.get(other_file).copied().unwrap_or_default() != FileState::Normal {
                continue;
            }

            if !old.same_content(new) {
                let mut report = report_conflicts;
                if self.config.color != 0 && new.color != 0 && new.color != old.color {
                    if old.color & self.config.prefer_color != 0 {
                        // The installed file keeps the path, config or not
                        set.actions[file] = FileAction::SkipColor;
                        continue;
                    } else if new.color & self.config.prefer_color != 0 {
                        set.actions[file] = FileAction::Create;
                        report = false;
                    }
                }

                if report {
                    self.problems.push(
                        Problem::new(ProblemKind::FileConflict, element.nevra())
                            .with_alt(other.header.nevra())
                            .with_detail(set.path(file)),
                    );
                }

                if !(is_config || set.actions[file].is_skip()) && !shared.is_removed {
                    set.replaced.push(ReplacedFile {
                        instance: shared.other_instance,
                        file_index: other_file,
                    });
                }
            }

            if is_config {
                let disk_path = self.config.root_path(&set.path(file));
                set.actions[file] = decide_file_fate(&disk_path, old, &set.files[file]);
            }
            set.replaced_sizes[file] = old.size;
        }
    }

    /// Overlaps between elements of this transaction, plus disk accounting
    fn resolve_overlapped(&mut self, id: ElementId, elements: &[TransactionElement], file_sets: &mut [FileInfoSet]) {
        let goal = elements[id].goal;
        let (earlier, rest) = file_sets.split_at_mut(id);
        let set = &mut rest[0];

        for file in 0..set.len() {
            if set.actions[file].is_skip() {
                continue;
            }
            let Some(fingerprint) = set.fingerprints.get(file).cloned() else {
                continue;
            };

            let claims = self.index.claims(&fingerprint);
            let position = claims
                .iter()
                .position(|&(e, f)| e == id && f == file)
                .unwrap_or(0);

            let mut previous: Option<(ElementId, usize)> = None;
            for &(e, f) in claims[..position].iter().rev() {
                if e == id {
                    continue;
                }
                if goal == Goal::Install && elements[e].goal != Goal::Install {
                    continue;
                }
                if earlier[e].actions[f] != FileAction::Unknown {
                    previous = Some((e, f));
                    break;
                }
            }

            let mut fixup_size = 0;
            match goal {
                Goal::Install => {
                    fixup_size = self.decide_install(id, elements, earlier, set, file, previous);
                }
                Goal::Erase => self.decide_erase(earlier, set, file, previous),
            }

            let size = set.files[file].size;
            let dir = set.dirname(file).to_string();
            self.disk.update(
                self.cache,
                fingerprint.dev(),
                &dir,
                id,
                set.actions[file],
                size,
                set.replaced_sizes[file],
                fixup_size,
            );
        }
    }

    /// Install-side decision table; returns the superseded claim's size
    fn decide_install(
        &mut self,
        id: ElementId,
        elements: &[TransactionElement],
        earlier: &mut [FileInfoSet],
        set: &mut FileInfoSet,
        file: usize,
        previous: Option<(ElementId, usize)>,
    ) -> u64 {
        let path = set.path(file);
        let disk_path = self.config.root_path(&path);
        let flags = set.files[file].flags;
        let config_on_disk = || flags.is_config() && exists_on_disk(&disk_path);

        let Some((other_id, other_file)) = previous else {
            if set.actions[file] != FileAction::Unknown {
                return 0;
            }
            set.actions[file] = if config_on_disk() {
                if flags.contains(FileFlags::NOREPLACE) {
                    FileAction::AlternateName
                } else {
                    FileAction::Backup
                }
            } else {
                FileAction::Create
            };
            return 0;
        };

        let other_set = &mut earlier[other_id];
        let old = &other_set.files[other_file];
        let new = &set.files[file];
        let earlier_created = other_set.actions[other_file] == FileAction::Create;

        if old.same_content(new) {
            trace!("{} is identical in {} and {}", path, elements[other_id].nevra(), elements[id].nevra());
            set.actions[file] = FileAction::Skip;
            return 0;
        }

        if self.config.color != 0 && new.color != 0 && old.color != 0 && new.color != old.color {
            if new_color_wins(new.color, old.color, self.config.prefer_color) {
                let fixup = if earlier_created { old.size } else { 0 };
                other_set.actions[other_file] = FileAction::SkipColor;
                set.actions[file] = FileAction::Create;
                return fixup;
            }
            set.actions[file] = FileAction::SkipColor;
            return 0;
        }

        self.problems.push(
            Problem::new(ProblemKind::NewFileConflict, elements[id].nevra())
                .with_alt(elements[other_id].nevra())
                .with_detail(path.clone()),
        );

        if config_on_disk() {
            set.actions[file] = if flags.contains(FileFlags::NOREPLACE) {
                FileAction::AlternateName
            } else {
                FileAction::Skip
            };
            0
        } else {
            set.actions[file] = FileAction::Create;
            if earlier_created { old.size } else { 0 }
        }
    }

    /// Erase-side decision table
    fn decide_erase(
        &mut self,
        earlier: &mut [FileInfoSet],
        set: &mut FileInfoSet,
        file: usize,
        previous: Option<(ElementId, usize)>,
    ) {
        if let Some((other_id, other_file)) = previous {
            let other_set = &mut earlier[other_id];
            if other_set.actions[other_file] != FileAction::Erase {
                // The path now belongs to a package installed earlier in this transaction
                set.actions[file] = FileAction::Skip;
                return;
            }
            other_set.actions[other_file] = FileAction::Skip;
        }

        if set.state(file) != FileState::Normal {
            set.actions[file] = FileAction::Skip;
            return;
        }

        let record = &set.files[file];
        if !(record.is_regular() && record.flags.is_config()) {
            set.actions[file] = FileAction::Erase;
            return;
        }

        let disk_path = self.config.root_path(&set.path(file));
        set.actions[file] = match file_digest(&disk_path) {
            Ok(digest) if record.digest.as_deref() != Some(digest.as_str()) => FileAction::Backup,
            _ => FileAction::Erase,
        };
    }
}

/// An element being erased shares files with another installed package
fn handle_removed_files(set: &mut FileInfoSet, other: &InstalledPackage, run: &[SharedFileInfo]) {
    for shared in run {
        if other.file_states.get(shared.other_file).copied().unwrap_or_default() != FileState::Normal {
            continue;
        }
        set.actions[shared.file] = FileAction::Skip;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProblemFilter;
    use crate::db::schema;
    use crate::filesystem::data_digest;
    use crate::package::PackageHeader;
    use crate::transaction::diskspace::DiskSpaceInfo;
    use tempfile::{NamedTempFile, TempDir};

    struct Fixture {
        root: TempDir,
        _db: NamedTempFile,
        conn: Connection,
        config: TransactionConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            for dir in ["usr/bin", "etc", "usr/share/doc"] {
                std::fs::create_dir_all(root.path().join(dir)).unwrap();
            }
            let db = NamedTempFile::new().unwrap();
            let conn = Connection::open(db.path()).unwrap();
            schema::migrate(&conn).unwrap();
            let config = TransactionConfig::with_root(root.path());
            Self {
                root,
                _db: db,
                conn,
                config,
            }
        }

        fn write(&self, path: &str, content: &[u8]) {
            std::fs::write(self.root.path().join(path.trim_start_matches('/')), content).unwrap();
        }

        /// Resolve, returning the file sets, problems and the disk tracker
        fn resolve(&self, elements: &[TransactionElement]) -> (Vec<FileInfoSet>, ProblemSet, DiskSpaceTracker) {
            let mut cache = FingerprintCache::new(self.root.path());
            let mut sets: Vec<FileInfoSet> = elements.iter().map(FileInfoSet::for_element).collect();
            for (set, element) in sets.iter_mut().zip(elements) {
                if element.goal == Goal::Install {
                    skip_files(&self.config, set);
                }
                set.fingerprints = cache.lookup_all(&set.dirnames, &set.files);
            }

            let dev = cache.lookup("/usr/bin", "x").dev();
            let mut disk = DiskSpaceTracker::new();
            disk.insert(DiskSpaceInfo::fixed(dev, "/", 1024, 1_000_000, 1_000_000));

            let index = SharedFileIndex::build(&sets);
            let mut problems = ProblemSet::new(self.config.filter.clone());
            OverlapResolver::new(&self.conn, &self.config, &mut cache, &index, &mut problems, &mut disk)
                .resolve(elements, &mut sets)
                .unwrap();
            (sets, problems, disk)
        }
    }

    fn content(text: &str) -> FileRecord {
        FileRecord::regular(text.len() as u64, 0o644, Some(data_digest(text.as_bytes())))
    }

    fn pkg(name: &str, version: &str, files: &[(&str, FileRecord)]) -> PackageHeader {
        let mut h = PackageHeader::new(name, version, "1", "x86_64");
        for (path, record) in files {
            h.add_file(path, record.clone());
        }
        h
    }

    fn install(h: PackageHeader) -> TransactionElement {
        TransactionElement::install_header(h, None)
    }

    #[test]
    fn test_simple_install_creates() {
        let fx = Fixture::new();
        let (sets, problems, _) = fx.resolve(&[install(pkg("foo", "1.0", &[("/usr/bin/foo", content("foo"))]))]);
        assert_eq!(sets[0].actions, vec![FileAction::Create]);
        assert!(problems.is_empty());
    }

    #[test]
    fn test_identical_files_skip_and_charge_once() {
        let fx = Fixture::new();
        let shared = FileRecord::regular(2048, 0o644, Some("aa".repeat(32)));
        let (sets, problems, disk) = fx.resolve(&[
            install(pkg("a", "1", &[("/usr/share/doc/COPYING", shared.clone())])),
            install(pkg("b", "1", &[("/usr/share/doc/COPYING", shared)])),
        ]);

        assert_eq!(sets[0].actions, vec![FileAction::Create]);
        assert_eq!(sets[1].actions, vec![FileAction::Skip]);
        assert!(problems.is_empty());
        let info = &disk.entries()[0];
        assert_eq!(info.bneeded, 2);
        assert_eq!(info.ineeded, 1);
    }

    #[test]
    fn test_conflict_reported_once_and_later_wins() {
        let fx = Fixture::new();
        let (sets, problems, disk) = fx.resolve(&[
            install(pkg("a", "1", &[("/usr/bin/tool", content("from a"))])),
            install(pkg("b", "1", &[("/usr/bin/tool", content("from b, longer"))])),
        ]);

        assert_eq!(problems.count(ProblemKind::NewFileConflict), 1);
        let problem = problems.iter().next().unwrap();
        assert_eq!(problem.package, "b-1-1.x86_64");
        assert_eq!(problem.alt_package.as_deref(), Some("a-1-1.x86_64"));
        assert_eq!(sets[1].actions, vec![FileAction::Create]);
        // The superseded claim is refunded: one block charged in total
        assert_eq!(disk.entries()[0].bneeded, 1);
    }

    #[test]
    fn test_conflict_suppressed_by_filter() {
        let mut fx = Fixture::new();
        fx.config.filter = ProblemFilter {
            replace_new_files: true,
            ..ProblemFilter::default()
        };
        let (sets, problems, _) = fx.resolve(&[
            install(pkg("a", "1", &[("/usr/bin/tool", content("a"))])),
            install(pkg("b", "1", &[("/usr/bin/tool", content("b"))])),
        ]);
        assert!(problems.is_empty());
        assert_eq!(sets[1].actions, vec![FileAction::Create]);
    }

    #[test]
    fn test_color_conflict_prefers_configured_color() {
        let mut fx = Fixture::new();
        fx.config.color = 3;
        fx.config.prefer_color = 2;
        let (sets, problems, _) = fx.resolve(&[
            install(pkg("lib", "1", &[("/usr/bin/tool", content("elf64").with_color(2))])),
            install(pkg("lib32", "1", &[("/usr/bin/tool", content("elf32").with_color(1))])),
        ]);

        assert!(problems.is_empty());
        assert_eq!(sets[0].actions, vec![FileAction::Create]);
        assert_eq!(sets[1].actions, vec![FileAction::SkipColor]);
    }

    #[test]
    fn test_color_conflict_later_preferred_file_wins() {
        let mut fx = Fixture::new();
        fx.config.color = 3;
        fx.config.prefer_color = 2;
        let (sets, problems, _) = fx.resolve(&[
            install(pkg("lib32", "1", &[("/usr/bin/tool", content("elf32").with_color(1))])),
            install(pkg("lib", "1", &[("/usr/bin/tool", content("elf64").with_color(2))])),
        ]);

        assert!(problems.is_empty());
        assert_eq!(sets[0].actions, vec![FileAction::SkipColor]);
        assert_eq!(sets[1].actions, vec![FileAction::Create]);
    }

    fn colored_config(name: &str, arch: &str, text: &str, color: u32) -> PackageHeader {
        let mut h = PackageHeader::new(name, "1", "1", arch);
        h.add_file(
            "/etc/lib.conf",
            content(text).with_flags(FileFlags::CONFIG).with_color(color),
        );
        h
    }

    #[test]
    fn test_installed_preferred_color_config_is_kept() {
        let mut fx = Fixture::new();
        fx.config.color = 3;
        fx.config.prefer_color = 2;
        let mut installed = InstalledPackage::new(colored_config("lib", "x86_64", "conf64", 2), 1);
        installed.insert(&fx.conn).unwrap();
        fx.write("/etc/lib.conf", b"conf64");

        let (sets, problems, _) = fx.resolve(&[install(colored_config("lib", "i686", "conf32", 1))]);

        assert!(problems.is_empty());
        assert_eq!(sets[0].actions, vec![FileAction::SkipColor]);
        assert!(sets[0].replaced.is_empty());
    }

    #[test]
    fn test_preferred_color_config_still_saves_local_edits() {
        let mut fx = Fixture::new();
        fx.config.color = 3;
        fx.config.prefer_color = 2;
        let mut installed = InstalledPackage::new(colored_config("lib", "i686", "conf32", 1), 1);
        installed.insert(&fx.conn).unwrap();
        fx.write("/etc/lib.conf", b"edited");

        let (sets, problems, _) = fx.resolve(&[install(colored_config("lib", "x86_64", "conf64", 2))]);

        assert!(problems.is_empty());
        assert_eq!(sets[0].actions, vec![FileAction::Backup]);
    }

    #[test]
    fn test_preexisting_config_is_backed_up_or_renamed() {
        let fx = Fixture::new();
        fx.write("/etc/a.conf", b"local");
        fx.write("/etc/b.conf", b"local");
        let (sets, _, _) = fx.resolve(&[install(pkg(
            "foo",
            "1",
            &[
                ("/etc/a.conf", content("pkg").with_flags(FileFlags::CONFIG)),
                (
                    "/etc/b.conf",
                    content("pkg").with_flags(FileFlags::CONFIG | FileFlags::NOREPLACE),
                ),
                ("/etc/c.conf", content("pkg").with_flags(FileFlags::CONFIG)),
            ],
        ))]);

        assert_eq!(
            sets[0].actions,
            vec![FileAction::Backup, FileAction::AlternateName, FileAction::Create]
        );
        assert_eq!(sets[0].backup_suffix(0, Goal::Install), ".rpmorig");
    }

    #[test]
    fn test_upgrade_keeps_modified_config_and_unchanged_files() {
        let fx = Fixture::new();
        let old = pkg(
            "foo",
            "1.0",
            &[
                ("/etc/foo.conf", content("v1 conf").with_flags(FileFlags::CONFIG)),
                ("/usr/bin/foo", content("binary")),
                ("/usr/bin/foo-old", content("old only")),
            ],
        );
        let mut old_pkg = InstalledPackage::new(old, 1);
        old_pkg.insert(&fx.conn).unwrap();
        fx.write("/etc/foo.conf", b"edited by admin");
        fx.write("/usr/bin/foo", b"binary");
        fx.write("/usr/bin/foo-old", b"old only");

        let new = pkg(
            "foo",
            "2.0",
            &[
                ("/etc/foo.conf", content("v2 conf").with_flags(FileFlags::CONFIG)),
                ("/usr/bin/foo", content("binary")),
            ],
        );
        let mut erase = TransactionElement::erase(old_pkg);
        erase.upgrade_of = Some(0);
        let (sets, problems, _) = fx.resolve(&[install(new), erase]);

        assert!(problems.is_empty());
        assert_eq!(sets[0].actions, vec![FileAction::Backup, FileAction::Create]);
        assert_eq!(sets[0].backup_suffix(0, Goal::Install), ".rpmsave");
        // Being-removed owner: nothing is recorded as replaced
        assert!(sets[0].replaced.is_empty());
        assert_eq!(
            sets[1].actions,
            vec![FileAction::Skip, FileAction::Skip, FileAction::Erase]
        );
    }

    #[test]
    fn test_conflict_with_installed_file() {
        let fx = Fixture::new();
        let mut other = InstalledPackage::new(pkg("other", "1", &[("/usr/bin/tool", content("other"))]), 1);
        let instance = other.insert(&fx.conn).unwrap();

        let (sets, problems, _) = fx.resolve(&[install(pkg("new", "1", &[("/usr/bin/tool", content("new"))]))]);

        assert_eq!(problems.count(ProblemKind::FileConflict), 1);
        assert_eq!(sets[0].actions, vec![FileAction::Create]);
        assert_eq!(
            sets[0].replaced,
            vec![ReplacedFile {
                instance,
                file_index: 0
            }]
        );
        assert_eq!(sets[0].replaced_sizes, vec![5]);
    }

    #[test]
    fn test_erase_keeps_files_still_owned_elsewhere() {
        let fx = Fixture::new();
        let shared = content("shared");
        let mut a = InstalledPackage::new(pkg("a", "1", &[("/usr/bin/shared", shared.clone())]), 1);
        a.insert(&fx.conn).unwrap();
        let mut b = InstalledPackage::new(pkg("b", "1", &[("/usr/bin/shared", shared)]), 1);
        b.insert(&fx.conn).unwrap();

        let (sets, _, _) = fx.resolve(&[TransactionElement::erase(a)]);
        assert_eq!(sets[0].actions, vec![FileAction::Skip]);
    }

    #[test]
    fn test_erase_backs_up_modified_config_and_skips_non_normal() {
        let fx = Fixture::new();
        let mut installed = InstalledPackage::new(
            pkg(
                "foo",
                "1",
                &[
                    ("/etc/foo.conf", content("orig").with_flags(FileFlags::CONFIG)),
                    ("/etc/bar.conf", content("orig").with_flags(FileFlags::CONFIG)),
                    ("/usr/bin/foo", content("bin")),
                ],
            ),
            1,
        );
        installed.file_states[2] = FileState::Replaced;
        installed.insert(&fx.conn).unwrap();
        fx.write("/etc/foo.conf", b"changed");
        fx.write("/etc/bar.conf", b"orig");

        let (sets, _, _) = fx.resolve(&[TransactionElement::erase(installed)]);
        assert_eq!(
            sets[0].actions,
            vec![FileAction::Backup, FileAction::Erase, FileAction::Skip]
        );
    }

    #[test]
    fn test_exclusions_are_not_charged() {
        let mut fx = Fixture::new();
        fx.config.flags.no_docs = true;
        fx.config.netshared_paths = vec!["/usr/share/net".to_string()];
        fx.config.install_langs = Some(vec!["de".to_string()]);

        let (sets, _, disk) = fx.resolve(&[install(pkg(
            "foo",
            "1",
            &[
                ("/usr/share/doc/foo", FileRecord::directory(0o755)),
                ("/usr/share/doc/foo/README", content("doc").with_flags(FileFlags::DOC)),
                ("/usr/share/net/x", content("net")),
                ("/usr/share/locale/fr/foo.mo", content("fr").with_lang("fr")),
                ("/usr/share/locale/de/foo.mo", content("de").with_lang("de_DE")),
            ],
        ))]);

        assert_eq!(
            sets[0].actions,
            vec![
                FileAction::SkipDoc,
                FileAction::SkipDoc,
                FileAction::SkipNetShared,
                FileAction::SkipLanguage,
                FileAction::Create,
            ]
        );
        assert_eq!(disk.entries()[0].ineeded, 1);
    }

    #[test]
    fn test_nested_directories_emptied_by_exclusion() {
        let mut fx = Fixture::new();
        fx.config.flags.no_docs = true;

        let (sets, _, _) = fx.resolve(&[install(pkg(
            "foo",
            "1",
            &[
                ("/usr/share/doc/foo", FileRecord::directory(0o755)),
                ("/usr/share/doc/foo/html", FileRecord::directory(0o755)),
                ("/usr/share/doc/foo/html/index.html", content("doc").with_flags(FileFlags::DOC)),
                ("/usr/share/foo", FileRecord::directory(0o755)),
                ("/usr/share/foo/data", content("data")),
            ],
        ))]);

        assert_eq!(
            sets[0].actions,
            vec![
                FileAction::SkipDoc,
                FileAction::SkipDoc,
                FileAction::SkipDoc,
                FileAction::Create,
                FileAction::Create,
            ]
        );
    }

    #[test]
    fn test_decide_file_fate_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("x.conf");
        let old = content("old").with_flags(FileFlags::CONFIG);
        let new = content("new").with_flags(FileFlags::CONFIG);

        // Missing on disk
        assert_eq!(decide_file_fate(&path, &old, &new), FileAction::Create);
        let missing_ok = new.clone().with_flags(FileFlags::CONFIG | FileFlags::MISSINGOK);
        assert_eq!(decide_file_fate(&path, &old, &missing_ok), FileAction::Skip);

        // Unmodified since install
        std::fs::write(&path, b"old").unwrap();
        assert_eq!(decide_file_fate(&path, &old, &new), FileAction::Create);

        // Modified, but the package content did not change
        std::fs::write(&path, b"edited").unwrap();
        assert_eq!(decide_file_fate(&path, &old, &old.clone()), FileAction::Skip);

        // Modified and the package content changed
        assert_eq!(decide_file_fate(&path, &old, &new), FileAction::Backup);
        let noreplace = new.clone().with_flags(FileFlags::CONFIG | FileFlags::NOREPLACE);
        assert_eq!(decide_file_fate(&path, &old, &noreplace), FileAction::AlternateName);
    }

    #[test]
    fn test_lang_matching() {
        let langs = vec!["de".to_string()];
        assert!(lang_wanted(Some(langs.as_slice()), Some("de_DE")));
        assert!(lang_wanted(Some(langs.as_slice()), Some("de")));
        assert!(lang_wanted(Some(langs.as_slice()), Some("C")));
        assert!(!lang_wanted(Some(langs.as_slice()), Some("fr")));
        assert!(lang_wanted(None, Some("fr")));
        let all = vec!["all".to_string()];
        assert!(lang_wanted(Some(all.as_slice()), Some("fr")));
    }
}
