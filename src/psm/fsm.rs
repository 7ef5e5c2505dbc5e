// src/psm/fsm.rs

//! File state machine: applies decided file actions to the install root

use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::filesystem::{exists_on_disk, is_sha256_hex, with_suffix, HashingWriter};
use crate::package::{FileFlags, PackageHeader, Payload};
use crate::transaction::element::Goal;
use crate::transaction::fileinfo::{FileAction, FileInfoSet};
use nix::errno::Errno;
use nix::unistd::{geteuid, Group, User};
use std::collections::HashMap;
use std::fs::{self, Permissions};
use std::io::{self, Read};
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SETID_BITS: u32 = 0o6000;

fn lookup_user(name: &str) -> Option<u32> {
    if name == "root" {
        return Some(0);
    }
    User::from_name(name).ok().flatten().map(|user| user.uid.as_raw())
}

fn lookup_group(name: &str) -> Option<u32> {
    if name == "root" {
        return Some(0);
    }
    Group::from_name(name).ok().flatten().map(|group| group.gid.as_raw())
}

/// Resolve user and group names to ids
///
/// Unknown names fall back to root, and the file loses its set-id bits.
pub fn remap_owners(set: &mut FileInfoSet) {
    let mut users: HashMap<String, Option<u32>> = HashMap::new();
    let mut groups: HashMap<String, Option<u32>> = HashMap::new();
    let mut owners = Vec::with_capacity(set.len());

    for index in 0..set.len() {
        let path = set.path(index);
        let file = &mut set.files[index];

        let uid = *users.entry(file.user.clone()).or_insert_with(|| lookup_user(&file.user));
        let gid = *groups.entry(file.group.clone()).or_insert_with(|| lookup_group(&file.group));

        if uid.is_none() {
            warn!("user {} does not exist - using root for {}", file.user, path);
        }
        if gid.is_none() {
            warn!("group {} does not exist - using root for {}", file.group, path);
        }
        if (uid.is_none() || gid.is_none()) && file.mode & SETID_BITS != 0 {
            file.mode &= !SETID_BITS;
        }
        owners.push((uid.unwrap_or(0), gid.unwrap_or(0)));
    }

    set.owners = owners;
}

fn chown(path: &Path, owner: (u32, u32)) -> io::Result<()> {
    if !geteuid().is_root() {
        return Ok(());
    }
    std::os::unix::fs::lchown(path, Some(owner.0), Some(owner.1))
}

/// Something to put back if extraction fails part way
#[derive(Debug)]
enum Undo {
    Created(PathBuf),
    Restore { backup: PathBuf, original: PathBuf },
}

/// Writes one package's files beneath the root
pub struct FileInstaller<'a> {
    config: &'a TransactionConfig,
    /// Header with the paths the payload is stored under
    header: &'a PackageHeader,
    set: &'a FileInfoSet,
    undo: Vec<Undo>,
}

impl<'a> FileInstaller<'a> {
    pub fn new(config: &'a TransactionConfig, header: &'a PackageHeader, set: &'a FileInfoSet) -> Self {
        Self {
            config,
            header,
            set,
            undo: Vec::new(),
        }
    }

    fn owner(&self, index: usize) -> (u32, u32) {
        self.set.owners.get(index).copied().unwrap_or((0, 0))
    }

    fn destination(&self, index: usize) -> PathBuf {
        self.config.root_path(&self.set.path(index))
    }

    fn wanted(&self, index: usize) -> bool {
        self.set.actions[index].writes() && !self.set.files[index].flags.contains(FileFlags::GHOST)
    }

    /// Bytes of regular file content this install writes
    pub fn total_size(&self) -> u64 {
        (0..self.set.len())
            .filter(|&i| self.wanted(i) && self.set.files[i].is_regular())
            .map(|i| self.set.files[i].size)
            .sum()
    }

    /// Extract the payload; on failure everything written so far is undone
    pub fn install(&mut self, payload: &mut dyn Payload, progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
        let result = self.extract(payload, progress);
        if result.is_err() {
            self.undo();
        }
        result
    }

    fn extract(&mut self, payload: &mut dyn Payload, progress: &mut dyn FnMut(u64, u64)) -> Result<()> {
        let total = self.total_size();
        let by_path: HashMap<String, usize> = (0..self.header.files.len())
            .map(|i| (self.header.file_path(i), i))
            .collect();

        for index in 0..self.set.len() {
            if self.wanted(index) && self.set.files[index].is_dir() {
                self.make_dir(index)?;
            }
        }
        for index in 0..self.set.len() {
            if self.wanted(index) && self.set.files[index].is_symlink() {
                self.make_symlink(index)?;
            }
        }

        let mut seen = vec![false; self.set.len()];
        let mut written = 0u64;
        payload.for_each_entry(&mut |entry| {
            let Some(&index) = by_path.get(&entry.path) else {
                debug!("Payload member {} is not in the file list", entry.path);
                io::copy(entry.reader, &mut io::sink())?;
                return Ok(());
            };
            seen[index] = true;

            if !self.wanted(index) || !self.set.files[index].is_regular() {
                io::copy(entry.reader, &mut io::sink())?;
                return Ok(());
            }

            self.write_regular(index, entry.reader)?;
            written += self.set.files[index].size;
            progress(written, total);
            Ok(())
        })?;

        for index in 0..self.set.len() {
            if self.wanted(index) && self.set.files[index].is_regular() && !seen[index] {
                return Err(Error::archive(self.set.path(index), "missing from payload"));
            }
        }

        // Directory modes last, so read-only directories can still be filled
        for index in 0..self.set.len() {
            if self.wanted(index) && self.set.files[index].is_dir() {
                let path = self.destination(index);
                fs::set_permissions(&path, Permissions::from_mode(self.set.files[index].permissions()))?;
            }
        }

        Ok(())
    }

    fn make_dir(&mut self, index: usize) -> Result<()> {
        let path = self.destination(index);
        if path.is_dir() {
            return Ok(());
        }
        if exists_on_disk(&path) {
            self.save_existing(index, &path)?;
        }
        fs::create_dir_all(&path)?;
        chown(&path, self.owner(index))?;
        self.undo.push(Undo::Created(path));
        Ok(())
    }

    fn make_symlink(&mut self, index: usize) -> Result<()> {
        let set = self.set;
        let Some(target) = set.files[index].link_to.as_deref() else {
            return Err(Error::archive(set.path(index), "symlink without target"));
        };
        let path = self.destination(index);
        let path = match set.actions[index] {
            FileAction::AlternateName => with_suffix(&path, ".rpmnew"),
            _ => path,
        };
        ensure_parent(&path)?;

        if exists_on_disk(&path) {
            if path.is_dir() && !path.is_symlink() {
                return Err(Error::archive(set.path(index), "a directory is in the way"));
            }
            if set.actions[index] == FileAction::Backup {
                self.save_existing(index, &path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }

        symlink(target, &path)?;
        chown(&path, self.owner(index))?;
        self.undo.push(Undo::Created(path));
        Ok(())
    }

    fn write_regular(&mut self, index: usize, reader: &mut dyn Read) -> Result<()> {
        let set = self.set;
        let record = &set.files[index];
        let install_path = set.path(index);
        let destination = self.destination(index);
        let target = match set.actions[index] {
            FileAction::AlternateName => with_suffix(&destination, ".rpmnew"),
            _ => destination.clone(),
        };
        let parent = ensure_parent(&target)?;

        let mut temp = tempfile::Builder::new().prefix(".pkgtx").tempfile_in(&parent)?;
        let mut writer = HashingWriter::new(temp.as_file_mut());
        io::copy(reader, &mut writer).map_err(|e| Error::archive(&install_path, e.to_string()))?;
        let (_, digest) = writer.finish();

        if let Some(expected) = record.digest.as_deref().filter(|d| is_sha256_hex(d)) {
            if expected != digest {
                return Err(Error::archive(&install_path, "digest mismatch"));
            }
        }

        temp.as_file()
            .set_permissions(Permissions::from_mode(record.permissions()))?;
        chown(temp.path(), self.owner(index))?;

        if set.actions[index] == FileAction::Backup && exists_on_disk(&destination) {
            self.save_existing(index, &destination)?;
        }

        let existed = exists_on_disk(&target);
        temp.persist(&target).map_err(|e| Error::Io(e.error))?;
        if !existed {
            self.undo.push(Undo::Created(target.clone()));
        }
        if set.actions[index] == FileAction::AlternateName {
            warn!("{} created as {}", install_path, target.display());
        }
        Ok(())
    }

    /// Rename whatever is at `path` to its backup name
    fn save_existing(&mut self, index: usize, path: &Path) -> Result<()> {
        let backup = with_suffix(path, self.set.backup_suffix(index, Goal::Install));
        fs::rename(path, &backup)?;
        warn!("{} saved as {}", self.set.path(index), backup.display());
        self.undo.push(Undo::Restore {
            backup,
            original: path.to_path_buf(),
        });
        Ok(())
    }

    fn undo(&mut self) {
        while let Some(step) = self.undo.pop() {
            let outcome = match &step {
                Undo::Created(path) if path.is_dir() && !path.is_symlink() => fs::remove_dir(path),
                Undo::Created(path) => fs::remove_file(path),
                Undo::Restore { backup, original } => fs::rename(backup, original),
            };
            if let Err(e) = outcome {
                warn!("Cannot undo {:?}: {}", step, e);
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::archive(path.display().to_string(), "no parent directory"))?;
    if !parent.is_dir() {
        fs::create_dir_all(&parent)?;
    }
    Ok(parent)
}

/// Remove an erased package's files, last first
///
/// Failures are warnings: a half-removed package must still leave the
/// database.
pub fn erase_files(config: &TransactionConfig, set: &FileInfoSet, progress: &mut dyn FnMut(u64, u64)) {
    let total = set.len() as u64;

    for index in (0..set.len()).rev() {
        progress(total - index as u64, total);
        let action = set.actions[index];
        if action != FileAction::Erase && action != FileAction::Backup {
            continue;
        }

        let path = config.root_path(&set.path(index));
        if action == FileAction::Backup {
            let backup = with_suffix(&path, set.backup_suffix(index, Goal::Erase));
            match fs::rename(&path, &backup) {
                Ok(()) => warn!("{} saved as {}", set.path(index), backup.display()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Cannot save {}: {}", path.display(), e),
            }
            continue;
        }

        let outcome = if set.files[index].is_dir() {
            fs::remove_dir(&path)
        } else {
            fs::remove_file(&path)
        };
        match outcome {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if matches!(e.raw_os_error().map(Errno::from_raw), Some(Errno::ENOTEMPTY | Errno::EEXIST)) => {
                debug!("Keeping non-empty directory {}", path.display())
            }
            Err(e) => warn!("Cannot remove {}: {}", path.display(), e),
        }
    }
}
