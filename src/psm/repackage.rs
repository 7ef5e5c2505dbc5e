// src/psm/repackage.rs

//! Repackaging: capture an installed instance as a native package before
//! it is erased, so a failed transaction can put it back

use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::filesystem::{file_digest, FileKind};
use crate::package::native::NativeWriter;
use crate::package::{FileFlags, FileState, PackageHeader};
use std::fs::{self, File};
use std::path::PathBuf;
use tracing::{debug, info};

/// File name a repackaged instance is written under
pub fn package_file_name(header: &PackageHeader) -> String {
    format!("{}.pkg.tar.zst", header.nevra())
}

/// Write `header` plus the current on-disk content of its files
///
/// Records are refreshed from disk (size and digest), so a rollback
/// reinstalls what was actually there. Files that are absent, or that this
/// instance did not put on disk, become ghosts.
pub fn repackage(
    config: &TransactionConfig,
    header: &PackageHeader,
    states: &[FileState],
    progress: &mut dyn FnMut(u64, u64),
) -> Result<PathBuf> {
    let dir = config.repackage_path();
    fs::create_dir_all(&dir)?;
    let target = dir.join(package_file_name(header));

    let mut header = header.clone();
    header.install_time = None;
    let mut members = Vec::new();

    for index in 0..header.files.len() {
        let path = header.file_path(index);
        let on_disk = config.root_path(&path);
        let state = states.get(index).copied().unwrap_or_default();
        let record = &mut header.files[index];

        if !record.is_regular() || record.flags.contains(FileFlags::GHOST) {
            continue;
        }
        if state != FileState::Normal || FileKind::on_disk(&on_disk) != Some(FileKind::Regular) {
            debug!("{} is not on disk, repackaged as a ghost", path);
            record.flags = record.flags | FileFlags::GHOST;
            continue;
        }

        record.size = fs::metadata(&on_disk)?.len();
        record.digest = Some(file_digest(&on_disk)?);
        members.push((path, on_disk, record.permissions(), record.size));
    }

    let temp = tempfile::Builder::new()
        .prefix(".repackage")
        .tempfile_in(&dir)?;
    let mut writer = NativeWriter::create(temp.path(), &header)?;
    let total = members.len() as u64;
    for (done, (path, on_disk, mode, size)) in members.iter().enumerate() {
        writer.append_file(path, *mode, *size, File::open(on_disk)?)?;
        progress(done as u64 + 1, total);
    }
    writer.finish()?;

    temp.persist(&target)
        .map_err(|e| Error::Rollback(format!("cannot store {}: {}", target.display(), e.error)))?;
    info!("Repackaged {} to {}", header.nevra(), target.display());
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::data_digest;
    use crate::package::native::NativePackage;
    use crate::package::{FileRecord, PackageFormat};
    use tempfile::TempDir;

    #[test]
    fn test_repackage_captures_current_content() {
        let root = TempDir::new().unwrap();
        let config = TransactionConfig::with_root(root.path());
        fs::create_dir_all(root.path().join("etc")).unwrap();
        fs::write(root.path().join("etc/foo.conf"), b"edited locally\n").unwrap();

        let mut header = PackageHeader::new("foo", "1.0", "1", "noarch");
        header.add_file("/etc", FileRecord::directory(0o755));
        header.add_file("/etc/foo.conf", FileRecord::regular(4, 0o644, Some(data_digest(b"old\n"))));
        header.add_file("/etc/gone", FileRecord::regular(4, 0o644, None));
        let states = vec![FileState::Normal; 3];

        let path = repackage(&config, &header, &states, &mut |_, _| {}).unwrap();
        assert_eq!(path, config.repackage_path().join("foo-1.0-1.noarch.pkg.tar.zst"));

        let parsed = NativePackage::parse(&path).unwrap();
        let files = &parsed.header().files;
        assert_eq!(files[1].size, 15);
        assert_eq!(files[1].digest.as_deref(), Some(data_digest(b"edited locally\n").as_str()));
        assert!(files[2].flags.contains(FileFlags::GHOST));
    }
}
