// src/package/mod.rs

//! Package metadata records and package file readers
//!
//! The transaction engine only ever sees `PackageHeader` records and
//! `Payload` streams; this module turns package files (RPM or the native
//! tar-based format) into those.

pub mod cpio;
pub mod header;
pub mod native;
pub mod rpm;
pub mod traits;

pub use header::{
    split_path, Dependency, FileFlags, FileRecord, FileState, PackageHeader, Scriptlet,
    ScriptletKind, Trigger, TriggerSense,
};
pub use traits::{PackageFormat, Payload, PayloadEntry};

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Package file formats understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormatType {
    Rpm,
    Native,
}

const RPM_MAGIC: [u8; 4] = [0xED, 0xAB, 0xEE, 0xDB];

/// Detect package format from magic bytes, leaving the file at offset 0
pub fn detect_format(file: &mut File) -> Result<PackageFormatType> {
    let mut magic = [0u8; 4];
    let read = file.read(&mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    if read == 4 && magic == RPM_MAGIC {
        Ok(PackageFormatType::Rpm)
    } else {
        Ok(PackageFormatType::Native)
    }
}

/// Read the metadata record of a package file of either format
pub fn read_header(path: &Path) -> Result<PackageHeader> {
    let mut file = File::open(path)
        .map_err(|e| Error::PackageFormat(format!("Failed to open {}: {}", path.display(), e)))?;

    match detect_format(&mut file)? {
        PackageFormatType::Rpm => Ok(rpm::RpmPackage::parse(path)?.into_header()),
        PackageFormatType::Native => Ok(native::NativePackage::parse(path)?.into_header()),
    }
}

/// Open the payload of an already-open package file
pub fn open_payload(mut file: File) -> Result<Box<dyn Payload>> {
    match detect_format(&mut file)? {
        PackageFormatType::Rpm => rpm::RpmPackage::open_payload(file),
        PackageFormatType::Native => native::NativePackage::open_payload(file),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_detect_format_from_rpm_magic_bytes() {
        let temp_file = NamedTempFile::with_suffix(".unknown").unwrap();
        std::fs::write(temp_file.path(), [0xED, 0xAB, 0xEE, 0xDB, 0, 0, 0, 0]).unwrap();

        let mut file = File::open(temp_file.path()).unwrap();
        assert_eq!(detect_format(&mut file).unwrap(), PackageFormatType::Rpm);
    }

    #[test]
    fn test_detect_format_defaults_to_native() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), [0x28, 0xB5, 0x2F, 0xFD, 0, 0, 0, 0]).unwrap();

        let mut file = File::open(temp_file.path()).unwrap();
        assert_eq!(detect_format(&mut file).unwrap(), PackageFormatType::Native);
    }

    #[test]
    fn test_read_header_of_garbage_fails() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(temp_file.path(), b"not a package at all").unwrap();
        assert!(read_header(temp_file.path()).is_err());
    }
}
