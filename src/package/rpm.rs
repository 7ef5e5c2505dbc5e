// src/package/rpm.rs

//! RPM package format reader
//!
//! Converts an RPM header into a `PackageHeader` and exposes the payload
//! (a compressed `newc` cpio archive) through `CpioPayload`.

use crate::error::{Error, Result};
use crate::package::cpio::CpioPayload;
use crate::package::header::{Dependency, FileFlags, FileRecord, PackageHeader};
use crate::package::native::decompress;
use crate::package::traits::{PackageFormat, Payload};
use crate::version::DepFlags;
use rpm::Package;
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use tracing::debug;

/// Sense bits shared by RPM dependency flags and `DepFlags`
const SENSE_MASK: u32 = 0x0e;

/// RPM package representation
pub struct RpmPackage {
    header: PackageHeader,
}

impl RpmPackage {
    fn read(path: &Path) -> Result<Package> {
        let file = File::open(path)
            .map_err(|e| Error::PackageFormat(format!("Failed to open RPM file: {}", e)))?;
        let mut buf_reader = BufReader::new(file);
        Package::parse(&mut buf_reader)
            .map_err(|e| Error::PackageFormat(format!("Failed to parse RPM: {}", e)))
    }

    /// Fill the header's file list from the RPM file entries
    fn extract_files(pkg: &Package, header: &mut PackageHeader) {
        if let Ok(file_entries) = pkg.metadata.get_file_entries() {
            for entry in file_entries {
                let digest = entry.digest.as_ref().map(|d| format!("{}", d));
                let mut record = FileRecord::regular(entry.size as u64, 0, digest);
                record.mode = entry.mode.raw_mode() as u32;
                record.flags = FileFlags(entry.flags.bits() as u32);
                record.user = entry.ownership.user.clone();
                record.group = entry.ownership.group.clone();
                if !entry.linkto.is_empty() {
                    record.link_to = Some(entry.linkto.clone());
                }

                header.add_file(&entry.path.to_string_lossy(), record);
            }
        }
    }

    fn convert_dependency(name: &str, flags: u32, version: &str) -> Dependency {
        Dependency {
            name: name.to_string(),
            flags: DepFlags((flags & SENSE_MASK) as u8),
            version: if version.is_empty() {
                None
            } else {
                Some(version.to_string())
            },
        }
    }

    fn extract_dependencies(pkg: &Package, header: &mut PackageHeader) {
        if let Ok(provides) = pkg.metadata.get_provides() {
            for p in provides {
                header
                    .provides
                    .push(Self::convert_dependency(&p.name, p.flags.bits() as u32, &p.version));
            }
        }

        if let Ok(requires) = pkg.metadata.get_requires() {
            for req in requires {
                // Skip rpmlib dependencies
                if req.name.starts_with("rpmlib(") {
                    continue;
                }
                header
                    .requires
                    .push(Self::convert_dependency(&req.name, req.flags.bits() as u32, &req.version));
            }
        }
    }
}

impl PackageFormat for RpmPackage {
    fn parse(path: &Path) -> Result<Self> {
        debug!("Parsing RPM package: {}", path.display());

        let pkg = Self::read(path)?;

        let name = pkg
            .metadata
            .get_name()
            .map_err(|e| Error::PackageFormat(format!("Failed to get package name: {}", e)))?
            .to_string();
        let version = pkg
            .metadata
            .get_version()
            .map_err(|e| Error::PackageFormat(format!("Failed to get package version: {}", e)))?
            .to_string();
        let release = pkg
            .metadata
            .get_release()
            .map_err(|e| Error::PackageFormat(format!("Failed to get package release: {}", e)))?
            .to_string();
        let arch = pkg
            .metadata
            .get_arch()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "noarch".to_string());

        let mut header = PackageHeader::new(name, version, release, arch);
        header.epoch = pkg.metadata.get_epoch().ok();
        header.summary = pkg.metadata.get_description().ok().map(|s| s.to_string());

        Self::extract_files(&pkg, &mut header);
        Self::extract_dependencies(&pkg, &mut header);
        header.validate()?;

        debug!(
            "Parsed RPM: {} ({} files, {} provides, {} requires)",
            header.nevra(),
            header.files.len(),
            header.provides.len(),
            header.requires.len()
        );

        Ok(Self { header })
    }

    fn header(&self) -> &PackageHeader {
        &self.header
    }

    fn into_header(self) -> PackageHeader {
        self.header
    }

    fn open_payload(file: File) -> Result<Box<dyn Payload>> {
        let mut buf_reader = BufReader::new(file);
        let pkg = Package::parse(&mut buf_reader)
            .map_err(|e| Error::PackageFormat(format!("Failed to parse RPM: {}", e)))?;

        let reader = decompress(Cursor::new(pkg.content))?;
        Ok(Box::new(CpioPayload::new(reader)))
    }
}
