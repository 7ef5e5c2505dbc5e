// src/package/native.rs

//! Native package format
//!
//! A native package is a tar stream, optionally compressed with zstd, xz or
//! gzip (detected from magic bytes), whose first member `.PKGINFO` holds the
//! JSON-encoded `PackageHeader`. All remaining members are payload, stored
//! under their install path relative to `/`.

use crate::error::{Error, Result};
use crate::package::header::PackageHeader;
use crate::package::traits::{member_to_install_path, PackageFormat, Payload, PayloadEntry};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::debug;
use xz2::read::XzDecoder;

/// Name of the metadata member
pub const PKGINFO: &str = ".PKGINFO";

/// Stream compression of a native package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Zstd,
    Xz,
    Gzip,
    None,
}

impl Compression {
    /// Detect compression from the leading bytes of a file
    pub fn detect(magic: &[u8]) -> Self {
        if magic.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
            Compression::Zstd
        } else if magic.starts_with(&[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00]) {
            Compression::Xz
        } else if magic.starts_with(&[0x1F, 0x8B]) {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

/// Wrap a buffered reader in the decoder its magic bytes call for
pub fn decompress<R: BufRead + 'static>(mut reader: R) -> Result<Box<dyn Read>> {
    let magic = {
        let buf = reader.fill_buf()?;
        buf[..buf.len().min(6)].to_vec()
    };

    let reader: Box<dyn Read> = match Compression::detect(&magic) {
        Compression::Zstd => Box::new(
            zstd::Decoder::new(reader)
                .map_err(|e| Error::PackageFormat(format!("Failed to create zstd decoder: {}", e)))?,
        ),
        Compression::Xz => Box::new(XzDecoder::new(reader)),
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::None => Box::new(reader),
    };

    Ok(reader)
}

fn open_archive(file: File) -> Result<Archive<Box<dyn Read>>> {
    Ok(Archive::new(decompress(BufReader::new(file))?))
}

/// Native package representation
pub struct NativePackage {
    package_path: PathBuf,
    header: PackageHeader,
}

impl NativePackage {
    pub fn path(&self) -> &Path {
        &self.package_path
    }
}

impl PackageFormat for NativePackage {
    fn parse(path: &Path) -> Result<Self> {
        debug!("Parsing native package: {}", path.display());

        let file = File::open(path)
            .map_err(|e| Error::PackageFormat(format!("Failed to open package file: {}", e)))?;
        let mut archive = open_archive(file)?;

        let mut entries = archive
            .entries()
            .map_err(|e| Error::PackageFormat(format!("Failed to read archive entries: {}", e)))?;

        let mut first = entries
            .next()
            .ok_or_else(|| Error::PackageFormat(format!("{} is empty", path.display())))?
            .map_err(|e| Error::PackageFormat(format!("Failed to read archive entry: {}", e)))?;

        let name = first
            .path()
            .map_err(|e| Error::PackageFormat(format!("Failed to get entry path: {}", e)))?
            .to_string_lossy()
            .to_string();
        if name.trim_start_matches("./") != PKGINFO {
            return Err(Error::PackageFormat(format!(
                "{} does not start with {}",
                path.display(),
                PKGINFO
            )));
        }

        let mut content = String::new();
        first
            .read_to_string(&mut content)
            .map_err(|e| Error::PackageFormat(format!("Failed to read {}: {}", PKGINFO, e)))?;
        let header: PackageHeader = serde_json::from_str(&content)?;
        header.validate()?;

        debug!(
            "Parsed native package: {} ({} files)",
            header.nevra(),
            header.files.len()
        );

        Ok(Self {
            package_path: path.to_path_buf(),
            header,
        })
    }

    fn header(&self) -> &PackageHeader {
        &self.header
    }

    fn into_header(self) -> PackageHeader {
        self.header
    }

    fn open_payload(file: File) -> Result<Box<dyn Payload>> {
        Ok(Box::new(NativePayload {
            archive: open_archive(file)?,
        }))
    }
}

/// Payload reader over a native package's tar members
pub struct NativePayload {
    archive: Archive<Box<dyn Read>>,
}

impl Payload for NativePayload {
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(PayloadEntry<'_>) -> Result<()>,
    ) -> Result<()> {
        let entries = self
            .archive
            .entries()
            .map_err(|e| Error::archive("payload", e.to_string()))?;

        for entry in entries {
            let mut entry = entry.map_err(|e| Error::archive("payload", e.to_string()))?;
            let name = entry
                .path()
                .map_err(|e| Error::archive("payload", e.to_string()))?
                .to_string_lossy()
                .to_string();

            if name.trim_start_matches("./") == PKGINFO {
                continue;
            }
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let size = entry
                .header()
                .size()
                .map_err(|e| Error::archive(&name, e.to_string()))?;

            visit(PayloadEntry {
                path: member_to_install_path(&name),
                size,
                reader: &mut entry,
            })?;
        }

        Ok(())
    }
}

/// Streaming writer for native packages (zstd compressed)
pub struct NativeWriter {
    builder: tar::Builder<zstd::Encoder<'static, File>>,
}

impl NativeWriter {
    /// Create the package file and write its metadata member
    pub fn create(path: &Path, header: &PackageHeader) -> Result<Self> {
        let file = File::create(path)?;
        let encoder = zstd::Encoder::new(file, 3)?;
        let mut writer = Self {
            builder: tar::Builder::new(encoder),
        };

        let json = serde_json::to_vec_pretty(header)?;
        writer.append_member(PKGINFO, 0o644, json.len() as u64, &json[..])?;
        Ok(writer)
    }

    /// Append file content under its install path
    pub fn append_file(&mut self, install_path: &str, mode: u32, size: u64, reader: impl Read) -> Result<()> {
        let member = format!("./{}", install_path.trim_start_matches('/'));
        self.append_member(&member, mode, size, reader)
    }

    pub fn append_data(&mut self, install_path: &str, mode: u32, data: &[u8]) -> Result<()> {
        self.append_file(install_path, mode, data.len() as u64, data)
    }

    fn append_member(&mut self, member: &str, mode: u32, size: u64, reader: impl Read) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(size);
        header.set_mode(mode & 0o7777);
        header.set_mtime(0);
        self.builder
            .append_data(&mut header, member, reader)
            .map_err(|e| Error::archive(member, e.to_string()))?;
        Ok(())
    }

    /// Flush the archive and the compressor
    pub fn finish(self) -> Result<()> {
        let encoder = self.builder.into_inner()?;
        encoder.finish()?;
        Ok(())
    }
}
