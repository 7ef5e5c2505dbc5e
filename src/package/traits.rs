// src/package/traits.rs

//! Common traits for package format readers

use crate::error::Result;
use crate::package::header::PackageHeader;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// One member of a package payload, positioned at its content
pub struct PayloadEntry<'a> {
    /// Absolute install path (e.g. `/usr/bin/foo`)
    pub path: String,
    pub size: u64,
    pub reader: &'a mut dyn Read,
}

/// Sequential access to a package's archived file contents
pub trait Payload {
    /// Visit every member in archive order
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(PayloadEntry<'_>) -> Result<()>,
    ) -> Result<()>;
}

/// Common interface for all package formats
pub trait PackageFormat {
    /// Parse a package file from the given path
    fn parse(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Get the validated metadata record
    fn header(&self) -> &PackageHeader;

    /// Consume the reader, keeping only the metadata record
    fn into_header(self) -> PackageHeader;

    /// Open the payload from an already-open package file
    fn open_payload(file: File) -> Result<Box<dyn Payload>>
    where
        Self: Sized;
}

/// Normalize an archive member name (`./usr/bin/foo`) to an install path
pub fn member_to_install_path(name: &str) -> String {
    let trimmed = name.trim_start_matches("./").trim_start_matches('/');
    format!("/{}", trimmed.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_to_install_path() {
        assert_eq!(member_to_install_path("./usr/bin/foo"), "/usr/bin/foo");
        assert_eq!(member_to_install_path("usr/share/doc/"), "/usr/share/doc");
        assert_eq!(member_to_install_path("/etc/foo.conf"), "/etc/foo.conf");
    }
}
