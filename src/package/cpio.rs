// src/package/cpio.rs

//! Reader for the SVR4 `newc` cpio archives used as RPM payloads

use crate::error::{Error, Result};
use crate::package::traits::{member_to_install_path, Payload, PayloadEntry};
use std::io::{self, Read};

const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";
const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

/// Parsed fixed-width header of one member
#[derive(Debug)]
struct CpioHeader {
    mode: u32,
    file_size: u64,
    name_size: usize,
}

impl CpioHeader {
    fn parse(raw: &[u8; HEADER_LEN]) -> Result<Self> {
        let magic = &raw[..6];
        if magic != b"070701" && magic != b"070702" {
            return Err(Error::archive(
                "payload",
                format!("bad cpio magic {:?}", String::from_utf8_lossy(magic)),
            ));
        }

        let field = |index: usize| -> Result<u64> {
            let start = 6 + index * 8;
            let text = std::str::from_utf8(&raw[start..start + 8])
                .map_err(|_| Error::archive("payload", "non-ascii cpio header"))?;
            u64::from_str_radix(text, 16)
                .map_err(|_| Error::archive("payload", format!("bad cpio field {:?}", text)))
        };

        Ok(Self {
            mode: field(1)? as u32,
            file_size: field(6)?,
            name_size: field(11)? as usize,
        })
    }
}

fn pad4(n: usize) -> usize {
    (4 - (n % 4)) % 4
}

fn skip(reader: &mut dyn Read, n: u64) -> io::Result<()> {
    io::copy(&mut reader.take(n), &mut io::sink())?;
    Ok(())
}

/// Streaming cpio payload
pub struct CpioPayload {
    reader: Box<dyn Read>,
}

impl CpioPayload {
    pub fn new(reader: Box<dyn Read>) -> Self {
        Self { reader }
    }
}

impl Payload for CpioPayload {
    fn for_each_entry(
        &mut self,
        visit: &mut dyn FnMut(PayloadEntry<'_>) -> Result<()>,
    ) -> Result<()> {
        loop {
            let mut raw = [0u8; HEADER_LEN];
            self.reader
                .read_exact(&mut raw)
                .map_err(|e| Error::archive("payload", format!("truncated cpio header: {}", e)))?;
            let header = CpioHeader::parse(&raw)?;

            let mut name = vec![0u8; header.name_size];
            self.reader
                .read_exact(&mut name)
                .map_err(|e| Error::archive("payload", format!("truncated cpio name: {}", e)))?;
            skip(&mut *self.reader, pad4(HEADER_LEN + header.name_size) as u64)?;

            let name = String::from_utf8_lossy(&name)
                .trim_end_matches('\0')
                .to_string();
            if name == TRAILER {
                return Ok(());
            }

            let path = member_to_install_path(&name);
            let mut limited = (&mut *self.reader).take(header.file_size);
            if header.mode & S_IFMT == S_IFREG {
                visit(PayloadEntry {
                    path: path.clone(),
                    size: header.file_size,
                    reader: &mut limited,
                })?;
            }
            // Drain whatever the visitor did not consume
            io::copy(&mut limited, &mut io::sink())
                .map_err(|e| Error::archive(&path, e.to_string()))?;

            skip(&mut *self.reader, pad4(header.file_size as usize) as u64)?;
        }
    }
}
