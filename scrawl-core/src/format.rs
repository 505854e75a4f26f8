//! On-disk document format.
//!
//! ```text
//! 2\n
//! [{"items":[{"kind":"Stroke","coords":[...],...}]}, ...]
//! ```
//!
//! The first line is the format version, the rest is the page list as JSON.

use std::io::{BufRead, Write};

use thiserror::Error;

use crate::document::Page;

/// Version written by this build.
pub const FORMAT_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing version header")]
    MissingVersion,
    #[error("unsupported format version {0:?}")]
    UnsupportedVersion(String),
    #[error("malformed page list: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write a page list in the current format.
pub fn write_pages<W: Write>(mut out: W, pages: &[Page]) -> Result<(), FormatError> {
    writeln!(out, "{FORMAT_VERSION}")?;
    serde_json::to_writer(&mut out, pages)?;
    out.flush()?;
    Ok(())
}

/// Encode a page list into a byte buffer.
pub fn encode_pages(pages: &[Page]) -> Result<Vec<u8>, FormatError> {
    let mut buf = Vec::new();
    write_pages(&mut buf, pages)?;
    Ok(buf)
}

/// Read a page list, rejecting any version but the current one.
pub fn read_pages<R: BufRead>(mut input: R) -> Result<Vec<Page>, FormatError> {
    let mut header = String::new();
    if input.read_line(&mut header)? == 0 {
        return Err(FormatError::MissingVersion);
    }
    let version = header.trim();
    if version.parse::<u32>().ok() != Some(FORMAT_VERSION) {
        return Err(FormatError::UnsupportedVersion(version.to_string()));
    }
    Ok(serde_json::from_reader(input)?)
}

pub fn decode_pages(bytes: &[u8]) -> Result<Vec<Page>, FormatError> {
    read_pages(bytes)
}
