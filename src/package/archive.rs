// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! tar.gz assembly helpers.
//!
//! Entries are named `./{file}` and stamped with the run's `until` as mtime, so
//! two archives of the same window differ only in content.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use crate::error::ArchiveError;

/// Archive member name for a file at the archive root.
pub fn entry_name(filename: &str) -> String {
    format!("./{}", filename)
}

/// Width of the v7 `name` field.
const NAME_FIELD_LEN: usize = 100;

/// Member name GNU tar gives the entry carrying an overlong path.
const GNU_LONG_LINK: &[u8] = b"././@LongLink";

fn raw_header(name: &[u8], size: u64, mtime: DateTime<Utc>, entry_type: EntryType) -> Header {
    let mut header = Header::new_gnu();
    {
        // Written raw: the path setters normalize away the leading "./"
        let field = &mut header.as_old_mut().name;
        let len = name.len().min(field.len() - 1);
        field[..len].copy_from_slice(&name[..len]);
    }
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime.timestamp().max(0) as u64);
    header.set_entry_type(entry_type);
    header.set_cksum();
    header
}

/// Write `name`'s header(s) followed by `size` bytes of `data`.
///
/// Names that do not fit the `name` field are preceded by a GNU long-name
/// entry, which readers join back onto the following header.
fn append_entry<W: Write, R: Read>(
    builder: &mut Builder<W>,
    name: &str,
    size: u64,
    mtime: DateTime<Utc>,
    data: R,
) -> Result<(), ArchiveError> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.contains(&0) {
        return Err(ArchiveError::EntryName(name.to_string()));
    }
    if bytes.len() >= NAME_FIELD_LEN {
        let mut long = Vec::with_capacity(bytes.len() + 1);
        long.extend_from_slice(bytes);
        long.push(0);
        let header = raw_header(GNU_LONG_LINK, long.len() as u64, mtime, EntryType::GNULongName);
        builder.append(&header, long.as_slice())?;
    }
    let header = raw_header(bytes, size, mtime, EntryType::Regular);
    builder.append(&header, data)?;
    Ok(())
}

/// Append an in-memory entry.
pub fn append_bytes<W: Write>(
    builder: &mut Builder<W>,
    name: &str,
    data: &[u8],
    mtime: DateTime<Utc>,
) -> Result<(), ArchiveError> {
    append_entry(builder, name, data.len() as u64, mtime, data)
}

/// Append a file from disk.
pub fn append_file<W: Write>(
    builder: &mut Builder<W>,
    name: &str,
    path: &Path,
    mtime: DateTime<Utc>,
) -> Result<(), ArchiveError> {
    let file = File::open(path)?;
    let size = file.metadata()?.len();
    // Bound the read to the size recorded in the header
    append_entry(builder, name, size, mtime, file.take(size))
}

/// `{prefix}-{until:%Y-%m-%d-%H%M%S%z}`, shared by all archives of one run.
pub fn tarname_base(prefix: &str, until: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, until.format("%Y-%m-%d-%H%M%S%z"))
}

/// Next free `{base}-{index}.tar.gz` in `dir`.
///
/// The index starts at the number of files already named `{base}-*` and skips
/// any name that exists, so indexes are never reused within a destination.
pub fn next_archive_path(dir: &Path, base: &str) -> io::Result<PathBuf> {
    let marker = format!("{}-", base);
    let mut index = 0usize;
    for entry in fs::read_dir(dir)? {
        if entry?.file_name().to_string_lossy().starts_with(&marker) {
            index += 1;
        }
    }
    loop {
        let path = dir.join(format!("{}-{}.tar.gz", base, index));
        if !path.exists() {
            return Ok(path);
        }
        index += 1;
    }
}

/// gzip-compressed tar writer for one archive file.
pub struct ArchiveWriter {
    builder: Builder<GzEncoder<File>>,
    path: PathBuf,
}

impl ArchiveWriter {
    /// Create the archive file at `path`.
    pub fn create(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::create(path)?;
        let builder = Builder::new(GzEncoder::new(file, Compression::default()));
        Ok(Self {
            builder,
            path: path.to_path_buf(),
        })
    }

    pub fn builder(&mut self) -> &mut Builder<GzEncoder<File>> {
        &mut self.builder
    }

    /// Write an in-memory entry.
    pub fn append_bytes(
        &mut self,
        name: &str,
        data: &[u8],
        mtime: DateTime<Utc>,
    ) -> Result<(), ArchiveError> {
        append_bytes(&mut self.builder, name, data, mtime)
    }

    /// Write the tar trailer, flush the gzip stream and return the archive path.
    pub fn finish(self) -> Result<PathBuf, ArchiveError> {
        let encoder = self.builder.into_inner()?;
        let mut file = encoder.finish()?;
        file.flush()?;
        Ok(self.path)
    }
}
