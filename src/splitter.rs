// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Size-bounded CSV output.
//!
//! Some tables are far larger than one upload allows. [`CsvFileSplitter`] takes a
//! stream of CSV text (header line first) and spreads it over numbered files
//! `{base}_split0`, `{base}_split1`, ... switching to a new file once the current
//! one reaches the byte threshold. Every file starts with the header line.
//!
//! # Example
//!
//! ```rust,ignore
//! use harvest::splitter::CsvFileSplitter;
//!
//! let mut out = CsvFileSplitter::new(dir.join("jobs.csv"), ctx.max_data_size)?;
//! out.write_str("id,name\n")?;
//! for job in jobs {
//!     out.write_row(&format!("{},{}", job.id, job.name))?;
//! }
//! let files = out.finalize()?;
//! ```

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::trace;

/// Writer splitting CSV text across files of bounded size.
#[derive(Debug)]
pub struct CsvFileSplitter {
    base_path: PathBuf,
    threshold: u64,
    files: Vec<PathBuf>,
    current: Option<BufWriter<File>>,
    header: Option<String>,
    written: u64,
}

impl CsvFileSplitter {
    /// Create a splitter and open its first file.
    pub fn new(base_path: impl Into<PathBuf>, threshold: u64) -> io::Result<Self> {
        let mut splitter = Self {
            base_path: base_path.into(),
            threshold: threshold.max(1),
            files: Vec::new(),
            current: None,
            header: None,
            written: 0,
        };
        splitter.cycle()?;
        Ok(splitter)
    }

    /// Header line captured from the first write.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    /// Files opened so far, including the current one.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Close the current file and start the next one, repeating the header.
    fn cycle(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }

        let path = split_path(&self.base_path, self.files.len());
        trace!(path = %path.display(), "Opening split file");
        let mut file = BufWriter::new(File::create(&path)?);
        self.files.push(path);
        self.written = 0;

        if let Some(header) = &self.header {
            file.write_all(header.as_bytes())?;
            file.write_all(b"\n")?;
            self.written += header.len() as u64 + 1;
        }
        self.current = Some(file);
        Ok(())
    }

    /// Write a chunk of CSV text.
    ///
    /// The first chunk must contain the header line; everything before its first
    /// newline is remembered as the header. Chunks are never split across files,
    /// so callers should write whole rows.
    pub fn write_str(&mut self, chunk: &str) -> io::Result<()> {
        if self.header.is_none() {
            let end = chunk.find('\n').ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "first chunk must contain the CSV header line",
                )
            })?;
            self.header = Some(chunk[..end].to_string());
        }

        let file = match self.current.as_mut() {
            Some(file) => file,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "splitter has no open file",
                ))
            }
        };
        file.write_all(chunk.as_bytes())?;
        self.written += chunk.len() as u64;

        if self.written >= self.threshold {
            self.cycle()?;
        }
        Ok(())
    }

    /// Write one row, appending the line terminator.
    pub fn write_row(&mut self, row: &str) -> io::Result<()> {
        let mut line = String::with_capacity(row.len() + 1);
        line.push_str(row);
        line.push('\n');
        self.write_str(&line)
    }

    /// Close the last file and return the produced files in order.
    ///
    /// A trailing file holding nothing but the header is removed, so a dump
    /// without data rows yields no files. A single file loses its `_split0`
    /// suffix.
    pub fn finalize(mut self) -> io::Result<Vec<PathBuf>> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }

        let header_only = match &self.header {
            Some(header) => self.written <= header.len() as u64 + 1,
            None => true,
        };
        if header_only {
            if let Some(last) = self.files.pop() {
                fs::remove_file(&last)?;
            }
        }

        if self.files.len() == 1 {
            let split = self.files.remove(0);
            fs::rename(&split, &self.base_path)?;
            self.files.push(self.base_path.clone());
        }

        Ok(self.files)
    }
}

fn split_path(base: &Path, index: usize) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(format!("_split{}", index));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HEADER: &str = "Col1,Col2\n";
    const ROW: &str = "1234,6789\n";

    fn write_rows(splitter: &mut CsvFileSplitter, rows: usize) {
        splitter.write_str(HEADER).unwrap();
        for _ in 0..rows {
            splitter.write_str(ROW).unwrap();
        }
    }

    #[test]
    fn test_no_rows_yields_no_files() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("empty.csv");
        let mut splitter = CsvFileSplitter::new(&base, 100).unwrap();
        write_rows(&mut splitter, 0);

        let files = splitter.finalize().unwrap();
        assert!(files.is_empty());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_nothing_written_yields_no_files() {
        let temp = TempDir::new().unwrap();
        let splitter = CsvFileSplitter::new(temp.path().join("x.csv"), 100).unwrap();
        assert!(splitter.finalize().unwrap().is_empty());
    }

    #[test]
    fn test_single_file_drops_suffix() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("small.csv");
        let mut splitter = CsvFileSplitter::new(&base, 1000).unwrap();
        write_rows(&mut splitter, 5);

        let files = splitter.finalize().unwrap();
        assert_eq!(files, vec![base.clone()]);
        assert_eq!(fs::read_to_string(&base).unwrap().len(), 60);
    }

    #[test]
    fn test_splits_repeat_header() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("big.csv");
        let mut splitter = CsvFileSplitter::new(&base, 100).unwrap();
        // 10 files of header + 9 rows each
        write_rows(&mut splitter, 90);

        let files = splitter.finalize().unwrap();
        assert_eq!(files.len(), 10);
        for (i, file) in files.iter().enumerate() {
            assert!(file.to_string_lossy().ends_with(&format!("_split{}", i)));
            let content = fs::read_to_string(file).unwrap();
            assert!(content.starts_with(HEADER));
            assert_eq!(content.len(), 100);
        }
    }

    #[test]
    fn test_partial_last_file_kept() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("t.csv");
        let mut splitter = CsvFileSplitter::new(&base, 100).unwrap();
        write_rows(&mut splitter, 12);

        let files = splitter.finalize().unwrap();
        assert_eq!(files.len(), 2);
        let last = fs::read_to_string(&files[1]).unwrap();
        assert_eq!(last, format!("{}{}", HEADER, ROW.repeat(3)));
    }

    #[test]
    fn test_header_from_first_write_only() {
        let temp = TempDir::new().unwrap();
        let mut splitter = CsvFileSplitter::new(temp.path().join("h.csv"), 14).unwrap();
        splitter.write_str("a,b\n1,2\n").unwrap();
        splitter.write_str("other\n").unwrap();
        assert_eq!(splitter.header(), Some("a,b"));

        splitter.write_str("3,4\n").unwrap();
        let files = splitter.finalize().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(fs::read_to_string(&files[1]).unwrap(), "a,b\n3,4\n");
    }

    #[test]
    fn test_first_chunk_without_newline_rejected() {
        let temp = TempDir::new().unwrap();
        let mut splitter = CsvFileSplitter::new(temp.path().join("n.csv"), 100).unwrap();
        let err = splitter.write_str("no newline").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_write_row_appends_newline() {
        let temp = TempDir::new().unwrap();
        let base = temp.path().join("rows.csv");
        let mut splitter = CsvFileSplitter::new(&base, 1000).unwrap();
        splitter.write_row("id,name").unwrap();
        splitter.write_row("1,alpha").unwrap();

        let files = splitter.finalize().unwrap();
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), "id,name\n1,alpha\n");
    }
}
