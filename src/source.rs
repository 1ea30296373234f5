//! Line source: lazy, line-at-a-time reading of an input locator.
//!
//! A locator is a file, a directory of part files, or a glob pattern.

use std::collections::VecDeque;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use glob::glob;
use itertools::Itertools;
use log::debug;

use crate::utils::CancelToken;
use crate::ResolveError;

/// One input record, without its line terminator.
#[derive(Clone, Debug)]
pub struct SourceLine {
    pub file: Arc<Path>,
    /// 1-based line number within `file`.
    pub number: u64,
    pub text: Bytes,
}

impl SourceLine {
    /// `file:line`, for log and error messages.
    pub fn origin(&self) -> String {
        format!("{}:{}", self.file.display(), self.number)
    }
}

impl fmt::Display for SourceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file.display(), self.number)
    }
}

// Hadoop-style bookkeeping files (`_SUCCESS`, `.crc`) are not data.
fn is_part_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| !name.starts_with('.') && !name.starts_with('_'))
        .unwrap_or(false)
}

fn is_glob(locator: &str) -> bool {
    locator.contains(&['*', '?', '['][..])
}

/// Expands a locator into the list of files to read, in name order.
pub fn resolve_locator(locator: &str) -> Result<Vec<PathBuf>, ResolveError> {
    let path = Path::new(locator);
    let files = if path.is_file() {
        vec![path.to_path_buf()]
    } else if path.is_dir() {
        fs::read_dir(path)
            .map_err(|e| ResolveError::io(locator, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| ResolveError::io(locator, e))?
            .into_iter()
            .filter(|p| p.is_file() && is_part_file(p))
            .sorted()
            .collect()
    } else if is_glob(locator) {
        glob(locator)?
            .flatten()
            .filter(|p| p.is_file())
            .sorted()
            .collect()
    } else {
        // Surface the filesystem's own reason (missing, permission, ...).
        fs::metadata(path).map_err(|e| ResolveError::io(locator, e))?;
        Vec::new()
    };

    if files.is_empty() && !path.is_dir() {
        return Err(ResolveError::io(
            locator,
            io::Error::new(io::ErrorKind::NotFound, "locator matched no files"),
        ));
    }
    debug!("locator `{}` resolved to {} file(s)", locator, files.len());
    Ok(files)
}

/// Total size in bytes of the given files.
pub fn total_size(files: &[PathBuf]) -> Result<u64, ResolveError> {
    files.iter().try_fold(0u64, |acc, file| {
        let meta = fs::metadata(file).map_err(|e| ResolveError::io(file.display().to_string(), e))?;
        Ok(acc + meta.len())
    })
}

/// Lazily yields the lines of a list of files, one file after another.
///
/// LF terminators are removed, as is a CR right before the LF. Blank lines
/// are passed through. The first error ends the sequence.
pub struct LineSource {
    pending: VecDeque<PathBuf>,
    current: Option<(Arc<Path>, BufReader<File>)>,
    number: u64,
    cancel: CancelToken,
    failed: bool,
}

impl LineSource {
    pub fn new(files: Vec<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            pending: files.into(),
            current: None,
            number: 0,
            cancel,
            failed: false,
        }
    }

    /// Resolves `locator` and opens a source over it.
    pub fn open(locator: &str, cancel: CancelToken) -> Result<Self, ResolveError> {
        Ok(Self::new(resolve_locator(locator)?, cancel))
    }

    fn next_line(&mut self) -> Result<Option<SourceLine>, ResolveError> {
        loop {
            self.cancel.check()?;
            if self.current.is_none() {
                let Some(path) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let file = File::open(&path)
                    .map_err(|e| ResolveError::io(path.display().to_string(), e))?;
                self.current = Some((Arc::from(path.as_path()), BufReader::new(file)));
                self.number = 0;
            }

            let Some((path, reader)) = self.current.as_mut() else {
                continue;
            };
            let mut buf = Vec::new();
            let read = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| ResolveError::io(path.display().to_string(), e))?;
            if read == 0 {
                self.current = None;
                continue;
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
            }
            self.number += 1;
            return Ok(Some(SourceLine {
                file: path.clone(),
                number: self.number,
                text: Bytes::from(buf),
            }));
        }
    }
}

impl Iterator for LineSource {
    type Item = Result<SourceLine, ResolveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_line() {
            Ok(line) => line.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
