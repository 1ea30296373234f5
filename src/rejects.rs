//! Collector for record-fatal errors.
//!
//! Parsers hand rejected lines here instead of unwinding the pipeline. The
//! collector counts them per kind, logs the first few and optionally copies
//! every rejected line to a side-channel file as `relation\tline\n`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::records::{parse_mapping, parse_register};
use crate::source::SourceLine;
use crate::{Mapping, RecordError, Register, ResolveError, StreamTag};

/// Rejection counters, per error kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectCounts {
    pub malformed_record: u64,
    pub malformed_numeric: u64,
}

impl RejectCounts {
    pub fn total(&self) -> u64 {
        self.malformed_record + self.malformed_numeric
    }
}

pub struct RejectCollector {
    malformed_record: AtomicU64,
    malformed_numeric: AtomicU64,
    max_logged: u64,
    side_channel: Option<(PathBuf, Mutex<BufWriter<File>>)>,
}

impl RejectCollector {
    pub fn new(max_logged: u64) -> Self {
        Self {
            malformed_record: AtomicU64::new(0),
            malformed_numeric: AtomicU64::new(0),
            max_logged,
            side_channel: None,
        }
    }

    /// Also copy rejected lines to `path`, truncating it first.
    pub fn with_side_channel(mut self, path: &Path) -> Result<Self, ResolveError> {
        let file = File::create(path).map_err(|e| ResolveError::io(path.display().to_string(), e))?;
        self.side_channel = Some((path.to_path_buf(), Mutex::new(BufWriter::new(file))));
        Ok(self)
    }

    pub fn counts(&self) -> RejectCounts {
        RejectCounts {
            malformed_record: self.malformed_record.load(Ordering::Relaxed),
            malformed_numeric: self.malformed_numeric.load(Ordering::Relaxed),
        }
    }

    /// Records one rejected line. Only side-channel write failures are errors.
    pub fn reject(
        &self,
        relation: StreamTag,
        line: &SourceLine,
        error: RecordError,
    ) -> Result<(), ResolveError> {
        let counter = match error {
            RecordError::MalformedRecord { .. } => &self.malformed_record,
            RecordError::MalformedNumeric { .. } => &self.malformed_numeric,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let seen = self.counts().total();
        if seen <= self.max_logged {
            let err = ResolveError::Rejected {
                relation: relation.name(),
                origin: line.origin(),
                source: error,
            };
            warn!("{err}");
            if seen == self.max_logged {
                info!("further rejected records are counted but not logged");
            }
        }

        if let Some((path, writer)) = &self.side_channel {
            let io_err = |e: std::io::Error| ResolveError::io(path.display().to_string(), e);
            let mut writer = writer
                .lock()
                .map_err(|_| ResolveError::InvariantViolation("reject side channel poisoned".into()))?;
            writer.write_all(relation.name().as_bytes()).map_err(io_err)?;
            writer.write_all(b"\t").map_err(io_err)?;
            writer.write_all(&line.text).map_err(io_err)?;
            writer.write_all(b"\n").map_err(io_err)?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), ResolveError> {
        if let Some((path, writer)) = &self.side_channel {
            writer
                .lock()
                .map_err(|_| ResolveError::InvariantViolation("reject side channel poisoned".into()))?
                .flush()
                .map_err(|e| ResolveError::io(path.display().to_string(), e))?;
        }
        Ok(())
    }
}

/// Parses a line stream into mappings, diverting bad lines to `rejects`.
pub fn mappings<'a, I>(
    lines: I,
    rejects: &'a RejectCollector,
) -> impl Iterator<Item = Result<Mapping, ResolveError>> + 'a
where
    I: Iterator<Item = Result<SourceLine, ResolveError>> + 'a,
{
    parsed(lines, rejects, StreamTag::Mapping, |line| parse_mapping(&line.text))
}

/// Parses a line stream into registers, diverting bad lines to `rejects`.
pub fn registers<'a, I>(
    lines: I,
    rejects: &'a RejectCollector,
) -> impl Iterator<Item = Result<Register, ResolveError>> + 'a
where
    I: Iterator<Item = Result<SourceLine, ResolveError>> + 'a,
{
    parsed(lines, rejects, StreamTag::Register, |line| parse_register(&line.text))
}

fn parsed<'a, I, T, F>(
    lines: I,
    rejects: &'a RejectCollector,
    relation: StreamTag,
    parse: F,
) -> impl Iterator<Item = Result<T, ResolveError>> + 'a
where
    I: Iterator<Item = Result<SourceLine, ResolveError>> + 'a,
    F: Fn(&SourceLine) -> Result<T, RecordError> + 'a,
    T: 'a,
{
    lines.filter_map(move |line| {
        let line = match line {
            Ok(line) => line,
            Err(e) => return Some(Err(e)),
        };
        match parse(&line) {
            Ok(record) => Some(Ok(record)),
            Err(error) => rejects.reject(relation, &line, error).err().map(Err),
        }
    })
}
