//! Output side of the pipeline.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::BytesMut;

use crate::utils::CancelToken;
use crate::{Resolved, ResolveError};

/// Receives resolved rows from a join strategy.
///
/// `Send`, so the shuffle strategy can write from its own thread.
pub trait ResolvedSink: Send {
    fn emit(&mut self, row: &Resolved) -> Result<(), ResolveError>;
}

impl ResolvedSink for Vec<Resolved> {
    fn emit(&mut self, row: &Resolved) -> Result<(), ResolveError> {
        self.push(row.clone());
        Ok(())
    }
}

/// Writes each row as `canonicalUrl\ttimestamp\tip\n`.
pub struct LineSink<W: Write> {
    writer: W,
    locator: String,
    buf: BytesMut,
    written: u64,
    cancel: CancelToken,
}

impl LineSink<BufWriter<File>> {
    /// Opens `path` in truncate mode, creating parent directories.
    pub fn create(path: &Path, cancel: CancelToken) -> Result<Self, ResolveError> {
        let locator = path.display().to_string();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ResolveError::io(&locator, e))?;
        }
        let file = File::create(path).map_err(|e| ResolveError::io(&locator, e))?;
        Ok(Self::new(BufWriter::new(file), locator, cancel))
    }
}

impl<W: Write> LineSink<W> {
    pub fn new(writer: W, locator: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            writer,
            locator: locator.into(),
            buf: BytesMut::with_capacity(256),
            written: 0,
            cancel,
        }
    }

    /// Number of rows written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W, ResolveError> {
        self.writer
            .flush()
            .map_err(|e| ResolveError::io(&self.locator, e))?;
        Ok(self.writer)
    }
}

impl<W: Write + Send> ResolvedSink for LineSink<W> {
    fn emit(&mut self, row: &Resolved) -> Result<(), ResolveError> {
        self.cancel.check()?;
        row.write_line(&mut self.buf);
        self.writer
            .write_all(&self.buf)
            .map_err(|e| ResolveError::io(&self.locator, e))?;
        self.buf.clear();
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn row(canonical: &'static str, timestamp: i64, ip: &'static str) -> Resolved {
        Resolved {
            canonical_url: Bytes::from_static(canonical.as_bytes()),
            timestamp,
            ip: Bytes::from_static(ip.as_bytes()),
        }
    }

    #[test]
    fn formats_tab_delimited_lines() {
        let mut sink = LineSink::new(Vec::new(), "memory", CancelToken::new());
        sink.emit(&row("A", 100, "1.1.1.1")).unwrap();
        sink.emit(&row("B", -1, "2.2.2.2")).unwrap();
        assert_eq!(sink.written(), 2);
        let out = sink.finish().unwrap();
        assert_eq!(out, b"A\t100\t1.1.1.1\nB\t-1\t2.2.2.2\n");
    }

    #[test]
    fn create_truncates_existing_output() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("resolved.tsv");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"stale content that is longer than the new one\n").unwrap();

        let mut sink = LineSink::create(&path, CancelToken::new()).unwrap();
        sink.emit(&row("x", 0, "ip")).unwrap();
        sink.finish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x\t0\tip\n");
    }

    #[test]
    fn cancelled_sink_refuses_rows() {
        let cancel = CancelToken::new();
        let mut sink = LineSink::new(Vec::new(), "memory", cancel.clone());
        cancel.cancel();
        assert!(matches!(
            sink.emit(&row("A", 1, "ip")),
            Err(ResolveError::Cancelled)
        ));
    }
}
