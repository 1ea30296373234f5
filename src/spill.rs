//! Sorted runs spilled to disk by the external sort.
//!
//! A run is a Parquet file with three columns: `key` (binary), `tag` (u8) and
//! `value` (binary), holding [`TaggedRecord`]s in sort order.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, BinaryArray, UInt8Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use log::{debug, warn};
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use uuid::Uuid;

use crate::{ResolveError, StreamTag, TaggedRecord};

/// Rows per record batch, both when writing and when reading a run.
pub const RUN_BATCH_ROWS: usize = 8192;

fn run_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("key", DataType::Binary, false),
        Field::new("tag", DataType::UInt8, false),
        Field::new("value", DataType::Binary, false),
    ]))
}

fn to_batch(schema: &SchemaRef, records: &[TaggedRecord]) -> Result<RecordBatch, ResolveError> {
    let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_ref()).collect();
    let tags: Vec<u8> = records.iter().map(|r| r.tag as u8).collect();
    let values: Vec<&[u8]> = records.iter().map(|r| r.value.as_ref()).collect();
    Ok(RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(BinaryArray::from(keys)) as ArrayRef,
            Arc::new(UInt8Array::from(tags)) as ArrayRef,
            Arc::new(BinaryArray::from(values)) as ArrayRef,
        ],
    )?)
}

/// A directory holding the runs of one sort. Run files are removed on drop.
pub struct SpillDir {
    dir: PathBuf,
    runs: Vec<PathBuf>,
}

impl SpillDir {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            runs: Vec::new(),
        }
    }

    pub fn runs(&self) -> &[PathBuf] {
        &self.runs
    }

    /// Writes `records`, already sorted, as a new run.
    pub fn write_run(&mut self, records: &[TaggedRecord]) -> Result<PathBuf, ResolveError> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| ResolveError::io(self.dir.display().to_string(), e))?;
        let path = self.dir.join(format!("urlres-run-{}.parquet", Uuid::new_v4()));
        let file = File::create(&path).map_err(|e| ResolveError::io(path.display().to_string(), e))?;
        // Registered before writing so a failed run is still cleaned up.
        self.runs.push(path.clone());

        let schema = run_schema();
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
        for chunk in records.chunks(RUN_BATCH_ROWS) {
            writer.write(&to_batch(&schema, chunk)?)?;
        }
        // writer must be closed to write footer
        writer.close()?;
        debug!("spilled {} records to {}", records.len(), path.display());
        Ok(path)
    }
}

impl Drop for SpillDir {
    fn drop(&mut self) {
        for run in self.runs.drain(..) {
            if let Err(e) = fs::remove_file(&run) {
                warn!("could not remove spill run {}: {}", run.display(), e);
            }
        }
    }
}

/// Streams the records of one run back, batch by batch.
pub struct RunReader {
    reader: ParquetRecordBatchReader,
    batch: Option<RecordBatch>,
    row: usize,
    failed: bool,
}

impl RunReader {
    pub fn open(path: &Path) -> Result<Self, ResolveError> {
        let file = File::open(path).map_err(|e| ResolveError::io(path.display().to_string(), e))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
            .with_batch_size(RUN_BATCH_ROWS)
            .build()?;
        Ok(Self {
            reader,
            batch: None,
            row: 0,
            failed: false,
        })
    }

    fn next_record(&mut self) -> Result<Option<TaggedRecord>, ResolveError> {
        loop {
            if let Some(batch) = &self.batch {
                if self.row < batch.num_rows() {
                    let record = read_row(batch, self.row)?;
                    self.row += 1;
                    return Ok(Some(record));
                }
            }
            match self.reader.next() {
                Some(batch) => {
                    self.batch = Some(batch?);
                    self.row = 0;
                }
                None => return Ok(None),
            }
        }
    }
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, index: usize) -> Result<&'a T, ResolveError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ResolveError::InvariantViolation(format!("spill run column {index} has an unexpected type")))
}

fn read_row(batch: &RecordBatch, row: usize) -> Result<TaggedRecord, ResolveError> {
    let keys = column::<BinaryArray>(batch, 0)?;
    let tags = column::<UInt8Array>(batch, 1)?;
    let values = column::<BinaryArray>(batch, 2)?;
    Ok(TaggedRecord {
        key: Bytes::copy_from_slice(keys.value(row)),
        tag: StreamTag::try_from(tags.value(row))?,
        value: Bytes::copy_from_slice(values.value(row)),
    })
}

impl Iterator for RunReader {
    type Item = Result<TaggedRecord, ResolveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mapping, Register};
    use tempfile::tempdir;

    fn sample(n: usize) -> Vec<TaggedRecord> {
        let mut records: Vec<TaggedRecord> = (0..n)
            .map(|i| {
                if i % 3 == 0 {
                    TaggedRecord::from(Mapping {
                        raw_url: Bytes::from(format!("k{:05}", i)),
                        canonical_url: Bytes::from(format!("C{i}")),
                    })
                } else {
                    TaggedRecord::from(Register {
                        raw_url: Bytes::from(format!("k{:05}", i)),
                        timestamp: i as i64 - 5,
                        ip: Bytes::from(format!("10.0.0.{}", i % 256)),
                    })
                }
            })
            .collect();
        records.sort_by(TaggedRecord::cmp_sort_key);
        records
    }

    #[test]
    fn run_reads_back_in_order_across_batches() {
        let dir = tempdir().unwrap();
        let mut spill = SpillDir::new(dir.path());
        let records = sample(RUN_BATCH_ROWS + 17);
        let path = spill.write_run(&records).unwrap();

        let read: Vec<TaggedRecord> = RunReader::open(&path)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, records);
    }

    #[test]
    fn dropping_the_spill_dir_removes_runs() {
        let dir = tempdir().unwrap();
        let path = {
            let mut spill = SpillDir::new(dir.path());
            let path = spill.write_run(&sample(10)).unwrap();
            assert!(path.exists());
            assert_eq!(spill.runs().len(), 1);
            path
        };
        assert!(!path.exists());
    }
}
