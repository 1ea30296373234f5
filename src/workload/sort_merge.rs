//! External sort-merge join.
//!
//! Both relations are tagged and fed into one external sort keyed on
//! `(key, tag)`. Sorted runs that exceed the memory threshold are spilled to
//! disk, then all runs are k-way merged into a single stream that drives the
//! cogroup. The register side is never bounded by memory.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::{debug, info};

use crate::sink::ResolvedSink;
use crate::spill::{RunReader, SpillDir};
use crate::utils::CancelToken;
use crate::workload::cogroup::cogroup;
use crate::workload::{JoinInputs, JoinOptions, JoinStats};
use crate::{ResolveError, TaggedRecord};

type RunIter = Box<dyn Iterator<Item = Result<TaggedRecord, ResolveError>>>;

/// Accumulates tagged records, spilling sorted runs past `threshold`.
pub struct ExternalSorter {
    buffer: Vec<TaggedRecord>,
    threshold: usize,
    spill: SpillDir,
    cancel: CancelToken,
}

impl ExternalSorter {
    pub fn new(threshold: usize, spill: SpillDir, cancel: CancelToken) -> Self {
        let threshold = threshold.max(1);
        Self {
            buffer: Vec::with_capacity(threshold.min(64 * 1024)),
            threshold,
            spill,
            cancel,
        }
    }

    pub fn push(&mut self, record: TaggedRecord) -> Result<(), ResolveError> {
        self.cancel.check()?;
        self.buffer.push(record);
        if self.buffer.len() >= self.threshold {
            self.spill_buffer()?;
        }
        Ok(())
    }

    fn spill_buffer(&mut self) -> Result<(), ResolveError> {
        // Stable: records with equal (key, tag) keep their input order.
        self.buffer.sort_by(TaggedRecord::cmp_sort_key);
        self.spill.write_run(&self.buffer)?;
        self.buffer.clear();
        Ok(())
    }

    pub fn spilled_runs(&self) -> usize {
        self.spill.runs().len()
    }

    /// Sorts the in-memory tail and merges it with every spilled run.
    pub fn finish(mut self) -> Result<RunMerger, ResolveError> {
        self.buffer.sort_by(TaggedRecord::cmp_sort_key);
        let mut sources: Vec<RunIter> = Vec::with_capacity(self.spilled_runs() + 1);
        for run in self.spill.runs() {
            sources.push(Box::new(RunReader::open(run)?));
        }
        // The tail holds the latest input, so it merges last on ties.
        sources.push(Box::new(
            std::mem::take(&mut self.buffer)
                .into_iter()
                .map(Ok::<_, ResolveError>),
        ));
        RunMerger::new(sources, self.spill, self.cancel)
    }
}

struct MergeHead {
    record: TaggedRecord,
    run: usize,
}

impl PartialEq for MergeHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for MergeHead {}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MergeHead {
    // Reversed, so the max-heap pops the smallest (key, tag, run) first.
    fn cmp(&self, other: &Self) -> Ordering {
        TaggedRecord::cmp_sort_key(&other.record, &self.record).then_with(|| other.run.cmp(&self.run))
    }
}

/// K-way merge of sorted runs. Ties go to the earlier run.
pub struct RunMerger {
    sources: Vec<RunIter>,
    heap: BinaryHeap<MergeHead>,
    failed: bool,
    cancel: CancelToken,
    // Declared last: run files outlive their readers.
    _spill: SpillDir,
}

impl RunMerger {
    fn new(mut sources: Vec<RunIter>, spill: SpillDir, cancel: CancelToken) -> Result<Self, ResolveError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (run, source) in sources.iter_mut().enumerate() {
            if let Some(record) = source.next() {
                heap.push(MergeHead { record: record?, run });
            }
        }
        Ok(Self {
            sources,
            heap,
            failed: false,
            cancel,
            _spill: spill,
        })
    }
}

impl Iterator for RunMerger {
    type Item = Result<TaggedRecord, ResolveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.cancel.check() {
            self.failed = true;
            return Some(Err(e));
        }
        let MergeHead { record, run } = self.heap.pop()?;
        match self.sources[run].next() {
            Some(Ok(next)) => self.heap.push(MergeHead { record: next, run }),
            Some(Err(e)) => {
                self.failed = true;
                return Some(Err(e));
            }
            None => {}
        }
        Some(Ok(record))
    }
}

pub fn join(inputs: JoinInputs<'_>, options: &JoinOptions, sink: &mut dyn ResolvedSink) -> Result<JoinStats, ResolveError> {
    let mut sorter = ExternalSorter::new(
        options.spill_threshold,
        SpillDir::new(&options.temp_dir),
        options.cancel.clone(),
    );
    for mapping in inputs.mapping {
        sorter.push(TaggedRecord::from(mapping?))?;
    }
    for register in inputs.register {
        sorter.push(TaggedRecord::from(register?))?;
    }

    let mut stats = JoinStats {
        spill_runs: sorter.spilled_runs() as u64,
        ..JoinStats::default()
    };
    if stats.spill_runs > 0 {
        info!("external sort spilled {} run(s)", stats.spill_runs);
    } else {
        debug!("external sort fit in memory");
    }
    let merged = sorter.finish()?;
    cogroup(merged, options.duplicates, sink, &mut stats)?;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mapping, Register, Resolved};
    use bytes::Bytes;
    use tempfile::tempdir;

    fn mapping(raw: &str, canonical: &str) -> Result<Mapping, ResolveError> {
        Ok(Mapping {
            raw_url: Bytes::copy_from_slice(raw.as_bytes()),
            canonical_url: Bytes::copy_from_slice(canonical.as_bytes()),
        })
    }

    fn register(raw: &str, timestamp: i64, ip: &str) -> Result<Register, ResolveError> {
        Ok(Register {
            raw_url: Bytes::copy_from_slice(raw.as_bytes()),
            timestamp,
            ip: Bytes::copy_from_slice(ip.as_bytes()),
        })
    }

    fn run(
        mappings: Vec<Result<Mapping, ResolveError>>,
        registers: Vec<Result<Register, ResolveError>>,
        options: &JoinOptions,
    ) -> (Vec<Resolved>, JoinStats) {
        let inputs = JoinInputs {
            mapping: Box::new(mappings.into_iter()),
            register: Box::new(registers.into_iter()),
        };
        let mut out: Vec<Resolved> = Vec::new();
        let stats = join(inputs, options, &mut out).unwrap();
        out.sort();
        (out, stats)
    }

    #[test]
    fn merger_yields_sorted_stream_and_prefers_earlier_runs() {
        let dir = tempdir().unwrap();
        let mut sorter = ExternalSorter::new(2, SpillDir::new(dir.path()), CancelToken::new());
        for (key, canonical) in [("b", "1"), ("a", "2"), ("b", "3"), ("c", "4"), ("a", "5")] {
            sorter.push(TaggedRecord::from(mapping(key, canonical).unwrap())).unwrap();
        }
        assert_eq!(sorter.spilled_runs(), 2);

        let merged: Vec<(Bytes, Bytes)> = sorter
            .finish()
            .unwrap()
            .map(|r| r.map(|r| (r.key, r.value)))
            .collect::<Result<_, _>>()
            .unwrap();
        let expected: Vec<(Bytes, Bytes)> = [("a", "2"), ("a", "5"), ("b", "1"), ("b", "3"), ("c", "4")]
            .iter()
            .map(|(k, v)| (Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes())))
            .collect();
        assert_eq!(merged, expected);
    }

    #[test]
    fn spilled_join_matches_in_memory_join() {
        let dir = tempdir().unwrap();
        let mappings = || (0..50).map(|i| mapping(&format!("u{i}"), &format!("C{i}"))).collect::<Vec<_>>();
        let registers = || {
            (0..400)
                .rev()
                .map(|i| register(&format!("u{}", i % 60), i, &format!("ip{i}")))
                .collect::<Vec<_>>()
        };

        let in_memory = JoinOptions {
            temp_dir: dir.path().to_path_buf(),
            ..JoinOptions::default()
        };
        let spilling = JoinOptions {
            spill_threshold: 7,
            temp_dir: dir.path().to_path_buf(),
            ..JoinOptions::default()
        };

        let (expected, stats) = run(mappings(), registers(), &in_memory);
        assert_eq!(stats.spill_runs, 0);
        let (actual, spilled_stats) = run(mappings(), registers(), &spilling);
        assert!(spilled_stats.spill_runs > 0);

        assert_eq!(actual, expected);
        // u50..u59 have no mapping.
        assert_eq!(spilled_stats.unmatched, 400 - expected.len() as u64);
        assert_eq!(spilled_stats.resolved, expected.len() as u64);
        // Run files are gone once the join returns.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn first_wins_keeps_input_order_across_runs() {
        let dir = tempdir().unwrap();
        let options = JoinOptions {
            spill_threshold: 1,
            temp_dir: dir.path().to_path_buf(),
            duplicates: crate::workload::DuplicatePolicy::FirstWins,
            ..JoinOptions::default()
        };
        let (rows, stats) = run(
            vec![mapping("a", "FIRST"), mapping("a", "SECOND")],
            vec![register("a", 1, "ip")],
            &options,
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].canonical_url, "FIRST");
        assert_eq!(stats.duplicates_dropped, 1);
    }

    #[test]
    fn cancelled_token_stops_the_sort() {
        let dir = tempdir().unwrap();
        let options = JoinOptions {
            spill_threshold: 2,
            temp_dir: dir.path().to_path_buf(),
            ..JoinOptions::default()
        };
        options.cancel.cancel();
        let inputs = JoinInputs {
            mapping: Box::new(vec![mapping("a", "A")].into_iter()),
            register: Box::new((0..10).map(|i| register("a", i, "ip"))),
        };
        let mut out: Vec<Resolved> = Vec::new();
        let result = join(inputs, &options, &mut out);

        assert!(matches!(result, Err(ResolveError::Cancelled)));
        assert!(out.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn cancelling_mid_merge_stops_the_merger() {
        let dir = tempdir().unwrap();
        let cancel = CancelToken::new();
        let mut sorter = ExternalSorter::new(2, SpillDir::new(dir.path()), cancel.clone());
        // Registers only: nothing reaches a sink, the merge alone must notice.
        for i in 0..10 {
            sorter.push(TaggedRecord::from(register("orphan", i, "ip").unwrap())).unwrap();
        }
        assert_eq!(sorter.spilled_runs(), 5);

        let mut merged = sorter.finish().unwrap();
        assert!(merged.next().unwrap().is_ok());
        cancel.cancel();
        assert!(matches!(merged.next(), Some(Err(ResolveError::Cancelled))));
        assert!(merged.next().is_none());
    }
}
