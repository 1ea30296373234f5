//! Parallel shuffle join.
//!
//! The map side tags every record and drops it into bucket
//! `ihash(key) % partitions`. Each bucket is then sorted and cogrouped on its
//! own rayon task; buckets share nothing, since a key lives in exactly one.
//! Reduced buckets stream through a bounded channel to a single writer thread
//! that owns the sink, so at most a few buckets' rows are held at once.

use std::panic;
use std::sync::mpsc::{self, Receiver};
use std::thread;

use dashmap::DashMap;
use log::{debug, info};
use rayon::prelude::*;

use crate::sink::ResolvedSink;
use crate::utils::CancelToken;
use crate::workload::cogroup::cogroup;
use crate::workload::{DuplicatePolicy, JoinInputs, JoinOptions, JoinStats};
use crate::{ihash, ResolveError, Resolved, TaggedRecord};

// bucket number -> tagged records hashed to it
type Partition = u32;
type Partitions = DashMap<Partition, Vec<TaggedRecord>>;

type ReducedBucket = (Vec<Resolved>, JoinStats);

fn perform_map(inputs: JoinInputs<'_>, num_partitions: u32) -> Result<Partitions, ResolveError> {
    let partitions = Partitions::new();
    let place = |record: TaggedRecord| {
        let bucket_no = ihash(&record.key) % num_partitions;
        partitions
            .entry(bucket_no)
            .or_insert_with(Vec::new)
            .push(record);
    };
    for mapping in inputs.mapping {
        place(TaggedRecord::from(mapping?));
    }
    for register in inputs.register {
        place(TaggedRecord::from(register?));
    }
    Ok(partitions)
}

fn perform_reduce(
    mut bucket: Vec<TaggedRecord>,
    policy: DuplicatePolicy,
    cancel: &CancelToken,
) -> Result<ReducedBucket, ResolveError> {
    cancel.check()?;
    // Stable, so duplicate mappings keep their input order.
    bucket.sort_by(TaggedRecord::cmp_sort_key);
    let mut rows: Vec<Resolved> = Vec::new();
    let mut stats = JoinStats::default();
    cogroup(bucket.into_iter().map(Ok::<_, ResolveError>), policy, &mut rows, &mut stats)?;
    Ok((rows, stats))
}

/// Writer side: emits every reduced bucket as soon as it arrives.
fn drain(reduced: Receiver<ReducedBucket>, sink: &mut dyn ResolvedSink) -> Result<JoinStats, ResolveError> {
    let mut stats = JoinStats::default();
    for (rows, bucket_stats) in reduced {
        for row in &rows {
            sink.emit(row)?;
        }
        stats.merge(bucket_stats);
    }
    Ok(stats)
}

pub fn join(inputs: JoinInputs<'_>, options: &JoinOptions, sink: &mut dyn ResolvedSink) -> Result<JoinStats, ResolveError> {
    let num_partitions = u32::try_from(options.partitions.max(1)).unwrap_or(u32::MAX);
    let partitions = perform_map(inputs, num_partitions)?;
    info!("shuffled into {} non-empty bucket(s)", partitions.len());

    let policy = options.duplicates;
    let cancel = &options.cancel;
    let backlog = rayon::current_num_threads();
    let (tx, rx) = mpsc::sync_channel::<ReducedBucket>(backlog);

    thread::scope(|scope| {
        let writer = scope.spawn(move || drain(rx, sink));

        // Err(None): the writer hung up and holds the real error.
        let reduced: Result<(), Option<ResolveError>> = partitions
            .into_par_iter()
            .try_for_each_with(tx, |tx, (bucket_no, bucket)| {
                let output = perform_reduce(bucket, policy, cancel).map_err(Some)?;
                debug!("bucket {} reduced to {} row(s)", bucket_no, output.0.len());
                tx.send(output).map_err(|_| None)
            });

        let written = writer.join().unwrap_or_else(|e| panic::resume_unwind(e));
        match reduced {
            Err(Some(e)) => Err(e),
            _ => written,
        }
    })
}
