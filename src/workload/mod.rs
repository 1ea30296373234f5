//! Join strategies, looked up by name.
//!
//! Every strategy computes the same multiset of resolved rows:
//! `{ (m.canonicalUrl, r.timestamp, r.ip) : m.rawUrl = r.rawUrl }`.
//! Registers without a mapping are dropped.
//!
//! # Example
//!
//! ```
//! # use anyhow::Result;
//! use urlres::workload;
//! # fn main() -> Result<()> {
//! let hash = workload::named("hash")?;
//! assert_eq!(hash.name, "hash");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::sink::ResolvedSink;
use crate::utils::CancelToken;
use crate::{Mapping, Register, ResolveError};

pub mod cogroup;
pub mod hash;
pub mod shuffle;
pub mod sort_merge;

/// What to do when the mapping relation repeats a raw URL.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    /// Abort the job.
    #[default]
    Reject,
    /// Keep the first mapping in input order, count and drop the rest.
    FirstWins,
    /// Pair each register with every mapping of its key.
    FanOut,
}

/// Tuning knobs shared by the strategies.
#[derive(Clone, Debug)]
pub struct JoinOptions {
    pub duplicates: DuplicatePolicy,
    /// Tagged records held in memory before the external sort spills a run.
    pub spill_threshold: usize,
    /// Buckets of the shuffle strategy.
    pub partitions: usize,
    pub temp_dir: PathBuf,
    pub cancel: CancelToken,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            duplicates: DuplicatePolicy::Reject,
            spill_threshold: 1_000_000,
            partitions: rayon::current_num_threads(),
            temp_dir: std::env::temp_dir(),
            cancel: CancelToken::new(),
        }
    }
}

/// Counters reported by a strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinStats {
    pub mapping_records: u64,
    pub register_records: u64,
    pub resolved: u64,
    /// Registers whose raw URL has no mapping.
    pub unmatched: u64,
    /// Mappings dropped under [`DuplicatePolicy::FirstWins`].
    pub duplicates_dropped: u64,
    pub spill_runs: u64,
}

impl JoinStats {
    pub fn merge(&mut self, other: JoinStats) {
        self.mapping_records += other.mapping_records;
        self.register_records += other.register_records;
        self.resolved += other.resolved;
        self.unmatched += other.unmatched;
        self.duplicates_dropped += other.duplicates_dropped;
        self.spill_runs += other.spill_runs;
    }
}

/// The two parsed input streams.
///
/// Items are job-fatal errors only; rejected lines never show up here.
pub struct JoinInputs<'a> {
    pub mapping: Box<dyn Iterator<Item = Result<Mapping, ResolveError>> + 'a>,
    pub register: Box<dyn Iterator<Item = Result<Register, ResolveError>> + 'a>,
}

/// A join strategy: consumes both inputs and emits resolved rows into `sink`.
pub type JoinFn =
    fn(inputs: JoinInputs<'_>, options: &JoinOptions, sink: &mut dyn ResolvedSink) -> Result<JoinStats, ResolveError>;

/// A named join strategy.
#[derive(Copy, Clone)]
pub struct Workload {
    pub name: &'static str,
    pub join_fn: JoinFn,
}

pub const AUTO: &str = "auto";

/// Gets the [`Workload`] named `name`.
///
/// Returns [`None`] if no strategy with the given name was found. `auto` is
/// not a strategy; see [`select`].
pub fn try_named(name: &str) -> Option<Workload> {
    match name {
        "hash" => Some(Workload {
            name: "hash",
            join_fn: hash::join,
        }),
        "sort-merge" => Some(Workload {
            name: "sort-merge",
            join_fn: sort_merge::join,
        }),
        "shuffle" => Some(Workload {
            name: "shuffle",
            join_fn: shuffle::join,
        }),
        _ => None,
    }
}

/// Gets the [`Workload`] named `name`.
///
/// Returns an [`anyhow::Error`] if no strategy with the given name was found.
pub fn named(name: &str) -> Result<Workload> {
    match try_named(name) {
        Some(app) => Ok(app),
        None => bail!("No join strategy named `{}` found.", name),
    }
}

/// Resolves a strategy name, choosing for `auto` by mapping size:
/// broadcast hash when the mapping is at most `broadcast_limit` bytes,
/// external sort-merge otherwise.
pub fn select(name: &str, mapping_bytes: u64, broadcast_limit: u64) -> Result<Workload> {
    if name != AUTO {
        return named(name);
    }
    if mapping_bytes <= broadcast_limit {
        named("hash")
    } else {
        named("sort-merge")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_is_an_error() {
        assert!(try_named("nested-loop").is_none());
        assert!(named("nested-loop").is_err());
    }

    #[test]
    fn auto_picks_by_mapping_size() {
        assert_eq!(select(AUTO, 10, 1024).unwrap().name, "hash");
        assert_eq!(select(AUTO, 1025, 1024).unwrap().name, "sort-merge");
        assert_eq!(select("shuffle", 10, 1024).unwrap().name, "shuffle");
    }

    #[test]
    fn stats_merge_adds_counters() {
        let mut total = JoinStats {
            resolved: 2,
            unmatched: 1,
            ..JoinStats::default()
        };
        total.merge(JoinStats {
            resolved: 3,
            spill_runs: 1,
            ..JoinStats::default()
        });
        assert_eq!(total.resolved, 5);
        assert_eq!(total.unmatched, 1);
        assert_eq!(total.spill_runs, 1);
    }
}
