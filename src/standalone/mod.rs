use std::path::PathBuf;

use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};

use crate::workload::{DuplicatePolicy, AUTO};

pub mod engine;

pub const DEFAULT_BROADCAST_LIMIT: u64 = 64 * 1024 * 1024;
pub const DEFAULT_SPILL_THRESHOLD: usize = 1_000_000;
pub const DEFAULT_MAX_LOGGED_REJECTS: u64 = 10;

/// Resolve raw URLs in a hit log to their canonical URLs.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Mapping input: file, directory of part files, or glob (`rawUrl<TAB>canonicalUrl`)
    pub mapping: String,

    /// Register input: file, directory of part files, or glob (`rawUrl<TAB>timestamp<TAB>ip`)
    pub register: String,

    /// Output file, truncated on open (`canonicalUrl<TAB>timestamp<TAB>ip`)
    pub output: PathBuf,

    /// Join strategy: auto, hash, sort-merge or shuffle
    #[arg(short, long, default_value = AUTO)]
    pub strategy: String,

    /// Handling of raw URLs mapped more than once
    #[arg(short, long, value_enum, default_value_t = DuplicatePolicy::Reject)]
    pub duplicates: DuplicatePolicy,

    /// Largest mapping input (bytes) that `auto` joins with a broadcast hash table
    #[arg(long, default_value_t = DEFAULT_BROADCAST_LIMIT)]
    pub broadcast_limit: u64,

    /// Records buffered by the external sort before a run is spilled
    #[arg(long, default_value_t = DEFAULT_SPILL_THRESHOLD)]
    pub spill_threshold: usize,

    /// Buckets of the shuffle strategy [default: number of CPUs]
    #[arg(short, long)]
    pub partitions: Option<usize>,

    /// Directory for spill runs [default: system temp dir]
    #[arg(long)]
    pub temp_dir: Option<PathBuf>,

    /// Copy rejected lines to this file as `relation<TAB>line`
    #[arg(long)]
    pub rejects: Option<PathBuf>,

    /// Write the job report as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Rejected records logged individually before only counting
    #[arg(long, default_value_t = DEFAULT_MAX_LOGGED_REJECTS)]
    pub max_logged_rejects: u64,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// One resolution job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub mapping: String,
    pub register: String,
    pub output: PathBuf,
    pub strategy: String,
    pub duplicates: DuplicatePolicy,
    pub broadcast_limit: u64,
    pub spill_threshold: usize,
    pub partitions: Option<usize>,
    pub temp_dir: Option<PathBuf>,
    pub rejects: Option<PathBuf>,
    pub report: Option<PathBuf>,
    pub max_logged_rejects: u64,
}

impl Job {
    /// A job with default settings.
    pub fn new(mapping: impl Into<String>, register: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            mapping: mapping.into(),
            register: register.into(),
            output: output.into(),
            strategy: AUTO.to_string(),
            duplicates: DuplicatePolicy::Reject,
            broadcast_limit: DEFAULT_BROADCAST_LIMIT,
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            partitions: None,
            temp_dir: None,
            rejects: None,
            report: None,
            max_logged_rejects: DEFAULT_MAX_LOGGED_REJECTS,
        }
    }

    pub fn with_strategy(mut self, strategy: &str) -> Self {
        self.strategy = strategy.to_string();
        self
    }
}

impl From<Args> for Job {
    fn from(args: Args) -> Self {
        Job {
            mapping: args.mapping,
            register: args.register,
            output: args.output,
            strategy: args.strategy,
            duplicates: args.duplicates,
            broadcast_limit: args.broadcast_limit,
            spill_threshold: args.spill_threshold,
            partitions: args.partitions,
            temp_dir: args.temp_dir,
            rejects: args.rejects,
            report: args.report,
            max_logged_rejects: args.max_logged_rejects,
        }
    }
}
