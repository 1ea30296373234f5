use std::fs::File;
use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::rejects::{self, RejectCollector, RejectCounts};
use crate::sink::LineSink;
use crate::source::{resolve_locator, total_size, LineSource};
use crate::standalone::Job;
use crate::utils::CancelToken;
use crate::workload::{self, JoinInputs, JoinOptions, JoinStats};
use crate::ResolveError;

/// Counters of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub strategy: String,
    pub mapping_records: u64,
    pub register_records: u64,
    pub resolved: u64,
    pub unmatched: u64,
    pub duplicates_dropped: u64,
    pub spill_runs: u64,
    pub rejected: RejectCounts,
}

impl JobReport {
    fn new(strategy: &str, stats: JoinStats, rejected: RejectCounts) -> Self {
        Self {
            strategy: strategy.to_string(),
            mapping_records: stats.mapping_records,
            register_records: stats.register_records,
            resolved: stats.resolved,
            unmatched: stats.unmatched,
            duplicates_dropped: stats.duplicates_dropped,
            spill_runs: stats.spill_runs,
            rejected,
        }
    }
}

fn join_options(job: &Job, cancel: &CancelToken) -> JoinOptions {
    let defaults = JoinOptions::default();
    JoinOptions {
        duplicates: job.duplicates,
        spill_threshold: job.spill_threshold,
        partitions: job.partitions.unwrap_or(defaults.partitions),
        temp_dir: job.temp_dir.clone().unwrap_or(defaults.temp_dir),
        cancel: cancel.clone(),
    }
}

/// Runs one job: sources -> parsers -> join -> sink.
///
/// Inputs are resolved before the output is opened, so a bad locator leaves
/// an existing output untouched.
pub fn run_job(job: &Job, cancel: &CancelToken) -> Result<JobReport> {
    let mapping_files = resolve_locator(&job.mapping)?;
    let register_files = resolve_locator(&job.register)?;

    let mapping_bytes = total_size(&mapping_files)?;
    let engine = workload::select(&job.strategy, mapping_bytes, job.broadcast_limit)?;
    info!(
        "resolving {} against {} ({} mapping bytes) with {} join",
        job.register, job.mapping, mapping_bytes, engine.name
    );

    let mut rejects = RejectCollector::new(job.max_logged_rejects);
    if let Some(path) = &job.rejects {
        rejects = rejects.with_side_channel(path)?;
    }
    let mut sink = LineSink::create(&job.output, cancel.clone())?;

    let inputs = JoinInputs {
        mapping: Box::new(rejects::mappings(
            LineSource::new(mapping_files, cancel.clone()),
            &rejects,
        )),
        register: Box::new(rejects::registers(
            LineSource::new(register_files, cancel.clone()),
            &rejects,
        )),
    };
    let stats = (engine.join_fn)(inputs, &join_options(job, cancel), &mut sink)?;
    let written = sink.written();
    sink.finish()?;
    rejects.flush()?;

    let report = JobReport::new(engine.name, stats, rejects.counts());
    info!(
        "wrote {} resolved row(s) to {}; {} unmatched register(s), {} rejected line(s)",
        written,
        job.output.display(),
        report.unmatched,
        report.rejected.total()
    );

    if report.rejected.total() > 0 && report.mapping_records + report.register_records == 0 {
        return Err(ResolveError::AllRecordsRejected(report.rejected.total()).into());
    }
    if let Some(path) = &job.report {
        let file = File::create(path).with_context(|| format!("creating report {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &report)?;
        writer.flush()?;
    }
    Ok(report)
}
