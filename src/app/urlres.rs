use anyhow::*;
use clap::Parser;
use log::info;
use urlres::standalone::{engine::run_job, Args, Job};
use urlres::utils::CancelToken;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn parse_args() -> Job {
    let args = Args::parse();
    init_logging(args.verbose);
    Job::from(args)
}

fn main() -> Result<()> {
    let job = parse_args();

    // Ctrl-C stops the job at the next line read or write.
    let cancel = CancelToken::new();
    let handler = cancel.clone();
    ctrlc::set_handler(move || handler.cancel()).context("installing Ctrl-C handler")?;

    let report = run_job(&job, &cancel)?;
    info!(
        "{} join: {} mapping / {} register records, {} resolved",
        report.strategy, report.mapping_records, report.register_records, report.resolved
    );
    Ok(())
}
