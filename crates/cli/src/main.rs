//! CLI entry point for rmbloat
//!
//! Scans the given paths, probes what it finds and re-encodes the files that
//! are worth it, one at a time, through the retry ladder.

use clap::Parser;
use log::{error, info, warn};
use rmbloat::{
    scan_paths, wants_conversion, Config, JobPoll, ProbeCache, RetryLadder, RetryTier, Vid,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// rmbloat - shrink bloated videos by re-encoding them to x265
#[derive(Parser, Debug)]
#[command(name = "rmbloat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Files or directories to scan for videos
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Path to the configuration file (config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Quality (CRF or QP); overrides the config file
    #[arg(short, long)]
    quality: Option<u32>,

    /// Encode a short sample of each file instead of replacing it
    #[arg(long)]
    sample: bool,

    /// Keep originals as ORIG.<name> after a successful conversion
    #[arg(long)]
    keep_backup: bool,

    /// List the files that would be converted and exit
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(args: &Args) -> Result<Config, rmbloat::config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    if let Some(quality) = args.quality {
        config.encoder.quality = quality;
    }
    config.encoder.sample |= args.sample;
    config.acceptance.keep_backup |= args.keep_backup;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let files = scan_paths(&args.paths);
    info!("found {} video files", files.len());

    let cache = ProbeCache::from_config(&config.probe);
    let probes = cache.batch_get_or_probe(&files, config.probe.workers).await;
    let selected: Vec<Vid> = probes
        .into_iter()
        .filter(|(_, probe)| wants_conversion(probe, &config.acceptance))
        .map(|(path, probe)| Vid::new(path, probe))
        .collect();
    info!("{} of {} files selected for conversion", selected.len(), files.len());

    if args.dry_run {
        for vid in &selected {
            println!(
                "{:>6} {:>5} {:>6.3}G {}",
                vid.probe0.codec,
                vid.probe0.bloat(),
                vid.gb(),
                vid.filepath.display()
            );
        }
        return ExitCode::SUCCESS;
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                interrupted.store(true, Ordering::SeqCst);
            }
        });
    }

    let mut ladder = RetryLadder::from_config(&config);
    let total = selected.len();

    'videos: for (index, vid) in selected.into_iter().enumerate() {
        info!("[{}/{}] {}", index + 1, total, vid.filepath.display());
        let mut job = ladder.start_transcode_job(vid, RetryTier::Initial);

        let (job, status) = loop {
            if interrupted.load(Ordering::SeqCst) {
                warn!("interrupted");
                ladder.abort_transcode_job(job);
                break 'videos;
            }
            match ladder.check_job_status(job) {
                JobPoll::Running { job: next, report } => {
                    if let Some(line) = report {
                        info!("{} {}", line, next.vid.basename());
                    }
                    job = next;
                }
                JobPoll::Retrying { job: next, report } => {
                    warn!("{} {}", report, next.vid.basename());
                    job = next;
                }
                JobPoll::Done { job, status } => break (job, status),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let outcome = ladder.finish_transcode_job(job, status.is_success(), &cache);
        let net = outcome
            .vid
            .net
            .map_or_else(|| "-".to_string(), |net| format!("{}%", net));
        info!("{} {} net={}", status, outcome.vid.basename(), net);
        for op in &outcome.vid.ops {
            info!("    {}", op);
        }
        if !outcome.success {
            if let Some(run) = outcome.vid.current_run() {
                info!("    cmd: {}", run.command);
                for text in run.texts.iter().rev().take(5).rev() {
                    info!("    {}", text);
                }
            }
        }
    }

    if let Err(e) = cache.store() {
        warn!("Failed to save probe cache: {}", e);
    }

    let vitals = ladder.vitals();
    println!(
        "Done: {} ok, {} failed ({} consecutive)",
        vitals.ok_count, vitals.error_count, vitals.consecutive_failures
    );

    if interrupted.load(Ordering::SeqCst) {
        ExitCode::from(130)
    } else {
        ExitCode::SUCCESS
    }
}
