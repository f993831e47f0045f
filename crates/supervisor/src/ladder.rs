//! Retry ladder and job finishing.
//!
//! A failed initial attempt may be retried once with error tolerance, and a
//! failed tolerant attempt once more in software. Every retry is a new Job
//! handed back to the caller; a Job never restarts itself.

use crate::accept::{self, Acceptance};
use crate::classify;
use crate::encode::{sample_window, shell_quote, CommandBuilder, EncodeRequest, FfmpegCommand};
use crate::jobs::{Job, RetryTier, Vid};
use crate::monitor::{ProcessMonitor, MANUAL_STOP_CODE};
use crate::probe::{Probe, ProbeCache, Prober};
use crate::progress::{ProgressInterpreter, ProgressUpdate};
use crate::replace;
use log::{debug, info, warn};
use rmbloat_config::{AcceptanceConfig, Config, EncoderConfig, SupervisorConfig};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

pub const TOLERANT_RETRY_REPORT: &str = "RETRYING (Tolerant)";
pub const SOFTWARE_RETRY_REPORT: &str = "RETRYING (Software)";

/// Terminal status of a job after the ladder is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalStatus {
    /// Succeeded on the first attempt
    Ok,
    /// Succeeded on the tolerant retry
    Ok2,
    /// Succeeded on the software retry
    Ok3,
    Err,
}

impl FinalStatus {
    pub fn from_outcome(tier: RetryTier, success: bool) -> Self {
        match (success, tier) {
            (false, _) => FinalStatus::Err,
            (true, RetryTier::Initial) => FinalStatus::Ok,
            (true, RetryTier::Tolerant) => FinalStatus::Ok2,
            (true, RetryTier::Software) => FinalStatus::Ok3,
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, FinalStatus::Err)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Ok => "OK",
            FinalStatus::Ok2 => "OK2",
            FinalStatus::Ok3 => "OK3",
            FinalStatus::Err => "ERR",
        }
    }
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to "what's the status of this job?"
#[derive(Debug)]
pub enum JobPoll {
    /// Still encoding; `report` carries a fresh progress line if there is one
    Running { job: Job, report: Option<String> },
    /// The attempt failed and a retry took its place
    Retrying { job: Job, report: &'static str },
    /// No more attempts; finish the job with [`RetryLadder::finish_transcode_job`]
    Done { job: Job, status: FinalStatus },
}

/// Success and failure counters across jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vitals {
    pub ok_count: u32,
    pub error_count: u32,
    pub consecutive_failures: u32,
}

/// What finishing a job produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub vid: Vid,
    /// Whether the output was kept
    pub success: bool,
    /// Probe of the encoder output, if it could be probed
    pub probe: Option<Probe>,
}

/// Drives jobs through the retry ladder.
pub struct RetryLadder<B: CommandBuilder = FfmpegCommand> {
    builder: B,
    encoder: EncoderConfig,
    supervisor: SupervisorConfig,
    acceptance: AcceptanceConfig,
    vitals: Vitals,
}

impl RetryLadder<FfmpegCommand> {
    /// Ladder building ffmpeg commands from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(FfmpegCommand::new(config.encoder.clone()), config)
    }
}

impl<B: CommandBuilder> RetryLadder<B> {
    pub fn new(builder: B, config: &Config) -> Self {
        Self {
            builder,
            encoder: config.encoder.clone(),
            supervisor: config.supervisor.clone(),
            acceptance: config.acceptance.clone(),
            vitals: Vitals::default(),
        }
    }

    pub fn vitals(&self) -> Vitals {
        self.vitals
    }

    /// Start an attempt for `vid` at the given tier.
    ///
    /// The initial tier clears the Vid's run history. Launch failures are not
    /// errors here: the monitor reports them as an exit code on first poll.
    pub fn start_transcode_job(&self, mut vid: Vid, tier: RetryTier) -> Job {
        let temp_file = if self.encoder.sample {
            self.encoder.sample_dir.join(format!(
                "SAMPLE.{}.{}",
                self.encoder.quality, vid.standard_name
            ))
        } else {
            vid.dir().join(format!("TEMP.{}", vid.standard_name))
        };
        let orig_backup_file = replace::backup_path(&vid.filepath);

        if temp_file.exists() {
            if let Err(e) = fs::remove_file(&temp_file) {
                warn!("cannot remove stale {}: {}", temp_file.display(), e);
            }
        }
        if self.encoder.sample {
            if let Err(e) = fs::create_dir_all(&self.encoder.sample_dir) {
                warn!("cannot create {}: {}", self.encoder.sample_dir.display(), e);
            }
        }

        let window = self
            .encoder
            .sample
            .then(|| sample_window(vid.probe0.duration, self.encoder.sample_seconds));
        let duration_secs = match window {
            Some((_, length)) => f64::from(length),
            None => vid.probe0.duration,
        };

        let command = self.builder.build(&EncodeRequest {
            input: &vid.filepath,
            output: &temp_file,
            probe: &vid.probe0,
            tier,
            sample_window: window,
        });

        if tier == RetryTier::Initial {
            vid.runs.clear();
        }
        vid.start_new_run(tier.descr()).command = shell_quote(&command);
        info!("{}: {}", vid.basename(), tier);

        let mut monitor = ProcessMonitor::new()
            .with_stop_grace(Duration::from_secs(self.supervisor.stop_grace_secs));
        // A fresh monitor has no child, so start() cannot refuse.
        let _ = monitor.start(&command, Some(&temp_file));
        let started = Instant::now();

        Job {
            vid,
            tier,
            temp_file,
            orig_backup_file,
            duration_secs,
            total_duration: Job::duration_label(duration_secs),
            started,
            monitor,
            interpreter: ProgressInterpreter::starting_at(
                started,
                duration_secs,
                Duration::from_secs(self.supervisor.progress_secs_max),
            ),
        }
    }

    /// Stop a job without finishing it; the encoder output is discarded.
    ///
    /// The source is left untouched and no anomaly is recorded.
    pub fn abort_transcode_job(&self, job: Job) -> Vid {
        let Job {
            mut vid,
            mut monitor,
            ..
        } = job;
        warn!("{}: stopping encoder", vid.basename());
        monitor.stop(MANUAL_STOP_CODE);
        vid.current_run_mut().return_code = Some(MANUAL_STOP_CODE);
        vid
    }

    /// Advance a job and apply the retry decision once it has exited.
    pub fn check_job_status(&self, mut job: Job) -> JobPoll {
        let code = match job.progress() {
            ProgressUpdate::Finished(code) => code,
            ProgressUpdate::Progress(line) => {
                return JobPoll::Running {
                    job,
                    report: Some(line),
                }
            }
            ProgressUpdate::Pending => return JobPoll::Running { job, report: None },
        };
        self.decide(job, code)
    }

    fn decide(&self, job: Job, code: i32) -> JobPoll {
        let failed = code != 0;
        let run = job.vid.current_run();

        if failed
            && job.tier == RetryTier::Initial
            && run.is_some_and(classify::tolerant_retry_eligible)
        {
            info!("{}: exit {}, retrying with error tolerance", job.vid.basename(), code);
            let Job { vid, .. } = job;
            return JobPoll::Retrying {
                job: self.start_transcode_job(vid, RetryTier::Tolerant),
                report: TOLERANT_RETRY_REPORT,
            };
        }

        if failed
            && job.tier == RetryTier::Tolerant
            && run.is_some_and(classify::software_retry_eligible)
        {
            info!("{}: exit {}, retrying in software", job.vid.basename(), code);
            let Job { vid, .. } = job;
            return JobPoll::Retrying {
                job: self.start_transcode_job(vid, RetryTier::Software),
                report: SOFTWARE_RETRY_REPORT,
            };
        }

        let status = FinalStatus::from_outcome(job.tier, !failed);
        debug!("{}: finished with {} (exit {})", job.vid.basename(), status, code);
        JobPoll::Done { job, status }
    }

    /// Accept or discard a finished job's output.
    ///
    /// A successful encode is probed and checked for shrinkage; a kept
    /// full encode replaces the source, a kept sample is left where it is.
    /// Discarded output is deleted and failures are marked in the cache.
    pub fn finish_transcode_job<P: Prober + 'static>(
        &mut self,
        job: Job,
        success: bool,
        cache: &ProbeCache<P>,
    ) -> JobOutcome {
        let Job {
            mut vid,
            temp_file,
            monitor,
            ..
        } = job;
        drop(monitor);

        let mut success = success;
        let mut rejected = false;
        let mut probe = None;

        if success {
            match cache.get(&temp_file) {
                Ok(output) => {
                    let net = accept::net_change_pct(vid.gb(), output.gb());
                    vid.net = Some(net);
                    let original_allowed =
                        accept::is_allowed_codec(self.acceptance.allowed_codecs, &vid.probe0.codec);
                    if let Acceptance::Reject {
                        net_pct,
                        min_shrink_pct,
                    } = accept::check_shrink(original_allowed, net, self.acceptance.min_shrink_pct)
                    {
                        let note =
                            accept::rejection_note(&vid.probe0.codec, net_pct, min_shrink_pct);
                        vid.ops.push(note);
                        cache.set_anomaly(&vid.filepath, "OPT");
                        success = false;
                        rejected = true;
                    }
                    probe = Some(output);
                }
                Err(e) => {
                    warn!("cannot probe {}: {}", temp_file.display(), e);
                    vid.current_run_mut()
                        .texts
                        .push(format!("PROBE FAILED: {}", e));
                    success = false;
                }
            }
        }

        if !success && !rejected {
            let code = vid.return_code().unwrap_or(0);
            if let Some(report) = vid.current_run().and_then(classify::post_mortem) {
                if report.is_corrupt() {
                    vid.current_run_mut().texts.push(report.note(code));
                }
            }
        }

        if success && !self.encoder.sample {
            self.vitals.ok_count += 1;
            self.vitals.consecutive_failures = 0;
        } else if !success {
            self.vitals.error_count += 1;
            self.vitals.consecutive_failures += 1;
        }

        if success && !self.encoder.sample {
            let standard = vid.standard_path();
            match replace::swap_into_place(
                &vid.filepath,
                &temp_file,
                &standard,
                self.acceptance.keep_backup,
            ) {
                Ok(ops) => {
                    vid.ops.extend(ops);
                    vid.basename1 = Some(standard);
                }
                Err(e) => {
                    vid.ops.push(format!("ERROR during swap of {}: {}", vid.filepath.display(), e));
                    vid.ops.push(format!(
                        "Original: {}, New: {}. Manual cleanup required.",
                        vid.filepath.display(),
                        temp_file.display()
                    ));
                }
            }
        } else if success {
            vid.basename1 = Some(temp_file);
        } else {
            discard_output(&mut vid, &temp_file);
            // a rejected source keeps OPT instead of escalating to Er1
            if !rejected {
                cache.set_anomaly(&vid.filepath, "Err");
            }
        }

        JobOutcome {
            vid,
            success,
            probe,
        }
    }
}

fn discard_output(vid: &mut Vid, temp_file: &Path) {
    if !temp_file.exists() {
        return;
    }
    match fs::remove_file(temp_file) {
        Ok(()) => {
            if vid.ops.is_empty() {
                vid.ops.push(format!(
                    "CLEANUP: Deleted {} - FFmpeg failed or quality check rejected file.",
                    temp_file.display()
                ));
            }
        }
        Err(e) => vid
            .ops
            .push(format!("ERROR removing {}: {}", temp_file.display(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::probe;
    use std::path::PathBuf;

    /// Builder that ignores the request and runs a fixed shell script.
    struct Script(&'static str);

    impl CommandBuilder for Script {
        fn build(&self, _request: &EncodeRequest<'_>) -> Vec<String> {
            vec!["sh".to_string(), "-c".to_string(), self.0.to_string()]
        }
    }

    fn drive<B: CommandBuilder>(
        ladder: &RetryLadder<B>,
        mut job: Job,
    ) -> (Job, FinalStatus, Vec<&'static str>) {
        let deadline = Instant::now() + Duration::from_secs(20);
        let mut reports = Vec::new();
        loop {
            assert!(Instant::now() < deadline, "job never finished");
            match ladder.check_job_status(job) {
                JobPoll::Running { job: next, .. } => {
                    job = next;
                    std::thread::sleep(Duration::from_millis(10));
                }
                JobPoll::Retrying { job: next, report } => {
                    reports.push(report);
                    job = next;
                }
                JobPoll::Done { job, status } => return (job, status, reports),
            }
        }
    }

    fn vid() -> Vid {
        Vid::new("/nonexistent/media/film.avi", probe("mpeg4", 720, 480, 1500, 1))
    }

    #[test]
    fn test_final_status_labels() {
        assert_eq!(FinalStatus::from_outcome(RetryTier::Initial, true).to_string(), "OK");
        assert_eq!(FinalStatus::from_outcome(RetryTier::Tolerant, true).to_string(), "OK2");
        assert_eq!(FinalStatus::from_outcome(RetryTier::Software, true).to_string(), "OK3");
        assert_eq!(FinalStatus::from_outcome(RetryTier::Software, false), FinalStatus::Err);
        assert!(!FinalStatus::Err.is_success());
    }

    #[test]
    fn test_clean_exit_is_done_ok() {
        let ladder = RetryLadder::new(Script("echo fine >&2"), &Config::default());
        let job = ladder.start_transcode_job(vid(), RetryTier::Initial);
        assert_eq!(job.temp_file, PathBuf::from("/nonexistent/media/TEMP.film.mkv"));
        assert_eq!(job.orig_backup_file, PathBuf::from("/nonexistent/media/ORIG.film.avi"));

        let (job, status, reports) = drive(&ladder, job);
        assert_eq!(status, FinalStatus::Ok);
        assert!(reports.is_empty());
        assert_eq!(job.vid.runs.len(), 1);
        assert_eq!(job.vid.runs[0].descr, "initial run");
        assert_eq!(job.vid.runs[0].texts, vec!["fine".to_string()]);
        assert_eq!(job.vid.runs[0].return_code, Some(0));
        assert_eq!(job.vid.runs[0].command, "sh -c 'echo fine >&2'");
    }

    #[test]
    fn test_unclassified_failure_is_not_retried() {
        let ladder = RetryLadder::new(
            Script("echo 'No such file' >&2; exit 1"),
            &Config::default(),
        );
        let job = ladder.start_transcode_job(vid(), RetryTier::Initial);
        let (job, status, reports) = drive(&ladder, job);
        assert_eq!(status, FinalStatus::Err);
        assert!(reports.is_empty());
        assert_eq!(job.vid.runs.len(), 1);
    }

    #[test]
    fn test_filter_failure_climbs_whole_ladder() {
        let ladder = RetryLadder::new(
            Script("echo 'Error reinitializing filters!' >&2; exit 1"),
            &Config::default(),
        );
        let job = ladder.start_transcode_job(vid(), RetryTier::Initial);
        let (job, status, reports) = drive(&ladder, job);

        assert_eq!(reports, vec![TOLERANT_RETRY_REPORT, SOFTWARE_RETRY_REPORT]);
        assert_eq!(status, FinalStatus::Err);
        assert_eq!(job.tier, RetryTier::Software);
        let descrs: Vec<&str> = job.vid.runs.iter().map(|r| r.descr.as_str()).collect();
        assert_eq!(descrs, vec!["initial run", "redo w err tolerance", "retry w S/W convert"]);
        assert!(job.vid.runs.iter().all(|r| r.return_code == Some(1)));
    }

    #[test]
    fn test_initial_run_resets_history() {
        let ladder = RetryLadder::new(Script("exit 0"), &Config::default());
        let mut old = vid();
        old.start_new_run("initial run").return_code = Some(3);
        old.start_new_run("redo w err tolerance").return_code = Some(3);

        let job = ladder.start_transcode_job(old, RetryTier::Initial);
        assert_eq!(job.vid.runs.len(), 1);
        assert_eq!(job.vid.runs[0].return_code, None);
    }

    #[test]
    fn test_abort_stops_encoder_and_discards_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = dir.path().join("long.mp4");
        fs::write(&source, b"source").unwrap();
        let mut config = Config::default();
        config.supervisor.stop_grace_secs = 5;
        let ladder = RetryLadder::new(Script("exec sleep 30"), &config);

        let job = ladder.start_transcode_job(
            Vid::new(&source, probe("h264", 1280, 720, 3000, 6)),
            RetryTier::Initial,
        );
        fs::write(&job.temp_file, b"partial").unwrap();
        let temp = job.temp_file.clone();

        let started = Instant::now();
        let vid = ladder.abort_transcode_job(job);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!temp.exists());
        assert!(source.exists());
        assert_eq!(vid.return_code(), Some(MANUAL_STOP_CODE));
        assert!(vid.ops.is_empty());
    }

    #[test]
    fn test_sample_mode_paths_and_duration() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.encoder.sample = true;
        config.encoder.sample_dir = dir.path().join("samples");
        let ladder = RetryLadder::new(Script("exit 0"), &config);

        let job = ladder.start_transcode_job(vid(), RetryTier::Initial);
        assert_eq!(job.temp_file, dir.path().join("samples/SAMPLE.28.film.mkv"));
        assert_eq!(job.duration_secs, 30.0);
        assert_eq!(job.total_duration, "0:30");
        assert!(dir.path().join("samples").is_dir());
    }
}
