//! Run, Vid and Job entities.
//!
//! A [`Vid`] is one source file across all its attempts; each attempt is a
//! [`Run`] appended to the Vid. A [`Job`] is the live side of the current
//! attempt: the child process, its progress state and the paths involved.
//! The Job owns its Vid; when the ladder retries, the Vid moves into the
//! continuation Job.

use crate::monitor::ProcessMonitor;
use crate::probe::Probe;
use crate::progress::{format_duration, ProgressInterpreter, ProgressUpdate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// One transcode attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Captured non-progress output lines, in order
    pub texts: Vec<String>,
    /// Exit code, `None` while the attempt is live
    pub return_code: Option<i32>,
    /// What strategy this attempt used
    pub descr: String,
    /// Shell-quoted command line
    pub command: String,
}

impl Run {
    pub fn new(descr: impl Into<String>) -> Self {
        Self {
            descr: descr.into(),
            ..Self::default()
        }
    }
}

/// Which rung of the retry ladder produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetryTier {
    Initial,
    /// Relaxed error handling, geometry pinned to the source
    Tolerant,
    /// Relaxed error handling, no hardware acceleration
    Software,
}

impl RetryTier {
    /// Description recorded on the run
    pub fn descr(&self) -> &'static str {
        match self {
            RetryTier::Initial => "initial run",
            RetryTier::Tolerant => "redo w err tolerance",
            RetryTier::Software => "retry w S/W convert",
        }
    }

    pub fn is_retry(&self) -> bool {
        !matches!(self, RetryTier::Initial)
    }

    pub fn is_software_fallback(&self) -> bool {
        matches!(self, RetryTier::Software)
    }
}

impl fmt::Display for RetryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.descr())
    }
}

/// A source video and its attempt history.
#[derive(Debug, Clone, PartialEq)]
pub struct Vid {
    pub filepath: PathBuf,
    /// File name the converted output ends up with
    pub standard_name: String,
    /// Probe of the source taken before the first attempt
    pub probe0: Probe,
    pub runs: Vec<Run>,
    /// Size change of the last accepted or rejected output, in percent
    pub net: Option<i64>,
    /// File operations and verdicts, in order
    pub ops: Vec<String>,
    /// Where the converted (or sample) output was left
    pub basename1: Option<PathBuf>,
}

impl Vid {
    pub fn new(filepath: impl Into<PathBuf>, probe0: Probe) -> Self {
        let filepath = filepath.into();
        let standard_name = standard_name_for(&filepath);
        Self {
            filepath,
            standard_name,
            probe0,
            runs: Vec::new(),
            net: None,
            ops: Vec::new(),
            basename1: None,
        }
    }

    pub fn basename(&self) -> String {
        self.filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Directory holding the source
    pub fn dir(&self) -> &Path {
        self.filepath.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Full path of the converted output
    pub fn standard_path(&self) -> PathBuf {
        self.dir().join(&self.standard_name)
    }

    /// Source size in GiB
    pub fn gb(&self) -> f64 {
        self.probe0.gb()
    }

    /// Push a fresh run and return it
    pub fn start_new_run(&mut self, descr: impl Into<String>) -> &mut Run {
        self.runs.push(Run::new(descr));
        self.current_run_mut()
    }

    pub fn current_run(&self) -> Option<&Run> {
        self.runs.last()
    }

    /// The current run, creating an empty one if none exists yet.
    pub fn current_run_mut(&mut self) -> &mut Run {
        if self.runs.is_empty() {
            self.runs.push(Run::default());
        }
        let last = self.runs.len() - 1;
        &mut self.runs[last]
    }

    /// Exit code of the latest run
    pub fn return_code(&self) -> Option<i32> {
        self.current_run().and_then(|run| run.return_code)
    }
}

/// Output file name for a source: same stem, `.mkv` container.
pub fn standard_name_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}.mkv", stem)
}

/// The live attempt for one Vid.
#[derive(Debug)]
pub struct Job {
    pub vid: Vid,
    pub tier: RetryTier,
    /// Encoder output, renamed over the source on success
    pub temp_file: PathBuf,
    /// `ORIG.<basename>` next to the source
    pub orig_backup_file: PathBuf,
    /// Seconds of media this attempt should produce
    pub duration_secs: f64,
    /// `duration_secs` rendered for progress lines
    pub total_duration: String,
    pub started: Instant,
    pub monitor: ProcessMonitor,
    pub interpreter: ProgressInterpreter,
}

impl Job {
    pub fn is_retry(&self) -> bool {
        self.tier.is_retry()
    }

    pub fn is_software_fallback(&self) -> bool {
        self.tier.is_software_fallback()
    }

    /// Advance the progress interpreter by one step.
    pub fn progress(&mut self) -> ProgressUpdate {
        self.progress_at(Instant::now())
    }

    pub fn progress_at(&mut self, now: Instant) -> ProgressUpdate {
        let Job {
            vid,
            monitor,
            interpreter,
            ..
        } = self;
        interpreter.step_at(monitor, vid.current_run_mut(), now)
    }

    /// Total duration label for the given seconds.
    pub fn duration_label(duration_secs: f64) -> String {
        format_duration(duration_secs.max(0.0).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::probe;

    #[test]
    fn test_standard_name() {
        assert_eq!(
            standard_name_for(Path::new("/tv/Show.S01E01.x264.mp4")),
            "Show.S01E01.x264.mkv"
        );
        assert_eq!(standard_name_for(Path::new("film.mkv")), "film.mkv");
    }

    #[test]
    fn test_vid_runs() {
        let mut vid = Vid::new("/media/film.avi", probe("mpeg4", 720, 480, 1500, 1));
        assert_eq!(vid.basename(), "film.avi");
        assert_eq!(vid.standard_path(), PathBuf::from("/media/film.mkv"));
        assert_eq!(vid.return_code(), None);

        vid.start_new_run("initial run").return_code = Some(1);
        vid.start_new_run("redo w err tolerance");
        assert_eq!(vid.runs.len(), 2);
        assert_eq!(vid.current_run().unwrap().descr, "redo w err tolerance");
        assert_eq!(vid.return_code(), None);
    }

    #[test]
    fn test_current_run_mut_creates_missing_run() {
        let mut vid = Vid::new("film.avi", probe("mpeg4", 720, 480, 1500, 1));
        vid.current_run_mut().texts.push("x".to_string());
        assert_eq!(vid.runs.len(), 1);
        assert_eq!(vid.dir(), Path::new(""));
    }

    #[test]
    fn test_tier_flags() {
        assert!(!RetryTier::Initial.is_retry());
        assert!(RetryTier::Tolerant.is_retry());
        assert!(!RetryTier::Tolerant.is_software_fallback());
        assert!(RetryTier::Software.is_retry());
        assert!(RetryTier::Software.is_software_fallback());
        assert_eq!(RetryTier::Software.to_string(), "retry w S/W convert");
    }
}
