//! rmbloat supervisor
//!
//! Runs ffmpeg re-encodes one file at a time, watching the encoder's output,
//! classifying failures and retrying with progressively more forgiving
//! strategies before swapping a smaller result over the original.

pub mod accept;
pub mod classify;
pub mod encode;
pub mod jobs;
pub mod ladder;
pub mod monitor;
pub mod probe;
pub mod progress;
pub mod replace;
pub mod scan;

pub use accept::{wants_conversion, Acceptance};
pub use classify::{post_mortem, software_retry_eligible, tolerant_retry_eligible, CorruptionReport};
pub use encode::{CommandBuilder, EncodeRequest, FfmpegCommand};
pub use jobs::{Job, RetryTier, Run, Vid};
pub use ladder::{FinalStatus, JobOutcome, JobPoll, RetryLadder, Vitals};
pub use monitor::{EventSource, MonitorEvent, ProcessMonitor};
pub use probe::{FfprobeProber, Probe, ProbeCache, ProbeError, Prober};
pub use progress::{ProgressInterpreter, ProgressUpdate};
pub use replace::{swap_into_place, ReplaceError};
pub use rmbloat_config as config;
pub use rmbloat_config::Config;
pub use scan::scan_paths;
