//! Typed configuration for the encoder, supervisor, acceptance policy and probe cache

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// What to do with subtitle streams of the source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubtitleMode {
    /// Carry subtitle streams into the output unchanged
    #[default]
    Copy,
    /// Leave subtitle streams out of the output
    Drop,
}

/// Which source codecs already count as "good"
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AllowedCodecs {
    /// Every codec is allowed
    #[serde(rename = "all")]
    All,
    /// Only HEVC is allowed
    #[default]
    #[serde(rename = "x265")]
    X265,
    /// HEVC and H.264 are allowed
    #[serde(rename = "x26*")]
    X26x,
}

impl AllowedCodecs {
    /// Whether a probed codec name is in the allowed set
    pub fn allows(&self, codec: &str) -> bool {
        match self {
            AllowedCodecs::All => true,
            AllowedCodecs::X265 => codec == "hevc",
            AllowedCodecs::X26x => matches!(codec, "hevc" | "h264"),
        }
    }
}

/// Encoder parameters handed to the command builder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Constant rate factor / quality (default 28)
    #[serde(default = "default_quality")]
    pub quality: u32,
    /// Encoder thread count (0 = let the encoder decide)
    #[serde(default)]
    pub thread_count: u32,
    /// Encode only a short sample window instead of the whole file
    #[serde(default)]
    pub sample: bool,
    /// Length of the sample window in seconds (default 30)
    #[serde(default = "default_sample_seconds")]
    pub sample_seconds: u32,
    /// Directory receiving sample outputs
    #[serde(default = "default_sample_dir")]
    pub sample_dir: PathBuf,
    /// Sources taller than this are scaled down to it (default 1080)
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    /// Override for the output color space
    #[serde(default)]
    pub color_space: Option<String>,
    /// Override for the output color primaries
    #[serde(default)]
    pub color_primaries: Option<String>,
    /// Override for the output transfer characteristics
    #[serde(default)]
    pub color_trc: Option<String>,
    /// Subtitle handling (default copy)
    #[serde(default)]
    pub subtitles: SubtitleMode,
    /// Run the encoder under nice/ionice (default true)
    #[serde(default = "default_true")]
    pub use_nice_ionice: bool,
    /// Use hardware (VAAPI) encoding when not in software fallback (default true)
    #[serde(default = "default_true")]
    pub use_acceleration: bool,
    /// VAAPI render node
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: String,
}

fn default_quality() -> u32 {
    28
}

fn default_sample_seconds() -> u32 {
    30
}

fn default_sample_dir() -> PathBuf {
    PathBuf::from("/tmp/rmbloat-samples")
}

fn default_max_height() -> u32 {
    1080
}

fn default_true() -> bool {
    true
}

fn default_vaapi_device() -> String {
    "/dev/dri/renderD128".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            quality: default_quality(),
            thread_count: 0,
            sample: false,
            sample_seconds: default_sample_seconds(),
            sample_dir: default_sample_dir(),
            max_height: default_max_height(),
            color_space: None,
            color_primaries: None,
            color_trc: None,
            subtitles: SubtitleMode::default(),
            use_nice_ionice: true,
            use_acceleration: true,
            vaapi_device: default_vaapi_device(),
        }
    }
}

/// Job supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    /// Seconds without encoder output before a job counts as stalled (default 300)
    #[serde(default = "default_progress_secs_max")]
    pub progress_secs_max: u64,
    /// Seconds to wait after SIGTERM before force-killing (default 15)
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

fn default_progress_secs_max() -> u64 {
    300
}

fn default_stop_grace_secs() -> u64 {
    15
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            progress_secs_max: default_progress_secs_max(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

/// Post-run acceptability configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AcceptanceConfig {
    /// Required shrink in percent when the source codec was already allowed (default 10)
    #[serde(default = "default_min_shrink_pct")]
    pub min_shrink_pct: i64,
    /// Codecs considered already good (default x265)
    #[serde(default)]
    pub allowed_codecs: AllowedCodecs,
    /// Keep the original as ORIG.<name> instead of removing it
    #[serde(default)]
    pub keep_backup: bool,
    /// Bloat score at or above which an allowed-codec file is still selected (default 1600)
    #[serde(default = "default_min_bloat")]
    pub min_bloat: u64,
}

fn default_min_shrink_pct() -> i64 {
    10
}

fn default_min_bloat() -> u64 {
    1600
}

impl Default for AcceptanceConfig {
    fn default() -> Self {
        Self {
            min_shrink_pct: default_min_shrink_pct(),
            allowed_codecs: AllowedCodecs::default(),
            keep_backup: false,
            min_bloat: default_min_bloat(),
        }
    }
}

/// Probe cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Directory holding the cache file
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Cache file name
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    /// Concurrent probes during batch probing (default 8)
    #[serde(default = "default_probe_workers")]
    pub workers: usize,
    /// Flush the cache once this many entries are dirty (default 100)
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_cache_file() -> String {
    "video_probes.json".to_string()
}

fn default_probe_workers() -> usize {
    8
}

fn default_flush_every() -> usize {
    100
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_file: default_cache_file(),
            workers: default_probe_workers(),
            flush_every: default_flush_every(),
        }
    }
}

impl ProbeConfig {
    /// Full path of the cache file
    pub fn cache_path(&self) -> PathBuf {
        self.cache_dir.join(&self.cache_file)
    }
}

/// Complete rmbloat configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub acceptance: AcceptanceConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

fn parse_bool(val: &str) -> Option<bool> {
    // Accept "true", "1", "yes" as true; "false", "0", "no" as false
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Read and parse a TOML config file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse a TOML document; missing sections take their defaults
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RMBLOAT_QUALITY -> encoder.quality
    /// - RMBLOAT_THREAD_COUNT -> encoder.thread_count
    /// - RMBLOAT_USE_ACCELERATION -> encoder.use_acceleration
    /// - RMBLOAT_PROGRESS_SECS_MAX -> supervisor.progress_secs_max
    /// - RMBLOAT_MIN_SHRINK_PCT -> acceptance.min_shrink_pct
    /// - RMBLOAT_KEEP_BACKUP -> acceptance.keep_backup
    /// - RMBLOAT_PROBE_WORKERS -> probe.workers
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RMBLOAT_QUALITY") {
            if let Ok(quality) = val.parse::<u32>() {
                self.encoder.quality = quality;
            }
        }

        if let Ok(val) = env::var("RMBLOAT_THREAD_COUNT") {
            if let Ok(threads) = val.parse::<u32>() {
                self.encoder.thread_count = threads;
            }
        }

        if let Ok(val) = env::var("RMBLOAT_USE_ACCELERATION") {
            if let Some(flag) = parse_bool(&val) {
                self.encoder.use_acceleration = flag;
            }
        }

        if let Ok(val) = env::var("RMBLOAT_PROGRESS_SECS_MAX") {
            if let Ok(secs) = val.parse::<u64>() {
                self.supervisor.progress_secs_max = secs;
            }
        }

        if let Ok(val) = env::var("RMBLOAT_MIN_SHRINK_PCT") {
            if let Ok(pct) = val.parse::<i64>() {
                self.acceptance.min_shrink_pct = pct;
            }
        }

        if let Ok(val) = env::var("RMBLOAT_KEEP_BACKUP") {
            if let Some(flag) = parse_bool(&val) {
                self.acceptance.keep_backup = flag;
            }
        }

        if let Ok(val) = env::var("RMBLOAT_PROBE_WORKERS") {
            if let Ok(workers) = val.parse::<usize>() {
                if workers > 0 {
                    self.probe.workers = workers;
                }
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults with environment overrides, for runs without a config file
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }
}
