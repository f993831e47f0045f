//! Probe collaborator: media metadata for sources and finished outputs.
//!
//! [`FfprobeProber`] shells out to ffprobe; [`ProbeCache`] keeps results on
//! disk so repeated scans of a library do not re-probe unchanged files.

pub mod cache;

pub use cache::{CacheError, ProbeCache};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Command;
use thiserror::Error;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The file to probe does not exist.
    #[error("file not found: {0}")]
    NotFound(String),

    /// ffprobe could not be run or exited non-zero.
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// ffprobe output could not be understood.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Probe record for one file, exactly as stored in the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Probe {
    /// Sticky marker for files that failed (`Er1`..`Er9`) or would not shrink (`OPT`)
    pub anomaly: Option<String>,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    /// Container bitrate in kbit/s
    pub bitrate: u64,
    /// Seconds
    pub duration: f64,
    pub size_bytes: u64,
    /// Compact color descriptor, `space,primaries|~,trc|~`
    pub color_spt: String,
    pub pix_fmt: String,
}

impl Probe {
    /// Size in GiB rounded to 3 decimals
    pub fn gb(&self) -> f64 {
        (self.size_bytes as f64 / BYTES_PER_GIB * 1000.0).round() / 1000.0
    }

    /// Bitrate normalised by frame diagonal-ish area; 0 when dimensions are unknown.
    pub fn bloat(&self) -> u64 {
        let area = f64::from(self.width) * f64::from(self.height);
        if area > 0.0 {
            (self.bitrate as f64 / area.sqrt() * 1000.0).round() as u64
        } else {
            0
        }
    }
}

/// Anything that can produce a [`Probe`] for a path.
pub trait Prober: Send + Sync {
    fn probe(&self, path: &Path) -> Result<Probe, ProbeError>;
}

/// Prober backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: String,
}

impl Default for FfprobeProber {
    fn default() -> Self {
        Self {
            program: "ffprobe".to_string(),
        }
    }
}

impl FfprobeProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different ffprobe executable
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Prober for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<Probe, ProbeError> {
        if !path.exists() {
            return Err(ProbeError::NotFound(path.display().to_string()));
        }

        let output = Command::new(&self.program)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .map_err(|e| ProbeError::FfprobeFailed(format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let size_bytes = std::fs::metadata(path)?.len();
        parse_ffprobe_output(&String::from_utf8_lossy(&output.stdout), size_bytes)
    }
}

mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub codec_name: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
        pub pix_fmt: Option<String>,
        pub color_space: Option<String>,
        pub color_primaries: Option<String>,
        pub color_transfer: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
        pub bit_rate: Option<String>,
    }
}

/// Build a [`Probe`] from ffprobe JSON and the file's on-disk size.
///
/// The first video stream supplies geometry, codec and color; the container
/// supplies bitrate and duration.
pub fn parse_ffprobe_output(json_str: &str, size_bytes: u64) -> Result<Probe, ProbeError> {
    let parsed: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let format = parsed
        .format
        .ok_or_else(|| ProbeError::ParseError("missing format section".to_string()))?;
    let video = parsed
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ProbeError::ParseError("no video stream".to_string()))?;

    let bitrate = format
        .bit_rate
        .as_deref()
        .and_then(|b| b.parse::<u64>().ok())
        .map_or(0, |bps| bps / 1000);
    let duration = format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(Probe {
        anomaly: None,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        codec: video.codec_name.unwrap_or_else(|| "unk_codec".to_string()),
        bitrate,
        duration,
        size_bytes,
        color_spt: color_spt(
            video.color_space.as_deref(),
            video.color_primaries.as_deref(),
            video.color_transfer.as_deref(),
        ),
        pix_fmt: video.pix_fmt.unwrap_or_default(),
    })
}

/// Compact color descriptor; `~` repeats the previous component.
pub fn color_spt(space: Option<&str>, primaries: Option<&str>, trc: Option<&str>) -> String {
    let space = space.unwrap_or("unknown");
    let primaries = primaries.unwrap_or("unknown");
    let trc = trc.unwrap_or("unknown");
    format!(
        "{},{},{}",
        space,
        if primaries == space { "~" } else { primaries },
        if trc == primaries { "~" } else { trc },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::probe;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "audio", "codec_name": "aac"},
            {"index": 1, "codec_type": "video", "codec_name": "h264", "width": 1920,
             "height": 1080, "pix_fmt": "yuv420p", "color_space": "bt709",
             "color_primaries": "bt709", "color_transfer": "bt709"}
        ],
        "format": {"duration": "5400.250000", "bit_rate": "8000000", "size": "1"}
    }"#;

    #[test]
    fn test_parse_ffprobe_output_picks_video_stream() {
        let probe = parse_ffprobe_output(SAMPLE, 5_400_000_000).unwrap();
        assert_eq!(probe.codec, "h264");
        assert_eq!((probe.width, probe.height), (1920, 1080));
        assert_eq!(probe.bitrate, 8000);
        assert!((probe.duration - 5400.25).abs() < 1e-9);
        assert_eq!(probe.size_bytes, 5_400_000_000);
        assert_eq!(probe.color_spt, "bt709,~,~");
        assert_eq!(probe.pix_fmt, "yuv420p");
        assert_eq!(probe.anomaly, None);
    }

    #[test]
    fn test_parse_ffprobe_output_missing_optional_fields() {
        let json = r#"{"streams": [{"codec_type": "video"}], "format": {}}"#;
        let probe = parse_ffprobe_output(json, 10).unwrap();
        assert_eq!(probe.codec, "unk_codec");
        assert_eq!(probe.bitrate, 0);
        assert_eq!(probe.duration, 0.0);
        assert_eq!(probe.color_spt, "unknown,~,~");
    }

    #[test]
    fn test_parse_ffprobe_output_rejects_incomplete() {
        let no_video = r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        assert!(matches!(
            parse_ffprobe_output(no_video, 0),
            Err(ProbeError::ParseError(_))
        ));
        let no_format = r#"{"streams": [{"codec_type": "video"}]}"#;
        assert!(parse_ffprobe_output(no_format, 0).is_err());
        assert!(parse_ffprobe_output("not json", 0).is_err());
    }

    #[test]
    fn test_color_spt_placeholders() {
        assert_eq!(color_spt(Some("bt709"), Some("bt709"), Some("bt709")), "bt709,~,~");
        assert_eq!(
            color_spt(Some("bt2020nc"), Some("bt2020"), Some("smpte2084")),
            "bt2020nc,bt2020,smpte2084"
        );
        assert_eq!(color_spt(Some("bt470bg"), Some("bt709"), Some("bt709")), "bt470bg,bt709,~");
        assert_eq!(color_spt(None, None, Some("bt709")), "unknown,~,bt709");
    }

    #[test]
    fn test_derived_fields() {
        let p = probe("h264", 1920, 1080, 8000, 3 * 1024 * 1024 * 1024 / 2);
        assert_eq!(p.gb(), 1.5);
        // 8000 / sqrt(1920*1080) * 1000 = 5555.6
        assert_eq!(p.bloat(), 5556);

        let unknown = probe("h264", 0, 0, 8000, 0);
        assert_eq!(unknown.bloat(), 0);
        assert_eq!(unknown.gb(), 0.0);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let result = FfprobeProber::new().probe(Path::new("/nonexistent/rmbloat/file.mkv"));
        assert!(matches!(result, Err(ProbeError::NotFound(_))));
    }
}
