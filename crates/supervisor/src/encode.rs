//! Encoder command construction.
//!
//! The supervisor only runs and observes a command line; building it is the
//! job of a [`CommandBuilder`]. [`FfmpegCommand`] produces HEVC encodes with
//! ffmpeg, on VAAPI hardware when enabled and with libx265 otherwise.

use crate::jobs::RetryTier;
use crate::probe::Probe;
use rmbloat_config::{EncoderConfig, SubtitleMode};
use std::path::Path;

const DEFAULT_SPACE: &str = "bt709";
const DEFAULT_PRIMARIES: &str = "bt709";
/// Transfer characteristics use the numeric spelling.
const DEFAULT_TRC: &str = "709";

/// Sample windows start this far (as a fraction) into the source.
const SAMPLE_START_FRACTION: f64 = 0.20;
/// Sources shorter than this are treated as this long when placing a sample.
const SAMPLE_MIN_BASIS_SECS: f64 = 120.0;

/// Everything a builder needs to know about one attempt.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub input: &'a Path,
    pub output: &'a Path,
    pub probe: &'a Probe,
    pub tier: RetryTier,
    /// Encode only `(start_secs, length_secs)` of the source
    pub sample_window: Option<(f64, u32)>,
}

/// Builds the argument vector (program first) for one encode attempt.
pub trait CommandBuilder {
    fn build(&self, request: &EncodeRequest<'_>) -> Vec<String>;
}

/// Sample window for a source of `duration_secs`.
pub fn sample_window(duration_secs: f64, sample_seconds: u32) -> (f64, u32) {
    (duration_secs.max(SAMPLE_MIN_BASIS_SECS) * SAMPLE_START_FRACTION, sample_seconds)
}

/// Whether to produce a 10-bit encode for this source pixel format.
///
/// 10-bit sources stay 10-bit. Everything else, including 8-bit mpeg4 and
/// exotic formats such as `yuvj420p`, is encoded 8-bit.
pub fn should_use_10bit(pix_fmt: &str) -> bool {
    ["10le", "10be", "p010", "p210"]
        .iter()
        .any(|marker| pix_fmt.contains(marker))
}

/// `-colorspace`/`-color_primaries`/`-color_trc` from a compact descriptor.
///
/// `~` repeats the previous component; `unknown` falls back to BT.709.
pub fn color_opts(color_spt: &str, config: &EncoderConfig) -> Vec<String> {
    let mut parts = color_spt.split(',');
    let space = parts.next().filter(|s| !s.is_empty()).unwrap_or("unknown");
    let primaries = match parts.next() {
        Some("~") | None => space,
        Some(p) => p,
    };
    let trc = match parts.next() {
        Some("~") | None => primaries,
        Some(t) => t,
    };

    let space = if space == "unknown" { DEFAULT_SPACE } else { space };
    let primaries = if primaries == "unknown" { DEFAULT_PRIMARIES } else { primaries };
    let trc = match trc {
        "unknown" | "bt709" => DEFAULT_TRC,
        other => other,
    };

    vec![
        "-colorspace".to_string(),
        config.color_space.as_deref().unwrap_or(space).to_string(),
        "-color_primaries".to_string(),
        config.color_primaries.as_deref().unwrap_or(primaries).to_string(),
        "-color_trc".to_string(),
        config.color_trc.as_deref().unwrap_or(trc).to_string(),
    ]
}

/// Quote an argument vector for display as a shell command line.
pub fn shell_quote(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let safe = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,@%".contains(c));
            if safe {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// ffmpeg HEVC command builder
#[derive(Debug, Clone, Default)]
pub struct FfmpegCommand {
    config: EncoderConfig,
}

impl FfmpegCommand {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    fn video_filters(
        &self,
        request: &EncodeRequest<'_>,
        accelerated: bool,
        ten_bit: bool,
    ) -> Vec<String> {
        let probe = request.probe;
        let mut filters = Vec::new();

        if request.tier == RetryTier::Tolerant && probe.width > 0 && probe.height > 0 {
            // Pinned geometry keeps the filter graph stable across mid-stream changes.
            filters.push(format!("scale={}:{}", probe.width, probe.height));
        } else if probe.height > self.config.max_height {
            let width = u64::from(self.config.max_height) * u64::from(probe.width)
                / u64::from(probe.height);
            filters.push(format!("scale={}:-2", width));
        }

        if accelerated {
            filters.push(if ten_bit { "format=p010" } else { "format=nv12" }.to_string());
            filters.push("hwupload".to_string());
        }
        filters
    }
}

impl CommandBuilder for FfmpegCommand {
    fn build(&self, request: &EncodeRequest<'_>) -> Vec<String> {
        let config = &self.config;
        let accelerated = config.use_acceleration && request.tier != RetryTier::Software;
        let ten_bit = should_use_10bit(&request.probe.pix_fmt);
        let mut cmd: Vec<String> = Vec::new();
        let mut push = |args: &[&str]| cmd.extend(args.iter().map(|a| a.to_string()));

        if config.use_nice_ionice {
            push(&["nice", "-n", "19", "ionice", "-c3"]);
        }
        push(&["ffmpeg", "-hide_banner", "-nostats", "-y"]);

        if request.tier.is_retry() {
            push(&["-err_detect", "ignore_err", "-fflags", "+genpts+discardcorrupt"]);
        }
        if accelerated {
            cmd.extend(["-vaapi_device".to_string(), config.vaapi_device.clone()]);
        }
        if let Some((start, _)) = request.sample_window {
            cmd.extend(["-ss".to_string(), format!("{:.2}", start)]);
        }
        cmd.extend(["-i".to_string(), request.input.display().to_string()]);
        if let Some((_, length)) = request.sample_window {
            cmd.extend(["-t".to_string(), length.to_string()]);
        }
        if config.thread_count > 0 {
            cmd.extend(["-threads".to_string(), config.thread_count.to_string()]);
        }

        cmd.extend(["-progress".to_string(), "pipe:2".to_string()]);

        let mut map = vec!["-map", "0:v:0", "-map", "0:a?", "-c:a", "copy"];
        match config.subtitles {
            SubtitleMode::Copy => map.extend(["-map", "0:s?", "-c:s", "copy"]),
            SubtitleMode::Drop => map.extend(["-map", "-0:s"]),
        }
        map.extend(["-map", "-0:t", "-map", "-0:d"]);
        cmd.extend(map.into_iter().map(String::from));

        let filters = self.video_filters(request, accelerated, ten_bit);
        if !filters.is_empty() {
            cmd.extend(["-vf".to_string(), filters.join(",")]);
        }

        if accelerated {
            cmd.extend([
                "-c:v".to_string(),
                "hevc_vaapi".to_string(),
                "-qp".to_string(),
                config.quality.to_string(),
            ]);
            if ten_bit {
                cmd.extend(["-profile:v".to_string(), "main10".to_string()]);
            }
        } else {
            cmd.extend([
                "-c:v".to_string(),
                "libx265".to_string(),
                "-crf".to_string(),
                config.quality.to_string(),
                "-preset".to_string(),
                "medium".to_string(),
            ]);
            if ten_bit {
                cmd.extend(["-pix_fmt".to_string(), "yuv420p10le".to_string()]);
            }
        }

        cmd.extend(color_opts(&request.probe.color_spt, config));
        cmd.push(request.output.display().to_string());
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::probe;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn build(
        config: EncoderConfig,
        probe: &Probe,
        tier: RetryTier,
        sample: Option<(f64, u32)>,
    ) -> Vec<String> {
        let input = PathBuf::from("/media/in put.mp4");
        let output = PathBuf::from("/media/TEMP.in put.mkv");
        FfmpegCommand::new(config).build(&EncodeRequest {
            input: &input,
            output: &output,
            probe,
            tier,
            sample_window: sample,
        })
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_initial_accelerated_command() {
        let src = probe("h264", 1920, 1080, 8000, 1);
        let args = build(EncoderConfig::default(), &src, RetryTier::Initial, None);

        assert_eq!(&args[..5], &["nice", "-n", "19", "ionice", "-c3"]);
        assert_eq!(args[5], "ffmpeg");
        assert_eq!(value_after(&args, "-progress"), Some("pipe:2"));
        assert_eq!(value_after(&args, "-c:v"), Some("hevc_vaapi"));
        assert_eq!(value_after(&args, "-qp"), Some("28"));
        assert_eq!(value_after(&args, "-vf"), Some("format=nv12,hwupload"));
        assert_eq!(value_after(&args, "-i"), Some("/media/in put.mp4"));
        assert_eq!(args.last().map(String::as_str), Some("/media/TEMP.in put.mkv"));
        assert!(!args.contains(&"-err_detect".to_string()));
        assert!(!args.contains(&"-ss".to_string()));
    }

    #[test]
    fn test_software_tier_uses_libx265() {
        let src = probe("h264", 1280, 720, 3000, 1);
        let args = build(EncoderConfig::default(), &src, RetryTier::Software, None);

        assert_eq!(value_after(&args, "-c:v"), Some("libx265"));
        assert_eq!(value_after(&args, "-crf"), Some("28"));
        assert!(!args.contains(&"-vaapi_device".to_string()));
        assert!(!args.contains(&"-vf".to_string()));
        assert_eq!(value_after(&args, "-err_detect"), Some("ignore_err"));
    }

    #[test]
    fn test_tolerant_tier_pins_resolution() {
        let src = probe("mpeg4", 720, 480, 1500, 1);
        let args = build(EncoderConfig::default(), &src, RetryTier::Tolerant, None);

        assert_eq!(value_after(&args, "-vf"), Some("scale=720:480,format=nv12,hwupload"));
        assert_eq!(value_after(&args, "-fflags"), Some("+genpts+discardcorrupt"));
        // Error-tolerant flags belong to the input
        let flag = args.iter().position(|a| a == "-err_detect").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(flag < input);
    }

    #[test]
    fn test_tall_sources_are_scaled_down() {
        let src = probe("h264", 3840, 2160, 20000, 1);
        let config = EncoderConfig {
            use_acceleration: false,
            use_nice_ionice: false,
            ..EncoderConfig::default()
        };
        let args = build(config, &src, RetryTier::Initial, None);
        assert_eq!(args[0], "ffmpeg");
        assert_eq!(value_after(&args, "-vf"), Some("scale=1920:-2"));
    }

    #[test]
    fn test_sample_window_and_threads() {
        let src = probe("h264", 1920, 1080, 8000, 1);
        let config = EncoderConfig {
            thread_count: 4,
            subtitles: SubtitleMode::Drop,
            ..EncoderConfig::default()
        };
        let window = sample_window(50.0, 30);
        assert_eq!(window, (24.0, 30));
        let args = build(config, &src, RetryTier::Initial, Some(window));

        let ss = args.iter().position(|a| a == "-ss").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        let t = args.iter().position(|a| a == "-t").unwrap();
        assert!(ss < input && input < t);
        assert_eq!(args[ss + 1], "24.00");
        assert_eq!(args[t + 1], "30");
        assert_eq!(value_after(&args, "-threads"), Some("4"));
        assert!(args.windows(2).any(|w| w[0] == "-map" && w[1] == "-0:s"));
    }

    #[test]
    fn test_ten_bit_decision() {
        assert!(should_use_10bit("yuv420p10le"));
        assert!(should_use_10bit("p010le"));
        assert!(!should_use_10bit("yuv420p"));
        assert!(!should_use_10bit("yuvj420p"));
        assert!(!should_use_10bit(""));

        let mut src = probe("hevc", 1920, 1080, 8000, 1);
        src.pix_fmt = "yuv420p10le".to_string();
        let args = build(EncoderConfig::default(), &src, RetryTier::Initial, None);
        assert_eq!(value_after(&args, "-profile:v"), Some("main10"));
        assert_eq!(value_after(&args, "-vf"), Some("format=p010,hwupload"));
    }

    #[test]
    fn test_color_opts_fallbacks() {
        let config = EncoderConfig::default();
        assert_eq!(
            color_opts("bt709,~,~", &config),
            vec!["-colorspace", "bt709", "-color_primaries", "bt709", "-color_trc", "709"]
        );
        assert_eq!(
            color_opts("unknown,~,~", &config),
            vec!["-colorspace", "bt709", "-color_primaries", "bt709", "-color_trc", "709"]
        );
        assert_eq!(
            color_opts("bt2020nc,bt2020,smpte2084", &config),
            vec!["-colorspace", "bt2020nc", "-color_primaries", "bt2020", "-color_trc", "smpte2084"]
        );

        let overridden = EncoderConfig {
            color_trc: Some("bt2020-10".to_string()),
            ..EncoderConfig::default()
        };
        assert_eq!(color_opts("bt709,~,~", &overridden)[5], "bt2020-10");
    }

    #[test]
    fn test_shell_quote() {
        let args: Vec<String> = ["ffmpeg", "-i", "it's here.mkv", "-vf", "scale=1:2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(shell_quote(&args), r"ffmpeg -i 'it'\''s here.mkv' -vf scale=1:2");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_output_last_and_progress_on_stderr(
            width in 1u32..8000,
            height in 1u32..5000,
            accelerated in proptest::bool::ANY,
            tier in prop::sample::select(vec![
                RetryTier::Initial,
                RetryTier::Tolerant,
                RetryTier::Software,
            ]),
            quality in 10u32..40,
        ) {
            let src = probe("h264", width, height, 5000, 1);
            let config = EncoderConfig {
                quality,
                use_acceleration: accelerated,
                ..EncoderConfig::default()
            };
            let args = build(config, &src, tier, None);

            prop_assert_eq!(args.last().map(String::as_str), Some("/media/TEMP.in put.mkv"));
            prop_assert_eq!(value_after(&args, "-progress"), Some("pipe:2"));
            let codec = value_after(&args, "-c:v").unwrap();
            let q = quality.to_string();
            if accelerated && tier != RetryTier::Software {
                prop_assert_eq!(codec, "hevc_vaapi");
                prop_assert_eq!(value_after(&args, "-qp"), Some(q.as_str()));
            } else {
                prop_assert_eq!(codec, "libx265");
                prop_assert_eq!(value_after(&args, "-crf"), Some(q.as_str()));
            }
        }
    }
}
