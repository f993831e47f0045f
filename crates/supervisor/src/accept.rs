//! Acceptance policy: which files to convert and whether a result is kept.

use crate::probe::Probe;
use rmbloat_config::{AcceptanceConfig, AllowedCodecs};

/// Outcome of the post-run shrink check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accept,
    /// The source already used an allowed codec and did not shrink enough
    Reject { net_pct: i64, min_shrink_pct: i64 },
}

/// Size change in whole percent; negative means the output is smaller.
///
/// The old size is floored at 0.001 GiB so tiny sources do not divide by zero.
pub fn net_change_pct(old_gb: f64, new_gb: f64) -> i64 {
    ((new_gb - old_gb) / old_gb.max(0.001) * 100.0).round() as i64
}

/// Whether the probed codec counts as already good.
///
/// A codec field that is not a codec name (e.g. `---`) is treated as allowed
/// so it is never picked for conversion.
pub fn is_allowed_codec(allowed: AllowedCodecs, codec: &str) -> bool {
    let looks_like_codec = codec
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && codec.chars().all(|c| c.is_alphanumeric() || c == '_');
    !looks_like_codec || allowed.allows(codec)
}

/// Post-run shrink check.
///
/// Only sources whose codec was already allowed must shrink by at least
/// `min_shrink_pct`; any result is accepted for other codecs.
pub fn check_shrink(original_allowed: bool, net_pct: i64, min_shrink_pct: i64) -> Acceptance {
    if original_allowed && net_pct > -min_shrink_pct {
        Acceptance::Reject {
            net_pct,
            min_shrink_pct,
        }
    } else {
        Acceptance::Accept
    }
}

/// Operations-log line for a rejected result
pub fn rejection_note(codec: &str, net_pct: i64, min_shrink_pct: i64) -> String {
    format!(
        "REJECTED: Already {} and shrink ({}%) not > -{}%",
        codec, net_pct, min_shrink_pct
    )
}

/// Whether a probed file should be queued for conversion.
///
/// Files with a recorded anomaly are skipped. Otherwise a file is chosen if
/// its codec is not allowed, or if it is bloated enough to be worth redoing.
pub fn wants_conversion(probe: &Probe, config: &AcceptanceConfig) -> bool {
    if probe.anomaly.is_some() {
        return false;
    }
    !is_allowed_codec(config.allowed_codecs, &probe.codec) || probe.bloat() >= config.min_bloat
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::probe;
    use proptest::prelude::*;

    #[test]
    fn test_net_change_pct() {
        assert_eq!(net_change_pct(2.0, 1.0), -50);
        assert_eq!(net_change_pct(1.0, 1.0), 0);
        assert_eq!(net_change_pct(1.0, 1.25), 25);
        // Floor on the denominator
        assert_eq!(net_change_pct(0.0, 0.001), 100);
    }

    #[test]
    fn test_shrink_check_only_for_allowed_sources() {
        assert_eq!(
            check_shrink(true, -5, 10),
            Acceptance::Reject { net_pct: -5, min_shrink_pct: 10 }
        );
        // Shrinking by exactly the minimum is enough
        assert_eq!(check_shrink(true, -10, 10), Acceptance::Accept);
        assert_eq!(
            check_shrink(true, -9, 10),
            Acceptance::Reject { net_pct: -9, min_shrink_pct: 10 }
        );
        assert_eq!(check_shrink(true, -11, 10), Acceptance::Accept);
        // Disallowed source codecs accept any size, even growth
        assert_eq!(check_shrink(false, 40, 10), Acceptance::Accept);
    }

    #[test]
    fn test_rejection_note() {
        assert_eq!(
            rejection_note("hevc", -4, 10),
            "REJECTED: Already hevc and shrink (-4%) not > -10%"
        );
    }

    #[test]
    fn test_is_allowed_codec() {
        assert!(is_allowed_codec(AllowedCodecs::X265, "hevc"));
        assert!(!is_allowed_codec(AllowedCodecs::X265, "h264"));
        assert!(is_allowed_codec(AllowedCodecs::X26x, "h264"));
        assert!(!is_allowed_codec(AllowedCodecs::X26x, "mpeg4"));
        assert!(is_allowed_codec(AllowedCodecs::All, "mpeg4"));
        assert!(is_allowed_codec(AllowedCodecs::X265, "---"));
        assert!(is_allowed_codec(AllowedCodecs::X265, ""));
    }

    #[test]
    fn test_wants_conversion() {
        let config = AcceptanceConfig::default();

        assert!(wants_conversion(&probe("h264", 1920, 1080, 1000, 1), &config));
        // Allowed codec with modest bitrate is left alone
        assert!(!wants_conversion(&probe("hevc", 1920, 1080, 1000, 1), &config));
        // Allowed but bloated (bloat 5556)
        assert!(wants_conversion(&probe("hevc", 1920, 1080, 8000, 1), &config));

        let mut failed = probe("h264", 1920, 1080, 1000, 1);
        failed.anomaly = Some("Er1".to_string());
        assert!(!wants_conversion(&failed, &config));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_disallowed_sources_always_accepted(net in -100i64..500, min in 0i64..100) {
            prop_assert_eq!(check_shrink(false, net, min), Acceptance::Accept);
        }

        #[test]
        fn prop_allowed_sources_need_min_shrink(net in -100i64..500, min in 0i64..100) {
            let accepted = check_shrink(true, net, min) == Acceptance::Accept;
            prop_assert_eq!(accepted, net <= -min);
        }

        #[test]
        fn prop_net_change_sign(old in 0.01f64..100.0, new in 0.0f64..100.0) {
            let net = net_change_pct(old, new);
            if new < old * 0.99 {
                prop_assert!(net < 0);
            }
            if new > old * 1.01 {
                prop_assert!(net > 0);
            }
        }
    }
}
