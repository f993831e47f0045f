//! Failure classification over a run's captured encoder output.
//!
//! Three questions are answered from free text: is the failure worth a
//! tolerant retry, is it worth a software retry, and how badly corrupt is the
//! source. A zero exit code is never classified as failing.

use crate::jobs::Run;

/// Encoder messages showing the filter graph could not be rebuilt.
pub const FILTER_REINIT_SIGNALS: &[&str] = &[
    "Error reinitializing filters",
    "Impossible to convert between the formats",
];

/// Filter-graph messages that justify a tolerant retry.
pub const TOLERANT_RETRY_SIGNALS: &[&str] = &[
    "Error reinitializing filters",
    "Impossible to convert between the formats",
    "Reconfiguring filter graph because video parameters changed",
];

/// Known corruption messages and their weights, checked in order.
pub const CORRUPTION_SEVERITY: &[(&str, u32)] = &[
    ("corrupt decoded frame", 10),
    ("illegal mb_num", 9),
    ("marker does not match f_code", 9),
    ("damaged at", 8),
    ("Error at MB:", 7),
    ("time_increment_bits", 6),
    ("slice end not reached", 5),
    ("concealing", 2),
];

/// Severity at which a failed run earns a tolerant retry.
pub const TOLERANT_SEVERITY: u32 = 20;

/// Severity reported as confirmed corruption.
pub const CORRUPTION_THRESHOLD: u32 = 30;

/// Weighted corruption tally for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorruptionReport {
    pub severity: u32,
    pub events: u32,
}

impl CorruptionReport {
    pub fn is_corrupt(&self) -> bool {
        self.severity >= CORRUPTION_THRESHOLD
    }

    /// Post-mortem line recorded on a corrupt failed run.
    pub fn note(&self, return_code: i32) -> String {
        format!(
            "CORRUPT VIDEO: Total Severity Score {} from {} events. FFmpeg error_code={}",
            self.severity, self.events, return_code
        )
    }
}

fn failed(run: &Run) -> bool {
    matches!(run.return_code, Some(code) if code != 0)
}

fn any_line_contains(lines: &[String], signals: &[&str]) -> bool {
    signals
        .iter()
        .any(|signal| lines.iter().any(|line| line.contains(signal)))
}

/// Weight of the first corruption message found in `line`, if any.
fn line_weight(line: &str) -> Option<u32> {
    CORRUPTION_SEVERITY
        .iter()
        .find(|(signal, _)| line.contains(signal))
        .map(|(_, weight)| *weight)
}

/// Multiplier `N` of a "Last message repeated N times" line.
fn repeat_count(line: &str) -> Option<u32> {
    const PREFIX: &str = "last message repeated ";
    let lower = line.to_ascii_lowercase();
    lower.match_indices(PREFIX).find_map(|(at, _)| {
        let rest = &lower[at + PREFIX.len()..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 || !rest[digits..].starts_with(" times") {
            return None;
        }
        rest[..digits].parse().ok()
    })
}

/// Score lines in order, stopping early once `stop_at` is reached.
fn score(lines: &[String], stop_at: Option<u32>) -> CorruptionReport {
    let mut report = CorruptionReport::default();
    let mut last_weight: u32 = 0;

    for line in lines {
        let mut this_weight = 0;
        if let Some(weight) = line_weight(line) {
            report.severity += weight;
            report.events += 1;
            this_weight = weight;
        }

        if let Some(times) = repeat_count(line) {
            report.severity = report.severity.saturating_add(last_weight.saturating_mul(times));
            if last_weight > 0 {
                report.events = report.events.saturating_add(times);
            }
            // A repeat line never carries a weight forward.
            this_weight = 0;
        }
        last_weight = this_weight;

        if stop_at.is_some_and(|limit| report.severity >= limit) {
            break;
        }
    }
    report
}

/// Corruption severity of the whole log.
pub fn corruption_score(lines: &[String]) -> CorruptionReport {
    score(lines, None)
}

/// Whether a failed run should be retried with error tolerance.
pub fn tolerant_retry_eligible(run: &Run) -> bool {
    if !failed(run) {
        return false;
    }
    any_line_contains(&run.texts, TOLERANT_RETRY_SIGNALS)
        || score(&run.texts, Some(TOLERANT_SEVERITY)).severity >= TOLERANT_SEVERITY
}

/// Whether a failed run should be retried with software encoding.
pub fn software_retry_eligible(run: &Run) -> bool {
    failed(run) && any_line_contains(&run.texts, FILTER_REINIT_SIGNALS)
}

/// Corruption report for a failed run, `None` for success or a still-live run.
pub fn post_mortem(run: &Run) -> Option<CorruptionReport> {
    failed(run).then(|| corruption_score(&run.texts))
}
