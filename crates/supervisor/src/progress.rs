//! Progress interpreter: turns monitor events for one job into display lines.
//!
//! Each call to [`ProgressInterpreter::step`] yields nothing new, a formatted
//! progress report, or the job's terminal exit code. The interpreter also
//! owns stall detection: a job that writes nothing for longer than the
//! configured threshold is stopped with [`STALLED_CODE`].

use crate::jobs::Run;
use crate::monitor::{EventSource, MonitorEvent, STALLED_CODE};
use log::warn;
use std::time::{Duration, Instant};

/// Minimum wall-clock gap between two rendered progress reports.
pub const MIN_RENDER_INTERVAL: Duration = Duration::from_millis(1800);

/// Text appended to the run when the stall breaker trips.
pub const STALL_MARKER: &str = "PROGRESS TIMEOUT";

/// Wall-clock time below which average speed is not computed.
const MIN_ELAPSED_FOR_SPEED: f64 = 0.5;

/// Result of one interpreter step.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// Nothing worth showing yet
    Pending,
    /// A formatted progress report
    Progress(String),
    /// The job reached a terminal state with this exit code
    Finished(i32),
}

/// Values extracted from a progress snapshot or encoder stats line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub frame: u64,
    /// Encoded playback position in seconds
    pub position_secs: Option<f64>,
    /// Speed the encoder itself reports
    pub speed: Option<f64>,
}

/// Extract frame, position and speed from a progress-looking line.
///
/// Matching is case-insensitive. `frame` followed by `=`/whitespace, digits
/// and whitespace is required; `time HH:MM:SS.frac` and `speed N.Nx` may each
/// appear later in the line, time before speed, or be absent.
pub fn parse_progress(line: &str) -> Option<ProgressSample> {
    let text = line.to_ascii_lowercase();
    let bytes = text.as_bytes();

    let (frame, mut cursor) = occurrences(bytes, b"frame", 0).find_map(|at| {
        let i = after_separator(bytes, at, b"frame")?;
        let (digits, i) = take_digits(bytes, i)?;
        if !bytes.get(i).is_some_and(u8::is_ascii_whitespace) {
            return None;
        }
        Some((text[digits].parse::<u64>().ok()?, i))
    })?;

    let position = occurrences(bytes, b"time", cursor).find_map(|at| {
        let i = after_separator(bytes, at, b"time")?;
        let (h, i) = take_two_digits(bytes, i)?;
        let i = expect_byte(bytes, i, b':')?;
        let (m, i) = take_two_digits(bytes, i)?;
        let i = expect_byte(bytes, i, b':')?;
        let (s, i) = take_two_digits(bytes, i)?;
        let i = expect_byte(bytes, i, b'.')?;
        let (frac, end) = take_digits(bytes, i)?;
        // The fraction's length sets its scale: ".5" and ".50" are equal.
        let frac: f64 = format!("0.{}", &text[frac]).parse().ok()?;
        Some((f64::from(h * 3600 + m * 60 + s) + frac, end))
    });
    if let Some((_, end)) = position {
        cursor = end;
    }

    let speed = occurrences(bytes, b"speed", cursor).find_map(|at| {
        let i = after_separator(bytes, at, b"speed")?;
        let (whole, i) = take_digits(bytes, i)?;
        let i = expect_byte(bytes, i, b'.')?;
        let (_, i) = take_digits(bytes, i)?;
        expect_byte(bytes, i, b'x')?;
        text[whole.start..i].parse::<f64>().ok()
    });

    Some(ProgressSample {
        frame,
        position_secs: position.map(|(secs, _)| secs),
        speed,
    })
}

fn occurrences<'a>(
    haystack: &'a [u8],
    needle: &'a [u8],
    from: usize,
) -> impl Iterator<Item = usize> + 'a {
    (from..haystack.len()).filter(move |&at| haystack[at..].starts_with(needle))
}

/// Index just past `key` and a non-empty run of `=` or whitespace.
fn after_separator(bytes: &[u8], at: usize, key: &[u8]) -> Option<usize> {
    let start = at + key.len();
    let len = bytes[start..]
        .iter()
        .take_while(|b| **b == b'=' || b.is_ascii_whitespace())
        .count();
    (len > 0).then_some(start + len)
}

fn take_digits(bytes: &[u8], at: usize) -> Option<(std::ops::Range<usize>, usize)> {
    let len = bytes[at..].iter().take_while(|b| b.is_ascii_digit()).count();
    (len > 0).then_some((at..at + len, at + len))
}

fn take_two_digits(bytes: &[u8], at: usize) -> Option<(u32, usize)> {
    match bytes.get(at..at + 2) {
        Some([a, b]) if a.is_ascii_digit() && b.is_ascii_digit() => {
            Some((u32::from(a - b'0') * 10 + u32::from(b - b'0'), at + 2))
        }
        _ => None,
    }
}

fn expect_byte(bytes: &[u8], at: usize, want: u8) -> Option<usize> {
    (bytes.get(at) == Some(&want)).then_some(at + 1)
}

/// Render whole seconds as `M:SS`, or `H:MM:SS` from one hour up.
pub fn format_duration(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Per-job progress state.
#[derive(Debug, Clone)]
pub struct ProgressInterpreter {
    stall_after: Duration,
    started: Instant,
    last_output: Instant,
    last_render: Instant,
    tripped: bool,
    duration_secs: f64,
    latest: Option<ProgressSample>,
}

impl ProgressInterpreter {
    pub fn new(duration_secs: f64, stall_after: Duration) -> Self {
        Self::starting_at(Instant::now(), duration_secs, stall_after)
    }

    /// Interpreter for a job that started at `started`.
    pub fn starting_at(started: Instant, duration_secs: f64, stall_after: Duration) -> Self {
        Self {
            stall_after,
            started,
            last_output: started,
            last_render: started,
            tripped: false,
            duration_secs,
            latest: None,
        }
    }

    /// Most recently parsed sample, rendered or not
    pub fn latest(&self) -> Option<ProgressSample> {
        self.latest
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Whether the stall breaker has fired for this job
    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn step<S: EventSource + ?Sized>(
        &mut self,
        source: &mut S,
        run: &mut Run,
    ) -> ProgressUpdate {
        self.step_at(source, run, Instant::now())
    }

    /// One interpreter step evaluated at `now`.
    pub fn step_at<S: EventSource + ?Sized>(
        &mut self,
        source: &mut S,
        run: &mut Run,
        now: Instant,
    ) -> ProgressUpdate {
        // Burn through a backlog so a burst is not rendered line by line.
        while source.pending() > 1 {
            match source.poll() {
                MonitorEvent::Log(line) => {
                    self.last_output = now;
                    run.texts.push(line);
                }
                MonitorEvent::Progress(_) => self.last_output = now,
                MonitorEvent::Exit(code) => {
                    run.return_code = Some(code);
                    return ProgressUpdate::Finished(code);
                }
                MonitorEvent::Idle => break,
            }
        }

        loop {
            match source.poll() {
                MonitorEvent::Exit(code) => {
                    run.return_code = Some(code);
                    return ProgressUpdate::Finished(code);
                }
                MonitorEvent::Progress(snapshot) => {
                    self.last_output = now;
                    if source.pending() > 0 {
                        continue;
                    }
                    return self.interpret(&snapshot, true, run, now);
                }
                MonitorEvent::Log(line) => {
                    self.last_output = now;
                    return self.interpret(&line, false, run, now);
                }
                MonitorEvent::Idle => return self.check_stall(source, run, now),
            }
        }
    }

    fn interpret(
        &mut self,
        text: &str,
        is_snapshot: bool,
        run: &mut Run,
        now: Instant,
    ) -> ProgressUpdate {
        let Some(sample) = parse_progress(text) else {
            if !is_snapshot {
                run.texts.push(text.to_string());
            }
            return ProgressUpdate::Pending;
        };
        self.latest = Some(sample);

        if now.saturating_duration_since(self.last_render) < MIN_RENDER_INTERVAL {
            return ProgressUpdate::Pending;
        }
        self.last_render = now;

        match sample.position_secs {
            Some(position) => ProgressUpdate::Progress(self.render(position, now)),
            None => ProgressUpdate::Pending,
        }
    }

    fn render(&self, position: f64, now: Instant) -> String {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let avg_speed = if elapsed > MIN_ELAPSED_FOR_SPEED && position > 0.0 {
            position / elapsed
        } else {
            0.0
        };

        let (percent, remaining) = if self.duration_secs > 0.0 && avg_speed > 0.0 {
            let left = ((self.duration_secs - position) / avg_speed).max(0.0);
            (position / self.duration_secs * 100.0, format_duration(left as u64))
        } else {
            (0.0, "N/A".to_string())
        };

        format!(
            "{:.1}% {} -{} {:.1}x At {}/{}",
            percent,
            format_duration(elapsed as u64),
            remaining,
            avg_speed,
            format_duration(position.round() as u64),
            format_duration(self.duration_secs.max(0.0).round() as u64),
        )
    }

    fn check_stall<S: EventSource + ?Sized>(
        &mut self,
        source: &mut S,
        run: &mut Run,
        now: Instant,
    ) -> ProgressUpdate {
        if self.tripped || now.saturating_duration_since(self.last_output) <= self.stall_after {
            return ProgressUpdate::Pending;
        }

        warn!(
            "no encoder output for {:?}, stopping ({})",
            self.stall_after, run.descr
        );
        self.tripped = true;
        run.texts.push(STALL_MARKER.to_string());
        source.stop(STALLED_CODE);
        run.return_code = Some(STALLED_CODE);
        ProgressUpdate::Finished(STALLED_CODE)
    }
}
