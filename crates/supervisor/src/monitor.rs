//! Process monitor for a single encoder child process.
//!
//! The monitor owns one child at a time and turns its error stream into
//! discrete events: log lines, composite progress snapshots and, once every
//! buffered line has been handed out, the exit code. Nothing here blocks the
//! caller except the bounded grace period inside [`ProcessMonitor::stop`].

use log::{debug, info, warn};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Exit code reported when the child could not be launched at all.
pub const LAUNCH_FAILED_CODE: i32 = 127;

/// Exit code reported when the child produced no output within the stall threshold.
pub const STALLED_CODE: i32 = 254;

/// Exit code recorded by a plain `stop()` (and when a live monitor is dropped).
pub const MANUAL_STOP_CODE: i32 = 255;

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(15);

/// Keys the encoder emits in `-progress` output.
///
/// `time` is accepted as an alias for `out_time`.
pub const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "stream_0_0_q",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time",
    "out_time_ms",
    "time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

/// The key that closes one progress group.
pub const PROGRESS_TERMINATOR: &str = "progress";

const READ_CHUNK: usize = 8192;
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Error type for monitor operations
#[derive(Debug, Error)]
pub enum MonitorError {
    /// `start()` was called while a child is still being supervised
    #[error("monitor is already supervising process {0}")]
    AlreadyRunning(u32),
}

/// One result of [`ProcessMonitor::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Nothing new yet
    Idle,
    /// A free-text line from the error stream
    Log(String),
    /// A composite `frame=.. fps=.. bitrate=.. time=.. speed=..x` snapshot
    Progress(String),
    /// The child is gone and every buffered line has been delivered
    Exit(i32),
}

/// Anything the progress interpreter can pull events from.
pub trait EventSource {
    /// Next event, never blocking.
    fn poll(&mut self) -> MonitorEvent;
    /// Events already queued and not yet returned by `poll`.
    fn pending(&self) -> usize;
    /// Stop the source, recording `code` as its exit status.
    fn stop(&mut self, code: i32);
}

/// Splits raw error-stream bytes into log lines and progress snapshots.
///
/// Bytes are buffered until a line feed arrives, so a multi-byte character or
/// a `key=value` pair cut by a read boundary is only decoded once complete.
#[derive(Debug, Default)]
pub struct LineFramer {
    carry: Vec<u8>,
    fields: BTreeMap<String, String>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly read bytes, appending any completed events to `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut VecDeque<MonitorEvent>) {
        self.carry.extend_from_slice(bytes);
        let Some(last_newline) = self.carry.iter().rposition(|&b| b == b'\n') else {
            return;
        };
        let rest = self.carry.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.carry, rest);
        for line in complete.split(|&b| b == b'\n') {
            self.frame_line(line, out);
        }
    }

    /// Emit the unterminated trailing fragment, if any, as a final log line.
    pub fn finish(&mut self, out: &mut VecDeque<MonitorEvent>) {
        let tail = std::mem::take(&mut self.carry);
        let text = String::from_utf8_lossy(&tail);
        let text = text.trim();
        if !text.is_empty() {
            out.push_back(MonitorEvent::Log(text.to_string()));
        }
    }

    /// Drop the carry-over and any half-accumulated progress group.
    pub fn reset(&mut self) {
        self.carry.clear();
        self.fields.clear();
    }

    fn frame_line(&mut self, line: &[u8], out: &mut VecDeque<MonitorEvent>) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        if let Some((key, value)) = text.split_once('=') {
            let key = key.trim();
            if PROGRESS_KEYS.contains(&key) {
                self.fields.insert(key.to_string(), value.trim().to_string());
                if key == PROGRESS_TERMINATOR {
                    out.push_back(MonitorEvent::Progress(self.composite()));
                    self.fields.clear();
                }
                return;
            }
        }

        out.push_back(MonitorEvent::Log(text.to_string()));
    }

    fn composite(&self) -> String {
        let field = |key: &str| self.fields.get(key).map(String::as_str);
        let time = field("out_time").or_else(|| field("time")).unwrap_or("00:00:00.00");
        let speed = field("speed").unwrap_or("0");
        let speed = speed.strip_suffix('x').unwrap_or(speed);
        format!(
            "frame={} fps={} bitrate={} time={} speed={}x",
            field("frame").unwrap_or("0"),
            field("fps").unwrap_or("0"),
            field("bitrate").unwrap_or("0"),
            time,
            speed,
        )
    }
}

/// Supervises one encoder child process at a time.
#[derive(Debug)]
pub struct ProcessMonitor {
    child: Option<Child>,
    stderr: Option<ChildStderr>,
    framer: LineFramer,
    queue: VecDeque<MonitorEvent>,
    exit_code: Option<i32>,
    temp_file: Option<PathBuf>,
    stop_grace: Duration,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMonitor {
    /// Create an idle monitor
    pub fn new() -> Self {
        Self {
            child: None,
            stderr: None,
            framer: LineFramer::new(),
            queue: VecDeque::new(),
            exit_code: None,
            temp_file: None,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// Override the SIGTERM grace period used by `stop()`
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Start `command` on this (idle) monitor.
    ///
    /// A child that cannot be launched is not an error: the monitor records
    /// [`LAUNCH_FAILED_CODE`] and reports it from `poll()` like any other exit.
    /// Starting while a child is still supervised is refused.
    pub fn start(
        &mut self,
        command: &[String],
        temp_file: Option<&Path>,
    ) -> Result<(), MonitorError> {
        if let Some(child) = &self.child {
            return Err(MonitorError::AlreadyRunning(child.id()));
        }

        self.temp_file = temp_file.map(Path::to_path_buf);
        self.framer.reset();
        self.queue.clear();
        self.exit_code = None;

        let Some((program, args)) = command.split_first() else {
            warn!("refusing to launch an empty command line");
            self.exit_code = Some(LAUNCH_FAILED_CODE);
            return Ok(());
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!("failed to launch {}: {}", program, e);
                self.exit_code = Some(LAUNCH_FAILED_CODE);
                return Ok(());
            }
        };

        let stderr = child.stderr.take();
        if let Some(Err(e)) = stderr.as_ref().map(set_nonblocking) {
            warn!("cannot make stderr of {} non-blocking: {}", program, e);
            let _ = child.kill();
            let _ = child.wait();
            self.exit_code = Some(LAUNCH_FAILED_CODE);
            return Ok(());
        }

        info!("started {} (pid {})", program, child.id());
        self.stderr = stderr;
        self.child = Some(child);
        Ok(())
    }

    /// Create a monitor and start `command` on it.
    pub fn launch(command: &[String], temp_file: Option<&Path>) -> Self {
        let mut monitor = Self::new();
        // A fresh monitor has no child, so start() cannot refuse.
        let _ = monitor.start(command, temp_file);
        monitor
    }

    /// Return the next event without blocking.
    ///
    /// Queued events are returned first. Otherwise all currently readable
    /// bytes are framed, and the child is checked for exit. The exit code is
    /// only reported once the queue is empty, and is then reported on every
    /// later call.
    pub fn poll(&mut self) -> MonitorEvent {
        if let Some(event) = self.queue.pop_front() {
            return event;
        }
        if self.child.is_none() {
            return self.exit_code.map_or(MonitorEvent::Idle, MonitorEvent::Exit);
        }

        self.read_available();

        let status = match self.child.as_mut().map(Child::try_wait) {
            Some(Ok(status)) => status,
            Some(Err(e)) => {
                warn!("failed to check encoder status: {}", e);
                None
            }
            None => None,
        };

        if let Some(status) = status {
            // Whatever was written right before exiting is still in the pipe.
            self.read_available();
            self.framer.finish(&mut self.queue);
            let code = exit_code_of(status);
            debug!("encoder exited with code {}", code);
            self.exit_code = Some(code);
            self.child = None;
            self.stderr = None;
        }

        if let Some(event) = self.queue.pop_front() {
            return event;
        }
        match (&self.child, self.exit_code) {
            (None, Some(code)) => MonitorEvent::Exit(code),
            _ => MonitorEvent::Idle,
        }
    }

    /// Stop the child (if any), remove the registered temp file and reset.
    ///
    /// A live child gets SIGTERM, then SIGKILL if it is still running after the
    /// grace period. Safe to call repeatedly and on a monitor never started.
    pub fn stop(&mut self, code: i32) {
        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => {}
                _ => terminate(&mut child, self.stop_grace),
            }
        }

        if let Some(temp) = self.temp_file.take() {
            if temp.exists() {
                if let Err(e) = fs::remove_file(&temp) {
                    debug!("could not remove {}: {}", temp.display(), e);
                }
            }
        }

        self.stderr = None;
        self.framer.reset();
        self.queue.clear();
        self.exit_code = Some(code);
    }

    /// Whether a child is currently supervised
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// OS process id of the supervised child
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Number of queued, undelivered events
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Recorded terminal status, if any
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn read_available(&mut self) {
        let Some(stderr) = self.stderr.as_mut() else {
            return;
        };
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stderr.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.framer.push(&buf[..n], &mut self.queue),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("stderr read failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl EventSource for ProcessMonitor {
    fn poll(&mut self) -> MonitorEvent {
        ProcessMonitor::poll(self)
    }

    fn pending(&self) -> usize {
        ProcessMonitor::pending(self)
    }

    fn stop(&mut self, code: i32) {
        ProcessMonitor::stop(self, code)
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        if self.child.is_some() {
            self.stop(MANUAL_STOP_CODE);
        }
    }
}

fn set_nonblocking(stream: &ChildStderr) -> io::Result<()> {
    let fd = stream.as_raw_fd();
    // SAFETY: fd stays open for the duration of both calls (borrowed stream).
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above; only the O_NONBLOCK status flag changes.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn terminate(child: &mut Child, grace: Duration) {
    let pid = child.id();
    // SAFETY: the child has not been reaped yet, so pid still names it.
    let sent = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0;
    if sent {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(STOP_POLL_INTERVAL),
                Err(_) => break,
            }
        }
        warn!("process {} still alive after {:?}, killing", pid, grace);
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Exit code of a finished child; a signal death is the negated signal number.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |signal| -signal))
}
