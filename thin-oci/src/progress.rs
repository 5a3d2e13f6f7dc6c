//! Pull progress presentation.
//!
//! The pipeline talks to a [`ProgressReporter`] only.  Two presentations
//! exist: [`PlainReporter`] prints one line per lifecycle event, and
//! [`TerminalReporter`] additionally redraws an in-place status line for
//! the layer most recently started, from its own render thread.  The
//! variant is chosen once by [`reporter_for`].

use std::collections::HashMap;
use std::fmt;
use std::io::{self, IsTerminal, Write};
use std::str::FromStr;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::manifest::Descriptor;

/// Redraw period of the interactive status line.
pub const RENDER_INTERVAL: Duration = Duration::from_millis(100);

const SPINNER: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ";

// ---------------------------------------------------------------------------
// Reporter capability
// ---------------------------------------------------------------------------

/// Receives layer lifecycle events from the pull pipeline.
///
/// Implementations own all per-layer state; callers never read it back.
pub trait ProgressReporter: Send + Sync {
    fn download_started(&self, desc: &Descriptor);
    fn download_finished(&self, desc: &Descriptor);
    fn processing_started(&self, desc: &Descriptor);
    fn extraction_finished(&self, desc: &Descriptor);
    fn skipped(&self, desc: &Descriptor);
    /// Cumulative bytes read so far for the layer with `digest`.
    fn bytes_read(&self, digest: &str, total: u64);
    /// Stop any background rendering.  Must be safe to call more than once.
    fn shutdown(&self) {}
}

/// How pull progress should be presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    /// Interactive when stdout is a terminal, plain otherwise.
    #[default]
    Auto,
    Plain,
    Interactive,
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(ProgressMode::Auto),
            "plain" => Ok(ProgressMode::Plain),
            "interactive" => Ok(ProgressMode::Interactive),
            other => Err(format!(
                "unknown progress mode '{}' (expected auto, plain or interactive)",
                other
            )),
        }
    }
}

impl fmt::Display for ProgressMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProgressMode::Auto => "auto",
            ProgressMode::Plain => "plain",
            ProgressMode::Interactive => "interactive",
        })
    }
}

/// Pick the presentation for this run.
pub fn reporter_for(mode: ProgressMode) -> Arc<dyn ProgressReporter> {
    let interactive = match mode {
        ProgressMode::Auto => io::stdout().is_terminal(),
        ProgressMode::Plain => false,
        ProgressMode::Interactive => true,
    };
    if interactive {
        Arc::new(TerminalReporter::new())
    } else {
        Arc::new(PlainReporter::new())
    }
}

// ---------------------------------------------------------------------------
// Per-layer state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStatus {
    Pending,
    Downloading,
    Downloaded,
    Processing,
    Restored,
    Skipped,
}

/// Mutable record for one layer.
#[derive(Debug, Clone)]
pub struct LayerProgress {
    pub size: u64,
    pub status: LayerStatus,
    pub bytes_read: u64,
    pub started: Instant,
    pub finished: Option<Instant>,
    last_sample: (Instant, u64),
}

impl LayerProgress {
    fn new(size: u64, now: Instant) -> Self {
        Self {
            size,
            status: LayerStatus::Pending,
            bytes_read: 0,
            started: now,
            finished: None,
            last_sample: (now, 0),
        }
    }

    /// Record a cumulative byte count; never moves backwards.
    pub fn record_bytes(&mut self, total: u64) {
        self.bytes_read = self.bytes_read.max(total);
    }

    /// Completed fraction for display, clamped to `1.0` even when more bytes
    /// arrive than the descriptor declared.
    pub fn fraction(&self) -> f64 {
        if self.size == 0 {
            return if self.bytes_read > 0 { 1.0 } else { 0.0 };
        }
        (self.bytes_read as f64 / self.size as f64).min(1.0)
    }

    /// Bytes per second since the previous sample; starts a new sample.
    pub fn sample_throughput(&mut self, now: Instant) -> f64 {
        let (at, read) = self.last_sample;
        let elapsed = now.saturating_duration_since(at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.last_sample = (now, self.bytes_read);
        self.bytes_read.saturating_sub(read) as f64 / elapsed
    }

    /// Whole-transfer rate, used for the summary line once a layer is done.
    pub fn average_throughput(&self) -> f64 {
        let end = self.finished.unwrap_or_else(Instant::now);
        let secs = end.saturating_duration_since(self.started).as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.bytes_read as f64 / secs
        }
    }
}

/// What the interactive line shows for the current layer.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusLine {
    pub length: u64,
    /// Gauge position, never beyond `length`.
    pub position: u64,
    pub message: String,
}

/// Progress records for every layer seen in a pull, keyed by full digest.
#[derive(Debug, Default)]
pub struct ProgressBoard {
    layers: HashMap<String, LayerProgress>,
    current: Option<String>,
}

impl ProgressBoard {
    pub fn get(&self, digest: &str) -> Option<&LayerProgress> {
        self.layers.get(digest)
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn start(&mut self, desc: &Descriptor) -> String {
        let now = Instant::now();
        let mut p = LayerProgress::new(desc.size, now);
        p.status = LayerStatus::Downloading;
        self.layers.insert(desc.digest.clone(), p);
        self.current = Some(desc.digest.clone());
        format!(
            "↓ Pulling {} ({})",
            desc.short_digest(),
            format_bytes(desc.size)
        )
    }

    fn finish_download(&mut self, desc: &Descriptor) -> Option<String> {
        let p = self.layers.get_mut(&desc.digest)?;
        p.status = LayerStatus::Downloaded;
        p.finished = Some(Instant::now());
        Some(format!(
            "✓ Pulled {} ({}/s)",
            desc.short_digest(),
            format_rate(p.average_throughput())
        ))
    }

    fn set_status(&mut self, digest: &str, status: LayerStatus) {
        if let Some(p) = self.layers.get_mut(digest) {
            p.status = status;
        }
    }

    fn restore(&mut self, desc: &Descriptor) -> String {
        self.set_status(&desc.digest, LayerStatus::Restored);
        if self.current.as_deref() == Some(desc.digest.as_str()) {
            self.current = None;
        }
        format!("  └─ {}", desc.digest)
    }

    fn skip(&mut self, desc: &Descriptor) -> String {
        let p = self
            .layers
            .entry(desc.digest.clone())
            .or_insert_with(|| LayerProgress::new(desc.size, Instant::now()));
        p.status = LayerStatus::Skipped;
        format!("  ⊘ Skipped {}", desc.short_digest())
    }

    fn record_bytes(&mut self, digest: &str, total: u64) {
        if let Some(p) = self.layers.get_mut(digest) {
            p.record_bytes(total);
        }
    }

    /// Status line for the layer most recently started, if it is still
    /// downloading.  Takes a throughput sample.
    pub fn status_line(&mut self, now: Instant) -> Option<StatusLine> {
        let digest = self.current.as_ref()?;
        let p = self.layers.get_mut(digest)?;
        if p.status != LayerStatus::Downloading {
            return None;
        }
        let fraction = p.fraction();
        let rate = p.sample_throughput(now);
        let elapsed = now.saturating_duration_since(p.started);
        let message = format!(
            "{:>10}/s {}/{} {:>7} {:>6}",
            format_rate(rate),
            format_bytes(p.bytes_read),
            format_bytes(p.size),
            format!("{:.2}%", fraction * 100.0),
            format_duration(elapsed),
        );
        Some(StatusLine {
            length: p.size,
            position: p.bytes_read.min(p.size),
            message,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Plain presentation
// ---------------------------------------------------------------------------

struct PlainState {
    board: ProgressBoard,
    out: Box<dyn Write + Send>,
}

/// One line per lifecycle event, suitable for pipes and CI logs.
pub struct PlainReporter {
    state: Mutex<PlainState>,
}

impl PlainReporter {
    pub fn new() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            state: Mutex::new(PlainState {
                board: ProgressBoard::default(),
                out,
            }),
        }
    }

    fn emit(&self, f: impl FnOnce(&mut ProgressBoard) -> Option<String>) {
        let mut state = lock(&self.state);
        if let Some(line) = f(&mut state.board) {
            // Progress output is best effort; a closed pipe must not fail the pull.
            let _ = writeln!(state.out, "{}", line);
        }
    }

    /// Read access to the per-layer records.
    pub fn with_board<R>(&self, f: impl FnOnce(&ProgressBoard) -> R) -> R {
        f(&lock(&self.state).board)
    }
}

impl Default for PlainReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for PlainReporter {
    fn download_started(&self, desc: &Descriptor) {
        self.emit(|b| Some(b.start(desc)));
    }

    fn download_finished(&self, desc: &Descriptor) {
        self.emit(|b| b.finish_download(desc));
    }

    fn processing_started(&self, desc: &Descriptor) {
        self.emit(|b| {
            b.set_status(&desc.digest, LayerStatus::Processing);
            Some(format!("  Extracting {}", desc.short_digest()))
        });
    }

    fn extraction_finished(&self, desc: &Descriptor) {
        self.emit(|b| Some(b.restore(desc)));
    }

    fn skipped(&self, desc: &Descriptor) {
        self.emit(|b| Some(b.skip(desc)));
    }

    fn bytes_read(&self, digest: &str, total: u64) {
        lock(&self.state).board.record_bytes(digest, total);
    }

    fn shutdown(&self) {
        let _ = lock(&self.state).out.flush();
    }
}

// ---------------------------------------------------------------------------
// Interactive presentation
// ---------------------------------------------------------------------------

struct RenderLoop {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

struct TerminalState {
    board: ProgressBoard,
    render: Option<RenderLoop>,
    closed: bool,
}

/// Lifecycle lines plus a live status line (spinner, gauge, recent
/// throughput, size, percentage, elapsed time) redrawn every
/// [`RENDER_INTERVAL`].
pub struct TerminalReporter {
    state: Arc<Mutex<TerminalState>>,
    bar: ProgressBar,
}

impl TerminalReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stdout());
        let style = ProgressStyle::with_template("  {spinner} [{bar:20}] {msg}")
            .map(|s| s.tick_chars(SPINNER).progress_chars("= "))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);

        let state = Arc::new(Mutex::new(TerminalState {
            board: ProgressBoard::default(),
            render: None,
            closed: false,
        }));

        let (stop, stopped) = mpsc::channel::<()>();
        let thread_state = Arc::clone(&state);
        let thread_bar = bar.clone();
        let spawned = std::thread::Builder::new()
            .name("thin-progress".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(RENDER_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => render(&thread_state, &thread_bar),
                    _ => break,
                }
            });
        match spawned {
            Ok(handle) => lock(&state).render = Some(RenderLoop { stop, handle }),
            Err(e) => warn!(error = %e, "progress render thread unavailable"),
        }

        Self { state, bar }
    }

    fn emit(&self, f: impl FnOnce(&mut ProgressBoard) -> Option<String>) {
        let mut state = lock(&self.state);
        if let Some(line) = f(&mut state.board) {
            self.bar.println(line);
        }
    }
}

impl Default for TerminalReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn render(state: &Mutex<TerminalState>, bar: &ProgressBar) {
    let mut state = lock(state);
    let Some(line) = state.board.status_line(Instant::now()) else {
        return;
    };
    bar.set_length(line.length);
    bar.set_position(line.position);
    bar.set_message(line.message);
    bar.tick();
}

impl ProgressReporter for TerminalReporter {
    fn download_started(&self, desc: &Descriptor) {
        self.emit(|b| Some(b.start(desc)));
    }

    fn download_finished(&self, desc: &Descriptor) {
        self.emit(|b| b.finish_download(desc));
    }

    fn processing_started(&self, desc: &Descriptor) {
        self.emit(|b| {
            b.set_status(&desc.digest, LayerStatus::Processing);
            None
        });
    }

    fn extraction_finished(&self, desc: &Descriptor) {
        self.emit(|b| Some(b.restore(desc)));
    }

    fn skipped(&self, desc: &Descriptor) {
        self.emit(|b| Some(b.skip(desc)));
    }

    fn bytes_read(&self, digest: &str, total: u64) {
        lock(&self.state).board.record_bytes(digest, total);
    }

    fn shutdown(&self) {
        let render = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.render.take()
        };
        if let Some(RenderLoop { stop, handle }) = render {
            let _ = stop.send(());
            let _ = handle.join();
        }
        self.bar.finish_and_clear();
        println!();
    }
}

impl Drop for TerminalReporter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * KB;
const GB: f64 = 1024.0 * MB;

/// Human-readable size: `512B`, `4.47KB`, `4.40MB`, `1.00GB`.
pub fn format_bytes(size: u64) -> String {
    let s = size as f64;
    if s >= GB {
        format!("{:.2}GB", s / GB)
    } else if s >= MB {
        format!("{:.2}MB", s / MB)
    } else if s >= KB {
        format!("{:.2}KB", s / KB)
    } else {
        format!("{}B", size)
    }
}

/// Human-readable rate without the `/s` suffix.
pub fn format_rate(bps: f64) -> String {
    if bps >= GB {
        format!("{:.2}GB", bps / GB)
    } else if bps >= MB {
        format!("{:.2}MB", bps / MB)
    } else if bps >= KB {
        format!("{:.2}KB", bps / KB)
    } else {
        format!("{:.0}B", bps)
    }
}

/// Compact duration: `850ms`, `12s`, `1m23s`.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else if d < Duration::from_secs(60) {
        format!("{}s", d.as_secs())
    } else {
        format!("{}m{}s", d.as_secs() / 60, d.as_secs() % 60)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MEDIA_TYPE_ASSETS;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn assets(size: u64) -> Descriptor {
        Descriptor::new(
            MEDIA_TYPE_ASSETS,
            "sha256:5f70bf18a086007016e948b04aed3b82103a36bea41755b6cddfaf10ace3c6ef",
            size,
        )
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(4_577), "4.47KB");
        assert_eq!(format_bytes(4_613_734), "4.40MB");
        assert_eq!(format_bytes(1 << 30), "1.00GB");
    }

    #[test]
    fn format_duration_ranges() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(83)), "1m23s");
    }

    #[test]
    fn progress_mode_parses() {
        assert_eq!("plain".parse::<ProgressMode>().unwrap(), ProgressMode::Plain);
        assert_eq!("auto".parse::<ProgressMode>().unwrap(), ProgressMode::Auto);
        assert!("fancy".parse::<ProgressMode>().is_err());
        assert_eq!(ProgressMode::Interactive.to_string(), "interactive");
    }

    #[test]
    fn fraction_is_clamped_but_counter_is_not() {
        let mut p = LayerProgress::new(100, Instant::now());
        p.record_bytes(250);
        assert_eq!(p.bytes_read, 250);
        assert_eq!(p.fraction(), 1.0);
    }

    #[test]
    fn record_bytes_never_decreases() {
        let mut p = LayerProgress::new(100, Instant::now());
        p.record_bytes(40);
        p.record_bytes(10);
        assert_eq!(p.bytes_read, 40);
    }

    #[test]
    fn throughput_uses_bytes_since_last_sample() {
        let start = Instant::now();
        let mut p = LayerProgress::new(10_000, start);
        p.record_bytes(1_000);
        let first = p.sample_throughput(start + Duration::from_secs(1));
        assert!((first - 1_000.0).abs() < 1e-6);

        p.record_bytes(1_500);
        let second = p.sample_throughput(start + Duration::from_secs(2));
        assert!((second - 500.0).abs() < 1e-6);
    }

    #[test]
    fn status_line_clamps_gauge_position() {
        let mut board = ProgressBoard::default();
        let desc = assets(100);
        board.start(&desc);
        board.record_bytes(&desc.digest, 180);

        let line = board
            .status_line(Instant::now() + Duration::from_millis(100))
            .unwrap();
        assert_eq!(line.length, 100);
        assert_eq!(line.position, 100);
        assert!(line.message.contains("100.00%"), "{}", line.message);
        assert_eq!(board.get(&desc.digest).unwrap().bytes_read, 180);
    }

    #[test]
    fn status_line_only_while_downloading() {
        let mut board = ProgressBoard::default();
        let desc = assets(100);
        assert!(board.status_line(Instant::now()).is_none());

        board.start(&desc);
        assert!(board.status_line(Instant::now()).is_some());

        board.finish_download(&desc);
        assert!(board.status_line(Instant::now()).is_none());

        board.restore(&desc);
        assert!(board.current().is_none());
    }

    #[test]
    fn plain_reporter_prints_one_line_per_event() {
        let buf = SharedBuf::default();
        let reporter = PlainReporter::with_writer(Box::new(buf.clone()));
        let desc = assets(3_082);

        reporter.download_started(&desc);
        reporter.bytes_read(&desc.digest, 1_000);
        reporter.bytes_read(&desc.digest, 3_082);
        reporter.download_finished(&desc);
        reporter.processing_started(&desc);
        reporter.extraction_finished(&desc);
        reporter.shutdown();

        let text = buf.text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4, "{text}");
        assert_eq!(lines[0], "↓ Pulling sha256:5f70bf18a (3.01KB)");
        assert!(lines[1].starts_with("✓ Pulled sha256:5f70bf18a ("));
        assert_eq!(lines[2], "  Extracting sha256:5f70bf18a");
        assert_eq!(lines[3], format!("  └─ {}", desc.digest));

        reporter.with_board(|b| {
            let p = b.get(&desc.digest).unwrap();
            assert_eq!(p.status, LayerStatus::Restored);
            assert_eq!(p.bytes_read, 3_082);
        });
    }

    #[test]
    fn plain_reporter_records_skipped_layers() {
        let buf = SharedBuf::default();
        let reporter = PlainReporter::with_writer(Box::new(buf.clone()));
        let desc = assets(10);
        reporter.skipped(&desc);
        assert_eq!(buf.text(), "  ⊘ Skipped sha256:5f70bf18a\n");
        reporter.with_board(|b| {
            assert_eq!(b.get(&desc.digest).unwrap().status, LayerStatus::Skipped)
        });
    }

    #[test]
    fn terminal_reporter_shutdown_is_idempotent() {
        let reporter = TerminalReporter::new();
        let desc = assets(10);
        reporter.download_started(&desc);
        reporter.bytes_read(&desc.digest, 10);
        std::thread::sleep(RENDER_INTERVAL * 2);
        reporter.shutdown();
        reporter.shutdown();
        assert!(lock(&reporter.state).render.is_none());
    }
}
