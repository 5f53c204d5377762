//! Terminal progress for the probe and merge phases.
//!
//! `Rich` draws indicatif bars with one spinner per in-flight batch,
//! `Plain` prints `[PROGRESS]` lines on an interval (logs, CI), and `Quiet`
//! prints nothing but still collects warnings for the final outcome.

use clap::ValueEnum;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::{BTreeMap, VecDeque};
use std::io::IsTerminal;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const WARNING_CAP: usize = 32;
const TICK: Duration = Duration::from_secs(1);
const SPINNER_TICK: Duration = Duration::from_millis(120);
const SPINNER_CHARS: &str = "|/-\\ ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

/// What actually gets drawn once `Auto` is settled against the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Render {
    Rich,
    Plain,
    Quiet,
}

impl ProgressMode {
    pub fn render_for(self, stderr_is_tty: bool) -> Render {
        match self {
            ProgressMode::Auto if stderr_is_tty => Render::Rich,
            ProgressMode::Auto => Render::Plain,
            ProgressMode::Rich => Render::Rich,
            ProgressMode::Plain => Render::Plain,
            ProgressMode::Quiet => Render::Quiet,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Probe,
    Merge,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Probe => "probe",
            Phase::Merge => "merge",
        }
    }

    fn unit(self) -> &'static str {
        match self {
            Phase::Probe => "clips",
            Phase::Merge => "batches",
        }
    }

    fn item(self) -> &'static str {
        match self {
            Phase::Probe => "clip",
            Phase::Merge => "batch",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Warn when nothing finishes for this long.
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    tty: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(2),
            tty: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    fn assume_tty(mut self, is_tty: bool) -> Self {
        self.tty = Some(is_tty);
        self
    }

    pub fn render(self) -> Render {
        self.mode
            .render_for(self.tty.unwrap_or_else(|| std::io::stderr().is_terminal()))
    }
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub total: u64,
    pub done: u64,
    /// Most recent warnings, oldest first.
    pub warnings: Vec<String>,
}

struct InFlight {
    since: Instant,
    bar: Option<ProgressBar>,
}

struct Tally {
    started: Instant,
    stage: String,
    total: u64,
    done: u64,
    last_done_at: Instant,
    last_plain_at: Option<Instant>,
    last_idle_warn: Option<Instant>,
    in_flight: BTreeMap<usize, InFlight>,
    warnings: VecDeque<String>,
    closed: bool,
}

impl Tally {
    fn new(total: u64, now: Instant) -> Self {
        Self {
            started: now,
            stage: "starting".to_string(),
            total,
            done: 0,
            last_done_at: now,
            last_plain_at: None,
            last_idle_warn: None,
            in_flight: BTreeMap::new(),
            warnings: VecDeque::new(),
            closed: false,
        }
    }

    fn complete_one(&mut self, now: Instant) {
        self.done += 1;
        if self.total > 0 {
            self.done = self.done.min(self.total);
        }
        self.last_done_at = now;
    }

    /// Mean time per finished unit times what is left.
    fn eta(&self, now: Instant) -> Option<Duration> {
        if self.done == 0 || self.done >= self.total {
            return None;
        }
        let per_unit = now.duration_since(self.started).as_secs_f64() / self.done as f64;
        Some(Duration::from_secs_f64(per_unit * (self.total - self.done) as f64))
    }

    fn stalled(&self, now: Instant, threshold: Duration) -> bool {
        if self.total > 0 && self.done >= self.total {
            return false;
        }
        let quiet_since = match self.last_idle_warn {
            Some(warned) => warned.max(self.last_done_at),
            None => self.last_done_at,
        };
        now.duration_since(quiet_since) >= threshold
    }

    fn remember(&mut self, message: &str) {
        if self.warnings.len() == WARNING_CAP {
            self.warnings.pop_front();
        }
        self.warnings.push_back(message.to_string());
    }

    fn in_flight_summary(&self, phase: Phase, now: Instant) -> String {
        if self.in_flight.is_empty() {
            return "-".to_string();
        }
        self.in_flight
            .iter()
            .map(|(key, f)| {
                format!(
                    "{} {} ({})",
                    phase.item(),
                    key + 1,
                    format_clock(now.duration_since(f.since))
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn plain_line(phase: Phase, t: &Tally, now: Instant) -> String {
    let pct = if t.total == 0 {
        0.0
    } else {
        t.done as f64 * 100.0 / t.total as f64
    };
    format!(
        "[PROGRESS] {} {}/{} {} ({:.0}%) elapsed={} eta={} stage={} in_flight={}",
        phase.label(),
        t.done,
        t.total,
        phase.unit(),
        pct,
        format_clock(now.duration_since(t.started)),
        t.eta(now).map(format_clock).unwrap_or_else(|| "--:--".to_string()),
        t.stage,
        t.in_flight_summary(phase, now)
    )
}

struct Bars {
    multi: MultiProgress,
    main: ProgressBar,
}

impl Bars {
    fn new(phase: Phase, total: u64) -> Self {
        let multi = MultiProgress::new();
        let main = multi.add(ProgressBar::new(total.max(1)));
        let template = format!(
            "{{spinner:.green}} {} [{{elapsed_precise}}] {{wide_bar:.cyan/blue}} {{pos}}/{{len}} {} {{msg}}",
            phase.label(),
            phase.unit()
        );
        main.set_style(
            ProgressStyle::with_template(&template).unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        main.enable_steady_tick(SPINNER_TICK);
        Self { multi, main }
    }

    fn spinner(&self, prefix: String, detail: String) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.set_style(
            ProgressStyle::with_template("  {spinner:.magenta} {prefix:.bold} [{elapsed}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(SPINNER_CHARS),
        );
        bar.set_prefix(prefix);
        bar.set_message(detail);
        bar.enable_steady_tick(SPINNER_TICK);
        bar
    }
}

struct Shared {
    phase: Phase,
    render: Render,
    config: ProgressConfig,
    tally: Mutex<Tally>,
    bars: Option<Bars>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn refresh(&self, t: &mut Tally, now: Instant, force_plain: bool) {
        match self.render {
            Render::Quiet => {}
            Render::Rich => {
                if let Some(bars) = &self.bars {
                    bars.main.set_length(t.total.max(1));
                    bars.main.set_position(t.done);
                    bars.main.set_message(format!(
                        "eta {} | {}",
                        t.eta(now).map(format_clock).unwrap_or_else(|| "--:--".to_string()),
                        t.stage
                    ));
                }
            }
            Render::Plain => {
                let due = t
                    .last_plain_at
                    .map_or(true, |at| now.duration_since(at) >= self.config.plain_interval);
                if force_plain || due {
                    eprintln!("{}", plain_line(self.phase, t, now));
                    t.last_plain_at = Some(now);
                }
            }
        }
    }

    fn say(&self, level: &str, message: &str) {
        let line = format!("[{}] {}: {}", level, self.phase.label(), message);
        match (self.render, &self.bars) {
            (Render::Quiet, _) => {}
            (Render::Rich, Some(bars)) => {
                if bars.multi.println(&line).is_err() {
                    eprintln!("{}", line);
                }
            }
            _ => eprintln!("{}", line),
        }
    }

    fn tick(&self) {
        let now = Instant::now();
        let mut t = self.lock();
        if t.closed {
            return;
        }
        if t.stalled(now, self.config.idle_threshold) {
            t.last_idle_warn = Some(now);
            let msg = format!(
                "no {} finished for {}s (stage={}, in flight: {})",
                self.phase.unit(),
                now.duration_since(t.last_done_at).as_secs(),
                t.stage,
                t.in_flight_summary(self.phase, now)
            );
            t.remember(&msg);
            self.say("WARN", &msg);
        }
        self.refresh(&mut t, now, false);
    }

    fn close(&self, summary: Option<String>) -> ProgressOutcome {
        let now = Instant::now();
        let mut t = self.lock();
        if !t.closed {
            t.closed = true;
            match self.render {
                Render::Quiet => {}
                Render::Plain => {
                    eprintln!("{}", plain_line(self.phase, &t, now));
                    if let Some(msg) = &summary {
                        eprintln!("[DONE] {}: {}", self.phase.label(), msg);
                    }
                }
                Render::Rich => {
                    for f in t.in_flight.values_mut() {
                        if let Some(bar) = f.bar.take() {
                            bar.finish_and_clear();
                        }
                    }
                    if let Some(bars) = &self.bars {
                        bars.main.set_position(t.done);
                        match summary {
                            Some(msg) => bars.main.finish_with_message(msg),
                            None => bars.main.abandon(),
                        }
                    }
                }
            }
        }
        ProgressOutcome {
            elapsed: now.duration_since(t.started),
            total: t.total,
            done: t.done,
            warnings: t.warnings.iter().cloned().collect(),
        }
    }
}

/// Cheap to clone; every method is safe to call from any thread.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        let now = Instant::now();
        let mut t = self.shared.lock();
        t.stage = stage.into();
        self.shared.refresh(&mut t, now, true);
    }

    /// Marks item `key` (0-based) as in flight.
    pub fn begin(&self, key: usize, detail: impl Into<String>) {
        let now = Instant::now();
        let bar = self.shared.bars.as_ref().map(|bars| {
            bars.spinner(
                format!("{} {}", self.shared.phase.item(), key + 1),
                detail.into(),
            )
        });
        let mut t = self.shared.lock();
        t.in_flight.insert(key, InFlight { since: now, bar });
        self.shared.refresh(&mut t, now, false);
    }

    /// Finishes item `key` and counts it as done.
    pub fn end(&self, key: usize, status: &str) {
        let now = Instant::now();
        let mut t = self.shared.lock();
        if let Some(bar) = t.in_flight.remove(&key).and_then(|f| f.bar) {
            bar.finish_with_message(status.to_string());
        }
        t.complete_one(now);
        self.shared.refresh(&mut t, now, false);
    }

    /// Counts one unit done that was never tracked as in flight.
    pub fn advance(&self) {
        let now = Instant::now();
        let mut t = self.shared.lock();
        t.complete_one(now);
        self.shared.refresh(&mut t, now, false);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.say("INFO", &message.into());
    }

    /// Prints a warning and keeps it for the outcome.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.lock().remember(&message);
        self.shared.say("WARN", &message);
    }
}

pub struct ProgressReporter {
    handle: ProgressHandle,
    stop: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressReporter {
    pub fn new(phase: Phase, total: u64, config: ProgressConfig) -> Self {
        let render = config.render();
        let shared = Arc::new(Shared {
            phase,
            render,
            config,
            tally: Mutex::new(Tally::new(total, Instant::now())),
            bars: (render == Render::Rich).then(|| Bars::new(phase, total)),
        });

        // Dropping the sender wakes the ticker and ends it.
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let ticker = (render != Render::Quiet).then(|| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || loop {
                match stop_rx.recv_timeout(TICK) {
                    Err(RecvTimeoutError::Timeout) => shared.tick(),
                    _ => break,
                }
            })
        });

        Self {
            handle: ProgressHandle { shared },
            stop: Some(stop_tx),
            ticker,
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, summary: impl Into<String>) -> ProgressOutcome {
        self.stop_ticker();
        self.handle.shared.close(Some(summary.into()))
    }

    fn stop_ticker(&mut self) {
        drop(self.stop.take());
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_ticker();
        self.handle.shared.close(None);
    }
}

/// `MM:SS`, or `HH:MM:SS` past the hour.
pub fn format_clock(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}
