use crate::container::SensHeader;

use clap::ValueEnum;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

const MAX_STORED_WARNINGS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Minimum gap between two per-frame `[PROGRESS]` lines in plain mode.
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            plain_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        let is_tty = self
            .tty_override
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        match self.mode {
            ProgressMode::Auto if is_tty => ResolvedProgressMode::Rich,
            ProgressMode::Auto => ResolvedProgressMode::Plain,
            ProgressMode::Rich => ResolvedProgressMode::Rich,
            ProgressMode::Plain => ResolvedProgressMode::Plain,
            ProgressMode::Quiet => ResolvedProgressMode::Quiet,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConvertSummary {
    pub output_path: PathBuf,
    pub engine: String,
    pub workers: usize,
    pub queue_frames: usize,
    pub start_frame: u64,
    pub end_frame: u64,
    pub frames_written: u64,
    pub available_frames: usize,
    pub color_bytes: u64,
    pub depth_raw_bytes: u64,
    pub depth_bytes: u64,
    pub container_bytes: u64,
    pub max_skew: u64,
    pub mean_skew: f64,
    pub reused_depth: usize,
    pub elapsed: Duration,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct InspectSummary {
    pub input_path: PathBuf,
    pub header: SensHeader,
    pub frames_read: u64,
    pub color_bytes: u64,
    pub depth_bytes: u64,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
    pub verified: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub processed_bytes: u64,
    pub avg_bytes_per_sec: f64,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
struct Counters {
    stage: String,
    total_bytes: u64,
    processed_bytes: u64,
    total_frames: u64,
    processed_frames: u64,
    active: BTreeSet<String>,
    warnings: Vec<String>,
    last_plain_line: Option<Instant>,
    finished: bool,
}

struct Shared {
    label: String,
    mode: ResolvedProgressMode,
    plain_interval: Duration,
    started: Instant,
    bar: Option<ProgressBar>,
    counters: Mutex<Counters>,
}

/// Cloneable sink handed to workers; all rendering goes through it.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

/// Owns the display for one run. `finish` (or drop) closes it.
pub struct ProgressReporter {
    handle: ProgressHandle,
}

impl ProgressReporter {
    pub fn new(label: impl Into<String>, total_bytes: u64, config: ProgressConfig) -> Self {
        let label = label.into();
        let mode = config.resolve_mode();
        let bar = (mode == ResolvedProgressMode::Rich).then(|| rich_bar(&label, total_bytes));

        let shared = Arc::new(Shared {
            label,
            mode,
            plain_interval: config.plain_interval,
            started: Instant::now(),
            bar,
            counters: Mutex::new(Counters {
                stage: "initializing".to_string(),
                total_bytes,
                processed_bytes: 0,
                total_frames: 0,
                processed_frames: 0,
                active: BTreeSet::new(),
                warnings: Vec::new(),
                last_plain_line: None,
                finished: false,
            }),
        });
        Self {
            handle: ProgressHandle { shared },
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(self, final_message: impl Into<String>) -> ProgressOutcome {
        self.handle.shared.close(Some(final_message.into()))
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.handle.shared.close(None);
    }
}

impl ProgressHandle {
    pub fn set_totals(&self, total_bytes: u64, total_frames: u64) {
        let mut c = self.shared.lock();
        c.total_bytes = total_bytes;
        c.total_frames = total_frames;
        if let Some(bar) = &self.shared.bar {
            bar.set_length(total_bytes.max(1));
        }
        self.shared.render(&mut c, true);
    }

    pub fn set_stage(&self, stage: impl Into<String>) {
        let mut c = self.shared.lock();
        c.stage = stage.into();
        self.shared.render(&mut c, true);
    }

    /// Records one finished frame that consumed `bytes` of source data.
    pub fn frame_done(&self, bytes: u64) {
        let mut c = self.shared.lock();
        c.processed_bytes = c.processed_bytes.saturating_add(bytes);
        if c.total_bytes > 0 {
            c.processed_bytes = c.processed_bytes.min(c.total_bytes);
        }
        c.processed_frames += 1;
        self.shared.render(&mut c, false);
    }

    /// Marks a worker as busy. Only the id is displayed; `status` goes to the
    /// rich bar message.
    pub fn set_operation_status(&self, operation_id: impl Into<String>, status: impl Into<String>) {
        let mut c = self.shared.lock();
        c.active.insert(operation_id.into());
        if let Some(bar) = &self.shared.bar {
            bar.set_message(status.into());
        }
    }

    pub fn clear_operation(&self, operation_id: &str) {
        self.shared.lock().active.remove(operation_id);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.emit("INFO", &message.into());
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut c = self.shared.lock();
            if c.warnings.len() >= MAX_STORED_WARNINGS {
                c.warnings.remove(0);
            }
            c.warnings.push(message.clone());
        }
        self.shared.emit("WARN", &message);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        // A panicking worker must not take the reporter down with it.
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn render(&self, c: &mut Counters, force: bool) {
        if c.finished {
            return;
        }
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Rich => {
                if let Some(bar) = &self.bar {
                    bar.set_position(c.processed_bytes);
                    bar.set_prefix(format!(
                        "{} {}/{}",
                        c.stage, c.processed_frames, c.total_frames
                    ));
                }
            }
            ResolvedProgressMode::Plain => {
                let now = Instant::now();
                let due = c
                    .last_plain_line
                    .map_or(true, |t| now.duration_since(t) >= self.plain_interval);
                if force || due {
                    c.last_plain_line = Some(now);
                    eprintln!("{}", self.plain_line(c));
                }
            }
        }
    }

    fn plain_line(&self, c: &Counters) -> String {
        let elapsed = self.started.elapsed();
        let rate = average_rate(c.processed_bytes, elapsed);
        let active = if c.active.is_empty() {
            "-".to_string()
        } else {
            c.active.iter().take(4).cloned().collect::<Vec<_>>().join(",")
        };
        format!(
            "[PROGRESS] {} elapsed={} stage={} frames={}/{} done={} / {} rate={} ETA={} active={}",
            self.label,
            format_duration(elapsed),
            c.stage,
            c.processed_frames,
            c.total_frames,
            HumanBytes(c.processed_bytes),
            HumanBytes(c.total_bytes),
            format_rate(rate),
            compute_eta(c.total_bytes, c.processed_bytes, rate)
                .map(format_duration)
                .unwrap_or_else(|| "--:--".to_string()),
            active
        )
    }

    fn emit(&self, level: &str, message: &str) {
        let line = format!("[{}] {}: {}", level, self.label, message);
        match (self.mode, &self.bar) {
            (ResolvedProgressMode::Quiet, _) => {}
            (ResolvedProgressMode::Rich, Some(bar)) => bar.println(line),
            _ => eprintln!("{}", line),
        }
    }

    fn close(&self, final_message: Option<String>) -> ProgressOutcome {
        let mut c = self.lock();
        let elapsed = self.started.elapsed();
        if !c.finished {
            match self.mode {
                ResolvedProgressMode::Quiet => {}
                ResolvedProgressMode::Plain => {
                    eprintln!("{}", self.plain_line(&c));
                    if let Some(msg) = final_message.as_deref() {
                        eprintln!("[DONE] {}: {}", self.label, msg);
                    }
                }
                ResolvedProgressMode::Rich => {
                    if let Some(bar) = &self.bar {
                        match final_message {
                            Some(msg) => bar.finish_with_message(msg),
                            None => bar.finish_and_clear(),
                        }
                    }
                }
            }
            c.finished = true;
        }

        ProgressOutcome {
            elapsed,
            processed_bytes: c.processed_bytes,
            avg_bytes_per_sec: average_rate(c.processed_bytes, elapsed),
            warning_count: c.warnings.len(),
            warnings: c.warnings.clone(),
        }
    }
}

fn rich_bar(label: &str, total_bytes: u64) -> ProgressBar {
    let bar = ProgressBar::new(total_bytes.max(1));
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {prefix} {wide_bar:.cyan/blue} {bytes}/{total_bytes} {bytes_per_sec} ETA {eta} | {msg}",
        )
        .expect("valid progress template"),
    );
    bar.set_prefix(label.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

pub fn average_rate(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / elapsed.as_secs_f64().max(1e-6)
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

pub fn format_rate(bps: f64) -> String {
    if bps <= 0.1 {
        "0 B/s".to_string()
    } else {
        format!("{}/s", HumanBytes(bps as u64))
    }
}

fn compute_eta(total_bytes: u64, processed_bytes: u64, throughput_bps: f64) -> Option<Duration> {
    if throughput_bps <= 0.1 || processed_bytes >= total_bytes {
        return None;
    }
    let remaining = total_bytes.saturating_sub(processed_bytes) as f64;
    Some(Duration::from_secs_f64(remaining / throughput_bps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_resolution_respects_tty_override() {
        let cfg_tty = ProgressConfig::new(ProgressMode::Auto).with_tty_override(true);
        assert_eq!(cfg_tty.resolve_mode(), ResolvedProgressMode::Rich);

        let cfg_not_tty = ProgressConfig::new(ProgressMode::Auto).with_tty_override(false);
        assert_eq!(cfg_not_tty.resolve_mode(), ResolvedProgressMode::Plain);

        let cfg_quiet = ProgressConfig::new(ProgressMode::Quiet).with_tty_override(true);
        assert_eq!(cfg_quiet.resolve_mode(), ResolvedProgressMode::Quiet);
    }

    #[test]
    fn eta_uses_remaining_bytes() {
        let eta = compute_eta(1_000, 250, 50.0).expect("eta should exist");
        assert_eq!(eta.as_secs(), 15);
        assert!(compute_eta(100, 100, 1_000.0).is_none());
        assert!(compute_eta(100, 10, 0.0).is_none());
    }

    #[test]
    fn durations_render_with_hours_only_when_needed() {
        assert_eq!(format_duration(Duration::from_secs(75)), "01:15");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_rate(0.0), "0 B/s");
    }

    #[test]
    fn quiet_reporter_still_collects_warnings() {
        let cfg = ProgressConfig::new(ProgressMode::Quiet);
        let reporter = ProgressReporter::new("test", 10, cfg);
        let h = reporter.handle();
        h.set_totals(10, 2);
        h.frame_done(4);
        h.frame_done(4);
        h.warning("depth reused");
        let outcome = reporter.finish("done");
        assert_eq!(outcome.processed_bytes, 8);
        assert_eq!(outcome.warning_count, 1);
        assert_eq!(outcome.warnings, vec!["depth reused".to_string()]);
    }
}
