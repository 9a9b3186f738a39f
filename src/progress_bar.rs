//! Progress of a batch run.
//!
//! [`BatchProgress`] counts finished objects (fitted, failed or skipped) from any worker
//! thread. The mean wall time per object and the remaining time are derived from the
//! elapsed time since the run started, so they stay meaningful with several workers. With
//! feature `progress` each update moves an indicatif bar; otherwise it is a `debug!` line.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[cfg(feature = "progress")]
use indicatif::{ProgressBar, ProgressStyle};
#[cfg(not(feature = "progress"))]
use log::debug;

#[cfg(feature = "progress")]
const BAR_TEMPLATE: &str =
    "{bar:40.cyan/blue} {pos}/{len} objects ({percent:>3}%) | {elapsed_precise} | {msg}";

pub struct BatchProgress {
    started: Instant,
    total: usize,
    done: AtomicUsize,
    #[cfg(feature = "progress")]
    bar: ProgressBar,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        BatchProgress {
            started: Instant::now(),
            total,
            done: AtomicUsize::new(0),
            #[cfg(feature = "progress")]
            bar: object_bar(total as u64),
        }
    }

    /// Record one finished object.
    pub fn object_done(&self) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let msg = self.message(done);
        #[cfg(feature = "progress")]
        {
            self.bar.set_message(msg);
            self.bar.inc(1);
        }
        #[cfg(not(feature = "progress"))]
        debug!("{done}/{} objects, {msg}", self.total);
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    /// Mean wall time per finished object, zero before the first one.
    pub fn mean_per_object(&self) -> Duration {
        match self.done() {
            0 => Duration::ZERO,
            n => self.started.elapsed().div_f64(n as f64),
        }
    }

    fn message(&self, done: usize) -> String {
        let mean = match done {
            0 => Duration::ZERO,
            n => self.started.elapsed().div_f64(n as f64),
        };
        let left = self.total.saturating_sub(done);
        format!(
            "{} per object, ~{} left",
            fmt_dur(mean),
            fmt_dur(mean.mul_f64(left as f64))
        )
    }

    pub fn finish(&self) {
        #[cfg(feature = "progress")]
        self.bar.finish_and_clear();
    }
}

/// Duration in the largest of µs, ms or s that keeps it readable (`"253µs"`, `"42ms"`,
/// `"3.14s"`).
pub fn fmt_dur(d: Duration) -> String {
    match d.as_micros() {
        us if us < 1_000 => format!("{us}µs"),
        us if us < 1_000_000 => format!("{}ms", us / 1_000),
        _ => format!("{:.2}s", d.as_secs_f64()),
    }
}

#[cfg(feature = "progress")]
fn object_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total.max(1));
    if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(200));
    pb
}
