//! Run configuration.
//!
//! [`RunConfig`] is built once, from the command line or from code, through
//! [`RunConfig::builder`], and then passed by reference to every stage of the run.
use std::fmt;
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use log::warn;

use crate::constants::{DEFAULT_CHUNK_SIZE, DEFAULT_MIN_CUTOUTS, PLOT_SUBDIR};
use crate::mcal_errors::McalError;
use crate::metacal::MetacalParams;
use crate::selector::ObsSelection;

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub medsfile: Utf8PathBuf,
    /// Output file name, relative to `outdir` unless absolute.
    pub outfile: Utf8PathBuf,
    pub outdir: Utf8PathBuf,
    /// First catalogue row to fit.
    pub start: Option<usize>,
    /// One past the last catalogue row to fit.
    pub end: Option<usize>,
    /// Worker count; `1` runs sequentially.
    pub nproc: usize,
    /// Objects loaded from the catalogue per round of fitting.
    pub chunk_size: usize,
    pub seed: u64,
    pub make_plots: bool,
    pub selection: ObsSelection,
    pub overwrite: bool,
    pub verbose: bool,
    /// Objects with fewer cutouts are skipped.
    pub min_cutouts: usize,
    pub metacal: MetacalParams,
}

impl RunConfig {
    pub fn builder(
        medsfile: impl Into<Utf8PathBuf>,
        outfile: impl Into<Utf8PathBuf>,
    ) -> RunConfigBuilder {
        RunConfigBuilder::new(medsfile, outfile)
    }

    pub fn output_path(&self) -> Utf8PathBuf {
        self.outdir.join(&self.outfile)
    }

    pub fn plot_dir(&self) -> Utf8PathBuf {
        self.outdir.join(PLOT_SUBDIR)
    }

    /// Catalogue rows to fit for a catalogue of `nobj` rows.
    ///
    /// `start` and `end` past the end of the catalogue are clamped, with a warning.
    pub fn index_range(&self, nobj: usize) -> Range<usize> {
        let end = match self.end {
            Some(end) if end > nobj => {
                warn!("end = {end} is past the catalogue size {nobj}, clamping");
                nobj
            }
            Some(end) => end,
            None => nobj,
        };
        let start = self.start.unwrap_or(0).min(end);
        start..end
    }
}

/// Seconds since the Unix epoch, the seed of a run without an explicit one.
pub fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct RunConfigBuilder {
    config: RunConfig,
    seed: Option<u64>,
}

impl RunConfigBuilder {
    pub fn new(medsfile: impl Into<Utf8PathBuf>, outfile: impl Into<Utf8PathBuf>) -> Self {
        Self {
            config: RunConfig {
                medsfile: medsfile.into(),
                outfile: outfile.into(),
                outdir: Utf8PathBuf::from("."),
                start: None,
                end: None,
                nproc: 1,
                chunk_size: DEFAULT_CHUNK_SIZE,
                seed: 0,
                make_plots: false,
                selection: ObsSelection::default(),
                overwrite: false,
                verbose: false,
                min_cutouts: DEFAULT_MIN_CUTOUTS,
                metacal: MetacalParams::default(),
            },
            seed: None,
        }
    }

    pub fn outdir(mut self, v: impl AsRef<Utf8Path>) -> Self {
        self.config.outdir = v.as_ref().to_owned();
        self
    }
    pub fn start(mut self, v: Option<usize>) -> Self {
        self.config.start = v;
        self
    }
    pub fn end(mut self, v: Option<usize>) -> Self {
        self.config.end = v;
        self
    }
    pub fn nproc(mut self, v: usize) -> Self {
        self.config.nproc = v;
        self
    }
    pub fn chunk_size(mut self, v: usize) -> Self {
        self.config.chunk_size = v;
        self
    }
    pub fn seed(mut self, v: u64) -> Self {
        self.seed = Some(v);
        self
    }
    pub fn make_plots(mut self, v: bool) -> Self {
        self.config.make_plots = v;
        self
    }
    pub fn selection(mut self, v: ObsSelection) -> Self {
        self.config.selection = v;
        self
    }
    pub fn overwrite(mut self, v: bool) -> Self {
        self.config.overwrite = v;
        self
    }
    pub fn verbose(mut self, v: bool) -> Self {
        self.config.verbose = v;
        self
    }
    pub fn min_cutouts(mut self, v: usize) -> Self {
        self.config.min_cutouts = v;
        self
    }
    pub fn metacal(mut self, v: MetacalParams) -> Self {
        self.config.metacal = v;
        self
    }

    /// Validate and build.
    ///
    /// Validation rules
    /// -----------------
    /// * `nproc ≥ 1`.
    /// * `chunk_size ≥ 1`.
    /// * `outfile` is not empty.
    /// * `start ≤ end` when both are given.
    ///
    /// Without an explicit seed, the current Unix time (seconds) is used.
    pub fn build(self) -> Result<RunConfig, McalError> {
        let mut config = self.config;
        if config.nproc == 0 {
            return Err(McalError::InvalidConfig("nproc must be >= 1".into()));
        }
        if config.chunk_size == 0 {
            return Err(McalError::InvalidConfig("chunk_size must be >= 1".into()));
        }
        if config.outfile.as_str().is_empty() {
            return Err(McalError::InvalidConfig("outfile must not be empty".into()));
        }
        if let (Some(start), Some(end)) = (config.start, config.end) {
            if start > end {
                return Err(McalError::InvalidConfig(format!(
                    "start ({start}) must not exceed end ({end})"
                )));
            }
        }
        config.seed = self.seed.unwrap_or_else(time_seed);
        Ok(config)
    }
}

fn fmt_index(v: Option<usize>) -> String {
    v.map_or_else(|| "-".to_string(), |i| i.to_string())
}

impl fmt::Display for RunConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 44;
            writeln!(f, "Metacalibration run")?;
            writeln!(f, "-------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            writeln!(f, "[Input / output]")?;
            line!("medsfile    = {}", self.medsfile, "MEDS cutout file")?;
            line!("output      = {}", self.output_path(), "Parquet result table")?;
            line!("overwrite   = {}", self.overwrite, "Replace an existing output")?;
            line!("start       = {}", fmt_index(self.start), "First catalogue row")?;
            line!("end         = {}", fmt_index(self.end), "One past the last row")?;

            writeln!(f, "\n[Execution]")?;
            line!("nproc       = {}", self.nproc, "Worker threads")?;
            line!("chunk_size  = {}", self.chunk_size, "Objects in memory at a time")?;
            line!("seed        = {}", self.seed, "Run seed")?;
            line!("make_plots  = {}", self.make_plots, "Diagnostic PNGs")?;
            line!("verbose     = {}", self.verbose, "Debug logging")?;

            writeln!(f, "\n[Selection / metacal]")?;
            line!("selection   = {}", self.selection, "Epochs entering the fit")?;
            line!("min_cutouts = {}", self.min_cutouts, "Flag threshold")?;
            line!("step        = {}", self.metacal.step, "Artificial shear")?;
            line!("fix_noise   = {}", self.metacal.fix_noise, "Noise-fixing images")?;
            line!("ntry        = {}", self.metacal.ntry, "Fit attempts")?;
            line!("maxfev      = {}", self.metacal.lm.maxfev, "LM evaluations")?;
            line!("xtol        = {:.1e}", self.metacal.lm.xtol, "LM step tolerance")?;
            line!("ftol        = {:.1e}", self.metacal.lm.ftol, "LM cost tolerance")?;
            Ok(())
        } else {
            write!(
                f,
                "RunConfig(medsfile={}, output={}, range={}..{}, nproc={}, seed={}, selection={}, plots={}, {})",
                self.medsfile,
                self.output_path(),
                fmt_index(self.start),
                fmt_index(self.end),
                self.nproc,
                self.seed,
                self.selection,
                self.make_plots,
                self.metacal
            )
        }
    }
}

#[cfg(test)]
mod config_test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RunConfig::builder("a.fits", "out.parquet")
            .seed(3)
            .build()
            .unwrap();
        assert_eq!(cfg.nproc, 1);
        assert_eq!(cfg.seed, 3);
        assert_eq!(cfg.selection, ObsSelection::EpochsOnly);
        assert_eq!(cfg.output_path(), Utf8PathBuf::from("./out.parquet"));
        assert_eq!(cfg.plot_dir(), Utf8PathBuf::from("./metacal-plots"));
        assert!(!cfg.overwrite);
    }

    #[test]
    fn test_validation() {
        assert!(RunConfig::builder("a", "b").nproc(0).build().is_err());
        assert!(RunConfig::builder("a", "b").chunk_size(0).build().is_err());
        assert!(RunConfig::builder("a", "").build().is_err());
        assert!(RunConfig::builder("a", "b")
            .start(Some(5))
            .end(Some(2))
            .build()
            .is_err());
    }

    #[test]
    fn test_index_range_clamps() {
        let cfg = RunConfig::builder("a", "b")
            .start(Some(2))
            .end(Some(50))
            .seed(0)
            .build()
            .unwrap();
        assert_eq!(cfg.index_range(10), 2..10);
        assert_eq!(cfg.index_range(1), 1..1);
        let full = RunConfig::builder("a", "b").seed(0).build().unwrap();
        assert_eq!(full.index_range(7), 0..7);
    }

    #[test]
    fn test_display_table() {
        let cfg = RunConfig::builder("a.fits", "b.parquet").seed(9).build().unwrap();
        let s = format!("{cfg:#}");
        assert!(s.contains("[Execution]"));
        assert!(s.contains("seed        = 9"));
        assert!(format!("{cfg}").starts_with("RunConfig("));
    }
}
