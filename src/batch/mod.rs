//! # Batch orchestrator
//!
//! Runs the metacalibration estimator over a slice of a MEDS catalogue and gathers the
//! per-object rows into one table.
//!
//! ## Per-object life cycle
//! -----------------
//! ```text
//! Pending → FlagCheck → Fitting → Assembling → Done
//!                 └───→ Skipped                 (fewer cutouts than `min_cutouts`)
//!          any stage ─→ Failed                  (per-object error, logged with the id)
//! ```
//!
//! Epoch selection happens in the `Fitting` stage, so an object left without epochs is
//! `Failed` with [`McalError::EmptyObservation`].
//!
//! ## Execution
//! -----------------
//! * The range is processed in chunks of `chunk_size` objects. MEDS reads are sequential:
//!   the tasks (source + selected epochs) of one chunk are read, then fitted, so at most one
//!   chunk of cutouts is held in memory.
//! * Tasks run in catalogue order, either in the calling thread (`nproc = 1`) or on a
//!   rayon pool of exactly `nproc` threads. Each task owns its data and its generator
//!   [`child_rng`]`(seed, id)`; the prior and the fitter are shared read-only. The output is
//!   therefore identical for any worker count.
//! * Errors classified per-object by [`McalError::is_per_object`] only remove the object
//!   from the output. Any other error aborts the run.
//!
//! See also
//! ------------
//! * [`RunConfig`] – Run settings.
//! * [`run_meds_file`] – Full run from a MEDS file to a Parquet file (feature `fits`).
use std::fmt;
use std::fs;
use std::ops::Range;
use std::time::{Duration, Instant};

use arrow_array::RecordBatch;
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::constants::ObjectId;
use crate::mcal_errors::McalError;
use crate::meds::MedsSource;
use crate::metacal::ShapeFitter;
use crate::observation::{ObservationList, Source};
use crate::plotting::try_plot;
use crate::priors::JointPrior;
use crate::progress_bar::{fmt_dur, BatchProgress};
use crate::results::{assemble, concat_rows};
use crate::rng::child_rng;
use crate::selector::select;

pub mod config;

pub use config::{time_seed, RunConfig, RunConfigBuilder};

/// Stage reached by an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Pending,
    FlagCheck,
    Fitting,
    Assembling,
    Done,
    Skipped,
    Failed,
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObjectState::Pending => "pending",
            ObjectState::FlagCheck => "flag-check",
            ObjectState::Fitting => "fitting",
            ObjectState::Assembling => "assembling",
            ObjectState::Done => "done",
            ObjectState::Skipped => "skipped",
            ObjectState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Final state of one object and its row, if any.
#[derive(Debug, Clone)]
pub struct ObjectOutcome {
    pub meds_index: usize,
    pub id: ObjectId,
    pub state: ObjectState,
    /// Stage at which a failed object stopped.
    pub failed_at: Option<ObjectState>,
    /// Message of the skip or failure.
    pub reason: Option<String>,
    pub row: Option<RecordBatch>,
}

impl ObjectOutcome {
    fn new(source: &Source) -> Self {
        ObjectOutcome {
            meds_index: source.meds_index,
            id: source.id,
            state: ObjectState::Pending,
            failed_at: None,
            reason: None,
            row: None,
        }
    }

    fn skip(mut self, err: &McalError) -> Self {
        info!("Object {} skipped: {err}", self.id);
        self.state = ObjectState::Skipped;
        self.reason = Some(err.to_string());
        self
    }

    fn fail(mut self, err: McalError) -> Result<Self, McalError> {
        if !err.is_per_object() {
            return Err(err);
        }
        warn!("Object {} failed while {}: {err}", self.id, self.state);
        self.failed_at = Some(self.state);
        self.state = ObjectState::Failed;
        self.reason = Some(err.to_string());
        Ok(self)
    }
}

/// Flag check of one catalogue row.
///
/// Return
/// ----------
/// * [`McalError::FlaggedObject`] with flag `min_cutouts` if the object has fewer cutouts
///   than `min_cutouts`.
pub fn check_obj_flags(source: &Source, min_cutouts: usize) -> Result<(), McalError> {
    if source.ncutout < min_cutouts {
        return Err(McalError::FlaggedObject {
            flag: "min_cutouts".into(),
        });
    }
    Ok(())
}

/// Timing of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputReport {
    /// Objects attempted.
    pub nobj: usize,
    pub nproc: usize,
    pub wall: Duration,
}

impl ThroughputReport {
    /// Wall-clock seconds per attempted object.
    pub fn wall_per_object(&self) -> f64 {
        self.wall.as_secs_f64() / self.nobj.max(1) as f64
    }

    /// CPU seconds per object, wall-clock time times the worker count.
    pub fn cpu_per_object(&self) -> f64 {
        self.wall_per_object() * self.nproc as f64
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} objects in {:.2} s: {:.4} s per object (wall), {:.4} s per object (cpu, {} workers)",
            self.nobj,
            self.wall.as_secs_f64(),
            self.wall_per_object(),
            self.cpu_per_object(),
            self.nproc
        )
    }
}

/// Result of [`run_batch`].
#[derive(Debug, Clone)]
pub struct BatchOutput {
    /// Rows of the successful objects, in catalogue order.
    pub table: RecordBatch,
    /// One outcome per attempted object, in catalogue order.
    pub outcomes: Vec<ObjectOutcome>,
    pub throughput: ThroughputReport,
}

impl BatchOutput {
    pub fn count(&self, state: ObjectState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }
}

/// One object ready for fitting: catalogue row and the selection outcome.
struct Task {
    outcome: ObjectOutcome,
    source: Source,
    epochs: Result<ObservationList, McalError>,
}

/// Read the objects of `range` and run the flag check.
fn gather_tasks(
    meds: &mut impl MedsSource,
    config: &RunConfig,
    range: Range<usize>,
    progress: &BatchProgress,
) -> Result<(Vec<Task>, Vec<ObjectOutcome>), McalError> {
    let has_coadd = meds.has_coadd();
    let mut tasks = Vec::with_capacity(range.len());
    let mut early = Vec::new();

    for index in range {
        let source = meds.source(index)?;
        let mut outcome = ObjectOutcome::new(&source);

        outcome.state = ObjectState::FlagCheck;
        if let Err(e) = check_obj_flags(&source, config.min_cutouts) {
            early.push(outcome.skip(&e));
            progress.object_done();
            continue;
        }

        let epochs = match meds.observations(index) {
            Ok(all) => select(&all, has_coadd, config.selection),
            Err(e) if e.is_per_object() => Err(e),
            Err(e) => return Err(e),
        };
        tasks.push(Task {
            outcome,
            source,
            epochs,
        });
    }
    Ok((tasks, early))
}

/// Fit, assemble and optionally plot one object.
fn process_task(
    task: Task,
    config: &RunConfig,
    fitter: &impl ShapeFitter,
    prior: &JointPrior,
) -> Result<ObjectOutcome, McalError> {
    let Task {
        mut outcome,
        source,
        epochs,
    } = task;
    outcome.state = ObjectState::Fitting;
    let started = Instant::now();

    let obslist = match epochs {
        Ok(obslist) => obslist,
        Err(e) => return outcome.fail(e),
    };

    let id = source.id;
    debug!("Fitting object {id} ({} epochs)", obslist.len());
    let mut rng = child_rng(config.seed, id);
    let (mcal, model) = match fitter.fit_one(id, &obslist, prior, &mut rng) {
        Ok(res) => res,
        Err(e) => return outcome.fail(e),
    };

    outcome.state = ObjectState::Assembling;
    let row = match assemble(&mcal, &source) {
        Ok(row) => row,
        Err(e) => return outcome.fail(e),
    };

    if config.make_plots {
        try_plot(&config.plot_dir(), source.meds_index, &obslist, &model);
    }

    debug!("Object {id} done in {}", fmt_dur(started.elapsed()));
    outcome.state = ObjectState::Done;
    outcome.row = Some(row);
    Ok(outcome)
}

/// Shared read-only state of the fitting stage.
struct Fitting<'a, F> {
    config: &'a RunConfig,
    fitter: &'a F,
    prior: &'a JointPrior,
    pool: Option<rayon::ThreadPool>,
    progress: BatchProgress,
}

impl<F: ShapeFitter> Fitting<'_, F> {
    fn run(&self, tasks: Vec<Task>) -> Result<Vec<ObjectOutcome>, McalError> {
        let fit = |task: Task| {
            let res = process_task(task, self.config, self.fitter, self.prior);
            self.progress.object_done();
            res
        };
        match &self.pool {
            None => tasks.into_iter().map(fit).collect(),
            Some(pool) => pool.install(|| tasks.into_par_iter().map(fit).collect()),
        }
    }
}

/// Fit every object of the configured range.
///
/// Arguments
/// -----------------
/// * `meds`: The catalogue.
/// * `config`: Run settings (range, chunk size, worker count, seed, selection, plots).
/// * `fitter`: The per-object estimator.
/// * `prior`: The run prior.
///
/// Return
/// ----------
/// * The stacked rows of the successful objects with [`crate::results::result_schema`]
///   columns, the
///   outcome of every object and the throughput report.
/// * An error only for failures that are not confined to one object (MEDS access, plot
///   directory creation, worker pool).
pub fn run_batch<F: ShapeFitter>(
    meds: &mut impl MedsSource,
    config: &RunConfig,
    fitter: &F,
    prior: &JointPrior,
) -> Result<BatchOutput, McalError> {
    if config.make_plots {
        fs::create_dir_all(config.plot_dir())?;
    }

    let started = Instant::now();
    let range = config.index_range(meds.len());
    let pool = if config.nproc > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.nproc)
            .build()
            .map_err(|e| McalError::InvalidConfig(format!("worker pool: {e}")))?;
        Some(pool)
    } else {
        None
    };
    let stage = Fitting {
        config,
        fitter,
        prior,
        pool,
        progress: BatchProgress::new(range.len()),
    };
    info!(
        "Fitting objects {}..{} in chunks of {} with {} worker(s)",
        range.start, range.end, config.chunk_size, config.nproc
    );

    let mut outcomes = Vec::with_capacity(range.len());
    for start in range.clone().step_by(config.chunk_size) {
        let chunk = start..(start + config.chunk_size).min(range.end);
        let (tasks, early) = gather_tasks(meds, config, chunk, &stage.progress)?;
        outcomes.extend(early);
        outcomes.extend(stage.run(tasks)?);
    }
    stage.progress.finish();
    outcomes.sort_by_key(|o| o.meds_index);

    let table = concat_rows(outcomes.iter().filter_map(|o| o.row.as_ref()))?;

    let throughput = ThroughputReport {
        nobj: outcomes.len(),
        nproc: config.nproc,
        wall: started.elapsed(),
    };
    info!("Fitting done: {throughput}");
    info!(
        "{} rows, {} skipped, {} failed",
        table.num_rows(),
        outcomes.iter().filter(|o| o.state == ObjectState::Skipped).count(),
        outcomes.iter().filter(|o| o.state == ObjectState::Failed).count()
    );

    Ok(BatchOutput {
        table,
        outcomes,
        throughput,
    })
}

/// Fit a MEDS file and write the Parquet table.
///
/// The output is checked before any fitting; an existing file without `overwrite` is an
/// [`McalError::OutputExists`] error.
#[cfg(feature = "fits")]
pub fn run_meds_file(config: &RunConfig) -> Result<BatchOutput, McalError> {
    use crate::meds::FitsMeds;
    use crate::metacal::MetacalFitter;
    use crate::output::write_table;
    use crate::priors::build_priors;

    let output = config.output_path();
    if output.exists() && !config.overwrite {
        return Err(McalError::OutputExists(output.to_string()));
    }
    fs::create_dir_all(&config.outdir)?;

    let mut meds = FitsMeds::open(&config.medsfile)?;
    let prior = build_priors(config.seed);
    let fitter = MetacalFitter::new(config.metacal.clone());
    info!("{config:#}");
    debug!("Prior: {prior}");

    let out = run_batch(&mut meds, config, &fitter, &prior)?;
    write_table(&out.table, &output, config.overwrite)?;
    Ok(out)
}

#[cfg(test)]
mod batch_test {
    use super::*;
    use crate::metacal::{FitModel, MetacalFitter, MetacalParams};
    use crate::priors::build_priors;
    use crate::results::{result_schema, MetacalResult};
    use crate::synthetic::{synthetic_catalog, SyntheticObject};
    use rand::rngs::StdRng;

    fn config(nproc: usize) -> RunConfig {
        RunConfig::builder("mem", "out.parquet")
            .nproc(nproc)
            .seed(11)
            .metacal(MetacalParams::builder().maxfev(400).build().unwrap())
            .build()
            .unwrap()
    }

    struct AlwaysFails;

    impl ShapeFitter for AlwaysFails {
        fn fit_one(
            &self,
            _: ObjectId,
            _: &ObservationList,
            _: &JointPrior,
            _: &mut StdRng,
        ) -> Result<(MetacalResult, FitModel), McalError> {
            Err(McalError::FitDivergence {
                tries: 4,
                reason: "injected".into(),
            })
        }
    }

    struct Fatal;

    impl ShapeFitter for Fatal {
        fn fit_one(
            &self,
            _: ObjectId,
            _: &ObservationList,
            _: &JointPrior,
            _: &mut StdRng,
        ) -> Result<(MetacalResult, FitModel), McalError> {
            Err(McalError::IoError(std::io::Error::other("disk gone")))
        }
    }

    #[test]
    fn test_flag_check() {
        let mut src = Source {
            meds_index: 0,
            id: 1,
            ra: 0.0,
            dec: 0.0,
            xwin_image: 0.0,
            ywin_image: 0.0,
            ncutout: 0,
        };
        assert_eq!(
            check_obj_flags(&src, 1),
            Err(McalError::FlaggedObject {
                flag: "min_cutouts".into()
            })
        );
        src.ncutout = 1;
        assert!(check_obj_flags(&src, 1).is_ok());
    }

    #[test]
    fn test_failures_are_isolated() {
        let mut meds = synthetic_catalog(&SyntheticObject::default(), 3, 1, false).unwrap();
        let out = run_batch(&mut meds, &config(1), &AlwaysFails, &build_priors(1)).unwrap();
        assert_eq!(out.table.num_rows(), 0);
        assert_eq!(out.table.schema(), result_schema());
        assert_eq!(out.count(ObjectState::Failed), 3);
        assert_eq!(out.outcomes[0].failed_at, Some(ObjectState::Fitting));
    }

    #[test]
    fn test_chunked_run_matches_single_chunk() {
        let obj = SyntheticObject::default();
        let prior = build_priors(1);
        let fitter = MetacalFitter::new(MetacalParams::builder().maxfev(400).build().unwrap());
        let mut one = synthetic_catalog(&obj, 5, 1, false).unwrap();
        let whole = run_batch(&mut one, &config(1), &fitter, &prior).unwrap();

        let chunked_config = RunConfig::builder("mem", "out.parquet")
            .nproc(2)
            .seed(11)
            .chunk_size(2)
            .metacal(MetacalParams::builder().maxfev(400).build().unwrap())
            .build()
            .unwrap();
        let mut two = synthetic_catalog(&obj, 5, 1, false).unwrap();
        let chunked = run_batch(&mut two, &chunked_config, &fitter, &prior).unwrap();

        assert_eq!(chunked.outcomes.len(), 5);
        assert_eq!(chunked.table, whole.table);
        let indices: Vec<usize> = chunked.outcomes.iter().map(|o| o.meds_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_fatal_error_aborts() {
        let mut meds = synthetic_catalog(&SyntheticObject::default(), 2, 1, false).unwrap();
        let res = run_batch(&mut meds, &config(2), &Fatal, &build_priors(1));
        assert!(matches!(res, Err(McalError::IoError(_))));
    }

    #[test]
    fn test_coadd_only_catalogue_in_epochs_mode_fails_empty() {
        // One coadd and no single-epoch cutouts: nothing left in the default mode.
        let mut meds = synthetic_catalog(&SyntheticObject::default(), 2, 0, true).unwrap();
        let fitter = MetacalFitter::new(MetacalParams::default());
        let out = run_batch(&mut meds, &config(1), &fitter, &build_priors(1)).unwrap();
        assert_eq!(out.count(ObjectState::Failed), 2);
        assert_eq!(
            out.outcomes[1].reason.as_deref(),
            Some(McalError::EmptyObservation.to_string().as_str())
        );
    }

    #[test]
    fn test_throughput_relation() {
        let report = ThroughputReport {
            nobj: 8,
            nproc: 4,
            wall: Duration::from_secs(2),
        };
        assert_eq!(report.wall_per_object(), 0.25);
        assert_eq!(report.cpu_per_object(), 1.0);
        let empty = ThroughputReport {
            nobj: 0,
            nproc: 2,
            wall: Duration::ZERO,
        };
        assert_eq!(empty.cpu_per_object(), 0.0);
    }
}
