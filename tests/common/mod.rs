#![allow(dead_code)]

use std::sync::{Mutex, OnceLock};

use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type};
use arrow_array::RecordBatch;
use flexi_logger::writers::LogWriter;
use flexi_logger::{DeferredNow, Logger, LoggerHandle};
use log::Record;
use mcalfit::constants::ObjectId;
use mcalfit::gmix::Gauss2D;
use mcalfit::mcal_errors::McalError;
use mcalfit::metacal::response::Responsivity;
use mcalfit::metacal::{FitModel, MetacalType, ShapeFitter, NVARIANTS};
use mcalfit::observation::ObservationList;
use mcalfit::priors::JointPrior;
use mcalfit::results::{MetacalResult, ResponseBlock, VariantRecord};
use mcalfit::shape::Shear;
use mcalfit::synthetic::SyntheticObject;
use rand::rngs::StdRng;
use rand::Rng;

/// Smaller, faster synthetic source for batch runs.
pub fn small_object() -> SyntheticObject {
    SyntheticObject {
        dim: 25,
        psf_dim: 17,
        t: 0.6,
        psf_t: 0.3,
        ..Default::default()
    }
}

/// Returns a fixed result whose `g1_noshear` is one draw of the object generator.
pub struct CannedFitter;

impl ShapeFitter for CannedFitter {
    fn fit_one(
        &self,
        _source_id: ObjectId,
        obslist: &ObservationList,
        _prior: &JointPrior,
        rng: &mut StdRng,
    ) -> Result<(MetacalResult, FitModel), McalError> {
        let first = obslist.first().ok_or(McalError::EmptyObservation)?;
        let mut variants = [VariantRecord::default(); NVARIANTS];
        variants[MetacalType::NoShear.index()].g1 = rng.random::<f64>();
        let mc = ResponseBlock {
            r11: 1.0,
            r22: 1.0,
            ..Default::default()
        };
        let (nrow, ncol) = first.image.shape();
        let model = FitModel {
            gal: Gauss2D::round(1.0),
            psf: Gauss2D::round(0.5),
            jacobian: first.jacobian,
            nrow,
            ncol,
        };
        Ok((MetacalResult::new(variants, mc), model))
    }
}

/// Wraps a fitter and makes it diverge for one object id.
pub struct FailFor<F> {
    pub inner: F,
    pub id: ObjectId,
}

impl<F: ShapeFitter> ShapeFitter for FailFor<F> {
    fn fit_one(
        &self,
        source_id: ObjectId,
        obslist: &ObservationList,
        prior: &JointPrior,
        rng: &mut StdRng,
    ) -> Result<(MetacalResult, FitModel), McalError> {
        if source_id == self.id {
            return Err(McalError::FitDivergence {
                tries: 4,
                reason: "injected failure".into(),
            });
        }
        self.inner.fit_one(source_id, obslist, prior, rng)
    }
}

/// Wraps a fitter and gives one object identical shears in every variant, so its
/// responsivity is singular.
pub struct DegenerateFor<F> {
    pub inner: F,
    pub id: ObjectId,
}

impl<F: ShapeFitter> ShapeFitter for DegenerateFor<F> {
    fn fit_one(
        &self,
        source_id: ObjectId,
        obslist: &ObservationList,
        prior: &JointPrior,
        rng: &mut StdRng,
    ) -> Result<(MetacalResult, FitModel), McalError> {
        if source_id == self.id {
            let resp = Responsivity::from_variants(|_| Shear::new(0.1, 0.0), 0.01);
            resp.correct(Shear::new(0.1, 0.0))?;
        }
        self.inner.fit_one(source_id, obslist, prior, rng)
    }
}

pub fn int64_column(table: &RecordBatch, name: &str) -> Vec<i64> {
    let column = table.column_by_name(name).expect("column");
    column.as_primitive::<Int64Type>().values().to_vec()
}

pub fn float64_column(table: &RecordBatch, name: &str) -> Vec<f64> {
    let column = table.column_by_name(name).expect("column");
    column.as_primitive::<Float64Type>().values().to_vec()
}

static LOG_LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());
static LOGGER: OnceLock<LoggerHandle> = OnceLock::new();

/// Keeps `"<LEVEL> <message>"` of every record in memory.
struct MemoryWriter;

impl LogWriter for MemoryWriter {
    fn write(&self, _now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
        let line = format!("{} {}", record.level(), record.args());
        LOG_LINES.lock().expect("log lines").push(line);
        Ok(())
    }

    fn flush(&self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route the `info` and louder records of this test binary to memory.
pub fn capture_logs() {
    LOGGER.get_or_init(|| {
        Logger::try_with_str("info")
            .expect("log spec")
            .log_to_writer(Box::new(MemoryWriter))
            .start()
            .expect("logger")
    });
}

/// Captured lines containing `needle`.
pub fn logged(needle: &str) -> Vec<String> {
    LOG_LINES
        .lock()
        .expect("log lines")
        .iter()
        .filter(|l| l.contains(needle))
        .cloned()
        .collect()
}
