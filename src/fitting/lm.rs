//! # Levenberg–Marquardt settings
//!
//! The Gaussian fits are solved with the MINPACK-style optimizer of the
//! [`levenberg_marquardt`] crate. Each fit problem implements [`LeastSquaresProblem`] with an
//! analytic Jacobian and reports residuals outside the model domain (`|g| ≥ 1`, a
//! non-positive convolved covariance, a flat prior bound) as `None`, which ends that attempt.
//!
//! ## Stopping rules
//! -----------------
//! * `xtol`: relative step size,
//! * `ftol`: relative cost reduction,
//! * `maxfev`: residual evaluation budget, a patience of `⌈maxfev / (NPARS + 1)⌉`.
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DVector, Dyn};

use crate::constants::{LM_FTOL, LM_MAXFEV, LM_XTOL};
use crate::gmix::{GaussPars, NPARS};

/// Tolerances of the optimizer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmParams {
    /// Maximum number of residual evaluations.
    pub maxfev: usize,
    pub xtol: f64,
    pub ftol: f64,
}

impl Default for LmParams {
    fn default() -> Self {
        LmParams {
            maxfev: LM_MAXFEV,
            xtol: LM_XTOL,
            ftol: LM_FTOL,
        }
    }
}

impl LmParams {
    pub fn new(maxfev: usize, xtol: f64, ftol: f64) -> Self {
        LmParams { maxfev, xtol, ftol }
    }

    /// Patience factor of the solver for the [`NPARS`]-parameter model.
    pub fn patience(&self) -> usize {
        self.maxfev.div_ceil(NPARS + 1).max(1)
    }

    pub fn solver(&self) -> LevenbergMarquardt<f64> {
        LevenbergMarquardt::new()
            .with_xtol(self.xtol)
            .with_ftol(self.ftol)
            .with_patience(self.patience())
    }
}

/// A Gaussian fit problem over `[v, u, g1, g2, T, flux]`.
pub(crate) trait GaussProblem:
    LeastSquaresProblem<
    f64,
    Dyn,
    Dyn,
    ResidualStorage = Owned<f64, Dyn>,
    JacobianStorage = Owned<f64, Dyn, Dyn>,
    ParameterStorage = Owned<f64, Dyn>,
>
{
    /// Number of data residuals; prior terms, if any, follow them.
    fn npix(&self) -> usize;
}

/// Copy a solver parameter vector into the model layout.
pub(crate) fn to_pars(x: &DVector<f64>) -> GaussPars {
    let mut pars = [0.0; NPARS];
    for (p, v) in pars.iter_mut().zip(x.iter()) {
        *p = *v;
    }
    pars
}
