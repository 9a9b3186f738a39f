//! # Gaussian model fitting
//!
//! Maximum-likelihood fits of single Gaussians to PSF stamps ([`psf_fit`]) and of a
//! PSF-convolved Gaussian galaxy to all epochs of a source ([`gal_fit`]), both solved with
//! the Levenberg–Marquardt configuration of [`lm`].
//!
//! ## Restarts
//! -----------------
//! The galaxy fit regularized by the run prior and the PSF fit share the same retry policy:
//! up to `ntry` attempts, each from a freshly randomized guess ([`guess`]). The first attempt
//! whose solver run converges is kept. When all attempts fail the fit reports
//! [`McalError::FitDivergence`] carrying the last failure reason.
//!
//! ## Reported quantities
//! -----------------
//! A fit is summarized by [`GaussFit`]: best parameters, their covariance `(JᵀJ)⁻¹`
//! (absent when singular, errors then set to [`UNDEFINED_ERR`]), evaluation count, attempt
//! count, reduced χ² over the data pixels and the flux signal-to-noise.
use levenberg_marquardt::LeastSquaresProblem;
use log::debug;
use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

use crate::constants::UNDEFINED_ERR;
use crate::gmix::{Gauss2D, GaussPars, NPARS};
use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;
use crate::shape::{covariance_derivatives, Shear};

pub mod gal_fit;
pub mod guess;
pub mod lm;
pub mod psf_fit;

use lm::{to_pars, GaussProblem, LmParams};

/// Bit set in [`GaussFit::flags`] when the parameter covariance could not be computed.
pub const FLAG_COV_SINGULAR: i32 = 1;

/// Pixels of one image that carry a positive finite weight, in sky coordinates.
#[derive(Debug, Clone)]
pub(crate) struct PixelData {
    pub v: Vec<f64>,
    pub u: Vec<f64>,
    pub data: Vec<f64>,
    /// `sqrt(weight)`
    pub ierr: Vec<f64>,
    pub area: f64,
}

impl PixelData {
    pub fn from_image(
        image: &DMatrix<f64>,
        weight: &DMatrix<f64>,
        jacobian: &Jacobian,
    ) -> Result<Self, McalError> {
        let cap = image.len();
        let mut pix = PixelData {
            v: Vec::with_capacity(cap),
            u: Vec::with_capacity(cap),
            data: Vec::with_capacity(cap),
            ierr: Vec::with_capacity(cap),
            area: jacobian.area(),
        };
        for c in 0..image.ncols() {
            for r in 0..image.nrows() {
                let w = weight[(r, c)];
                if w.is_finite() && w > 0.0 {
                    let (v, u) = jacobian.to_sky(r as f64, c as f64);
                    pix.v.push(v);
                    pix.u.push(u);
                    pix.data.push(image[(r, c)]);
                    pix.ierr.push(w.sqrt());
                }
            }
        }
        if pix.data.is_empty() {
            return Err(McalError::InvalidObservation(
                "no pixel with positive weight".into(),
            ));
        }
        Ok(pix)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Write the weighted residuals `(model − data)·sqrt(w)` of `model` into `out`.
    pub fn fill_residuals(&self, model: &Gauss2D, out: &mut [f64]) -> Result<(), McalError> {
        let eval = model.evaluator()?;
        for (i, o) in out.iter_mut().enumerate().take(self.len()) {
            let m = eval.density(self.v[i], self.u[i]) * self.area;
            *o = (m - self.data[i]) * self.ierr[i];
        }
        Ok(())
    }

    /// Derivatives of [`fill_residuals`](Self::fill_residuals) for the model `pars`
    /// convolved with `psf_cov`, written into rows `row0..row0 + len()` of `jac`.
    ///
    /// Columns follow [`GaussPars`]. Returns [`McalError::GMixRange`] where the model is
    /// undefined.
    pub fn fill_jacobian(
        &self,
        pars: &GaussPars,
        psf_cov: &Matrix2<f64>,
        jac: &mut DMatrix<f64>,
        row0: usize,
    ) -> Result<(), McalError> {
        let gal = Gauss2D::from_pars(pars)?;
        let unit = Gauss2D::new(gal.v, gal.u, gal.cov + psf_cov, 1.0);
        let eval = unit.evaluator()?;
        let cinv = unit
            .cov
            .try_inverse()
            .ok_or_else(|| McalError::GMixRange("singular convolved covariance".into()))?;
        let dcov = covariance_derivatives(pars[4], Shear::new(pars[2], pars[3]))?;
        let traces = dcov.map(|d| (cinv * d).trace());

        for i in 0..self.len() {
            let w = cinv * Vector2::new(self.v[i] - gal.v, self.u[i] - gal.u);
            let n = eval.density(self.v[i], self.u[i]) * self.area * self.ierr[i];
            let m = n * pars[5];
            let row = row0 + i;
            jac[(row, 0)] = m * w[0];
            jac[(row, 1)] = m * w[1];
            for (k, (d, tr)) in dcov.iter().zip(traces).enumerate() {
                jac[(row, 2 + k)] = 0.5 * m * (w.dot(&(d * w)) - tr);
            }
            jac[(row, 5)] = n;
        }
        Ok(())
    }
}

/// Outcome of a converged Gaussian fit.
#[derive(Debug, Clone)]
pub struct GaussFit {
    pub pars: GaussPars,
    pub cov: Option<DMatrix<f64>>,
    pub nfev: usize,
    /// Attempt (1-based) that produced this fit.
    pub ntry: usize,
    pub chi2per: f64,
    pub dof: usize,
    pub flags: i32,
}

impl GaussFit {
    /// One-sigma parameter uncertainties.
    pub fn errors(&self) -> GaussPars {
        let mut err = [UNDEFINED_ERR; NPARS];
        if let Some(cov) = &self.cov {
            for (k, e) in err.iter_mut().enumerate() {
                let var = cov[(k, k)];
                if var.is_finite() && var >= 0.0 {
                    *e = var.sqrt();
                }
            }
        }
        err
    }

    /// Covariance of `(g1, g2)`, [`UNDEFINED_ERR`]-filled when unavailable.
    pub fn g_cov(&self) -> Matrix2<f64> {
        match &self.cov {
            Some(cov) => Matrix2::new(cov[(2, 2)], cov[(2, 3)], cov[(3, 2)], cov[(3, 3)]),
            None => Matrix2::from_element(UNDEFINED_ERR),
        }
    }

    pub fn flux_s2n(&self) -> f64 {
        let err = self.errors()[5];
        if err == UNDEFINED_ERR || err == 0.0 {
            0.0
        } else {
            self.pars[5] / err
        }
    }

    pub fn gauss(&self) -> Result<Gauss2D, McalError> {
        Gauss2D::from_pars(&self.pars)
    }
}

/// Run the solver from successive guesses until one converges.
///
/// Arguments
/// -----------------
/// * `problem`: The fit problem; its parameters are reset from each guess.
/// * `ntry`: Maximum number of attempts.
/// * `lm_params`: Solver tolerances.
/// * `next_guess`: Produces the starting point of each attempt.
///
/// Return
/// ----------
/// * The first converged fit, or [`McalError::FitDivergence`] after `ntry` failures.
pub(crate) fn fit_with_retries<P, G>(
    mut problem: P,
    ntry: usize,
    lm_params: &LmParams,
    mut next_guess: G,
) -> Result<GaussFit, McalError>
where
    P: GaussProblem,
    G: FnMut() -> Result<GaussPars, McalError>,
{
    let solver = lm_params.solver();
    let mut reason = String::from("no attempt made");
    for itry in 1..=ntry {
        let guess = next_guess()?;
        problem.set_params(&DVector::from_row_slice(&guess));
        let (solved, report) = solver.minimize(problem);
        problem = solved;
        if report.termination.was_successful() {
            return summarize(&problem, itry, report.number_of_evaluations);
        }
        reason = format!(
            "{:?} after {} evaluations",
            report.termination, report.number_of_evaluations
        );
        debug!("Fit attempt {itry}/{ntry} failed: {reason}");
    }
    Err(McalError::FitDivergence {
        tries: ntry,
        reason,
    })
}

fn summarize<P: GaussProblem>(
    problem: &P,
    itry: usize,
    nfev: usize,
) -> Result<GaussFit, McalError> {
    let pars = to_pars(&problem.params());
    let resid = problem
        .residuals()
        .ok_or_else(|| McalError::GMixRange("solution outside the model domain".into()))?;
    let npix = problem.npix();
    let chi2: f64 = resid.iter().take(npix).map(|r| r * r).sum();
    let dof = npix.saturating_sub(NPARS).max(1);
    let cov = problem
        .jacobian()
        .and_then(|jac| jac.tr_mul(&jac).try_inverse());
    let flags = if cov.is_none() { FLAG_COV_SINGULAR } else { 0 };
    Ok(GaussFit {
        pars,
        cov,
        nfev,
        ntry: itry,
        chi2per: chi2 / dof as f64,
        dof,
        flags,
    })
}

#[cfg(test)]
mod fitting_test {
    use super::*;

    #[test]
    fn test_pixel_data_skips_unweighted() {
        let jac = Jacobian::from_scale(1.0, 1.0, 0.5);
        let image = DMatrix::from_element(3, 3, 2.0);
        let mut weight = DMatrix::from_element(3, 3, 4.0);
        weight[(0, 0)] = 0.0;
        weight[(2, 2)] = f64::INFINITY;
        let pix = PixelData::from_image(&image, &weight, &jac).unwrap();
        assert_eq!(pix.len(), 7);
        assert_eq!(pix.ierr[0], 2.0);
        assert_eq!(pix.area, 0.25);
    }

    #[test]
    fn test_all_zero_weight_rejected() {
        let jac = Jacobian::from_scale(1.0, 1.0, 0.5);
        let res = PixelData::from_image(&DMatrix::zeros(3, 3), &DMatrix::zeros(3, 3), &jac);
        assert!(matches!(res, Err(McalError::InvalidObservation(_))));
    }

    #[test]
    fn test_jacobian_matches_differences() {
        let jac = Jacobian::from_scale(6.0, 6.0, 0.25);
        let image = DMatrix::from_element(13, 13, 1.0);
        let weight = DMatrix::from_element(13, 13, 9.0);
        let pix = PixelData::from_image(&image, &weight, &jac).unwrap();
        let psf_cov = Matrix2::new(0.15, 0.02, 0.02, 0.12);
        let pars = [0.05, -0.08, 0.12, -0.2, 0.6, 40.0];

        let mut analytic = DMatrix::zeros(pix.len(), NPARS);
        pix.fill_jacobian(&pars, &psf_cov, &mut analytic, 0).unwrap();

        let resid = |p: &GaussPars| {
            let gal = Gauss2D::from_pars(p).unwrap();
            let mut out = vec![0.0; pix.len()];
            let model = Gauss2D::new(gal.v, gal.u, gal.cov + psf_cov, gal.flux);
            pix.fill_residuals(&model, &mut out).unwrap();
            out
        };
        let scale = analytic.amax();
        for k in 0..NPARS {
            let h = 1e-6 * pars[k].abs().max(1.0);
            let (mut up, mut down) = (pars, pars);
            up[k] += h;
            down[k] -= h;
            let (ru, rd) = (resid(&up), resid(&down));
            for i in 0..pix.len() {
                let numeric = (ru[i] - rd[i]) / (2.0 * h);
                assert!(
                    (analytic[(i, k)] - numeric).abs() < 1e-6 * scale,
                    "parameter {k}, pixel {i}: {} vs {numeric}",
                    analytic[(i, k)]
                );
            }
        }
    }

    #[test]
    fn test_undefined_errors_without_covariance() {
        let fit = GaussFit {
            pars: [0.0, 0.0, 0.1, 0.0, 1.0, 100.0],
            cov: None,
            nfev: 10,
            ntry: 1,
            chi2per: 1.0,
            dof: 10,
            flags: FLAG_COV_SINGULAR,
        };
        assert_eq!(fit.errors(), [UNDEFINED_ERR; NPARS]);
        assert_eq!(fit.flux_s2n(), 0.0);
    }
}
