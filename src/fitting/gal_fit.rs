//! Prior-regularized fit of a PSF-convolved Gaussian galaxy to all epochs of a source.
//!
//! Residual vector layout: the weighted pixel residuals of every epoch, in epoch order,
//! followed by the [`NPRIOR_FDIFF`] prior terms of [`JointPrior::fill_fdiff`].
use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use rand::Rng;

use crate::constants::ArcSec2;
use crate::gmix::{Gauss2D, GaussPars, NPARS};
use crate::mcal_errors::McalError;
use crate::observation::ObservationList;
use crate::priors::{JointPrior, NPRIOR_FDIFF};

use super::guess::galaxy_guess;
use super::lm::{to_pars, GaussProblem, LmParams};
use super::{fit_with_retries, GaussFit, PixelData};

struct Epoch {
    pix: PixelData,
    psf: Gauss2D,
}

struct GalaxyProblem<'a> {
    epochs: Vec<Epoch>,
    npix: usize,
    prior: &'a JointPrior,
    pars: GaussPars,
}

impl GalaxyProblem<'_> {
    fn fill(&self, out: &mut [f64]) -> Result<(), McalError> {
        let gal = Gauss2D::from_pars(&self.pars)?;
        let mut start = 0;
        for epoch in &self.epochs {
            let end = start + epoch.pix.len();
            epoch
                .pix
                .fill_residuals(&gal.convolve(&epoch.psf), &mut out[start..end])?;
            start = end;
        }
        self.prior.fill_fdiff(&self.pars, &mut out[start..])
    }

    fn fill_jacobian(&self, jac: &mut DMatrix<f64>) -> Result<(), McalError> {
        let mut start = 0;
        for epoch in &self.epochs {
            epoch
                .pix
                .fill_jacobian(&self.pars, &epoch.psf.cov, jac, start)?;
            start += epoch.pix.len();
        }
        self.prior.fill_fdiff_jacobian(&self.pars, jac, start)
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for GalaxyProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        self.pars = to_pars(x);
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_row_slice(&self.pars)
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut out = DVector::zeros(self.npix + NPRIOR_FDIFF);
        self.fill(out.as_mut_slice()).ok()?;
        Some(out)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::zeros(self.npix + NPRIOR_FDIFF, NPARS);
        self.fill_jacobian(&mut jac).ok()?;
        Some(jac)
    }
}

impl GaussProblem for GalaxyProblem<'_> {
    fn npix(&self) -> usize {
        self.npix
    }
}

/// Galaxy fit settings shared by every variant of one object.
#[derive(Debug, Clone, Copy)]
pub struct GalaxyFitter<'a> {
    pub prior: &'a JointPrior,
    pub lm_params: &'a LmParams,
    pub ntry: usize,
    pub tguess: ArcSec2,
}

impl<'a> GalaxyFitter<'a> {
    pub fn new(prior: &'a JointPrior, lm_params: &'a LmParams, ntry: usize, tguess: ArcSec2) -> Self {
        GalaxyFitter {
            prior,
            lm_params,
            ntry,
            tguess,
        }
    }

    /// Fit the galaxy model jointly on all epochs.
    ///
    /// Arguments
    /// -----------------
    /// * `obslist`: The epochs to fit.
    /// * `psfs`: The Gaussian PSF model of each epoch, in the same order.
    /// * `rng`: The object's generator.
    ///
    /// Return
    /// ----------
    /// * The converged [`GaussFit`] (pixel χ² only in `chi2per`), or
    ///   [`McalError::FitDivergence`] after `ntry` failed attempts.
    pub fn fit(
        &self,
        obslist: &ObservationList,
        psfs: &[Gauss2D],
        rng: &mut impl Rng,
    ) -> Result<GaussFit, McalError> {
        if obslist.is_empty() {
            return Err(McalError::EmptyObservation);
        }
        if psfs.len() != obslist.len() {
            return Err(McalError::InvalidObservation(format!(
                "{} PSF models for {} epochs",
                psfs.len(),
                obslist.len()
            )));
        }

        let epochs = obslist
            .iter()
            .zip(psfs)
            .map(|(obs, psf)| {
                Ok(Epoch {
                    pix: PixelData::from_image(&obs.image, &obs.weight, &obs.jacobian)?,
                    psf: *psf,
                })
            })
            .collect::<Result<Vec<_>, McalError>>()?;
        let npix = epochs.iter().map(|e| e.pix.len()).sum();
        let flux = obslist.iter().map(|o| o.image.sum()).sum::<f64>() / obslist.len() as f64;

        let problem = GalaxyProblem {
            epochs,
            npix,
            prior: self.prior,
            pars: [0.0; NPARS],
        };
        fit_with_retries(problem, self.ntry, self.lm_params, || {
            galaxy_guess(self.prior, self.tguess, flux, rng)
        })
    }
}

#[cfg(test)]
mod gal_fit_test {
    use super::*;
    use crate::synthetic::SyntheticObject;
    use crate::priors::build_priors;
    use approx::assert_abs_diff_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_noiseless_galaxy_recovered() {
        let obj = SyntheticObject::default();
        let obslist = obj.observations(2).unwrap();
        let psf = Gauss2D::from_pars(&obj.psf_pars()).unwrap();
        let prior = build_priors(0);
        let lm = LmParams::default();
        let fitter = GalaxyFitter::new(&prior, &lm, 4, 4.0 * obj.scale * obj.scale);
        let mut rng = StdRng::seed_from_u64(3);
        let fit = fitter.fit(&obslist, &[psf, psf], &mut rng).unwrap();
        assert_abs_diff_eq!(fit.pars[2], obj.g1, epsilon = 1e-3);
        assert_abs_diff_eq!(fit.pars[3], obj.g2, epsilon = 1e-3);
        assert_abs_diff_eq!(fit.pars[4], obj.t, epsilon = 1e-2);
        assert_abs_diff_eq!(fit.pars[5], obj.flux, epsilon = 1.0);
        assert!(fit.chi2per < 1e-3);
        assert!(fit.errors()[2] < 1e-2);
    }

    #[test]
    fn test_psf_count_must_match_epochs() {
        let obj = SyntheticObject::default();
        let obslist = obj.observations(2).unwrap();
        let prior = build_priors(0);
        let lm = LmParams::default();
        let fitter = GalaxyFitter::new(&prior, &lm, 4, 0.16);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            fitter.fit(&obslist, &[Gauss2D::round(0.5)], &mut rng),
            Err(McalError::InvalidObservation(_))
        ));
    }
}
