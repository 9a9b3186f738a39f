//! Single-Gaussian fit of a PSF stamp.
use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn, Matrix2};
use rand::Rng;

use crate::constants::ArcSec2;
use crate::gmix::{Gauss2D, GaussPars, NPARS};
use crate::mcal_errors::McalError;
use crate::observation::PsfObservation;

use super::guess::psf_guess;
use super::lm::{to_pars, GaussProblem, LmParams};
use super::{fit_with_retries, GaussFit, PixelData};

/// Unregularized residuals of a Gaussian against the PSF stamp.
struct PsfProblem {
    pix: PixelData,
    pars: GaussPars,
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PsfProblem {
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
        let model = Gauss2D::from_pars(&self.pars).ok()?;
        let mut out = DVector::zeros(self.pix.len());
        self.pix.fill_residuals(&model, out.as_mut_slice()).ok()?;
        Some(out)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::zeros(self.pix.len(), NPARS);
        self.pix
            .fill_jacobian(&self.pars, &Matrix2::zeros(), &mut jac, 0)
            .ok()?;
        Some(jac)
    }
}

impl GaussProblem for PsfProblem {
    fn npix(&self) -> usize {
        self.pix.len()
    }
}

/// Fit a PSF stamp with one elliptical Gaussian.
///
/// Infinite weights (missing PSF) carry no pixel into the fit; a stamp without any usable
/// pixel is an [`McalError::InvalidObservation`].
///
/// Arguments
/// -----------------
/// * `psf`: The PSF observation.
/// * `tguess`: Size guess.
/// * `ntry`: Maximum number of attempts.
/// * `lm_params`: Solver tolerances.
/// * `rng`: The object's generator, used for the guesses.
///
/// Return
/// ----------
/// * The converged [`GaussFit`], or [`McalError::FitDivergence`].
pub fn fit_psf(
    psf: &PsfObservation,
    tguess: ArcSec2,
    ntry: usize,
    lm_params: &LmParams,
    rng: &mut impl Rng,
) -> Result<GaussFit, McalError> {
    let pix = PixelData::from_image(&psf.image, &psf.weight, &psf.jacobian)?;
    let flux: f64 = pix.data.iter().sum();
    let problem = PsfProblem {
        pix,
        pars: [0.0; NPARS],
    };
    let fit = fit_with_retries(problem, ntry, lm_params, || Ok(psf_guess(tguess, flux, rng)))?;
    if !(fit.pars[4] > 0.0) {
        return Err(McalError::FitDivergence {
            tries: fit.ntry,
            reason: format!("PSF fit ended with T = {}", fit.pars[4]),
        });
    }
    Ok(fit)
}

#[cfg(test)]
mod psf_fit_test {
    use super::*;
    use crate::jacobian::Jacobian;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_recovers_elliptical_psf() {
        let jac = Jacobian::from_scale(12.0, 12.0, 0.2);
        let truth = Gauss2D::from_pars(&[0.0, 0.0, 0.04, -0.02, 0.5, 1.0]).unwrap();
        let image = truth.render(25, 25, &jac).unwrap();
        let psf = PsfObservation::new(image, DMatrix::from_element(25, 25, 1.0e6), jac).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let fit = fit_psf(&psf, 4.0 * 0.04, 4, &LmParams::default(), &mut rng).unwrap();
        assert_relative_eq!(fit.pars[4], 0.5, epsilon = 1e-4);
        assert_relative_eq!(fit.pars[2], 0.04, epsilon = 1e-4);
        assert_relative_eq!(fit.pars[3], -0.02, epsilon = 1e-4);
        assert_relative_eq!(fit.pars[5], 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_missing_psf_has_no_usable_pixels() {
        let jac = Jacobian::from_scale(4.0, 4.0, 0.2);
        let psf = PsfObservation::new(
            DMatrix::zeros(9, 9),
            DMatrix::from_element(9, 9, f64::INFINITY),
            jac,
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            fit_psf(&psf, 0.16, 4, &LmParams::default(), &mut rng),
            Err(McalError::InvalidObservation(_))
        ));
    }
}
