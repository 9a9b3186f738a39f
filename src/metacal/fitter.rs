//! # Per-object metacalibration estimator
//!
//! [`MetacalFitter::fit_one`] runs the full estimator on the selected epochs of one source:
//!
//! 1. Fit a Gaussian to the PSF of every epoch; the size guess is `4·scale²`.
//! 2. Build the reconvolution PSF of every epoch: round, with variance the largest
//!    eigenvalue of the fitted PSF covariance dilated by `(1 + 2|step|)²`.
//! 3. Draw the noise-fixing images (when enabled) from the object's generator.
//! 4. For each [`MetacalType`], produce the variant epochs with
//!    [`apply_kernel`], refit their PSF, then fit the galaxy with the run prior.
//! 5. Compute the responsivity and the corrected shear ([`Responsivity`]).
//! 6. Refit the unsheared epochs to provide a [`FitModel`] for diagnostic plots.
//!
//! Every random draw comes from the generator handed in by the caller, in a fixed order,
//! so an object's result is a pure function of its data, the prior and that generator.
use log::debug;
use nalgebra::{DMatrix, Matrix2};
use rand::rngs::StdRng;

use crate::constants::{ObjectId, TGUESS_PIXEL_FACTOR};
use crate::fitting::gal_fit::GalaxyFitter;
use crate::fitting::psf_fit::fit_psf;
use crate::fitting::GaussFit;
use crate::gmix::Gauss2D;
use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;
use crate::observation::{Observation, ObservationList, PsfObservation};
use crate::priors::JointPrior;
use crate::results::{MetacalResult, ResponseBlock, VariantRecord};
use crate::shape::Shear;

use super::fourier::apply_kernel;
use super::noise::{fixed_noise_weight, noise_image};
use super::response::Responsivity;
use super::{MetacalParams, MetacalType, NVARIANTS};

/// Interface between the batch orchestrator and the per-object estimator.
pub trait ShapeFitter: Sync {
    /// Run the estimator on the selected epochs of one source.
    ///
    /// Arguments
    /// -----------------
    /// * `source_id`: Catalogue id, used for logging.
    /// * `obslist`: Selected epochs.
    /// * `prior`: The run prior, shared read-only.
    /// * `rng`: The object's own generator.
    ///
    /// Return
    /// ----------
    /// * The ten result blocks and the model of the unsheared refit.
    fn fit_one(
        &self,
        source_id: ObjectId,
        obslist: &ObservationList,
        prior: &JointPrior,
        rng: &mut StdRng,
    ) -> Result<(MetacalResult, FitModel), McalError>;
}

/// Best-fit model of the unsheared epochs, for diagnostics only.
#[derive(Debug, Clone)]
pub struct FitModel {
    /// Pre-PSF galaxy.
    pub gal: Gauss2D,
    /// PSF model of the first epoch.
    pub psf: Gauss2D,
    pub jacobian: Jacobian,
    pub nrow: usize,
    pub ncol: usize,
}

impl FitModel {
    /// PSF-convolved model on the grid of the first epoch.
    pub fn image(&self) -> Result<DMatrix<f64>, McalError> {
        self.gal
            .convolve(&self.psf)
            .render(self.nrow, self.ncol, &self.jacobian)
    }

    /// Pixel position `(row, col)` of the model centre.
    pub fn center_pixel(&self) -> Result<(f64, f64), McalError> {
        self.jacobian.to_pixel(self.gal.v, self.gal.u)
    }
}

#[derive(Debug, Clone)]
pub struct MetacalFitter {
    params: MetacalParams,
}

impl MetacalFitter {
    pub fn new(params: MetacalParams) -> Self {
        MetacalFitter { params }
    }

    pub fn params(&self) -> &MetacalParams {
        &self.params
    }

    fn psf_model(&self, psf: &PsfObservation, rng: &mut StdRng) -> Result<(GaussFit, Gauss2D), McalError> {
        let tguess = TGUESS_PIXEL_FACTOR * psf.jacobian.scale().powi(2);
        let fit = fit_psf(psf, tguess, self.params.ntry, &self.params.lm, rng)?;
        let gauss = fit.gauss()?.normalized();
        Ok((fit, gauss))
    }

    /// Image shear, kernel covariance and variant PSF covariance of `kind`.
    fn variant_kernel(
        kind: MetacalType,
        shear: &Matrix2<f64>,
        c_obs: &Matrix2<f64>,
        c_new: &Matrix2<f64>,
    ) -> (Matrix2<f64>, Matrix2<f64>, Matrix2<f64>) {
        if kind.is_psf_shear() {
            let sheared_psf = shear * c_new * shear.transpose();
            (Matrix2::identity(), sheared_psf - c_obs, sheared_psf)
        } else {
            (*shear, c_new - shear * c_obs * shear.transpose(), *c_new)
        }
    }

    fn make_variant(
        &self,
        kind: MetacalType,
        obslist: &ObservationList,
        psf_covs: &[Matrix2<f64>],
        reconv_covs: &[Matrix2<f64>],
        noises: Option<&[DMatrix<f64>]>,
    ) -> Result<ObservationList, McalError> {
        let shear = kind.shear(self.params.step);
        let a = shear.matrix()?;
        let a_noise = shear.negated().matrix()?;

        obslist
            .iter()
            .enumerate()
            .map(|(i, obs)| {
                let (img_shear, kernel, psf_cov) =
                    Self::variant_kernel(kind, &a, &psf_covs[i], &reconv_covs[i]);
                let mut image = apply_kernel(&obs.image, &obs.jacobian, &img_shear, &kernel)?;
                let mut weight = obs.weight.clone();

                if let Some(noises) = noises {
                    let (n_shear, n_kernel, _) =
                        Self::variant_kernel(kind, &a_noise, &psf_covs[i], &reconv_covs[i]);
                    image += apply_kernel(&noises[i], &obs.jacobian, &n_shear, &n_kernel)?;
                    weight = fixed_noise_weight(&weight);
                }

                let (pnrow, pncol) = obs.psf.image.shape();
                let psf_image =
                    Gauss2D::new(0.0, 0.0, psf_cov, 1.0).render(pnrow, pncol, &obs.psf.jacobian)?;
                let psf = PsfObservation::new(psf_image, obs.psf.weight.clone(), obs.psf.jacobian)?;
                Observation::new(image, weight, obs.jacobian, psf)
            })
            .collect()
    }

    fn fit_variant(
        &self,
        variant: &ObservationList,
        fitter: &GalaxyFitter<'_>,
        rng: &mut StdRng,
    ) -> Result<(VariantRecord, Shear), McalError> {
        let mut psf_fits = Vec::with_capacity(variant.len());
        let mut psf_models = Vec::with_capacity(variant.len());
        for obs in variant {
            let (fit, gauss) = self.psf_model(&obs.psf, rng)?;
            psf_fits.push(fit);
            psf_models.push(gauss);
        }
        let fit = fitter.fit(variant, &psf_models, rng)?;

        let first = variant.first().ok_or(McalError::EmptyObservation)?;
        let (row, col) = first.jacobian.to_pixel(fit.pars[0], fit.pars[1])?;
        let npsf = psf_fits.len() as f64;
        let tpsf = psf_fits.iter().map(|f| f.pars[4]).sum::<f64>() / npsf;
        let gpsf1 = psf_fits.iter().map(|f| f.pars[2]).sum::<f64>() / npsf;
        let gpsf2 = psf_fits.iter().map(|f| f.pars[3]).sum::<f64>() / npsf;

        let err = fit.errors();
        let record = VariantRecord {
            flags: fit.flags,
            nfev: to_i32(fit.nfev),
            ntry: to_i32(fit.ntry),
            g1: fit.pars[2],
            g2: fit.pars[3],
            g1_err: err[2],
            g2_err: err[3],
            g_cov12: fit.g_cov()[(0, 1)],
            t: fit.pars[4],
            t_err: err[4],
            flux: fit.pars[5],
            flux_err: err[5],
            flux_s2n: fit.flux_s2n(),
            chi2per: fit.chi2per,
            dof: to_i32(fit.dof),
            row,
            col,
            tpsf,
            gpsf1,
            gpsf2,
        };
        Ok((record, Shear::new(fit.pars[2], fit.pars[3])))
    }
}

#[inline]
fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Round reconvolution PSF covariance for a fitted PSF covariance `c_obs`.
pub fn reconvolution_cov(c_obs: &Matrix2<f64>, step: f64) -> Matrix2<f64> {
    let lambda_max = c_obs.symmetric_eigenvalues().max();
    let dilation = 1.0 + 2.0 * step.abs();
    Matrix2::identity() * (lambda_max * dilation * dilation)
}

impl ShapeFitter for MetacalFitter {
    fn fit_one(
        &self,
        source_id: ObjectId,
        obslist: &ObservationList,
        prior: &JointPrior,
        rng: &mut StdRng,
    ) -> Result<(MetacalResult, FitModel), McalError> {
        let first = obslist.first().ok_or(McalError::EmptyObservation)?;
        let tguess = TGUESS_PIXEL_FACTOR * first.pixel_scale().powi(2);
        let step = self.params.step;
        let fitter = GalaxyFitter::new(prior, &self.params.lm, self.params.ntry, tguess);

        let mut psf_models = Vec::with_capacity(obslist.len());
        for obs in obslist {
            psf_models.push(self.psf_model(&obs.psf, rng)?.1);
        }
        let psf_covs: Vec<Matrix2<f64>> = psf_models.iter().map(|p| p.cov).collect();
        let reconv_covs: Vec<Matrix2<f64>> =
            psf_covs.iter().map(|c| reconvolution_cov(c, step)).collect();

        let noises = if self.params.fix_noise {
            let mut images = Vec::with_capacity(obslist.len());
            for obs in obslist {
                images.push(noise_image(obs, rng)?);
            }
            Some(images)
        } else {
            None
        };

        let mut records = [VariantRecord::default(); NVARIANTS];
        let mut shears = [Shear::zero(); NVARIANTS];
        for kind in MetacalType::ALL {
            let variant =
                self.make_variant(kind, obslist, &psf_covs, &reconv_covs, noises.as_deref())?;
            let (record, g) = self.fit_variant(&variant, &fitter, rng)?;
            debug!(
                "Object {source_id} {kind}: g = ({:.5}, {:.5}), T = {:.4}, nfev = {}",
                g.g1, g.g2, record.t, record.nfev
            );
            records[kind.index()] = record;
            shears[kind.index()] = g;
        }

        let resp = Responsivity::from_variants(|k| shears[k.index()], step);
        let g_mc = resp.correct(shears[MetacalType::NoShear.index()])?;
        let mc = ResponseBlock {
            r11: resp.r[(0, 0)],
            r12: resp.r[(0, 1)],
            r21: resp.r[(1, 0)],
            r22: resp.r[(1, 1)],
            rpsf1: resp.rpsf[0],
            rpsf2: resp.rpsf[1],
            g1: g_mc.g1,
            g2: g_mc.g2,
        };

        let refit = fitter.fit(obslist, &psf_models, rng)?;
        let (nrow, ncol) = first.image.shape();
        let model = FitModel {
            gal: refit.gauss()?,
            psf: psf_models[0],
            jacobian: first.jacobian,
            nrow,
            ncol,
        };

        Ok((MetacalResult::new(records, mc), model))
    }
}

#[cfg(test)]
mod fitter_test {
    use super::*;
    use crate::priors::build_priors;
    use crate::synthetic::SyntheticObject;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    fn noiseless_fitter() -> MetacalFitter {
        MetacalFitter::new(MetacalParams::builder().fix_noise(false).build().unwrap())
    }

    #[test]
    fn test_reconvolution_psf_is_round_and_larger() {
        let c_obs = Matrix2::new(0.3, 0.05, 0.05, 0.2);
        let c_new = reconvolution_cov(&c_obs, 0.01);
        assert_eq!(c_new[(0, 1)], 0.0);
        assert_eq!(c_new[(0, 0)], c_new[(1, 1)]);
        let diff = c_new - c_obs;
        assert!(diff.symmetric_eigenvalues().min() > 0.0);
    }

    #[test]
    fn test_round_object_has_unit_response() {
        let obj = SyntheticObject {
            g1: 0.0,
            ..Default::default()
        };
        let obslist = obj.observations(1).unwrap();
        let prior = build_priors(1);
        let mut rng = StdRng::seed_from_u64(1);
        let (res, model) = noiseless_fitter()
            .fit_one(1, &obslist, &prior, &mut rng)
            .unwrap();
        assert_abs_diff_eq!(res.mc.r11, 1.0, epsilon = 0.02);
        assert_abs_diff_eq!(res.mc.r22, 1.0, epsilon = 0.02);
        assert_abs_diff_eq!(res.mc.r12, 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(res.mc.r21, 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(res.mc.g1, 0.0, epsilon = 1e-3);
        assert_eq!(res.nblocks(), 10);
        let (row, col) = model.center_pixel().unwrap();
        assert_abs_diff_eq!(row, 20.0, epsilon = 0.05);
        assert_abs_diff_eq!(col, 20.0, epsilon = 0.05);
    }

    #[test]
    fn test_same_generator_same_result() {
        let obj = SyntheticObject::default();
        let obslist = obj.observations(1).unwrap();
        let prior = build_priors(1);
        let fitter = MetacalFitter::new(MetacalParams::default());
        let a = fitter
            .fit_one(3, &obslist, &prior, &mut StdRng::seed_from_u64(8))
            .unwrap()
            .0;
        let b = fitter
            .fit_one(3, &obslist, &prior, &mut StdRng::seed_from_u64(8))
            .unwrap()
            .0;
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_list_rejected() {
        let prior = build_priors(1);
        let res = noiseless_fitter().fit_one(
            1,
            &ObservationList::default(),
            &prior,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(res, Err(McalError::EmptyObservation)));
    }
}
