//! Synthetic Gaussian sources.
//!
//! Renders sheared Gaussian galaxies convolved with a Gaussian PSF on square cutouts, with
//! optional Gaussian pixel noise, and packs them into an in-memory MEDS source. Used by the
//! tests and the benchmarks.
use nalgebra::DMatrix;
use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};

use crate::constants::{ArcSec, ArcSec2, ObjectId};
use crate::gmix::{Gauss2D, GaussPars};
use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;
use crate::meds::InMemoryMeds;
use crate::observation::{Observation, ObservationList, PsfObservation, Source};

/// Relative PSF noise level defining the PSF weight map, `w = 1 / (1e-3·max)²`.
pub const PSF_NOISE_FRACTION: f64 = 1.0e-3;

/// Truth and rendering settings of one synthetic source.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticObject {
    pub g1: f64,
    pub g2: f64,
    pub t: ArcSec2,
    pub flux: f64,
    pub psf_t: ArcSec2,
    pub psf_g1: f64,
    pub psf_g2: f64,
    pub scale: ArcSec,
    /// Side of the image cutouts (pixels).
    pub dim: usize,
    /// Side of the PSF stamps (pixels).
    pub psf_dim: usize,
    /// Pixel noise level; the weight map is `1/noise²` whether or not noise is added.
    pub noise: f64,
}

impl Default for SyntheticObject {
    fn default() -> Self {
        SyntheticObject {
            g1: 0.05,
            g2: 0.0,
            t: 1.0,
            flux: 1000.0,
            psf_t: 0.5,
            psf_g1: 0.0,
            psf_g2: 0.0,
            scale: 0.2,
            dim: 41,
            psf_dim: 25,
            noise: 0.01,
        }
    }
}

impl SyntheticObject {
    pub fn gal_pars(&self) -> GaussPars {
        [0.0, 0.0, self.g1, self.g2, self.t, self.flux]
    }

    pub fn psf_pars(&self) -> GaussPars {
        [0.0, 0.0, self.psf_g1, self.psf_g2, self.psf_t, 1.0]
    }

    fn jacobian(&self, dim: usize) -> Jacobian {
        let cen = (dim as f64 - 1.0) / 2.0;
        Jacobian::from_scale(cen, cen, self.scale)
    }

    /// PSF stamp with the uniform relative-noise weight map.
    pub fn psf_observation(&self) -> Result<PsfObservation, McalError> {
        let jac = self.jacobian(self.psf_dim);
        let image = Gauss2D::from_pars(&self.psf_pars())?.render(self.psf_dim, self.psf_dim, &jac)?;
        let max = image.max();
        let weight = DMatrix::from_element(
            self.psf_dim,
            self.psf_dim,
            1.0 / (PSF_NOISE_FRACTION * max).powi(2),
        );
        PsfObservation::new(image, weight, jac)
    }

    /// Noise-free PSF-convolved galaxy image.
    pub fn image(&self) -> Result<DMatrix<f64>, McalError> {
        let gal = Gauss2D::from_pars(&self.gal_pars())?;
        let psf = Gauss2D::from_pars(&self.psf_pars())?;
        gal.convolve(&psf)
            .render(self.dim, self.dim, &self.jacobian(self.dim))
    }

    /// One epoch, noiseless when `rng` is `None`.
    pub fn observation(&self, rng: Option<&mut dyn RngCore>) -> Result<Observation, McalError> {
        let mut image = self.image()?;
        if let Some(rng) = rng {
            let normal = Normal::new(0.0, self.noise)
                .map_err(|e| McalError::InvalidConfig(format!("synthetic noise: {e}")))?;
            image.iter_mut().for_each(|p| *p += normal.sample(rng));
        }
        let weight = DMatrix::from_element(self.dim, self.dim, 1.0 / (self.noise * self.noise));
        Observation::new(image, weight, self.jacobian(self.dim), self.psf_observation()?)
    }

    /// `nepoch` identical noiseless epochs.
    pub fn observations(&self, nepoch: usize) -> Result<ObservationList, McalError> {
        (0..nepoch).map(|_| self.observation(None)).collect()
    }

    /// `nepoch` epochs with independent noise realizations.
    pub fn noisy_observations(
        &self,
        nepoch: usize,
        rng: &mut impl Rng,
    ) -> Result<ObservationList, McalError> {
        (0..nepoch)
            .map(|_| self.observation(Some(&mut *rng as &mut dyn RngCore)))
            .collect()
    }
}

/// In-memory MEDS catalogue of `nobj` noiseless copies of `obj`.
///
/// Arguments
/// -----------------
/// * `obj`: The source template.
/// * `nobj`: Number of catalogue rows; ids are `1..=nobj`.
/// * `nepoch`: Single-epoch cutouts per source.
/// * `with_coadd`: Prepend a coadd cutout (epoch `0`) to every source.
pub fn synthetic_catalog(
    obj: &SyntheticObject,
    nobj: usize,
    nepoch: usize,
    with_coadd: bool,
) -> Result<InMemoryMeds, McalError> {
    let ncutout = nepoch + usize::from(with_coadd);
    let mut meds = InMemoryMeds::new(with_coadd);
    for i in 0..nobj {
        let source = Source {
            meds_index: i,
            id: (i + 1) as ObjectId,
            ra: 150.0 + 1e-3 * i as f64,
            dec: 2.0 - 1e-3 * i as f64,
            xwin_image: 100.0 + 10.0 * i as f64,
            ywin_image: 200.0,
            ncutout,
        };
        meds.push(source, obj.observations(ncutout)?);
    }
    Ok(meds)
}

#[cfg(test)]
mod synthetic_test {
    use super::*;
    use crate::meds::MedsSource;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_image_flux() {
        let obj = SyntheticObject::default();
        // stamp-edge truncation costs a few parts in 1e6
        assert_relative_eq!(obj.image().unwrap().sum(), obj.flux, max_relative = 1e-5);
    }

    #[test]
    fn test_noise_level() {
        let obj = SyntheticObject {
            noise: 0.5,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);
        let noisy = obj.noisy_observations(1, &mut rng).unwrap();
        let diff = &noisy.as_slice()[0].image - obj.image().unwrap();
        let var = diff.iter().map(|d| d * d).sum::<f64>() / diff.len() as f64;
        assert_relative_eq!(var.sqrt(), 0.5, max_relative = 0.1);
        assert_eq!(noisy.as_slice()[0].noise_sigma(), Some(0.5));
    }

    #[test]
    fn test_catalog_layout() {
        let mut meds = synthetic_catalog(&SyntheticObject::default(), 3, 2, true).unwrap();
        assert_eq!(meds.len(), 3);
        assert!(meds.has_coadd());
        assert_eq!(meds.source(2).unwrap().ncutout, 3);
    }
}
