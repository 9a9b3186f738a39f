//! Noise images for the noise-fixing correction.
//!
//! Shearing an image also shears its pixel noise, which then correlates with the applied
//! shear. Adding an independent noise field processed with the *opposite* shear makes the
//! total noise isotropic again; the pixel variance doubles, so variant weights are halved.
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::mcal_errors::McalError;
use crate::observation::Observation;

/// White Gaussian noise with the level implied by the weight map of `obs`.
///
/// Return
/// ----------
/// * A noise image of the cutout shape, or [`McalError::InvalidObservation`] when the weight
///   map carries no positive entry.
pub fn noise_image(obs: &Observation, rng: &mut impl Rng) -> Result<DMatrix<f64>, McalError> {
    let sigma = obs.noise_sigma().ok_or_else(|| {
        McalError::InvalidObservation("cannot infer noise level from weight map".into())
    })?;
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| McalError::InvalidObservation(format!("noise level {sigma}: {e}")))?;
    let (nrow, ncol) = obs.image.shape();
    Ok(DMatrix::from_fn(nrow, ncol, |_, _| normal.sample(rng)))
}

/// Weight map of an image whose noise variance was doubled.
pub fn fixed_noise_weight(weight: &DMatrix<f64>) -> DMatrix<f64> {
    weight * 0.5
}
