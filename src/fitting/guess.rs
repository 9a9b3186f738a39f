//! Randomized starting points for the Gaussian fits.
use rand::Rng;

use crate::constants::ArcSec2;
use crate::gmix::GaussPars;
use crate::mcal_errors::McalError;
use crate::priors::JointPrior;

/// Half-width of the uniform relative perturbation applied to `T` and flux guesses.
const GUESS_WIDTH: f64 = 0.05;

#[inline]
fn perturb(x: f64, rng: &mut impl Rng) -> f64 {
    x * (1.0 + rng.random_range(-GUESS_WIDTH..GUESS_WIDTH))
}

/// Guess for a PSF fit: centred, round, size near `tguess`, flux near `flux`.
pub fn psf_guess(tguess: ArcSec2, flux: f64, rng: &mut impl Rng) -> GaussPars {
    [
        rng.random_range(-0.01..0.01),
        rng.random_range(-0.01..0.01),
        rng.random_range(-0.01..0.01),
        rng.random_range(-0.01..0.01),
        perturb(tguess, rng),
        perturb(flux, rng),
    ]
}

/// Guess for a galaxy fit.
///
/// The centre and ellipticity come from a prior draw; `T` and flux are perturbations of
/// `tguess` and `flux`, clamped into the support of their flat priors.
///
/// Arguments
/// -----------------
/// * `prior`: The run prior.
/// * `tguess`: Size guess, usually `4·scale²`.
/// * `flux`: Flux guess, usually the mean image sum over epochs.
/// * `rng`: The object's generator.
pub fn galaxy_guess(
    prior: &JointPrior,
    tguess: ArcSec2,
    flux: f64,
    rng: &mut impl Rng,
) -> Result<GaussPars, McalError> {
    let (v, u) = prior.cen.sample(rng)?;
    let (g1, g2) = prior.g.sample(rng);
    Ok([
        v,
        u,
        g1,
        g2,
        prior.t.clamp(perturb(tguess, rng)),
        prior.flux.clamp(perturb(flux, rng)),
    ])
}

#[cfg(test)]
mod guess_test {
    use super::*;
    use crate::priors::build_priors;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_galaxy_guess_in_prior_support() {
        let prior = build_priors(0);
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..50 {
            let g = galaxy_guess(&prior, 0.16, 5.0e5, &mut rng).unwrap();
            assert!(prior.ln_prob(&g).is_ok());
            assert_eq!(g[5], 1.0e5);
            assert!((g[4] - 0.16).abs() <= 0.16 * GUESS_WIDTH);
        }
    }

    #[test]
    fn test_psf_guess_near_round() {
        let mut rng = StdRng::seed_from_u64(5);
        let g = psf_guess(0.3, 1.0, &mut rng);
        assert!(g[2].abs() < 0.01 && g[3].abs() < 0.01);
        assert!((g[5] - 1.0).abs() <= GUESS_WIDTH);
    }
}
