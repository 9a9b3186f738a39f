//! # Prior bank
//!
//! The fixed joint prior on the Gaussian model parameters `[v, u, g1, g2, T, flux]`,
//! built once per run and shared read-only by every fit.
//!
//! ## Components
//! -----------------
//! * **Centre** – [`CenPrior`], 2-D Gaussian on the offset from the Jacobian origin,
//!   `σ = 0.2` (Jacobian units, a bit below one pixel).
//! * **Ellipticity** – [`GPriorBA`] with `σ = 0.3`, excludes `|g| ≥ 1`.
//! * **Size** – [`FlatPrior`] on `[−1, 1000]` arcsec², slightly negative sizes allowed.
//! * **Flux** – [`FlatPrior`] on `[−10, 1e5]`.
//!
//! The joint prior is separable: its log density is the sum of the four marginal log
//! densities, and its residual terms are the concatenation of theirs.
//!
//! ## Randomness
//! -----------------
//! The prior itself holds no generator. It records the run seed it was built with; random
//! draws (guess perturbations) always take a caller-provided generator, usually the
//! per-object child generator from [`child_rng`](crate::rng::child_rng).
use std::fmt;

use nalgebra::DMatrix;
use rand::Rng;

use crate::constants::{
    CEN_PRIOR_SIGMA, FLUX_PRIOR_BOUNDS, G_PRIOR_SIGMA, T_PRIOR_BOUNDS,
};
use crate::gmix::GaussPars;
use crate::mcal_errors::McalError;

pub mod marginals;

pub use marginals::{CenPrior, FlatPrior, GPriorBA};

/// Number of residual terms contributed by [`JointPrior::fill_fdiff`].
pub const NPRIOR_FDIFF: usize = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct JointPrior {
    pub cen: CenPrior,
    pub g: GPriorBA,
    pub t: FlatPrior,
    pub flux: FlatPrior,
    seed: u64,
}

impl JointPrior {
    pub fn new(cen: CenPrior, g: GPriorBA, t: FlatPrior, flux: FlatPrior, seed: u64) -> Self {
        JointPrior {
            cen,
            g,
            t,
            flux,
            seed,
        }
    }

    /// Run seed this prior was built with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Joint log density, the sum of the marginal log densities.
    ///
    /// Return
    /// ----------
    /// * `ln p(pars)`, or [`McalError::GMixRange`] outside the joint support.
    pub fn ln_prob(&self, pars: &GaussPars) -> Result<f64, McalError> {
        Ok(self.cen.ln_prob(pars[0], pars[1])
            + self.g.ln_prob(pars[2], pars[3])?
            + self.t.ln_prob(pars[4])?
            + self.flux.ln_prob(pars[5])?)
    }

    /// Write the prior residual terms of `pars` into `out[..NPRIOR_FDIFF]`.
    ///
    /// Layout: `[cen_v, cen_u, g, T, flux]`.
    pub fn fill_fdiff(&self, pars: &GaussPars, out: &mut [f64]) -> Result<(), McalError> {
        let [dv, du] = self.cen.fdiff(pars[0], pars[1]);
        out[0] = dv;
        out[1] = du;
        out[2] = self.g.fdiff(pars[2], pars[3])?;
        out[3] = self.t.fdiff(pars[4])?;
        out[4] = self.flux.fdiff(pars[5])?;
        Ok(())
    }

    /// Derivatives of the [`fill_fdiff`](Self::fill_fdiff) terms, written into rows
    /// `row0..row0 + NPRIOR_FDIFF` of `jac`. The flat size and flux terms contribute nothing.
    pub fn fill_fdiff_jacobian(
        &self,
        pars: &GaussPars,
        jac: &mut DMatrix<f64>,
        row0: usize,
    ) -> Result<(), McalError> {
        let [dv, du] = self.cen.fdiff_gradient();
        let [dg1, dg2] = self.g.fdiff_gradient(pars[2], pars[3])?;
        self.t.fdiff(pars[4])?;
        self.flux.fdiff(pars[5])?;
        jac[(row0, 0)] = dv;
        jac[(row0 + 1, 1)] = du;
        jac[(row0 + 2, 2)] = dg1;
        jac[(row0 + 2, 3)] = dg2;
        Ok(())
    }

    /// Draw a full parameter vector from the prior.
    pub fn sample(&self, rng: &mut impl Rng) -> Result<GaussPars, McalError> {
        let (v, u) = self.cen.sample(rng)?;
        let (g1, g2) = self.g.sample(rng);
        Ok([v, u, g1, g2, self.t.sample(rng), self.flux.sample(rng)])
    }
}

impl fmt::Display for JointPrior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JointPrior(cen~N(({:.2},{:.2}),{:.2}), g~BA(σ={:.2}), T∈[{}, {}], F∈[{}, {:e}], seed={})",
            self.cen.mean_v,
            self.cen.mean_u,
            self.cen.sigma_v,
            self.g.sigma,
            self.t.min,
            self.t.max,
            self.flux.min,
            self.flux.max,
            self.seed
        )
    }
}

/// Build the run-level joint prior.
///
/// Arguments
/// -----------------
/// * `seed`: The run seed, recorded in the prior.
///
/// Return
/// ----------
/// * The separable joint prior of the module documentation. Two calls with the same seed
///   return equal priors.
pub fn build_priors(seed: u64) -> JointPrior {
    JointPrior::new(
        CenPrior::new(0.0, 0.0, CEN_PRIOR_SIGMA, CEN_PRIOR_SIGMA),
        GPriorBA::new(G_PRIOR_SIGMA),
        FlatPrior::new(T_PRIOR_BOUNDS.0, T_PRIOR_BOUNDS.1),
        FlatPrior::new(FLUX_PRIOR_BOUNDS.0, FLUX_PRIOR_BOUNDS.1),
        seed,
    )
}

#[cfg(test)]
mod priors_test {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn test_build_priors_is_pure() {
        assert_eq!(build_priors(42), build_priors(42));
        assert_eq!(build_priors(42).seed(), 42);
    }

    #[test]
    fn test_joint_density_factorizes() {
        let prior = build_priors(1);
        let pars = [0.05, -0.1, 0.12, -0.04, 0.8, 300.0];
        let sum = prior.cen.ln_prob(pars[0], pars[1])
            + prior.g.ln_prob(pars[2], pars[3]).unwrap()
            + prior.t.ln_prob(pars[4]).unwrap()
            + prior.flux.ln_prob(pars[5]).unwrap();
        assert_relative_eq!(prior.ln_prob(&pars).unwrap(), sum, epsilon = 1e-14);
    }

    #[test]
    fn test_out_of_support_is_range_error() {
        let prior = build_priors(1);
        assert!(prior.ln_prob(&[0.0, 0.0, 0.0, 0.0, -2.0, 10.0]).is_err());
        assert!(prior.ln_prob(&[0.0, 0.0, 0.0, 0.0, 1.0, 2.0e5]).is_err());
        let mut out = [0.0; NPRIOR_FDIFF];
        assert!(prior
            .fill_fdiff(&[0.0, 0.0, 0.7, 0.8, 1.0, 10.0], &mut out)
            .is_err());
    }

    #[test]
    fn test_fdiff_layout() {
        let prior = build_priors(1);
        let mut out = [f64::NAN; NPRIOR_FDIFF];
        prior
            .fill_fdiff(&[0.2, 0.0, 0.0, 0.0, 1.0, 10.0], &mut out)
            .unwrap();
        assert_eq!(out, [1.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_fdiff_jacobian_rows() {
        let prior = build_priors(1);
        let pars = [0.1, -0.2, 0.2, 0.1, 1.0, 10.0];
        let mut jac = DMatrix::zeros(2 + NPRIOR_FDIFF, 6);
        prior.fill_fdiff_jacobian(&pars, &mut jac, 2).unwrap();
        assert_eq!(jac.row(0).sum(), 0.0);
        assert_relative_eq!(jac[(2, 0)], 1.0 / prior.cen.sigma_v, epsilon = 1e-14);
        assert_relative_eq!(jac[(3, 1)], 1.0 / prior.cen.sigma_u, epsilon = 1e-14);
        assert!(jac[(4, 2)] > 0.0 && jac[(4, 3)] > 0.0);
        assert_eq!(jac.rows(5, 2).sum(), 0.0);
    }

    #[test]
    fn test_sample_within_support() {
        let prior = build_priors(3);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let pars = prior.sample(&mut rng).unwrap();
            assert!(prior.ln_prob(&pars).is_ok());
        }
    }
}
