//! One-parameter (or one-vector) priors combined by [`JointPrior`](super::JointPrior).
//!
//! Each prior exposes
//! * `ln_prob` – log density (up to a constant), `Err(GMixRange)` outside its support,
//! * `fdiff` – residual-like terms whose squares add `−2 ln p` to the fit cost,
//! * `sample` – a draw used to randomize initial guesses.
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::mcal_errors::McalError;

/// Independent Gaussian prior on the centre offsets `(v, u)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenPrior {
    pub mean_v: f64,
    pub mean_u: f64,
    pub sigma_v: f64,
    pub sigma_u: f64,
}

impl CenPrior {
    pub fn new(mean_v: f64, mean_u: f64, sigma_v: f64, sigma_u: f64) -> Self {
        CenPrior {
            mean_v,
            mean_u,
            sigma_v,
            sigma_u,
        }
    }

    pub fn ln_prob(&self, v: f64, u: f64) -> f64 {
        let [dv, du] = self.fdiff(v, u);
        -0.5 * (dv * dv + du * du)
    }

    #[inline]
    pub fn fdiff(&self, v: f64, u: f64) -> [f64; 2] {
        [
            (v - self.mean_v) / self.sigma_v,
            (u - self.mean_u) / self.sigma_u,
        ]
    }

    /// `d fdiff / d(v, u)`; the terms are linear.
    pub fn fdiff_gradient(&self) -> [f64; 2] {
        [1.0 / self.sigma_v, 1.0 / self.sigma_u]
    }

    pub fn sample(&self, rng: &mut impl Rng) -> Result<(f64, f64), McalError> {
        let nv = Normal::new(self.mean_v, self.sigma_v)
            .map_err(|e| McalError::InvalidConfig(format!("centre prior: {e}")))?;
        let nu = Normal::new(self.mean_u, self.sigma_u)
            .map_err(|e| McalError::InvalidConfig(format!("centre prior: {e}")))?;
        Ok((nv.sample(rng), nu.sample(rng)))
    }
}

/// Ellipticity prior of Bernstein & Armstrong (2014),
/// `p(g) ∝ (1 − |g|²)² exp(−|g|² / 2σ²)`, normalized so that `p(0) = 1`.
///
/// The density vanishes at `|g| = 1`, which keeps the fit away from unphysical shapes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GPriorBA {
    pub sigma: f64,
}

impl GPriorBA {
    pub fn new(sigma: f64) -> Self {
        GPriorBA { sigma }
    }

    pub fn ln_prob(&self, g1: f64, g2: f64) -> Result<f64, McalError> {
        let gsq = g1 * g1 + g2 * g2;
        if gsq >= 1.0 {
            return Err(McalError::GMixRange(format!(
                "|g| = {:.4} outside the ellipticity prior",
                gsq.sqrt()
            )));
        }
        Ok(2.0 * (1.0 - gsq).ln() - gsq / (2.0 * self.sigma * self.sigma))
    }

    /// Single residual term `sqrt(−2 ln p)`; `ln p ≤ 0` everywhere.
    pub fn fdiff(&self, g1: f64, g2: f64) -> Result<f64, McalError> {
        let chi2 = -2.0 * self.ln_prob(g1, g2)?;
        Ok(chi2.max(0.0).sqrt())
    }

    /// `d fdiff / d(g1, g2)`, taken as zero at `g = 0` where the term has a cusp.
    pub fn fdiff_gradient(&self, g1: f64, g2: f64) -> Result<[f64; 2], McalError> {
        let f = self.fdiff(g1, g2)?;
        if f == 0.0 {
            return Ok([0.0, 0.0]);
        }
        let gsq = g1 * g1 + g2 * g2;
        let fac = (4.0 / (1.0 - gsq) + 1.0 / (self.sigma * self.sigma)) / f;
        Ok([g1 * fac, g2 * fac])
    }

    /// Rejection sample inside the unit disk (envelope `p(0) = 1`).
    pub fn sample(&self, rng: &mut impl Rng) -> (f64, f64) {
        loop {
            let g1: f64 = rng.random_range(-1.0..1.0);
            let g2: f64 = rng.random_range(-1.0..1.0);
            if let Ok(lnp) = self.ln_prob(g1, g2) {
                if rng.random::<f64>() < lnp.exp() {
                    return (g1, g2);
                }
            }
        }
    }
}

/// Uniform prior on `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatPrior {
    pub min: f64,
    pub max: f64,
}

impl FlatPrior {
    pub fn new(min: f64, max: f64) -> Self {
        FlatPrior { min, max }
    }

    #[inline]
    pub fn contains(&self, x: f64) -> bool {
        x >= self.min && x <= self.max
    }

    pub fn ln_prob(&self, x: f64) -> Result<f64, McalError> {
        self.fdiff(x)
    }

    /// Zero inside the support, [`McalError::GMixRange`] outside.
    pub fn fdiff(&self, x: f64) -> Result<f64, McalError> {
        if self.contains(x) {
            Ok(0.0)
        } else {
            Err(McalError::GMixRange(format!(
                "{x} outside flat prior [{}, {}]",
                self.min, self.max
            )))
        }
    }

    pub fn sample(&self, rng: &mut impl Rng) -> f64 {
        rng.random_range(self.min..=self.max)
    }

    /// Clamp `x` into the support.
    pub fn clamp(&self, x: f64) -> f64 {
        x.clamp(self.min, self.max)
    }
}
