//! # Reduced shear and second moments
//!
//! Conventions follow the `(v, u)` sky frame of [`Jacobian`](crate::jacobian::Jacobian):
//! a Gaussian with size `T` and reduced shear `g = (g1, g2)` has covariance
//!
//! ```text
//! e   = 2 g / (1 + |g|²)
//! Cvv = T/2 (1 − e1),   Cvu = T/2 e2,   Cuu = T/2 (1 + e1)
//! ```
//!
//! so positive `g1` elongates along `u` and positive `g2` along the diagonal.
//! [`Shear::matrix`] is the area-preserving linear map that turns a round profile into one
//! with reduced shear `g` under the same convention.
use nalgebra::Matrix2;

use crate::constants::ArcSec2;
use crate::mcal_errors::McalError;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Shear {
    pub g1: f64,
    pub g2: f64,
}

impl Shear {
    pub fn new(g1: f64, g2: f64) -> Self {
        Shear { g1, g2 }
    }

    pub fn zero() -> Self {
        Shear::default()
    }

    #[inline]
    pub fn g_squared(&self) -> f64 {
        self.g1 * self.g1 + self.g2 * self.g2
    }

    #[inline]
    pub fn magnitude(&self) -> f64 {
        self.g_squared().sqrt()
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.g1 == 0.0 && self.g2 == 0.0
    }

    /// Opposite shear, `(−g1, −g2)`.
    pub fn negated(&self) -> Shear {
        Shear::new(-self.g1, -self.g2)
    }

    /// Area-preserving shear matrix acting on `(v, u)`.
    ///
    /// Return
    /// ----------
    /// * `[[1 − g1, g2], [g2, 1 + g1]] / sqrt(1 − |g|²)`, or [`McalError::GMixRange`] for `|g| ≥ 1`.
    pub fn matrix(&self) -> Result<Matrix2<f64>, McalError> {
        let gsq = self.g_squared();
        if gsq >= 1.0 {
            return Err(McalError::GMixRange(format!(
                "|g| = {:.4} >= 1",
                gsq.sqrt()
            )));
        }
        let norm = 1.0 / (1.0 - gsq).sqrt();
        Ok(Matrix2::new(
            (1.0 - self.g1) * norm,
            self.g2 * norm,
            self.g2 * norm,
            (1.0 + self.g1) * norm,
        ))
    }

    /// Distortion `e = 2g / (1 + |g|²)`.
    pub fn to_distortion(&self) -> Result<(f64, f64), McalError> {
        let gsq = self.g_squared();
        if gsq >= 1.0 {
            return Err(McalError::GMixRange(format!(
                "|g| = {:.4} >= 1",
                gsq.sqrt()
            )));
        }
        let fac = 2.0 / (1.0 + gsq);
        Ok((self.g1 * fac, self.g2 * fac))
    }

    /// Reduced shear from a distortion `e`, `g = e / (1 + sqrt(1 − |e|²))`.
    pub fn from_distortion(e1: f64, e2: f64) -> Result<Shear, McalError> {
        let esq = e1 * e1 + e2 * e2;
        if esq >= 1.0 {
            return Err(McalError::GMixRange(format!(
                "|e| = {:.4} >= 1",
                esq.sqrt()
            )));
        }
        let fac = 1.0 / (1.0 + (1.0 - esq).sqrt());
        Ok(Shear::new(e1 * fac, e2 * fac))
    }
}

/// Covariance in `(v, u)` of a Gaussian with size `t` and reduced shear `g`.
pub fn covariance_from_shape(t: ArcSec2, g: Shear) -> Result<Matrix2<f64>, McalError> {
    let (e1, e2) = g.to_distortion()?;
    let half = 0.5 * t;
    Ok(Matrix2::new(
        half * (1.0 - e1),
        half * e2,
        half * e2,
        half * (1.0 + e1),
    ))
}

/// Derivatives of [`covariance_from_shape`] with respect to `g1`, `g2` and `t`, in that order.
pub fn covariance_derivatives(t: ArcSec2, g: Shear) -> Result<[Matrix2<f64>; 3], McalError> {
    let (e1, e2) = g.to_distortion()?;
    let opg = 1.0 + g.g_squared();
    let a = 2.0 / opg;
    let b = 4.0 / (opg * opg);
    // de1/dg and de2/dg
    let de1 = [a - b * g.g1 * g.g1, -b * g.g1 * g.g2];
    let de2 = [-b * g.g1 * g.g2, a - b * g.g2 * g.g2];
    let half = 0.5 * t;
    let by_g = |k: usize| {
        Matrix2::new(
            -half * de1[k],
            half * de2[k],
            half * de2[k],
            half * de1[k],
        )
    };
    Ok([
        by_g(0),
        by_g(1),
        Matrix2::new(0.5 * (1.0 - e1), 0.5 * e2, 0.5 * e2, 0.5 * (1.0 + e1)),
    ])
}

/// Size `T` and reduced shear of a covariance in `(v, u)`.
pub fn shape_from_covariance(cov: &Matrix2<f64>) -> Result<(ArcSec2, Shear), McalError> {
    let t = cov[(0, 0)] + cov[(1, 1)];
    if !(t > 0.0) {
        return Err(McalError::GMixRange(format!("non-positive T = {t}")));
    }
    let e1 = (cov[(1, 1)] - cov[(0, 0)]) / t;
    let e2 = 2.0 * cov[(0, 1)] / t;
    Ok((t, Shear::from_distortion(e1, e2)?))
}
