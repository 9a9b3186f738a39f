//! # Shear responsivity
//!
//! Central finite differences of the fitted ellipticity over the sheared variants:
//!
//! ```text
//! R_ij = (g_i[j+] − g_i[j−]) / (2·step)
//! ```
//!
//! with `1p/1m` for column 1 and `2p/2m` for column 2. The corrected shear is
//! `g_MC = R⁻¹ · g_noshear`. The PSF-leakage terms `rpsf1`, `rpsf2` are the diagonal
//! differences over the `*_psf` variants.
use nalgebra::{Matrix2, Vector2};

use crate::constants::SINGULAR_DET_EPS;
use crate::mcal_errors::McalError;
use crate::shape::Shear;

use super::MetacalType;

/// Responsivity matrix and PSF-leakage response of one object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Responsivity {
    pub r: Matrix2<f64>,
    pub rpsf: [f64; 2],
}

impl Responsivity {
    /// Finite-difference responses from the fitted shear of each variant.
    ///
    /// Arguments
    /// -----------------
    /// * `g_of`: Fitted reduced shear of a variant.
    /// * `step`: The applied shear step.
    pub fn from_variants(g_of: impl Fn(MetacalType) -> Shear, step: f64) -> Self {
        let inv = 1.0 / (2.0 * step);
        let (p1, m1) = (g_of(MetacalType::P1), g_of(MetacalType::M1));
        let (p2, m2) = (g_of(MetacalType::P2), g_of(MetacalType::M2));
        let r = Matrix2::new(
            (p1.g1 - m1.g1) * inv,
            (p2.g1 - m2.g1) * inv,
            (p1.g2 - m1.g2) * inv,
            (p2.g2 - m2.g2) * inv,
        );
        let rpsf = [
            (g_of(MetacalType::P1Psf).g1 - g_of(MetacalType::M1Psf).g1) * inv,
            (g_of(MetacalType::P2Psf).g2 - g_of(MetacalType::M2Psf).g2) * inv,
        ];
        Responsivity { r, rpsf }
    }

    /// `R⁻¹`.
    ///
    /// Return
    /// ----------
    /// * [`McalError::SingularResponsivity`] when `|det R|` is below [`SINGULAR_DET_EPS`]
    ///   or not finite.
    pub fn inverse(&self) -> Result<Matrix2<f64>, McalError> {
        let det = self.r.determinant();
        if !det.is_finite() || det.abs() < SINGULAR_DET_EPS {
            return Err(McalError::SingularResponsivity { det });
        }
        self.r
            .try_inverse()
            .ok_or(McalError::SingularResponsivity { det })
    }

    /// Responsivity-corrected shear `R⁻¹ · g`.
    pub fn correct(&self, g: Shear) -> Result<Shear, McalError> {
        let corrected = self.inverse()? * Vector2::new(g.g1, g.g2);
        Ok(Shear::new(corrected[0], corrected[1]))
    }
}
