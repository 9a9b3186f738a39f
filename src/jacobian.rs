//! # Local affine WCS
//!
//! A [`Jacobian`] maps pixel coordinates `(row, col)` of a cutout to local sky-plane
//! offsets `(v, u)` (arcseconds) around a reference pixel `(row0, col0)`:
//!
//! ```text
//! v = dvdrow·(row − row0) + dvdcol·(col − col0)
//! u = dudrow·(row − row0) + dudcol·(col − col0)
//! ```
//!
//! All model parameters (centres, covariances, sizes `T`) live in the `(v, u)` frame;
//! images are sampled on the pixel grid through this transform.
use nalgebra::{Matrix2, Vector2};

use crate::constants::ArcSec;
use crate::mcal_errors::McalError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Jacobian {
    pub row0: f64,
    pub col0: f64,
    pub dvdrow: f64,
    pub dvdcol: f64,
    pub dudrow: f64,
    pub dudcol: f64,
}

impl Jacobian {
    pub fn new(row0: f64, col0: f64, dvdrow: f64, dvdcol: f64, dudrow: f64, dudcol: f64) -> Self {
        Jacobian {
            row0,
            col0,
            dvdrow,
            dvdcol,
            dudrow,
            dudcol,
        }
    }

    /// Diagonal Jacobian with square pixels of side `scale`.
    pub fn from_scale(row0: f64, col0: f64, scale: ArcSec) -> Self {
        Jacobian::new(row0, col0, scale, 0.0, 0.0, scale)
    }

    /// The 2×2 pixel→sky matrix, acting on `(Δrow, Δcol)` and returning `(v, u)`.
    #[inline]
    pub fn matrix(&self) -> Matrix2<f64> {
        Matrix2::new(self.dvdrow, self.dvdcol, self.dudrow, self.dudcol)
    }

    #[inline]
    pub fn det(&self) -> f64 {
        self.dvdrow * self.dudcol - self.dvdcol * self.dudrow
    }

    /// Sky area of one pixel (arcsec²).
    #[inline]
    pub fn area(&self) -> f64 {
        self.det().abs()
    }

    /// Linear pixel scale, `sqrt(|det J|)`.
    #[inline]
    pub fn scale(&self) -> ArcSec {
        self.area().sqrt()
    }

    /// Sky offset `(v, u)` of pixel `(row, col)`.
    #[inline]
    pub fn to_sky(&self, row: f64, col: f64) -> (f64, f64) {
        let drow = row - self.row0;
        let dcol = col - self.col0;
        (
            self.dvdrow * drow + self.dvdcol * dcol,
            self.dudrow * drow + self.dudcol * dcol,
        )
    }

    /// Pixel position `(row, col)` of a sky offset `(v, u)`.
    ///
    /// Return
    /// ----------
    /// * The pixel coordinates, or [`McalError::InvalidObservation`] if the Jacobian is singular.
    pub fn to_pixel(&self, v: f64, u: f64) -> Result<(f64, f64), McalError> {
        let inv = self.inverse()?;
        let d = inv * Vector2::new(v, u);
        Ok((self.row0 + d[0], self.col0 + d[1]))
    }

    /// Inverse (sky→pixel) matrix.
    pub fn inverse(&self) -> Result<Matrix2<f64>, McalError> {
        self.matrix().try_inverse().ok_or_else(|| {
            McalError::InvalidObservation(format!("singular jacobian (det = {:e})", self.det()))
        })
    }

    /// Copy of this Jacobian re-centred on `(row0, col0)`.
    pub fn with_center(&self, row0: f64, col0: f64) -> Self {
        Jacobian { row0, col0, ..*self }
    }
}

#[cfg(test)]
mod jacobian_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_scale_and_area() {
        let jac = Jacobian::from_scale(10.0, 12.0, 0.141);
        assert_relative_eq!(jac.scale(), 0.141, epsilon = 1e-14);
        assert_relative_eq!(jac.area(), 0.141 * 0.141, epsilon = 1e-14);
    }

    #[test]
    fn test_sky_pixel_roundtrip_sheared_wcs() {
        let jac = Jacobian::new(15.3, 14.7, 0.2, 0.01, -0.015, 0.21);
        let (v, u) = jac.to_sky(20.0, 3.5);
        let (row, col) = jac.to_pixel(v, u).unwrap();
        assert_relative_eq!(row, 20.0, epsilon = 1e-12);
        assert_relative_eq!(col, 3.5, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_jacobian_rejected() {
        let jac = Jacobian::new(0.0, 0.0, 1.0, 2.0, 2.0, 4.0);
        assert!(matches!(
            jac.inverse(),
            Err(McalError::InvalidObservation(_))
        ));
    }
}
