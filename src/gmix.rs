//! # Elliptical Gaussian model
//!
//! [`Gauss2D`] is the single-component Gaussian used for both the PSF and the galaxy.
//! Parameters follow the `[v, u, g1, g2, T, flux]` layout of the fitter
//! (see [`GaussPars`]), with `(v, u)` the centre offset from the Jacobian origin.
//!
//! The galaxy covariance may be non positive-definite (the size prior allows small
//! negative `T`); only the **PSF-convolved** model must be a valid Gaussian, which is
//! checked when it is evaluated.
use nalgebra::{DMatrix, Matrix2};

use crate::constants::ArcSec2;
use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;
use crate::shape::{covariance_from_shape, shape_from_covariance, Shear};

/// Number of parameters of a Gaussian model.
pub const NPARS: usize = 6;

/// Parameter vector `[v, u, g1, g2, T, flux]`.
pub type GaussPars = [f64; NPARS];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gauss2D {
    pub v: f64,
    pub u: f64,
    pub cov: Matrix2<f64>,
    pub flux: f64,
}

impl Gauss2D {
    pub fn new(v: f64, u: f64, cov: Matrix2<f64>, flux: f64) -> Self {
        Gauss2D { v, u, cov, flux }
    }

    /// Build a Gaussian from the fitter parameter layout.
    ///
    /// Return
    /// ----------
    /// * The model, or [`McalError::GMixRange`] when `|g| ≥ 1`.
    pub fn from_pars(pars: &GaussPars) -> Result<Self, McalError> {
        let cov = covariance_from_shape(pars[4], Shear::new(pars[2], pars[3]))?;
        Ok(Gauss2D::new(pars[0], pars[1], cov, pars[5]))
    }

    /// Round, unit-flux Gaussian centred on the Jacobian origin.
    pub fn round(t: ArcSec2) -> Self {
        Gauss2D::new(0.0, 0.0, Matrix2::identity() * (0.5 * t), 1.0)
    }

    #[inline]
    pub fn t(&self) -> ArcSec2 {
        self.cov[(0, 0)] + self.cov[(1, 1)]
    }

    /// Size and reduced shear of the covariance.
    pub fn shape(&self) -> Result<(ArcSec2, Shear), McalError> {
        shape_from_covariance(&self.cov)
    }

    /// Convolution with a PSF: covariances add, the centre of the PSF is ignored.
    pub fn convolve(&self, psf: &Gauss2D) -> Gauss2D {
        Gauss2D::new(self.v, self.u, self.cov + psf.cov, self.flux)
    }

    /// Same profile with unit flux.
    pub fn normalized(&self) -> Gauss2D {
        Gauss2D { flux: 1.0, ..*self }
    }

    /// Prepare the model for repeated evaluation.
    ///
    /// Return
    /// ----------
    /// * An evaluator, or [`McalError::GMixRange`] if the covariance is not positive-definite.
    pub fn evaluator(&self) -> Result<GaussEvaluator, McalError> {
        let det = self.cov.determinant();
        if !(det > 0.0 && self.cov[(0, 0)] > 0.0) || !det.is_finite() {
            return Err(McalError::GMixRange(format!(
                "covariance not positive-definite (det = {det:e})"
            )));
        }
        let inv_det = 1.0 / det;
        Ok(GaussEvaluator {
            v: self.v,
            u: self.u,
            dvv: self.cov[(1, 1)] * inv_det,
            duu: self.cov[(0, 0)] * inv_det,
            dvu: self.cov[(0, 1)] * inv_det,
            norm: self.flux / (2.0 * std::f64::consts::PI * det.sqrt()),
        })
    }

    /// Render the model onto a pixel grid through `jacobian`.
    ///
    /// Pixels receive the surface density at their centre times the pixel area, so the image
    /// sums to `flux` for a well-sampled, fully contained profile.
    pub fn render(
        &self,
        nrow: usize,
        ncol: usize,
        jacobian: &Jacobian,
    ) -> Result<DMatrix<f64>, McalError> {
        let eval = self.evaluator()?;
        let area = jacobian.area();
        Ok(DMatrix::from_fn(nrow, ncol, |r, c| {
            let (v, u) = jacobian.to_sky(r as f64, c as f64);
            eval.density(v, u) * area
        }))
    }
}

/// Precomputed inverse covariance and normalization of a [`Gauss2D`].
#[derive(Debug, Clone, Copy)]
pub struct GaussEvaluator {
    v: f64,
    u: f64,
    dvv: f64,
    duu: f64,
    dvu: f64,
    norm: f64,
}

impl GaussEvaluator {
    /// Surface density (flux per arcsec²) at sky offset `(v, u)`.
    #[inline]
    pub fn density(&self, v: f64, u: f64) -> f64 {
        let dv = v - self.v;
        let du = u - self.u;
        let chi2 = self.dvv * dv * dv + self.duu * du * du - 2.0 * self.dvu * dv * du;
        self.norm * (-0.5 * chi2).exp()
    }
}
