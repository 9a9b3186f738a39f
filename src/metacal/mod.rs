//! # Metacalibration
//!
//! For one source, the observed epochs are deconvolved by their fitted PSF, artificially
//! sheared, and reconvolved by a slightly larger round PSF. The galaxy model is fitted on
//! each of the nine resulting variants ([`MetacalType`]) and the finite-difference response
//! of the fitted ellipticity to the applied shear is used to debias the unsheared estimate.
//!
//! ## Variants
//! -----------------
//! | label      | image shear      | PSF shear        |
//! |------------|------------------|------------------|
//! | `noshear`  | none             | none             |
//! | `1p`/`1m`  | `(±step, 0)`     | none             |
//! | `2p`/`2m`  | `(0, ±step)`     | none             |
//! | `1p_psf`…  | none             | `(±step, 0)`…    |
//!
//! The `*_psf` variants measure the leakage of PSF anisotropy into the shape estimate.
//!
//! ## Modules
//! -----------------
//! * [`fourier`] – Pixel-grid Fourier operations (deconvolution, shear, reconvolution).
//! * [`noise`] – Noise images for the noise-fixing correction.
//! * [`response`] – Responsivity matrix, inversion and shear correction.
//! * [`fitter`] – The per-object estimator ([`MetacalFitter`]).
use std::fmt;

use crate::constants::{DEFAULT_MCAL_STEP, DEFAULT_NTRY};
use crate::fitting::lm::LmParams;
use crate::mcal_errors::McalError;
use crate::shape::Shear;

pub mod fitter;
pub mod fourier;
pub mod noise;
pub mod response;

pub use fitter::{FitModel, MetacalFitter, ShapeFitter};

/// Number of fitted variants per object.
pub const NVARIANTS: usize = 9;

/// One shear/PSF-shear variant of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetacalType {
    NoShear,
    P1,
    M1,
    P2,
    M2,
    P1Psf,
    M1Psf,
    P2Psf,
    M2Psf,
}

impl MetacalType {
    /// All variants, in output column order.
    pub const ALL: [MetacalType; NVARIANTS] = [
        MetacalType::NoShear,
        MetacalType::P1,
        MetacalType::M1,
        MetacalType::P2,
        MetacalType::M2,
        MetacalType::P1Psf,
        MetacalType::M1Psf,
        MetacalType::P2Psf,
        MetacalType::M2Psf,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            MetacalType::NoShear => "noshear",
            MetacalType::P1 => "1p",
            MetacalType::M1 => "1m",
            MetacalType::P2 => "2p",
            MetacalType::M2 => "2m",
            MetacalType::P1Psf => "1p_psf",
            MetacalType::M1Psf => "1m_psf",
            MetacalType::P2Psf => "2p_psf",
            MetacalType::M2Psf => "2m_psf",
        }
    }

    /// Position in [`MetacalType::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Whether the shear is applied to the PSF rather than to the galaxy.
    pub fn is_psf_shear(&self) -> bool {
        matches!(
            self,
            MetacalType::P1Psf | MetacalType::M1Psf | MetacalType::P2Psf | MetacalType::M2Psf
        )
    }

    /// Shear applied for this variant.
    pub fn shear(&self, step: f64) -> Shear {
        match self {
            MetacalType::NoShear => Shear::zero(),
            MetacalType::P1 | MetacalType::P1Psf => Shear::new(step, 0.0),
            MetacalType::M1 | MetacalType::M1Psf => Shear::new(-step, 0.0),
            MetacalType::P2 | MetacalType::P2Psf => Shear::new(0.0, step),
            MetacalType::M2 | MetacalType::M2Psf => Shear::new(0.0, -step),
        }
    }
}

impl fmt::Display for MetacalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Settings of the metacalibration estimator.
#[derive(Debug, Clone, PartialEq)]
pub struct MetacalParams {
    /// Artificial shear step.
    pub step: f64,
    /// Add a processed noise image to cancel the correlated-noise response.
    pub fix_noise: bool,
    /// Maximum number of attempts per fit.
    pub ntry: usize,
    pub lm: LmParams,
}

impl Default for MetacalParams {
    fn default() -> Self {
        MetacalParams {
            step: DEFAULT_MCAL_STEP,
            fix_noise: true,
            ntry: DEFAULT_NTRY,
            lm: LmParams::default(),
        }
    }
}

impl MetacalParams {
    pub fn builder() -> MetacalParamsBuilder {
        MetacalParamsBuilder::new()
    }
}

pub struct MetacalParamsBuilder {
    params: MetacalParams,
}

impl Default for MetacalParamsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MetacalParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: MetacalParams::default(),
        }
    }

    pub fn step(mut self, v: f64) -> Self {
        self.params.step = v;
        self
    }
    pub fn fix_noise(mut self, v: bool) -> Self {
        self.params.fix_noise = v;
        self
    }
    pub fn ntry(mut self, v: usize) -> Self {
        self.params.ntry = v;
        self
    }
    pub fn maxfev(mut self, v: usize) -> Self {
        self.params.lm.maxfev = v;
        self
    }
    pub fn xtol(mut self, v: f64) -> Self {
        self.params.lm.xtol = v;
        self
    }
    pub fn ftol(mut self, v: f64) -> Self {
        self.params.lm.ftol = v;
        self
    }

    /// Validate and build.
    ///
    /// Return
    /// ----------
    /// * [`McalError::InvalidConfig`] unless `0 < step < 0.1`, `ntry ≥ 1`, `maxfev ≥ 1`
    ///   and both tolerances are strictly positive.
    pub fn build(self) -> Result<MetacalParams, McalError> {
        let p = &self.params;
        if !(p.step > 0.0 && p.step < 0.1) {
            return Err(McalError::InvalidConfig(
                "metacal step must be in (0, 0.1)".into(),
            ));
        }
        if p.ntry == 0 {
            return Err(McalError::InvalidConfig("ntry must be >= 1".into()));
        }
        if p.lm.maxfev == 0 {
            return Err(McalError::InvalidConfig("maxfev must be >= 1".into()));
        }
        if !(p.lm.xtol > 0.0 && p.lm.ftol > 0.0) {
            return Err(McalError::InvalidConfig(
                "xtol and ftol must be > 0".into(),
            ));
        }
        Ok(self.params)
    }
}

impl fmt::Display for MetacalParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MetacalParams(step={}, fix_noise={}, ntry={}, maxfev={}, xtol={:e}, ftol={:e})",
            self.step, self.fix_noise, self.ntry, self.lm.maxfev, self.lm.xtol, self.lm.ftol
        )
    }
}
