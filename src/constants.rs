//! # Constants and type definitions for mcalfit
//!
//! This module centralizes the **numerical defaults**, **prior parameters**, and **common type
//! aliases** used throughout the metacalibration pipeline.
//!
//! ## Overview
//!
//! - Metacalibration shear step and variant bookkeeping
//! - Levenberg–Marquardt tolerances and restart budget
//! - Parameters of the fixed run-level prior (centre, ellipticity, size, flux)
//! - Sentinels written into result records when a quantity is undefined
//!
//! These definitions are shared by the fitter, the prior bank and the batch orchestrator.

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Angle or offset in arcseconds (Jacobian sky units)
pub type ArcSec = f64;

/// Area in square arcseconds (the `T = <x²> + <y²>` size measure)
pub type ArcSec2 = f64;

/// Catalogue identifier of a source
pub type ObjectId = i64;

// -------------------------------------------------------------------------------------------------
// Metacalibration
// -------------------------------------------------------------------------------------------------

/// Artificial shear applied along each component when building the sheared variants
pub const DEFAULT_MCAL_STEP: f64 = 0.01;

/// Number of fit attempts (initial guess + restarts) for each model fit
pub const DEFAULT_NTRY: usize = 4;

/// Minimum number of image cutouts an object needs to be fit
pub const DEFAULT_MIN_CUTOUTS: usize = 1;

/// Objects read from the MEDS file and held in memory at a time
pub const DEFAULT_CHUNK_SIZE: usize = 256;

/// Determinant magnitude below which the responsivity matrix is treated as singular
pub const SINGULAR_DET_EPS: f64 = 1e-12;

/// Guess for the size parameter, in units of the squared pixel scale
pub const TGUESS_PIXEL_FACTOR: f64 = 4.0;

// -------------------------------------------------------------------------------------------------
// Levenberg–Marquardt defaults
// -------------------------------------------------------------------------------------------------

/// Maximum number of residual evaluations per LM run
pub const LM_MAXFEV: usize = 2000;

/// Relative parameter-change tolerance
pub const LM_XTOL: f64 = 5.0e-5;

/// Relative cost-reduction tolerance
pub const LM_FTOL: f64 = 5.0e-5;

// -------------------------------------------------------------------------------------------------
// Prior bank
// -------------------------------------------------------------------------------------------------

/// Width of the Bernstein & Armstrong (2014) ellipticity prior
pub const G_PRIOR_SIGMA: f64 = 0.3;

/// Centre prior width along both axes (Jacobian units, slightly below one pixel)
pub const CEN_PRIOR_SIGMA: ArcSec = 0.2;

/// Flat size prior bounds
pub const T_PRIOR_BOUNDS: (ArcSec2, ArcSec2) = (-1.0, 1000.0);

/// Flat flux prior bounds
pub const FLUX_PRIOR_BOUNDS: (f64, f64) = (-10.0, 1.0e5);

// -------------------------------------------------------------------------------------------------
// Output conventions
// -------------------------------------------------------------------------------------------------

/// Value stored for undefined uncertainties (singular covariance)
pub const UNDEFINED_ERR: f64 = 9999.0;

/// Name of the run log written in the output directory
pub const LOG_FILE_BASENAME: &str = "mcal_fitting";

/// Sub-directory of the output directory receiving diagnostic plots
pub const PLOT_SUBDIR: &str = "metacal-plots";
