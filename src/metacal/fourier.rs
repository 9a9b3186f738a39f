//! # Pixel-grid Fourier operations
//!
//! All metacalibration image operations reduce to one linear map on the pixel grid:
//!
//! ```text
//! ĥ(q) = f̂(Mᵀq) · exp(−2π² kᵀ K k),      k = J⁻ᵀ q,   M = J⁻¹ A J
//! ```
//!
//! where `f` is the observed image, `q` a grid frequency (cycles per pixel), `J` the
//! Jacobian, `A` a sky-frame shear matrix and `K` a sky-frame kernel covariance.
//!
//! * Shearing the deconvolved galaxy `g = f ⊗ P⁻¹` by `A` and reconvolving with `P_new`
//!   gives `K = C_new − A·C_obs·Aᵀ`.
//! * Reconvolving the deconvolved galaxy with a sheared PSF gives `A = I`,
//!   `K = A·C_new·Aᵀ − C_obs`.
//!
//! Positions are measured from the Jacobian reference pixel, so shears act about the
//! cutout centre. Without a shear the spectrum is the grid FFT of the image. With a shear,
//! `f̂(Mᵀq)` sits off the grid and is evaluated as a direct transform, only at frequencies
//! the kernel does not suppress. The result always comes back through the inverse FFT.
use std::f64::consts::PI;

use nalgebra::{DMatrix, Matrix2, Vector2};
use rustfft::{num_complex::Complex, FftPlanner};

use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;

/// Kernel values below this are treated as zero in the sheared transform.
const KERNEL_FLOOR: f64 = 1e-14;

/// Signed grid frequency (cycles per sample) of index `k` on an `n`-point grid.
#[inline]
fn grid_frequency(k: usize, n: usize) -> f64 {
    if k < n.div_ceil(2) {
        k as f64 / n as f64
    } else {
        (k as f64 - n as f64) / n as f64
    }
}

#[inline]
fn phases(freq: f64, offsets: &[f64], out: &mut [Complex<f64>]) {
    for (o, y) in out.iter_mut().zip(offsets) {
        *o = Complex::cis(-2.0 * PI * freq * y);
    }
}

/// In-place 2-D FFT of a column-major matrix (unnormalized in both directions).
fn fft2(data: &mut DMatrix<Complex<f64>>, inverse: bool) {
    let (nrow, ncol) = data.shape();
    if nrow == 0 || ncol == 0 {
        return;
    }
    let mut planner = FftPlanner::new();
    let (along_rows, along_cols) = if inverse {
        (planner.plan_fft_inverse(nrow), planner.plan_fft_inverse(ncol))
    } else {
        (planner.plan_fft_forward(nrow), planner.plan_fft_forward(ncol))
    };

    for column in data.as_mut_slice().chunks_exact_mut(nrow) {
        along_rows.process(column);
    }
    let mut transposed = data.transpose();
    for row in transposed.as_mut_slice().chunks_exact_mut(ncol) {
        along_cols.process(row);
    }
    *data = transposed.transpose();
}

/// Sky-frame kernel `exp(−2π² kᵀKk)` at grid frequency `q`.
#[inline]
fn kernel_at(q: &Vector2<f64>, jinv_t: &Matrix2<f64>, kernel_cov: &Matrix2<f64>) -> f64 {
    let k = jinv_t * q;
    (-2.0 * PI * PI * k.dot(&(kernel_cov * k))).exp()
}

/// Spectrum of the sheared image on the grid, phase-referenced to pixel `(0, 0)`.
fn sheared_spectrum(
    image: &DMatrix<f64>,
    jacobian: &Jacobian,
    m_t: &Matrix2<f64>,
    jinv_t: &Matrix2<f64>,
    kernel_cov: &Matrix2<f64>,
) -> DMatrix<Complex<f64>> {
    let (nrow, ncol) = image.shape();
    let yr: Vec<f64> = (0..nrow).map(|r| r as f64 - jacobian.row0).collect();
    let yc: Vec<f64> = (0..ncol).map(|c| c as f64 - jacobian.col0).collect();

    let mut spectrum = DMatrix::<Complex<f64>>::zeros(nrow, ncol);
    let mut pr = vec![Complex::new(0.0, 0.0); nrow];
    let mut pc = vec![Complex::new(0.0, 0.0); ncol];

    for kr in 0..nrow {
        let qr = grid_frequency(kr, nrow);
        for kc in 0..ncol {
            let q = Vector2::new(qr, grid_frequency(kc, ncol));
            let kernel = kernel_at(&q, jinv_t, kernel_cov);
            if kernel < KERNEL_FLOOR {
                continue;
            }

            let qs = m_t * q;
            phases(qs[0], &yr, &mut pr);
            phases(qs[1], &yc, &mut pc);
            let mut acc = Complex::new(0.0, 0.0);
            for (r, phase_r) in pr.iter().enumerate() {
                let mut row_sum = Complex::new(0.0, 0.0);
                for (c, phase_c) in pc.iter().enumerate() {
                    row_sum += *phase_c * image[(r, c)];
                }
                acc += *phase_r * row_sum;
            }
            // back to the pixel-origin reference of the inverse FFT
            let shift = Complex::cis(-2.0 * PI * (q[0] * jacobian.row0 + q[1] * jacobian.col0));
            spectrum[(kr, kc)] = acc * shift * kernel;
        }
    }
    spectrum
}

/// Apply `ĥ(q) = f̂(Mᵀq)·exp(−2π² kᵀKk)` to `image`.
///
/// Arguments
/// -----------------
/// * `image`: The observed image.
/// * `jacobian`: Pixel→sky transform of `image`.
/// * `shear`: Sky-frame shear matrix `A` applied to the image (identity for none).
/// * `kernel_cov`: Sky-frame kernel covariance `K` (may be indefinite).
///
/// Return
/// ----------
/// * The transformed image, same shape as `image`.
/// * [`McalError::InvalidObservation`] if the Jacobian is singular.
pub fn apply_kernel(
    image: &DMatrix<f64>,
    jacobian: &Jacobian,
    shear: &Matrix2<f64>,
    kernel_cov: &Matrix2<f64>,
) -> Result<DMatrix<f64>, McalError> {
    let (nrow, ncol) = image.shape();
    let jinv = jacobian.inverse()?;
    let jinv_t = jinv.transpose();

    let mut spectrum = if *shear == Matrix2::identity() {
        // on-grid: centre phases of the forward and inverse transforms cancel
        let mut spectrum = image.map(|v| Complex::new(v, 0.0));
        fft2(&mut spectrum, false);
        for kc in 0..ncol {
            let qc = grid_frequency(kc, ncol);
            for kr in 0..nrow {
                let q = Vector2::new(grid_frequency(kr, nrow), qc);
                spectrum[(kr, kc)] *= kernel_at(&q, &jinv_t, kernel_cov);
            }
        }
        spectrum
    } else {
        let m_t = (jinv * shear * jacobian.matrix()).transpose();
        sheared_spectrum(image, jacobian, &m_t, &jinv_t, kernel_cov)
    };

    fft2(&mut spectrum, true);
    let norm = 1.0 / (nrow * ncol) as f64;
    Ok(spectrum.map(|z| z.re * norm))
}

#[cfg(test)]
mod fourier_test {
    use super::*;
    use crate::gmix::Gauss2D;
    use crate::shape::{shape_from_covariance, Shear};
    use approx::assert_abs_diff_eq;

    fn jac() -> Jacobian {
        Jacobian::from_scale(24.0, 24.0, 0.2)
    }

    #[test]
    fn test_identity_kernel_is_noop() {
        let img = Gauss2D::round(0.8).render(49, 49, &jac()).unwrap();
        let out = apply_kernel(&img, &jac(), &Matrix2::identity(), &Matrix2::zeros()).unwrap();
        for (a, b) in out.iter().zip(img.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_gaussian_kernel_convolves() {
        let gal = Gauss2D::round(0.6);
        let img = gal.render(49, 49, &jac()).unwrap();
        let kernel = Matrix2::identity() * 0.2;
        let out = apply_kernel(&img, &jac(), &Matrix2::identity(), &kernel).unwrap();
        let expected = Gauss2D::new(0.0, 0.0, gal.cov + kernel, 1.0)
            .render(49, 49, &jac())
            .unwrap();
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_shear_matches_analytic_profile() {
        let gal = Gauss2D::round(1.0);
        let img = gal.render(49, 49, &jac()).unwrap();
        let g = Shear::new(0.05, -0.03);
        let a = g.matrix().unwrap();
        let out = apply_kernel(&img, &jac(), &a, &Matrix2::zeros()).unwrap();

        // area-preserving: T grows by (1 + |g|²)/(1 − |g|²), the shape is g
        let sheared_cov = a * gal.cov * a.transpose();
        let (t, g_out) = shape_from_covariance(&sheared_cov).unwrap();
        assert_abs_diff_eq!(g_out.g1, g.g1, epsilon = 1e-12);
        assert_abs_diff_eq!(g_out.g2, g.g2, epsilon = 1e-12);
        let gsq = g.g_squared();
        assert_abs_diff_eq!(t, (1.0 + gsq) / (1.0 - gsq), epsilon = 1e-12);
        assert_abs_diff_eq!(sheared_cov.determinant(), gal.cov.determinant(), epsilon = 1e-12);

        let expected = Gauss2D::new(0.0, 0.0, sheared_cov, 1.0)
            .render(49, 49, &jac())
            .unwrap();
        for (a, b) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-7);
        }
    }

    #[test]
    fn test_sheared_path_agrees_with_grid_path() {
        // an (almost) identity shear takes the direct transform; it must match the FFT path
        let gal = Gauss2D::new(0.1, -0.05, Matrix2::new(0.5, 0.1, 0.1, 0.7), 1.0);
        let img = gal.render(33, 33, &Jacobian::from_scale(16.0, 16.0, 0.2)).unwrap();
        let jac = Jacobian::from_scale(16.0, 16.0, 0.2);
        let kernel = Matrix2::identity() * 0.1;
        let nearly = Matrix2::new(1.0 + 1e-15, 0.0, 0.0, 1.0);
        let fast = apply_kernel(&img, &jac, &Matrix2::identity(), &kernel).unwrap();
        let direct = apply_kernel(&img, &jac, &nearly, &kernel).unwrap();
        for (a, b) in fast.iter().zip(direct.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_grid_frequencies() {
        let f: Vec<f64> = (0..4).map(|k| grid_frequency(k, 4)).collect();
        assert_eq!(f, vec![0.0, 0.25, -0.5, -0.25]);
        let f: Vec<f64> = (0..3).map(|k| grid_frequency(k, 3)).collect();
        assert_abs_diff_eq!(f[2], -1.0 / 3.0, epsilon = 1e-15);
    }
}
