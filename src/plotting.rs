//! # Diagnostic plots
//!
//! One PNG per object, `diagnostics-<meds_index>.png`, with three panels side by side:
//!
//! | panel    | content                                             | stretch          |
//! |----------|-----------------------------------------------------|------------------|
//! | cutout   | mean image of the selected epochs                   | min/max of cutout|
//! | model    | unsheared refit, PSF convolved, first-epoch grid    | same as cutout   |
//! | residual | cutout − model                                      | symmetric ±max   |
//!
//! The model centre is marked by a red cross and the Jacobian centre by a green one.
use camino::{Utf8Path, Utf8PathBuf};
use image::{Rgb, RgbImage};
use itertools::iproduct;
use log::{debug, warn};
use nalgebra::DMatrix;

use crate::mcal_errors::McalError;
use crate::metacal::FitModel;
use crate::observation::ObservationList;

/// Screen pixels per cutout pixel.
const ZOOM: u32 = 4;
/// Gap between panels, in screen pixels.
const GAP: u32 = 8;
const MODEL_MARK: Rgb<u8> = Rgb([230, 40, 40]);
const CENTER_MARK: Rgb<u8> = Rgb([40, 200, 40]);
const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

pub fn plot_file_name(meds_index: usize) -> String {
    format!("diagnostics-{meds_index}.png")
}

fn gray(value: f64, lo: f64, hi: f64) -> Rgb<u8> {
    let t = if hi > lo {
        ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
    } else {
        0.5
    };
    let b = (t * 255.0).round() as u8;
    Rgb([b, b, b])
}

fn draw_panel(canvas: &mut RgbImage, panel: &DMatrix<f64>, x0: u32, lo: f64, hi: f64) {
    for (row, col) in iproduct!(0..panel.nrows(), 0..panel.ncols()) {
        let px = gray(panel[(row, col)], lo, hi);
        for (dy, dx) in iproduct!(0..ZOOM, 0..ZOOM) {
            canvas.put_pixel(x0 + col as u32 * ZOOM + dx, row as u32 * ZOOM + dy, px);
        }
    }
}

fn draw_cross(canvas: &mut RgbImage, x0: u32, ncol: usize, nrow: usize, row: f64, col: f64, color: Rgb<u8>) {
    if !(row.is_finite() && col.is_finite()) {
        return;
    }
    let (w, h) = (ncol as i64 * ZOOM as i64, nrow as i64 * ZOOM as i64);
    let cy = ((row + 0.5) * ZOOM as f64).round() as i64;
    let cx = ((col + 0.5) * ZOOM as f64).round() as i64;
    let arm = 2 * ZOOM as i64;
    for d in -arm..=arm {
        for (x, y) in [(cx + d, cy), (cx, cy + d)] {
            if (0..w).contains(&x) && (0..h).contains(&y) {
                canvas.put_pixel(x0 + x as u32, y as u32, color);
            }
        }
    }
}

/// Render the three diagnostic panels into an image.
///
/// Return
/// ----------
/// * [`McalError::InvalidObservation`] if the epochs have no common cutout shape or the
///   model grid differs from it.
pub fn render_diagnostics(
    obslist: &ObservationList,
    model: &FitModel,
) -> Result<RgbImage, McalError> {
    let cutout = obslist.mean_image().ok_or_else(|| {
        McalError::InvalidObservation("epochs do not share one cutout shape".into())
    })?;
    let model_img = model.image()?;
    if model_img.shape() != cutout.shape() {
        return Err(McalError::InvalidObservation(format!(
            "model grid {:?} differs from cutout {:?}",
            model_img.shape(),
            cutout.shape()
        )));
    }
    let resid = &cutout - &model_img;

    let (nrow, ncol) = cutout.shape();
    let pw = ncol as u32 * ZOOM;
    let ph = nrow as u32 * ZOOM;
    let mut canvas = RgbImage::from_pixel(3 * pw + 2 * GAP, ph, BACKGROUND);

    let (lo, hi) = (cutout.min(), cutout.max());
    let rmax = resid.amax();
    let offsets = [0, pw + GAP, 2 * (pw + GAP)];

    draw_panel(&mut canvas, &cutout, offsets[0], lo, hi);
    draw_panel(&mut canvas, &model_img, offsets[1], lo, hi);
    draw_panel(&mut canvas, &resid, offsets[2], -rmax, rmax);

    let (mrow, mcol) = model.center_pixel()?;
    let (jrow, jcol) = (model.jacobian.row0, model.jacobian.col0);
    for x0 in offsets {
        draw_cross(&mut canvas, x0, ncol, nrow, jrow, jcol, CENTER_MARK);
        draw_cross(&mut canvas, x0, ncol, nrow, mrow, mcol, MODEL_MARK);
    }
    Ok(canvas)
}

/// Write the diagnostic PNG of one object to `plot_dir`.
pub fn plot_diagnostics(
    plot_dir: &Utf8Path,
    meds_index: usize,
    obslist: &ObservationList,
    model: &FitModel,
) -> Result<Utf8PathBuf, McalError> {
    let canvas = render_diagnostics(obslist, model)?;
    let path = plot_dir.join(plot_file_name(meds_index));
    canvas.save(&path)?;
    debug!("Wrote diagnostic plot {path}");
    Ok(path)
}

/// [`plot_diagnostics`], logging a failure instead of returning it.
pub fn try_plot(
    plot_dir: &Utf8Path,
    meds_index: usize,
    obslist: &ObservationList,
    model: &FitModel,
) -> Option<Utf8PathBuf> {
    match plot_diagnostics(plot_dir, meds_index, obslist, model) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!("Bad gmix model, no image made (object {meds_index}: {e})");
            None
        }
    }
}

#[cfg(test)]
mod plotting_test {
    use super::*;
    use crate::gmix::Gauss2D;
    use crate::synthetic::SyntheticObject;

    fn model(obj: &SyntheticObject) -> FitModel {
        let obs = obj.observation(None).unwrap();
        FitModel {
            gal: Gauss2D::from_pars(&obj.gal_pars()).unwrap(),
            psf: Gauss2D::from_pars(&obj.psf_pars()).unwrap().normalized(),
            jacobian: obs.jacobian,
            nrow: obj.dim,
            ncol: obj.dim,
        }
    }

    #[test]
    fn test_panels_and_markers() {
        let obj = SyntheticObject::default();
        let obslist = obj.observations(2).unwrap();
        let canvas = render_diagnostics(&obslist, &model(&obj)).unwrap();
        let pw = obj.dim as u32 * ZOOM;
        assert_eq!(canvas.width(), 3 * pw + 2 * GAP);
        assert_eq!(canvas.height(), pw);
        // Model centred on the jacobian centre: the red cross is drawn last.
        let c = (obj.dim as u32 / 2) * ZOOM + ZOOM / 2;
        assert_eq!(*canvas.get_pixel(c, c), MODEL_MARK);
    }

    #[test]
    fn test_grid_mismatch_is_reported() {
        let obj = SyntheticObject::default();
        let obslist = obj.observations(1).unwrap();
        let mut m = model(&obj);
        m.nrow += 2;
        assert!(matches!(
            render_diagnostics(&obslist, &m),
            Err(McalError::InvalidObservation(_))
        ));
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        assert!(try_plot(dir, 3, &obslist, &m).is_none());
        assert!(try_plot(dir, 3, &obslist, &model(&obj)).is_some());
        assert!(dir.join("diagnostics-3.png").exists());
    }
}
