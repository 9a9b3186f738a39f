//! # Observations of a single source
//!
//! Data model for the per-source inputs of the fitter:
//!
//! * [`Source`] – one catalogue row (identifiers, position, number of cutouts),
//! * [`PsfObservation`] – a PSF stamp with its weight map and Jacobian,
//! * [`Observation`] – one epoch: image cutout, inverse-variance weight map, Jacobian and PSF,
//! * [`ObservationList`] – the ordered epochs of one source.
//!
//! Images are stored as `nalgebra::DMatrix<f64>` indexed `(row, col)`.
//!
//! ## Invariants
//! -----------------
//! * An image and its weight map always share the same shape (checked at construction).
//! * When the MEDS file carries a coadd, it is always epoch `0` of the list. Its PSF may be
//!   missing, which is encoded as an infinite inverse variance in the PSF weight map
//!   (see [`Observation::psf_is_degenerate`]).
use nalgebra::DMatrix;

use crate::constants::{ArcSec, ObjectId};
use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;

/// Catalogue entry of one source, read-only for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    /// Row of the source in the MEDS catalogue.
    pub meds_index: usize,
    pub id: ObjectId,
    /// Right ascension (degrees).
    pub ra: f64,
    /// Declination (degrees).
    pub dec: f64,
    /// Windowed centroid, column (pixels of the detection image).
    pub xwin_image: f64,
    /// Windowed centroid, row (pixels of the detection image).
    pub ywin_image: f64,
    /// Number of cutouts stored for this source (coadd included).
    pub ncutout: usize,
}

#[derive(Debug, Clone)]
pub struct PsfObservation {
    pub image: DMatrix<f64>,
    pub weight: DMatrix<f64>,
    pub jacobian: Jacobian,
}

impl PsfObservation {
    /// Build a PSF observation, checking that the image and weight shapes agree.
    pub fn new(
        image: DMatrix<f64>,
        weight: DMatrix<f64>,
        jacobian: Jacobian,
    ) -> Result<Self, McalError> {
        check_same_shape(&image, &weight, "psf")?;
        Ok(PsfObservation {
            image,
            weight,
            jacobian,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Observation {
    pub image: DMatrix<f64>,
    pub weight: DMatrix<f64>,
    pub jacobian: Jacobian,
    pub psf: PsfObservation,
}

impl Observation {
    /// Build an epoch observation.
    ///
    /// Arguments
    /// -----------------
    /// * `image`: The image cutout.
    /// * `weight`: Inverse-variance weight map, same shape as `image`.
    /// * `jacobian`: Pixel→sky transform of the cutout.
    /// * `psf`: The PSF stamp at the source position.
    ///
    /// Return
    /// ----------
    /// * The observation, or [`McalError::InvalidObservation`] on a shape mismatch
    ///   or an empty image.
    pub fn new(
        image: DMatrix<f64>,
        weight: DMatrix<f64>,
        jacobian: Jacobian,
        psf: PsfObservation,
    ) -> Result<Self, McalError> {
        check_same_shape(&image, &weight, "image")?;
        if image.is_empty() {
            return Err(McalError::InvalidObservation("empty image cutout".into()));
        }
        Ok(Observation {
            image,
            weight,
            jacobian,
            psf,
        })
    }

    pub fn pixel_scale(&self) -> ArcSec {
        self.jacobian.scale()
    }

    /// Whether the PSF stamp is flagged as missing.
    ///
    /// A missing PSF is encoded as an infinite inverse variance. Only the first PSF pixel
    /// is inspected, matching how MEDS writers fill an absent coadd PSF.
    pub fn psf_is_degenerate(&self) -> bool {
        self.psf
            .weight
            .get((0, 0))
            .is_some_and(|w| w.is_infinite())
    }

    /// Per-pixel noise level implied by the weight map, `sqrt(1 / median(w > 0))`.
    ///
    /// Return
    /// ----------
    /// * `None` if the weight map has no positive finite entry.
    pub fn noise_sigma(&self) -> Option<f64> {
        let mut positive: Vec<f64> = self
            .weight
            .iter()
            .copied()
            .filter(|w| w.is_finite() && *w > 0.0)
            .collect();
        if positive.is_empty() {
            return None;
        }
        positive.sort_unstable_by(|a, b| a.total_cmp(b));
        let n = positive.len();
        let median = if n % 2 == 1 {
            positive[n / 2]
        } else {
            0.5 * (positive[n / 2 - 1] + positive[n / 2])
        };
        Some((1.0 / median).sqrt())
    }
}

fn check_same_shape(
    image: &DMatrix<f64>,
    weight: &DMatrix<f64>,
    what: &str,
) -> Result<(), McalError> {
    if image.shape() != weight.shape() {
        return Err(McalError::InvalidObservation(format!(
            "{what} shape {:?} does not match weight shape {:?}",
            image.shape(),
            weight.shape()
        )));
    }
    Ok(())
}

/// Ordered epochs of one source; epoch `0` is the coadd when the file has one.
#[derive(Debug, Clone, Default)]
pub struct ObservationList {
    observations: Vec<Observation>,
}

impl ObservationList {
    pub fn new(observations: Vec<Observation>) -> Self {
        ObservationList { observations }
    }

    pub fn push(&mut self, obs: Observation) {
        self.observations.push(obs);
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn first(&self) -> Option<&Observation> {
        self.observations.first()
    }

    pub fn get(&self, idx: usize) -> Option<&Observation> {
        self.observations.get(idx)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.observations.iter()
    }

    pub fn as_slice(&self) -> &[Observation] {
        &self.observations
    }

    /// New list holding a copy of the epochs `range`.
    pub fn sub_list(&self, range: std::ops::RangeFrom<usize>) -> ObservationList {
        ObservationList {
            observations: self
                .observations
                .get(range)
                .map(|s| s.to_vec())
                .unwrap_or_default(),
        }
    }

    /// New list holding only the first epoch (empty if `self` is empty).
    pub fn head(&self) -> ObservationList {
        ObservationList {
            observations: self.observations.iter().take(1).cloned().collect(),
        }
    }

    /// Pixel-wise mean of the epoch images, used for diagnostic plots.
    ///
    /// Return
    /// ----------
    /// * `None` if the list is empty or the epochs do not share one cutout shape.
    pub fn mean_image(&self) -> Option<DMatrix<f64>> {
        let first = self.observations.first()?;
        let shape = first.image.shape();
        if self.observations.iter().any(|o| o.image.shape() != shape) {
            return None;
        }
        let mut sum = DMatrix::zeros(shape.0, shape.1);
        for obs in &self.observations {
            sum += &obs.image;
        }
        Some(sum / self.observations.len() as f64)
    }
}

impl FromIterator<Observation> for ObservationList {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        ObservationList {
            observations: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a ObservationList {
    type Item = &'a Observation;
    type IntoIter = std::slice::Iter<'a, Observation>;

    fn into_iter(self) -> Self::IntoIter {
        self.observations.iter()
    }
}

#[cfg(test)]
mod observation_test {
    use super::*;

    fn flat_obs(value: f64, psf_weight: f64) -> Observation {
        let jac = Jacobian::from_scale(2.0, 2.0, 0.2);
        let psf = PsfObservation::new(
            DMatrix::from_element(5, 5, 0.04),
            DMatrix::from_element(5, 5, psf_weight),
            jac,
        )
        .unwrap();
        Observation::new(
            DMatrix::from_element(5, 5, value),
            DMatrix::from_element(5, 5, 4.0),
            jac,
            psf,
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let jac = Jacobian::from_scale(2.0, 2.0, 0.2);
        let psf = PsfObservation::new(DMatrix::zeros(3, 3), DMatrix::zeros(3, 3), jac).unwrap();
        let res = Observation::new(DMatrix::zeros(4, 4), DMatrix::zeros(4, 5), jac, psf);
        assert!(matches!(res, Err(McalError::InvalidObservation(_))));
    }

    #[test]
    fn test_degenerate_psf_detection() {
        assert!(flat_obs(1.0, f64::INFINITY).psf_is_degenerate());
        assert!(!flat_obs(1.0, 1e6).psf_is_degenerate());
    }

    #[test]
    fn test_noise_sigma_from_weight() {
        let obs = flat_obs(1.0, 1.0);
        assert_eq!(obs.noise_sigma(), Some(0.5));
    }

    #[test]
    fn test_list_slicing_and_mean() {
        let list: ObservationList = [flat_obs(1.0, 1.0), flat_obs(3.0, 1.0), flat_obs(5.0, 1.0)]
            .into_iter()
            .collect();
        assert_eq!(list.sub_list(1..).len(), 2);
        assert_eq!(list.head().len(), 1);
        assert_eq!(list.sub_list(5..).len(), 0);
        let mean = list.mean_image().unwrap();
        assert_eq!(mean[(0, 0)], 3.0);
    }
}
