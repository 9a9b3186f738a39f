//! MEDS FITS reader (feature `fits`).
//!
//! Extensions used:
//!
//! | extension        | content                                                        |
//! |------------------|----------------------------------------------------------------|
//! | `object_data`    | catalogue table, one row per object, vector columns per cutout |
//! | `image_cutouts`  | all image cutouts, flattened into one 1-D image                |
//! | `weight_cutouts` | inverse-variance maps, same layout as `image_cutouts`          |
//! | `psf`            | PSF stamps, flattened, indexed by `psf_start_row`              |
//! | `metadata`       | run metadata; its `has_coadd` column flags a coadd at epoch 0  |
//!
//! PSF stamps carry no noise model in the file: their weight map is uniform,
//! `1/(1e-3·max)²`, or infinite when the stamp is empty (missing coadd PSF).
use camino::{Utf8Path, Utf8PathBuf};
use fitsio::hdu::{FitsHdu, HduInfo};
use fitsio::FitsFile;
use log::{debug, warn};
use nalgebra::DMatrix;

use crate::constants::ObjectId;
use crate::jacobian::Jacobian;
use crate::mcal_errors::McalError;
use crate::observation::{Observation, ObservationList, PsfObservation, Source};
use crate::synthetic::PSF_NOISE_FRACTION;

use super::MedsSource;

const OBJECT_DATA: &str = "object_data";
const IMAGE_CUTOUTS: &str = "image_cutouts";
const WEIGHT_CUTOUTS: &str = "weight_cutouts";
const PSF_CUTOUTS: &str = "psf";
const METADATA: &str = "metadata";

/// Catalogue columns read once at open time.
#[derive(Debug, Clone)]
struct Catalog {
    id: Vec<i64>,
    ncutout: Vec<i64>,
    box_size: Vec<i64>,
    ra: Vec<f64>,
    dec: Vec<f64>,
    xwin: Vec<f64>,
    ywin: Vec<f64>,
    /// `(name, 1-based column number, repeat)` of the vector columns.
    vector_columns: Vec<(String, i32, usize)>,
}

pub struct FitsMeds {
    fits: FitsFile,
    path: Utf8PathBuf,
    has_coadd: bool,
    catalog: Catalog,
}

impl FitsMeds {
    /// Open a MEDS file and read its catalogue.
    ///
    /// Return
    /// ----------
    /// * [`McalError::FitsError`] if the file cannot be read, [`McalError::MedsFormat`] if a
    ///   required extension or column is missing.
    pub fn open(path: &Utf8Path) -> Result<Self, McalError> {
        let mut fits = FitsFile::open(path)?;
        let hdu = fits
            .hdu(OBJECT_DATA)
            .map_err(|_| McalError::MedsFormat(format!("{path}: no {OBJECT_DATA} extension")))?;

        let vector_columns = match &hdu.info {
            HduInfo::TableInfo {
                column_descriptions,
                ..
            } => column_descriptions
                .iter()
                .enumerate()
                .map(|(i, c)| (c.name.clone(), (i + 1) as i32, c.data_type.repeat))
                .collect(),
            _ => {
                return Err(McalError::MedsFormat(format!(
                    "{path}: {OBJECT_DATA} is not a table"
                )))
            }
        };

        let nrows;
        let catalog = {
            let id: Vec<i64> = read_required(&hdu, &mut fits, "id")?;
            nrows = id.len();
            Catalog {
                ncutout: read_required(&hdu, &mut fits, "ncutout")?,
                box_size: read_required(&hdu, &mut fits, "box_size")?,
                ra: read_required(&hdu, &mut fits, "ra")?,
                dec: read_required(&hdu, &mut fits, "dec")?,
                xwin: read_optional(&hdu, &mut fits, "XWIN_IMAGE", nrows),
                ywin: read_optional(&hdu, &mut fits, "YWIN_IMAGE", nrows),
                vector_columns,
                id,
            }
        };

        let has_coadd = match fits.hdu(METADATA) {
            Ok(meta) => meta
                .read_col::<i32>(&mut fits, "has_coadd")
                .ok()
                .and_then(|v| v.first().copied())
                .is_some_and(|v| v != 0),
            Err(_) => {
                warn!("{path}: no {METADATA} extension, assuming no coadd");
                false
            }
        };

        debug!("Opened MEDS file {path}: {nrows} objects, has_coadd = {has_coadd}");
        Ok(FitsMeds {
            fits,
            path: path.to_owned(),
            has_coadd,
            catalog,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn check_index(&self, index: usize) -> Result<(), McalError> {
        if index >= self.catalog.id.len() {
            return Err(McalError::ObjectNotFound(index as ObjectId));
        }
        Ok(())
    }

    /// First `n` entries of the vector column `name` on catalogue row `index`.
    fn read_vector(&mut self, name: &str, index: usize, n: usize) -> Result<Vec<f64>, McalError> {
        let (colnum, repeat) = self
            .catalog
            .vector_columns
            .iter()
            .find(|(col, _, _)| col == name)
            .map(|(_, colnum, repeat)| (*colnum, *repeat))
            .ok_or_else(|| McalError::MedsFormat(format!("{}: no column {name}", self.path)))?;
        if n > repeat {
            return Err(McalError::MedsFormat(format!(
                "{}: column {name} holds {repeat} entries, {n} requested",
                self.path
            )));
        }

        self.fits.hdu(OBJECT_DATA)?;
        let mut out = vec![0.0; n];
        let status = read_doubles(&mut self.fits, colnum, index, &mut out).ok_or_else(|| {
            McalError::MedsFormat(format!("{}: row {index} of {name} out of range", self.path))
        })?;
        if status != 0 {
            return Err(McalError::MedsFormat(format!(
                "{}: reading {name}[{index}] failed with cfitsio status {status}",
                self.path
            )));
        }
        Ok(out)
    }

    fn read_stamp(
        &mut self,
        extension: &str,
        start: usize,
        nrow: usize,
        ncol: usize,
    ) -> Result<DMatrix<f64>, McalError> {
        let hdu = self.fits.hdu(extension)?;
        let pixels: Vec<f64> = hdu.read_section(&mut self.fits, start, start + nrow * ncol)?;
        Ok(DMatrix::from_row_slice(nrow, ncol, &pixels))
    }
}

/// cfitsio `(firstrow, nelem)` of `len` entries from 0-based catalogue row `index`.
fn row_span(index: usize, len: usize) -> Option<(i64, i64)> {
    let firstrow = i64::try_from(index).ok()?.checked_add(1)?;
    Some((firstrow, i64::try_from(len).ok()?))
}

/// Fill `out` from the start of a vector column cell of the current HDU.
///
/// Return
/// ----------
/// * The cfitsio status, `None` if the row or length does not fit the cfitsio types.
fn read_doubles(fits: &mut FitsFile, colnum: i32, index: usize, out: &mut [f64]) -> Option<i32> {
    // Vector columns are not exposed by the safe table API.
    let (firstrow, nelem) = row_span(index, out.len())?;
    let mut anynul = 0;
    let mut status = 0;
    // SAFETY: `out` holds exactly `nelem` doubles, so cfitsio writes inside it; the handle
    // is borrowed mutably for the whole call.
    unsafe {
        fitsio::sys::ffgcvd(
            fits.as_raw(),
            colnum,
            firstrow,
            1,
            nelem,
            0.0,
            out.as_mut_ptr(),
            &mut anynul,
            &mut status,
        );
    }
    Some(status)
}

fn read_required<T: fitsio::tables::ReadsCol>(
    hdu: &FitsHdu,
    fits: &mut FitsFile,
    name: &str,
) -> Result<Vec<T>, McalError> {
    hdu.read_col(fits, name)
        .map_err(|e| McalError::MedsFormat(format!("column {name}: {e}")))
}

fn read_optional(hdu: &FitsHdu, fits: &mut FitsFile, name: &str, nrows: usize) -> Vec<f64> {
    hdu.read_col(fits, name).unwrap_or_else(|_| {
        debug!("{OBJECT_DATA} has no {name} column");
        vec![f64::NAN; nrows]
    })
}

/// Uniform PSF weight map, infinite for an empty stamp.
fn psf_weight(image: &DMatrix<f64>) -> DMatrix<f64> {
    let max = image.max();
    let w = if max > 0.0 {
        1.0 / (PSF_NOISE_FRACTION * max).powi(2)
    } else {
        f64::INFINITY
    };
    DMatrix::from_element(image.nrows(), image.ncols(), w)
}

impl MedsSource for FitsMeds {
    fn len(&self) -> usize {
        self.catalog.id.len()
    }

    fn has_coadd(&self) -> bool {
        self.has_coadd
    }

    fn source(&mut self, index: usize) -> Result<Source, McalError> {
        self.check_index(index)?;
        let c = &self.catalog;
        Ok(Source {
            meds_index: index,
            id: c.id[index],
            ra: c.ra[index],
            dec: c.dec[index],
            xwin_image: c.xwin[index],
            ywin_image: c.ywin[index],
            ncutout: c.ncutout[index].max(0) as usize,
        })
    }

    fn observations(&mut self, index: usize) -> Result<ObservationList, McalError> {
        self.check_index(index)?;
        let ncut = self.catalog.ncutout[index].max(0) as usize;
        let box_size = self.catalog.box_size[index].max(0) as usize;
        if ncut == 0 {
            return Ok(ObservationList::default());
        }

        let start_row = self.read_vector("start_row", index, ncut)?;
        let cutout_row = self.read_vector("cutout_row", index, ncut)?;
        let cutout_col = self.read_vector("cutout_col", index, ncut)?;
        let dvdrow = self.read_vector("dvdrow", index, ncut)?;
        let dvdcol = self.read_vector("dvdcol", index, ncut)?;
        let dudrow = self.read_vector("dudrow", index, ncut)?;
        let dudcol = self.read_vector("dudcol", index, ncut)?;
        let psf_start = self.read_vector("psf_start_row", index, ncut)?;
        let psf_nrow = self.read_vector("psf_row_size", index, ncut)?;
        let psf_ncol = self.read_vector("psf_col_size", index, ncut)?;

        let mut obslist = ObservationList::default();
        for icut in 0..ncut {
            let jacobian = Jacobian::new(
                cutout_row[icut],
                cutout_col[icut],
                dvdrow[icut],
                dvdcol[icut],
                dudrow[icut],
                dudcol[icut],
            );
            let start = start_row[icut] as usize;
            let image = self.read_stamp(IMAGE_CUTOUTS, start, box_size, box_size)?;
            let weight = self.read_stamp(WEIGHT_CUTOUTS, start, box_size, box_size)?;

            let (pnrow, pncol) = (psf_nrow[icut] as usize, psf_ncol[icut] as usize);
            let psf_image = self.read_stamp(PSF_CUTOUTS, psf_start[icut] as usize, pnrow, pncol)?;
            let psf_jac = jacobian.with_center(
                (pnrow as f64 - 1.0) / 2.0,
                (pncol as f64 - 1.0) / 2.0,
            );
            let psf_wt = psf_weight(&psf_image);
            let psf = PsfObservation::new(psf_image, psf_wt, psf_jac)?;
            obslist.push(Observation::new(image, weight, jacobian, psf)?);
        }
        Ok(obslist)
    }
}

#[cfg(test)]
mod fits_test {
    use super::*;

    #[test]
    fn test_empty_psf_stamp_is_degenerate() {
        let w = psf_weight(&DMatrix::zeros(5, 5));
        assert!(w[(0, 0)].is_infinite());
        let mut img = DMatrix::zeros(5, 5);
        img[(2, 2)] = 0.5;
        let w = psf_weight(&img);
        assert!((w[(1, 1)] - 1.0 / (0.5e-3f64).powi(2)).abs() < 1e-3);
    }

    #[test]
    fn test_row_span_is_one_based() {
        assert_eq!(row_span(0, 4), Some((1, 4)));
        assert_eq!(row_span(41, 0), Some((42, 0)));
        assert_eq!(row_span(usize::MAX, 1), None);
    }
}
