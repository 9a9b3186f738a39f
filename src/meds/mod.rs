//! # MEDS access
//!
//! The fitter only needs a narrow view of a Multi-Epoch Data Structure file, captured by
//! [`MedsSource`]: the catalogue size, whether epoch `0` of every object is a coadd, the
//! catalogue row of an object and its epoch list.
//!
//! Implementations
//! -----------------
//! * [`InMemoryMeds`] – sources and epochs held in memory (synthetic data, tests).
//! * [`FitsMeds`] – standard MEDS FITS files, behind the `fits` feature.
use crate::mcal_errors::McalError;
use crate::observation::{ObservationList, Source};

#[cfg(feature = "fits")]
pub mod fits;

#[cfg(feature = "fits")]
pub use fits::FitsMeds;

/// Read access to a MEDS catalogue.
pub trait MedsSource {
    /// Number of catalogue rows.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether epoch `0` of every object is a coadd cutout.
    fn has_coadd(&self) -> bool;

    /// Catalogue row `index`.
    fn source(&mut self, index: usize) -> Result<Source, McalError>;

    /// All epochs of object `index`, coadd first when [`MedsSource::has_coadd`].
    fn observations(&mut self, index: usize) -> Result<ObservationList, McalError>;
}

/// MEDS catalogue held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMeds {
    has_coadd: bool,
    entries: Vec<(Source, ObservationList)>,
}

impl InMemoryMeds {
    pub fn new(has_coadd: bool) -> Self {
        InMemoryMeds {
            has_coadd,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, source: Source, obslist: ObservationList) {
        self.entries.push((source, obslist));
    }

    fn entry(&self, index: usize) -> Result<&(Source, ObservationList), McalError> {
        self.entries.get(index).ok_or_else(|| {
            McalError::MedsFormat(format!(
                "index {index} out of range for {} objects",
                self.entries.len()
            ))
        })
    }
}

impl MedsSource for InMemoryMeds {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn has_coadd(&self) -> bool {
        self.has_coadd
    }

    fn source(&mut self, index: usize) -> Result<Source, McalError> {
        Ok(self.entry(index)?.0.clone())
    }

    fn observations(&mut self, index: usize) -> Result<ObservationList, McalError> {
        Ok(self.entry(index)?.1.clone())
    }
}
