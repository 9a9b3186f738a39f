//! # Observation selection
//!
//! Decide which epochs of a source enter the fit: the coadd only, the coadd together with the
//! single-epoch cutouts, or the single-epoch cutouts only (default).
//!
//! The coadd, when present, is epoch `0`. Its PSF can be missing in the MEDS file (see
//! [`Observation::psf_is_degenerate`](crate::observation::Observation::psf_is_degenerate)); a
//! degenerate coadd is always dropped.
//!
//! | mode               | no coadd    | degenerate coadd | valid coadd   |
//! |--------------------|-------------|------------------|---------------|
//! | `CoaddOnly`        | all epochs  | epochs `[1..]`   | epoch `[0]`   |
//! | `CoaddAndEpochs`   | all epochs  | epochs `[1..]`   | all epochs    |
//! | `EpochsOnly`       | all epochs  | epochs `[1..]`   | epochs `[1..]`|
//!
//! The two coadd modes share their "no coadd" and "degenerate coadd" rows; each mode keeps
//! its own branch.
use std::fmt;

use log::debug;

use crate::mcal_errors::McalError;
use crate::observation::ObservationList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObsSelection {
    CoaddOnly,
    CoaddAndEpochs,
    #[default]
    EpochsOnly,
}

impl ObsSelection {
    /// Mode implied by the two command-line switches; `use_coadd_only` wins.
    pub fn from_flags(use_coadd: bool, use_coadd_only: bool) -> Self {
        if use_coadd_only {
            ObsSelection::CoaddOnly
        } else if use_coadd {
            ObsSelection::CoaddAndEpochs
        } else {
            ObsSelection::EpochsOnly
        }
    }
}

impl fmt::Display for ObsSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObsSelection::CoaddOnly => "coadd-only",
            ObsSelection::CoaddAndEpochs => "coadd+epochs",
            ObsSelection::EpochsOnly => "epochs-only",
        };
        f.write_str(s)
    }
}

/// Select the epochs used for fitting.
///
/// Arguments
/// -----------------
/// * `obslist`: All epochs of the source, coadd first when `has_coadd`.
/// * `has_coadd`: Whether the MEDS file stores a coadd as epoch `0`.
/// * `mode`: The selection mode.
///
/// Return
/// ----------
/// * The selected epochs (a new list, the input is not modified).
/// * [`McalError::EmptyObservation`] if no epoch is left.
///
/// See also
/// ------------
/// * [`ObsSelection`] – Mode semantics (module-level table).
pub fn select(
    obslist: &ObservationList,
    has_coadd: bool,
    mode: ObsSelection,
) -> Result<ObservationList, McalError> {
    let degenerate_coadd =
        has_coadd && obslist.first().is_some_and(|obs| obs.psf_is_degenerate());

    let selected = match mode {
        ObsSelection::CoaddOnly => {
            if !has_coadd {
                debug!("No coadd found, using all epochs");
                obslist.clone()
            } else if degenerate_coadd {
                debug!("Coadd PSF is missing, skipping the coadd");
                obslist.sub_list(1..)
            } else {
                obslist.head()
            }
        }
        ObsSelection::CoaddAndEpochs => {
            if !has_coadd {
                debug!("No coadd found, using all epochs");
                obslist.clone()
            } else if degenerate_coadd {
                debug!("Coadd PSF is missing, skipping the coadd");
                obslist.sub_list(1..)
            } else {
                obslist.clone()
            }
        }
        ObsSelection::EpochsOnly => {
            if has_coadd {
                obslist.sub_list(1..)
            } else {
                obslist.clone()
            }
        }
    };

    if selected.is_empty() {
        return Err(McalError::EmptyObservation);
    }
    Ok(selected)
}
