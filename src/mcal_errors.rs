use thiserror::Error;

use crate::constants::ObjectId;

#[derive(Error, Debug)]
pub enum McalError {
    #[error("Object flagged with {flag}")]
    FlaggedObject { flag: String },

    #[error("No usable epochs left after observation selection")]
    EmptyObservation,

    #[error("Fit failed to converge after {tries} tries: {reason}")]
    FitDivergence { tries: usize, reason: String },

    #[error("Responsivity matrix is singular (det = {det:e})")]
    SingularResponsivity { det: f64 },

    #[error("Model parameters out of range: {0}")]
    GMixRange(String),

    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Invalid run configuration: {0}")]
    InvalidConfig(String),

    #[error("Result table schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Object {0} not found in MEDS catalog")]
    ObjectNotFound(ObjectId),

    #[error("Malformed MEDS file: {0}")]
    MedsFormat(String),

    #[error("Output file already exists (use overwrite): {0}")]
    OutputExists(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parquet error: {0}")]
    ParquetError(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    ArrowError(#[from] arrow_schema::ArrowError),

    #[error("Image encoding error: {0}")]
    ImageError(#[from] image::ImageError),

    #[error("Logger initialization failed: {0}")]
    LoggerError(#[from] flexi_logger::FlexiLoggerError),

    #[cfg(feature = "fits")]
    #[error("FITS error: {0}")]
    FitsError(#[from] fitsio::errors::Error),
}

impl McalError {
    /// Whether this error is confined to a single object.
    ///
    /// Per-object errors are logged and turned into "no contribution" at the task boundary;
    /// every other kind aborts the run.
    ///
    /// Return
    /// ----------
    /// * `true` for flag, selection, fitting, responsivity, data-validity, schema and plotting failures.
    /// * `false` for configuration, I/O and output errors.
    pub fn is_per_object(&self) -> bool {
        use McalError::*;
        matches!(
            self,
            FlaggedObject { .. }
                | EmptyObservation
                | FitDivergence { .. }
                | SingularResponsivity { .. }
                | GMixRange(_)
                | InvalidObservation(_)
                | SchemaMismatch(_)
                | ImageError(_)
        )
    }
}

impl PartialEq for McalError {
    fn eq(&self, other: &Self) -> bool {
        use McalError::*;
        match (self, other) {
            (FlaggedObject { flag: a }, FlaggedObject { flag: b }) => a == b,
            (EmptyObservation, EmptyObservation) => true,
            (FitDivergence { tries: a, .. }, FitDivergence { tries: b, .. }) => a == b,
            (SingularResponsivity { .. }, SingularResponsivity { .. }) => true,
            (GMixRange(a), GMixRange(b)) => a == b,
            (InvalidObservation(a), InvalidObservation(b)) => a == b,
            (InvalidConfig(a), InvalidConfig(b)) => a == b,
            (SchemaMismatch(a), SchemaMismatch(b)) => a == b,
            (ObjectNotFound(a), ObjectNotFound(b)) => a == b,
            (MedsFormat(a), MedsFormat(b)) => a == b,
            (OutputExists(a), OutputExists(b)) => a == b,

            // Wrapped foreign errors are not comparable: same variant means equal
            (IoError(_), IoError(_)) => true,
            (ParquetError(_), ParquetError(_)) => true,
            (ArrowError(_), ArrowError(_)) => true,
            (ImageError(_), ImageError(_)) => true,
            (LoggerError(_), LoggerError(_)) => true,
            #[cfg(feature = "fits")]
            (FitsError(_), FitsError(_)) => true,

            _ => false,
        }
    }
}
