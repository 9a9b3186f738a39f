//! Log file and console setup.
//!
//! The run log goes to `<outdir>/mcal_fitting.log` and is duplicated to stderr. With
//! `verbose`, the file gets `debug` records and the console gets `info`; otherwise the file
//! gets `info` and the console only warnings.
use camino::Utf8Path;
use flexi_logger::{detailed_format, Duplicate, FileSpec, Logger, LoggerHandle};

use crate::constants::LOG_FILE_BASENAME;
use crate::mcal_errors::McalError;

/// Start the logger.
///
/// Return
/// ----------
/// * The [`LoggerHandle`]; logging stops when it is dropped, so keep it for the whole run.
pub fn setup_logger(outdir: &Utf8Path, verbose: bool) -> Result<LoggerHandle, McalError> {
    let (level, console) = if verbose {
        ("debug", Duplicate::Info)
    } else {
        ("info", Duplicate::Warn)
    };
    let handle = Logger::try_with_str(level)?
        .log_to_file(
            FileSpec::default()
                .directory(outdir.as_std_path())
                .basename(LOG_FILE_BASENAME)
                .suppress_timestamp(),
        )
        .format_for_files(detailed_format)
        .duplicate_to_stderr(console)
        .start()?;
    Ok(handle)
}
