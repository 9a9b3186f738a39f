//! # Parquet output
//!
//! The concatenated result batch is written with [`ArrowWriter`] (Snappy compression). The
//! file schema is the batch schema, so a run with zero fitted objects still produces a
//! readable file with every column.
use std::fs::File;

use arrow_array::RecordBatch;
use camino::Utf8Path;
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;

use crate::mcal_errors::McalError;

/// Write `table` to a Parquet file.
///
/// Arguments
/// -----------------
/// * `table`: The concatenated per-object rows.
/// * `path`: Destination file.
/// * `overwrite`: Replace an existing file instead of failing.
///
/// Return
/// ----------
/// * [`McalError::OutputExists`] if `path` exists and `overwrite` is false.
/// * I/O, Arrow or Parquet errors from the writer.
pub fn write_table(table: &RecordBatch, path: &Utf8Path, overwrite: bool) -> Result<(), McalError> {
    if path.exists() && !overwrite {
        return Err(McalError::OutputExists(path.to_string()));
    }
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, table.schema(), Some(props))?;
    writer.write(table)?;
    writer.close()?;

    info!("Wrote {} rows to {path}", table.num_rows());
    Ok(())
}
