//! # Result records and assembler
//!
//! Per-object output of the metacalibration fitter and its flattening into one Arrow row.
//!
//! ## Layout
//! -----------------
//! * [`MetacalResult`] holds one [`VariantRecord`] slot per [`MetacalType`] plus the derived
//!   [`ResponseBlock`] (`MC`). The slots are fixed, so the output schema is known statically
//!   ([`result_schema`]).
//! * [`assemble`] joins the identification fields of the source with the ten blocks, each
//!   block's columns suffixed by its label (`g1_noshear`, …, `g1_MC`), into a one-row
//!   [`RecordBatch`].
//! * [`concat_rows`] stacks those rows in order.
//!
//! Every row is checked against [`result_schema`]; a deviation is a
//! [`McalError::SchemaMismatch`] and never silently padded.
use std::sync::{Arc, LazyLock};

use arrow_array::{ArrayRef, Float64Array, Int32Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use arrow_select::concat::concat_batches;

use crate::metacal::{MetacalType, NVARIANTS};
use crate::mcal_errors::McalError;
use crate::observation::Source;

/// Suffix of the responsivity block columns.
pub const MC_LABEL: &str = "MC";

#[inline]
fn int32(v: i32) -> ArrayRef {
    Arc::new(Int32Array::from(vec![v]))
}

#[inline]
fn int64(v: i64) -> ArrayRef {
    Arc::new(Int64Array::from(vec![v]))
}

#[inline]
fn float64(v: f64) -> ArrayRef {
    Arc::new(Float64Array::from(vec![v]))
}

/// Fit summary of one variant.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VariantRecord {
    pub flags: i32,
    pub nfev: i32,
    pub ntry: i32,
    pub g1: f64,
    pub g2: f64,
    pub g1_err: f64,
    pub g2_err: f64,
    pub g_cov12: f64,
    pub t: f64,
    pub t_err: f64,
    pub flux: f64,
    pub flux_err: f64,
    pub flux_s2n: f64,
    pub chi2per: f64,
    pub dof: i32,
    /// Fitted centre, pixel row of the first epoch.
    pub row: f64,
    /// Fitted centre, pixel column of the first epoch.
    pub col: f64,
    pub tpsf: f64,
    pub gpsf1: f64,
    pub gpsf2: f64,
}

impl VariantRecord {
    /// Column names and types, in output order.
    pub const FIELDS: [(&'static str, DataType); 20] = [
        ("flags", DataType::Int32),
        ("nfev", DataType::Int32),
        ("ntry", DataType::Int32),
        ("g1", DataType::Float64),
        ("g2", DataType::Float64),
        ("g1_err", DataType::Float64),
        ("g2_err", DataType::Float64),
        ("g_cov12", DataType::Float64),
        ("T", DataType::Float64),
        ("T_err", DataType::Float64),
        ("flux", DataType::Float64),
        ("flux_err", DataType::Float64),
        ("flux_s2n", DataType::Float64),
        ("chi2per", DataType::Float64),
        ("dof", DataType::Int32),
        ("row", DataType::Float64),
        ("col", DataType::Float64),
        ("Tpsf", DataType::Float64),
        ("gpsf1", DataType::Float64),
        ("gpsf2", DataType::Float64),
    ];

    /// One single-element array per [`FIELDS`](Self::FIELDS) entry.
    pub fn columns(&self) -> [ArrayRef; 20] {
        [
            int32(self.flags),
            int32(self.nfev),
            int32(self.ntry),
            float64(self.g1),
            float64(self.g2),
            float64(self.g1_err),
            float64(self.g2_err),
            float64(self.g_cov12),
            float64(self.t),
            float64(self.t_err),
            float64(self.flux),
            float64(self.flux_err),
            float64(self.flux_s2n),
            float64(self.chi2per),
            int32(self.dof),
            float64(self.row),
            float64(self.col),
            float64(self.tpsf),
            float64(self.gpsf1),
            float64(self.gpsf2),
        ]
    }
}

/// Responsivity matrix, PSF leakage and corrected shear.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResponseBlock {
    pub r11: f64,
    pub r12: f64,
    pub r21: f64,
    pub r22: f64,
    pub rpsf1: f64,
    pub rpsf2: f64,
    /// Corrected shear, first component.
    pub g1: f64,
    /// Corrected shear, second component.
    pub g2: f64,
}

impl ResponseBlock {
    pub const FIELDS: [&'static str; 8] = ["r11", "r12", "r21", "r22", "rpsf1", "rpsf2", "g1", "g2"];

    pub fn columns(&self) -> [ArrayRef; 8] {
        [
            self.r11, self.r12, self.r21, self.r22, self.rpsf1, self.rpsf2, self.g1, self.g2,
        ]
        .map(float64)
    }
}

/// Nine variant fits and the responsivity block of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct MetacalResult {
    variants: [VariantRecord; NVARIANTS],
    pub mc: ResponseBlock,
}

impl MetacalResult {
    pub fn new(variants: [VariantRecord; NVARIANTS], mc: ResponseBlock) -> Self {
        MetacalResult { variants, mc }
    }

    pub fn get(&self, kind: MetacalType) -> &VariantRecord {
        &self.variants[kind.index()]
    }

    /// Variants with their labels, in column order.
    pub fn iter(&self) -> impl Iterator<Item = (MetacalType, &VariantRecord)> {
        MetacalType::ALL.iter().copied().zip(self.variants.iter())
    }

    /// Number of result blocks, variants plus `MC`.
    pub fn nblocks(&self) -> usize {
        NVARIANTS + 1
    }
}

/// Identification columns, in output order.
pub const IDENT_FIELDS: [(&str, DataType); 7] = [
    ("meds_index", DataType::Int64),
    ("id", DataType::Int64),
    ("ra", DataType::Float64),
    ("dec", DataType::Float64),
    ("xwin_image", DataType::Float64),
    ("ywin_image", DataType::Float64),
    ("ncutout", DataType::Int64),
];

fn ident_columns(source: &Source) -> [ArrayRef; 7] {
    [
        int64(source.meds_index as i64),
        int64(source.id),
        float64(source.ra),
        float64(source.dec),
        float64(source.xwin_image),
        float64(source.ywin_image),
        int64(source.ncutout as i64),
    ]
}

static RESULT_SCHEMA: LazyLock<SchemaRef> = LazyLock::new(|| {
    let mut fields: Vec<Field> = IDENT_FIELDS
        .iter()
        .map(|(name, dt)| Field::new(*name, dt.clone(), false))
        .collect();
    for kind in MetacalType::ALL {
        fields.extend(VariantRecord::FIELDS.iter().map(|(name, dt)| {
            Field::new(format!("{name}_{}", kind.label()), dt.clone(), false)
        }));
    }
    fields.extend(
        ResponseBlock::FIELDS
            .iter()
            .map(|name| Field::new(format!("{name}_{MC_LABEL}"), DataType::Float64, false)),
    );
    Arc::new(Schema::new(fields))
});

/// Schema shared by every assembled row and by the output file; all columns non-nullable.
pub fn result_schema() -> SchemaRef {
    Arc::clone(&RESULT_SCHEMA)
}

/// Flatten the result of one object into a one-row batch.
///
/// Arguments
/// -----------------
/// * `mcal`: The fitter output.
/// * `source`: Catalogue entry providing the identification columns.
///
/// Return
/// ----------
/// * A one-row [`RecordBatch`] with the [`result_schema`] columns.
/// * [`McalError::SchemaMismatch`] if the joined blocks deviate from that schema.
pub fn assemble(mcal: &MetacalResult, source: &Source) -> Result<RecordBatch, McalError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(RESULT_SCHEMA.fields().len());
    columns.extend(ident_columns(source));
    for (_, rec) in mcal.iter() {
        columns.extend(rec.columns());
    }
    columns.extend(mcal.mc.columns());

    RecordBatch::try_new(result_schema(), columns)
        .map_err(|e| McalError::SchemaMismatch(format!("object {}: {e}", source.id)))
}

/// Row-stack `rows` in order; zero rows give an empty batch with every column.
///
/// Return
/// ----------
/// * [`McalError::SchemaMismatch`] naming the first field of a row that differs from
///   [`result_schema`].
pub fn concat_rows<'a>(
    rows: impl IntoIterator<Item = &'a RecordBatch>,
) -> Result<RecordBatch, McalError> {
    let schema = result_schema();
    let rows: Vec<&RecordBatch> = rows.into_iter().collect();
    for row in &rows {
        if row.schema_ref() != &schema {
            let detail = schema
                .fields()
                .iter()
                .zip(row.schema_ref().fields().iter())
                .find(|(a, b)| a != b)
                .map(|(a, b)| {
                    format!(
                        "{} ({}) vs {} ({})",
                        a.name(),
                        a.data_type(),
                        b.name(),
                        b.data_type()
                    )
                })
                .unwrap_or_else(|| {
                    format!(
                        "{} vs {} columns",
                        schema.fields().len(),
                        row.num_columns()
                    )
                });
            return Err(McalError::SchemaMismatch(detail));
        }
    }
    concat_batches(&schema, rows).map_err(|e| McalError::SchemaMismatch(e.to_string()))
}

#[cfg(test)]
mod results_test {
    use super::*;
    use arrow_array::cast::AsArray;
    use arrow_array::types::{Float64Type, Int32Type, Int64Type};

    fn source(id: i64) -> Source {
        Source {
            meds_index: id as usize,
            id,
            ra: 10.0,
            dec: -3.0,
            xwin_image: 1.5,
            ywin_image: 2.5,
            ncutout: 3,
        }
    }

    fn result() -> MetacalResult {
        let mut variants = [VariantRecord::default(); NVARIANTS];
        for (i, v) in variants.iter_mut().enumerate() {
            v.g1 = i as f64;
            v.nfev = 10 + i as i32;
        }
        MetacalResult::new(
            variants,
            ResponseBlock {
                r11: 1.0,
                r22: 1.0,
                g1: 0.05,
                ..Default::default()
            },
        )
    }

    fn f64_at(batch: &RecordBatch, name: &str, row: usize) -> f64 {
        batch
            .column_by_name(name)
            .unwrap()
            .as_primitive::<Float64Type>()
            .value(row)
    }

    #[test]
    fn test_schema_size() {
        let schema = result_schema();
        let fields = schema.fields();
        assert_eq!(fields.len(), 7 + 9 * 20 + 8);
        assert_eq!(fields[0].name(), "meds_index");
        assert_eq!(fields[7].name(), "flags_noshear");
        assert_eq!(fields[fields.len() - 1].name(), "g2_MC");
    }

    #[test]
    fn test_assemble_one_row() {
        let row = assemble(&result(), &source(42)).unwrap();
        assert_eq!(row.num_rows(), 1);
        assert_eq!(row.schema(), result_schema());
        assert_eq!(f64_at(&row, "g1_2m", 0), 4.0);
        let nfev = row.column_by_name("nfev_1p_psf").unwrap();
        assert_eq!(nfev.as_primitive::<Int32Type>().value(0), 15);
        let id = row.column_by_name("id").unwrap();
        assert_eq!(id.as_primitive::<Int64Type>().value(0), 42);
        assert_eq!(f64_at(&row, "g1_MC", 0), 0.05);
    }

    #[test]
    fn test_rows_from_different_objects_stack() {
        let a = assemble(&result(), &source(1)).unwrap();
        let b = assemble(&result(), &source(2)).unwrap();
        let t = concat_rows([&a, &b]).unwrap();
        assert_eq!(t.num_rows(), 2);
        let id = t.column_by_name("id").unwrap().as_primitive::<Int64Type>();
        assert_eq!(id.values().to_vec(), vec![1, 2]);
        assert_eq!(result().nblocks(), 10);
        assert_eq!(result().get(MetacalType::M2).g1, 4.0);
    }

    #[test]
    fn test_no_rows_keeps_schema() {
        let t = concat_rows(std::iter::empty::<&RecordBatch>()).unwrap();
        assert_eq!(t.num_rows(), 0);
        assert_eq!(t.schema(), result_schema());
    }

    #[test]
    fn test_foreign_row_rejected() {
        let foreign = RecordBatch::try_new(
            Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)])),
            vec![int64(3)],
        )
        .unwrap();
        let good = assemble(&result(), &source(1)).unwrap();
        assert!(matches!(
            concat_rows([&good, &foreign]),
            Err(McalError::SchemaMismatch(_))
        ));
    }
}
