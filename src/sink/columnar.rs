//! Parquet shards of parsed cases, each kept under a byte ceiling.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arrow::array::{
    Array, ArrayRef, Int32Array, ListBuilder, StringArray, StringBuilder, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use tracing::{debug, warn};

use crate::catalog::{CaseKey, Category};
use crate::parser::ParsedCase;

/// Fraction of the ceiling the row estimate aims for.
const TARGET_FILL: f64 = 0.9;
const PROBE_FILE: &str = "probe.parquet";

pub fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("document_id", DataType::Utf8, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("outcome", DataType::Utf8, false),
        Field::new("inferred_year", DataType::Int32, false),
        Field::new("year_source", DataType::Utf8, false),
        Field::new("decision_date", DataType::Utf8, true),
        Field::new(
            "guidelines",
            DataType::List(Arc::new(Field::new("item", DataType::Utf8, true))),
            false,
        ),
        Field::new("details", DataType::Utf8, false),
        Field::new("summary", DataType::Utf8, false),
        Field::new("full_text", DataType::Utf8, false),
        Field::new("source_url", DataType::Utf8, false),
        Field::new(
            "parsed_at",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]))
}

fn utf8<'c>(cases: &'c [ParsedCase], f: impl Fn(&'c ParsedCase) -> &'c str) -> ArrayRef {
    Arc::new(StringArray::from(cases.iter().map(f).collect::<Vec<_>>()))
}

pub fn to_batch(cases: &[ParsedCase]) -> Result<RecordBatch> {
    let mut guidelines = ListBuilder::new(StringBuilder::new());
    for case in cases {
        for code in &case.guidelines {
            guidelines.values().append_value(code.to_string());
        }
        guidelines.append(true);
    }

    let details = cases
        .iter()
        .map(|c| serde_json::to_string(&c.details))
        .collect::<Result<Vec<_>, _>>()?;

    let columns: Vec<ArrayRef> = vec![
        utf8(cases, |c| c.document_id.as_str()),
        utf8(cases, |c| c.category.as_str()),
        utf8(cases, |c| c.outcome.as_str()),
        Arc::new(Int32Array::from(
            cases.iter().map(|c| c.inferred_year).collect::<Vec<_>>(),
        )),
        utf8(cases, |c| c.year_source.as_str()),
        Arc::new(StringArray::from(
            cases.iter().map(|c| c.decision_date.as_deref()).collect::<Vec<_>>(),
        )),
        Arc::new(guidelines.finish()),
        Arc::new(StringArray::from(details)),
        utf8(cases, |c| c.summary.as_str()),
        utf8(cases, |c| c.full_text.as_str()),
        utf8(cases, |c| c.source_url.as_str()),
        Arc::new(
            TimestampMicrosecondArray::from(
                cases
                    .iter()
                    .map(|c| c.parsed_at.timestamp_micros())
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
    ];
    Ok(RecordBatch::try_new(schema(), columns)?)
}

/// Write one Parquet file and return its size on disk.
pub fn write_file(path: &Path, cases: &[ParsedCase]) -> Result<u64> {
    let batch = to_batch(cases)?;
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(std::fs::metadata(path)?.len())
}

/// `(category, document_id)` of every row, in file order.
pub fn read_keys(path: &Path) -> Result<Vec<CaseKey>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut keys = Vec::new();
    for batch in reader {
        let batch = batch?;
        let categories = string_column(&batch, "category")?;
        let ids = string_column(&batch, "document_id")?;
        for row in 0..batch.num_rows() {
            let category: Category = categories.value(row).parse().map_err(anyhow::Error::msg)?;
            keys.push((category, ids.value(row).to_string()));
        }
    }
    Ok(keys)
}

fn string_column<'b>(batch: &'b RecordBatch, name: &str) -> Result<&'b StringArray> {
    batch
        .column_by_name(name)
        .and_then(|col| col.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| anyhow!("column {name} missing or not utf8"))
}

fn shard_name(index: usize) -> String {
    format!("cases-{index:04}.parquet")
}

/// Bytes per record observed on a probe file of the first `sample` cases.
pub fn estimate_bytes_per_record(dir: &Path, cases: &[ParsedCase], sample: usize) -> Result<f64> {
    let sample = &cases[..sample.max(1).min(cases.len())];
    if sample.is_empty() {
        return Ok(0.0);
    }
    let probe = dir.join(PROBE_FILE);
    let bytes = write_file(&probe, sample)?;
    std::fs::remove_file(&probe)?;
    Ok(bytes as f64 / sample.len() as f64)
}

/// Shard `cases` into `dir` so that no file exceeds `max_bytes`.
///
/// Rows per shard come from a probe estimate. Each shard is checked after
/// writing; one that landed over the ceiling is removed and its rows are
/// written again as two halves. A single record larger than the ceiling is
/// kept alone in its own shard.
pub fn write_shards(
    dir: &Path,
    cases: &[ParsedCase],
    max_bytes: u64,
    sample_rows: usize,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    if cases.is_empty() {
        let path = dir.join(shard_name(0));
        write_file(&path, cases)?;
        return Ok(vec![path]);
    }

    let per_record = estimate_bytes_per_record(dir, cases, sample_rows)?;
    let rows_per_shard = if per_record > 0.0 {
        ((max_bytes as f64 * TARGET_FILL) / per_record).floor().max(1.0) as usize
    } else {
        cases.len()
    };
    debug!(per_record, rows_per_shard, "columnar shard plan");

    let mut paths = Vec::new();
    for chunk in cases.chunks(rows_per_shard) {
        write_bounded(dir, chunk, max_bytes, &mut paths)?;
    }
    Ok(paths)
}

fn write_bounded(
    dir: &Path,
    cases: &[ParsedCase],
    max_bytes: u64,
    paths: &mut Vec<PathBuf>,
) -> Result<()> {
    let path = dir.join(shard_name(paths.len()));
    let size = write_file(&path, cases)?;
    if size <= max_bytes || cases.len() == 1 {
        if size > max_bytes {
            warn!(path = %path.display(), size, max_bytes, "single record exceeds shard ceiling");
        }
        paths.push(path);
        return Ok(());
    }
    debug!(path = %path.display(), size, rows = cases.len(), "shard over ceiling; splitting");
    std::fs::remove_file(&path)?;
    let (left, right) = cases.split_at(cases.len() / 2);
    write_bounded(dir, left, max_bytes, paths)?;
    write_bounded(dir, right, max_bytes, paths)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::testing::cases;

    #[test]
    fn batch_matches_schema() {
        let batch = to_batch(&cases(4, 100)).unwrap();
        assert_eq!(batch.num_rows(), 4);
        assert_eq!(batch.schema(), schema());
        let guidelines = batch.column_by_name("guidelines").unwrap();
        assert_eq!(guidelines.len(), 4);
    }

    #[test]
    fn single_file_round_trips_keys() {
        let dir = tempfile::tempdir().unwrap();
        let input = cases(25, 200);
        let path = dir.path().join("one.parquet");
        write_file(&path, &input).unwrap();
        let keys = read_keys(&path).unwrap();
        assert_eq!(keys, input.iter().map(|c| c.key()).collect::<Vec<_>>());
    }

    #[test]
    fn shards_respect_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let input = cases(400, 2000);
        let max_bytes = 64 * 1024;
        let paths = write_shards(dir.path(), &input, max_bytes, 50).unwrap();
        assert!(paths.len() > 1);
        let mut total = 0;
        for path in &paths {
            assert!(std::fs::metadata(path).unwrap().len() <= max_bytes);
            total += read_keys(path).unwrap().len();
        }
        assert_eq!(total, 400);
        assert!(!dir.path().join(PROBE_FILE).exists());
    }

    #[test]
    fn empty_input_writes_one_empty_shard() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_shards(dir.path(), &[], 1024, 10).unwrap();
        assert_eq!(paths.len(), 1);
        assert!(read_keys(&paths[0]).unwrap().is_empty());
    }
}
