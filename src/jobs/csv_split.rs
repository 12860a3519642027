use super::{AppContext, StoredFile};
use crate::api_client::Row;
use crate::background_job::{BackgroundJob, Concurrency};
use crate::errors::JobError;
use crate::fields::coerce;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::info;

/// One file is split by at most one worker at a time.
const SPLIT_EXCLUSION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Reads a stored attachment back, validates and parses it, and builds the
/// linear continuation chain of [`super::BatchDispatchJob`]s: batch 1 is
/// enqueued immediately, batch k+1 only runs after batch k succeeded.
///
/// A file with no data rows succeeds without enqueueing anything; no reply is
/// sent for it.
#[derive(Debug, Serialize, Deserialize)]
pub struct CsvSplitJob {
    file: StoredFile,
}

impl CsvSplitJob {
    /// Split the given stored attachment.
    pub fn new(file: StoredFile) -> Self {
        Self { file }
    }
}

impl BackgroundJob for CsvSplitJob {
    const JOB_NAME: &'static str = "csv-split";

    type Context = AppContext;

    fn concurrency(&self) -> Option<Concurrency> {
        Some(Concurrency::new(
            format!("csv-split:{}", self.file.object_key),
            SPLIT_EXCLUSION_WINDOW,
        ))
    }

    async fn run(&self, ctx: AppContext) -> Result<(), JobError> {
        // Store trouble is worth retrying; a malformed file never is.
        let mut stream = ctx
            .objects
            .get_stream(&self.file.object_key)
            .await
            .map_err(JobError::retryable)?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(JobError::retryable)?;

        let batches = split_into_batches(&raw, ctx.settings.batch_size).map_err(JobError::fatal)?;

        if batches.is_empty() {
            info!(file = %self.file.filename, "File has no data rows; nothing to dispatch");
            return Ok(());
        }

        let total_batches = batches.len();
        let mut parent: Option<i64> = None;

        for (index, rows) in batches.into_iter().enumerate() {
            let job =
                super::BatchDispatchJob::new(self.file.clone(), index + 1, total_batches, rows);

            let id = match parent {
                None => job
                    .enqueue(&ctx.jobs)
                    .await
                    .map_err(JobError::retryable)?
                    .ok_or_else(|| {
                        JobError::fatal(anyhow::anyhow!("first batch was unexpectedly deduplicated"))
                    })?,
                Some(parent_id) => job
                    .enqueue_after(&ctx.jobs, parent_id)
                    .await
                    .map_err(JobError::retryable)?,
            };

            parent = Some(id);
        }

        info!(
            file = %self.file.filename,
            batches = total_batches,
            "Continuation chain built"
        );
        Ok(())
    }
}

/// Error type for CSV validation and parsing; always a permanent failure.
#[derive(Debug, thiserror::Error)]
pub enum SplitError {
    /// The file has no usable header row.
    #[error("csv file has no non-empty header row")]
    MissingHeader,

    /// The file violates the CSV grammar (unbalanced quotes and the like).
    #[error("malformed csv: {0}")]
    Malformed(#[from] csv::Error),
}

/// Parse `raw` into contiguous batches of at most `batch_size` coerced rows.
///
/// Quoted fields, embedded separators and newlines, and doubled quotes are
/// handled by the parser; short records are padded with empty fields and
/// blank lines are skipped.
pub fn split_into_batches(raw: &[u8], batch_size: usize) -> Result<Vec<Vec<Row>>, SplitError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(raw);

    let headers = reader.headers()?.clone();
    if headers.is_empty() || headers.iter().all(|name| name.trim().is_empty()) {
        return Err(SplitError::MissingHeader);
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        // A lone empty field is what a stray blank-ish line parses into.
        if record.len() == 1 && record.get(0) == Some("") {
            continue;
        }

        let mut row = Row::new();
        for (index, name) in headers.iter().enumerate() {
            let cell = record.get(index).unwrap_or("");
            row.insert(name.to_string(), coerce(cell).into_json());
        }
        rows.push(row);
    }

    let batch_size = batch_size.max(1);
    Ok(rows.chunks(batch_size).map(<[Row]>::to_vec).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_list(rows: usize) -> Vec<u8> {
        let mut csv = String::from("Product,SKU,Price,Category\n");
        for i in 0..rows {
            csv.push_str(&format!("Product {i},SKU-{i},9.99,Tools\n"));
        }
        csv.into_bytes()
    }

    #[test]
    fn empty_input_has_no_header() {
        assert!(matches!(
            split_into_batches(b"", 1000),
            Err(SplitError::MissingHeader)
        ));
    }

    #[test]
    fn header_only_files_yield_zero_batches() {
        let batches = split_into_batches(&price_list(0), 1000).unwrap();
        assert!(batches.is_empty());
    }

    #[test]
    fn exactly_one_batch_at_the_boundary() {
        let batches = split_into_batches(&price_list(1000), 1000).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1000);
    }

    #[test]
    fn one_extra_row_spills_into_a_second_batch() {
        let batches = split_into_batches(&price_list(1001), 1000).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1]);
    }

    #[test]
    fn twenty_five_hundred_rows_make_three_batches() {
        let batches = split_into_batches(&price_list(2500), 1000).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1000, 1000, 500]);
    }

    #[test]
    fn quoted_fields_survive_commas_newlines_and_doubled_quotes() {
        let csv = "Product,Notes\n\"Widget, large\",\"He said \"\"hi\"\"\nsecond line\"\n";
        let batches = split_into_batches(csv.as_bytes(), 10).unwrap();

        assert_eq!(batches.len(), 1);
        let row = &batches[0][0];
        assert_eq!(row["Product"], serde_json::json!("Widget, large"));
        assert_eq!(row["Notes"], serde_json::json!("He said \"hi\"\nsecond line"));
    }

    #[test]
    fn short_records_are_padded_with_empty_fields() {
        let csv = "Product,SKU,Price\nWidget\n";
        let batches = split_into_batches(csv.as_bytes(), 10).unwrap();

        let row = &batches[0][0];
        assert_eq!(row["Product"], serde_json::json!("Widget"));
        assert_eq!(row["SKU"], serde_json::json!(""));
        assert_eq!(row["Price"], serde_json::json!(""));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let csv = "Product,Price\nWidget,1.50\n\nGadget,2.50\n";
        let batches = split_into_batches(csv.as_bytes(), 10).unwrap();
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn cells_are_coerced_through_the_ladder() {
        let csv = "Active,Price,Since,Name\ntrue,99.99,2024-01-15,text\n";
        let batches = split_into_batches(csv.as_bytes(), 10).unwrap();

        let row = &batches[0][0];
        assert_eq!(row["Active"], serde_json::json!(true));
        assert_eq!(row["Price"], serde_json::json!(99.99));
        assert_eq!(row["Since"], serde_json::json!("2024-01-15T00:00:00Z"));
        assert_eq!(row["Name"], serde_json::json!("text"));
    }

    #[test]
    fn non_utf8_content_is_malformed() {
        let csv = b"Product,Price\nWid\xffget,1.50\n";
        assert!(matches!(
            split_into_batches(csv, 10),
            Err(SplitError::Malformed(_))
        ));
    }
}
