//! Store metrics.
//!
//! Counters for the write, delete and export paths. They complement the
//! structured logs emitted by each operation's span.

use metrics::{counter, describe_counter};

use crate::engine::TableName;

// ============================================================================
// Write Metrics
// ============================================================================

/// Rows appended, by table.
pub const ROWS_WRITTEN: &str = "verso_store_rows_written_total";

/// Write statements retried after a transient failure, by table.
pub const WRITE_RETRIES: &str = "verso_store_write_retries_total";

/// Physical rows removed by deletes, by table.
pub const ROWS_DELETED: &str = "verso_store_rows_deleted_total";

// ============================================================================
// Export Metrics
// ============================================================================

/// Records emitted by streaming exports.
pub const RECORDS_EXPORTED: &str = "verso_store_records_exported_total";

/// Streaming exports ended by the export deadline.
pub const STREAM_TIMEOUTS: &str = "verso_store_stream_timeouts_total";

/// Registers all store metric descriptions.
///
/// Call this once at application startup after initializing the metrics recorder.
pub fn register_metrics() {
    describe_counter!(ROWS_WRITTEN, "Total rows appended to store tables");
    describe_counter!(WRITE_RETRIES, "Total write statements retried after transient failures");
    describe_counter!(ROWS_DELETED, "Total physical rows removed by deletes");
    describe_counter!(RECORDS_EXPORTED, "Total records emitted by streaming exports");
    describe_counter!(STREAM_TIMEOUTS, "Total streaming exports ended by the deadline");
}

/// Records appended rows.
pub fn record_rows_written(table: TableName, rows: usize) {
    counter!(ROWS_WRITTEN, "table" => table.as_str()).increment(rows as u64);
}

/// Records retried write statements.
pub fn record_write_retries(table: TableName, retries: u32) {
    counter!(WRITE_RETRIES, "table" => table.as_str()).increment(u64::from(retries));
}

/// Records removed rows.
pub fn record_rows_deleted(table: TableName, rows: usize) {
    counter!(ROWS_DELETED, "table" => table.as_str()).increment(rows as u64);
}

/// Records exported records.
pub fn record_exported(records: u64) {
    counter!(RECORDS_EXPORTED).increment(records);
}

/// Records an export ended by the deadline.
pub fn record_stream_timeout() {
    counter!(STREAM_TIMEOUTS).increment(1);
}
