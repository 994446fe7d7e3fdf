//! Append-only column tables made of Arrow record batch segments.

use arrow::array::{Array as _, BooleanArray, StringArray};
use arrow::compute::filter_record_batch;
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;

use super::statement::{BoundPredicate, Params, Predicate, TableName};
use crate::error::{Result, StoreError};

/// A table: a fixed schema and the list of segments appended to it.
#[derive(Debug)]
pub struct ColumnTable {
    name: TableName,
    schema: SchemaRef,
    segments: Vec<RecordBatch>,
}

impl ColumnTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new(name: TableName, schema: SchemaRef) -> Self {
        Self {
            name,
            schema,
            segments: Vec::new(),
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn name(&self) -> TableName {
        self.name
    }

    /// Returns the total number of physical rows.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.segments.iter().map(RecordBatch::num_rows).sum()
    }

    /// Appends a segment. Empty batches are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch schema differs from the table schema.
    pub fn append(&mut self, batch: RecordBatch) -> Result<usize> {
        if batch.schema() != self.schema {
            return Err(StoreError::invariant(format!(
                "batch schema does not match table '{}'",
                self.name.as_str()
            )));
        }
        let rows = batch.num_rows();
        if rows > 0 {
            self.segments.push(batch);
        }
        Ok(rows)
    }

    /// Returns the rows matching every predicate, one batch per non-empty segment match.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is unbound or a predicate column is missing.
    pub fn select(&self, predicates: &[Predicate], params: &Params) -> Result<Vec<RecordBatch>> {
        let bound = bind_all(predicates, params)?;
        let mut out = Vec::new();
        for segment in &self.segments {
            let mask = evaluate(segment, &bound, false)?;
            let matched = filter_record_batch(segment, &mask)?;
            if matched.num_rows() > 0 {
                out.push(matched);
            }
        }
        Ok(out)
    }

    /// Removes every row matching all predicates. Returns the number of removed rows.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is unbound or a predicate column is missing.
    pub fn delete(&mut self, predicates: &[Predicate], params: &Params) -> Result<usize> {
        let bound = bind_all(predicates, params)?;
        let mut removed = 0;
        let mut kept = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            let keep = evaluate(segment, &bound, true)?;
            let survivors = filter_record_batch(segment, &keep)?;
            removed += segment.num_rows() - survivors.num_rows();
            if survivors.num_rows() > 0 {
                kept.push(survivors);
            }
        }
        self.segments = kept;
        Ok(removed)
    }
}

fn bind_all<'a>(predicates: &[Predicate], params: &'a Params) -> Result<Vec<BoundPredicate<'a>>> {
    predicates.iter().map(|p| p.bind(params)).collect()
}

/// Builds the selection mask for a segment; `negate` selects the complement.
fn evaluate(segment: &RecordBatch, bound: &[BoundPredicate<'_>], negate: bool) -> Result<BooleanArray> {
    let columns = bound
        .iter()
        .map(|p| text_column(segment, p.column))
        .collect::<Result<Vec<_>>>()?;

    let mask: Vec<bool> = (0..segment.num_rows())
        .map(|row| {
            let matched = bound
                .iter()
                .zip(&columns)
                .all(|(predicate, column)| !column.is_null(row) && predicate.matches(column.value(row)));
            matched != negate
        })
        .collect();

    Ok(BooleanArray::from(mask))
}

fn text_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|e| StoreError::invariant(format!("missing column '{name}': {e}")))?;

    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| StoreError::invariant(format!("column '{name}' is not StringArray")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    const BY_KEY: &[Predicate] = &[Predicate::eq("key", "key")];

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Utf8, false),
        ]))
    }

    fn batch(rows: &[(&str, &str)]) -> RecordBatch {
        let keys = StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>());
        let values = StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>());
        RecordBatch::try_new(schema(), vec![Arc::new(keys), Arc::new(values)]).unwrap()
    }

    #[test]
    fn select_filters_across_segments() {
        let mut table = ColumnTable::new(TableName::Traces, schema());
        table.append(batch(&[("a", "1"), ("b", "2")])).unwrap();
        table.append(batch(&[("a", "3")])).unwrap();

        let params = Params::new().bind("key", "a");
        let rows: usize = table
            .select(BY_KEY, &params)
            .unwrap()
            .iter()
            .map(RecordBatch::num_rows)
            .sum();
        assert_eq!(rows, 2);
    }

    #[test]
    fn delete_removes_every_matching_row() {
        let mut table = ColumnTable::new(TableName::Traces, schema());
        table.append(batch(&[("a", "1"), ("b", "2")])).unwrap();
        table.append(batch(&[("a", "3")])).unwrap();

        let removed = table.delete(BY_KEY, &Params::new().bind("key", "a")).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(table.num_rows(), 1);
    }

    #[test]
    fn append_rejects_foreign_schema() {
        let mut table = ColumnTable::new(TableName::Traces, schema());
        let other = Arc::new(Schema::new(vec![Field::new("x", DataType::Utf8, false)]));
        let foreign = RecordBatch::try_new(
            other,
            vec![Arc::new(StringArray::from(vec!["1"]))],
        )
        .unwrap();
        assert!(table.append(foreign).is_err());
    }
}
