//! Query results.
//!
//! A [`QueryResult`] accumulates the responses of one statement; a
//! [`ResultGroup`] strings several together for the multi-statement
//! simple-query flow.
use bytes::Bytes;
use std::collections::HashMap;

use crate::protocol::backend::Column;

/// The accumulated outcome of one statement.
///
/// Owned and mutated by the engine while the statement runs; handed to the
/// caller's completion future once finished, or attached to the error when
/// the statement fails midway.
#[derive(Debug, Default)]
pub struct QueryResult {
    columns: Option<Vec<Column>>,
    parameter_oids: Option<Vec<i32>>,
    rows: Vec<Vec<Option<Bytes>>>,
    notices: Vec<HashMap<String, String>>,
    tag: Option<String>,
    rows_affected: Option<u64>,
}

impl QueryResult {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_columns(&mut self, columns: Vec<Column>) {
        self.columns = Some(columns);
    }

    pub(crate) fn set_parameter_oids(&mut self, oids: Vec<i32>) {
        self.parameter_oids = Some(oids);
    }

    pub(crate) fn push_row(&mut self, values: Vec<Option<Bytes>>) {
        self.rows.push(values);
    }

    pub(crate) fn push_notice(&mut self, notice: HashMap<String, String>) {
        self.notices.push(notice);
    }

    /// Finalize with a completion tag, extracting the trailing row count
    /// when the tag carries one (`DELETE 10` processed ten rows).
    pub(crate) fn finish(&mut self, tag: String) {
        self.rows_affected = rows_from_tag(&tag);
        self.tag = Some(tag);
    }

    /// A result is finalized once its tag is assigned; later responses
    /// belong to the next statement of the batch.
    pub fn is_finished(&self) -> bool {
        self.tag.is_some()
    }

    /// Column metadata, when the statement returned a rowset or was
    /// described.
    pub fn columns(&self) -> Option<&[Column]> {
        self.columns.as_deref()
    }

    /// Parameter type oids, when the statement was described.
    pub fn parameter_oids(&self) -> Option<&[i32]> {
        self.parameter_oids.as_deref()
    }

    /// Raw row values in the order received. `None` entries are SQL NULLs.
    pub fn rows(&self) -> &[Vec<Option<Bytes>>] {
        &self.rows
    }

    /// Notices received while the statement ran, keyed by field name.
    pub fn notices(&self) -> &[HashMap<String, String>] {
        &self.notices
    }

    /// The command completion tag, e.g. `SELECT 2`.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Rows processed according to the completion tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// Text of the value at `(row, column)`, when present and utf8.
    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        let value = self.rows.get(row)?.get(column)?.as_ref()?;
        std::str::from_utf8(value).ok()
    }
}

/// Parse the trailing ` <digits>` of a completion tag.
fn rows_from_tag(tag: &str) -> Option<u64> {
    let (_, count) = tag.rsplit_once(' ')?;
    count.parse().ok()
}

/// Results of a whole submission, one [`QueryResult`] per statement.
///
/// At least one result always exists; all but the last may be finalized.
#[derive(Debug)]
pub struct ResultGroup {
    results: Vec<QueryResult>,
}

impl Default for ResultGroup {
    fn default() -> Self {
        Self { results: vec![QueryResult::new()] }
    }
}

impl ResultGroup {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The result currently accumulating. Pushes a fresh one when the last
    /// is already finalized.
    pub(crate) fn current(&mut self) -> &mut QueryResult {
        if self.results.last().is_some_and(QueryResult::is_finished) {
            self.results.push(QueryResult::new());
        }
        self.results.last_mut().unwrap()
    }

    pub fn results(&self) -> &[QueryResult] {
        &self.results
    }

    /// Number of finalized or accumulating results.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn first(&self) -> &QueryResult {
        &self.results[0]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, QueryResult> {
        self.results.iter()
    }

    /// Collapse into the sole result of a single-statement submission.
    pub fn into_single(mut self) -> QueryResult {
        self.results.swap_remove(0)
    }
}

impl IntoIterator for ResultGroup {
    type Item = QueryResult;
    type IntoIter = std::vec::IntoIter<QueryResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_with_row_count() {
        let mut res = QueryResult::new();
        res.finish("DELETE 10".into());
        assert_eq!(res.rows_affected(), Some(10));
        assert_eq!(res.tag(), Some("DELETE 10"));
    }

    #[test]
    fn tag_without_row_count() {
        let mut res = QueryResult::new();
        res.finish("SELECT".into());
        assert_eq!(res.rows_affected(), None);
    }

    #[test]
    fn insert_tag_takes_trailing_count() {
        let mut res = QueryResult::new();
        res.finish("INSERT 0 1".into());
        assert_eq!(res.rows_affected(), Some(1));
    }

    #[test]
    fn group_rolls_over_after_finish() {
        let mut group = ResultGroup::new();
        group.current().push_row(vec![Some(Bytes::from_static(b"1"))]);
        group.current().finish("SELECT 1".into());
        group.current().push_row(vec![Some(Bytes::from_static(b"2"))]);
        assert_eq!(group.len(), 2);
        assert_eq!(group.results()[0].value(0, 0), Some("1"));
        assert_eq!(group.results()[1].value(0, 0), Some("2"));
    }
}
