//! Generic tabular results and their conversion into name-addressed rows.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::{models::Value, CollectorError, Result};

/// Result of one query: a header and positional rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<Value>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Binds every row to the header.
    ///
    /// All rows share one column set; a row with a different number of cells
    /// is rejected rather than guessed at.
    pub fn into_rows(self) -> Result<Vec<Row>> {
        let Table { columns, rows } = self;
        rows.into_iter()
            .enumerate()
            .map(|(i, cells)| {
                if cells.len() != columns.len() {
                    return Err(CollectorError::Decode(format!(
                        "row {} has {} values but the result has {} columns",
                        i,
                        cells.len(),
                        columns.len()
                    )));
                }
                Ok(Row {
                    entries: columns.iter().cloned().zip(cells).collect(),
                })
            })
            .collect()
    }
}

/// One record of a query result, addressed by column name.
///
/// Entries keep the result's column order for display; lookups are by name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    entries: Vec<(String, Value)>,
}

impl Row {
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn binds_cells_to_column_names() {
        let mut table = Table::new(vec!["value".into(), "host".into()]);
        table.push(vec![Value::Int(3), "a".into()]);
        table.push(vec![Value::Float(4.5), Value::Null]);

        let rows = table.into_rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("value"), Some(&Value::Int(3)));
        assert_eq!(rows[0].get("host"), Some(&Value::Text("a".into())));
        assert_eq!(rows[1].get("host"), Some(&Value::Null));
        assert_eq!(rows[1].get("missing"), None);
        assert_eq!(rows[1].columns().collect::<Vec<_>>(), vec!["value", "host"]);
    }

    #[test]
    fn rejects_rows_that_do_not_match_the_header() {
        let mut table = Table::new(vec!["value".into(), "host".into()]);
        table.push(vec![Value::Int(1), "a".into()]);
        table.push(vec![Value::Int(2)]);

        let err = table.into_rows().unwrap_err();
        assert!(matches!(err, CollectorError::Decode(ref msg) if msg.contains("row 1")));
    }

    #[test]
    fn empty_result_maps_to_no_rows() {
        let table = Table::new(vec!["value".into()]);
        assert!(table.into_rows().unwrap().is_empty());
    }

    #[test]
    fn row_serializes_as_object_in_column_order() {
        let row: Row = vec![("value", Value::Int(1)), ("job", Value::from("api"))]
            .into_iter()
            .collect();
        assert_eq!(
            serde_json::to_string(&row).unwrap(),
            r#"{"value":1,"job":"api"}"#
        );
    }
}
