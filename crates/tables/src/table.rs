//! In-memory table payloads.
//!
//! A `TableSet` is built from the JSON shape callers already use:
//!
//! ```json
//! {
//!   "people": [{ "name": "Ada", "age": 36 }],
//!   "$people": { "formats": { "name": "$char20.", "age": "best." } }
//! }
//! ```
//!
//! Entries whose key starts with `$` carry an explicit column → format
//! mapping for the table of the same name and are not tables themselves.

use serde_json::{Map, Value};

use crate::error::EncodeError;

/// One row record: column name → string / number / null, in column order.
pub type Row = Map<String, Value>;

/// Prefix marking a format entry in a table payload.
pub const FORMAT_PREFIX: char = '$';

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    rows: Vec<Row>,
    formats: Option<Vec<(String, String)>>,
}

impl Table {
    pub fn new(name: impl Into<String>, rows: Vec<Row>) -> Self {
        Self { name: name.into(), rows, formats: None }
    }

    /// Attach an explicit column → format mapping (e.g. `"$char10."`, `"best."`).
    pub fn with_formats<I, K, V>(mut self, formats: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.formats = Some(
            formats
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn formats(&self) -> Option<&[(String, String)]> {
        self.formats.as_deref()
    }

    pub fn format_for(&self, column: &str) -> Option<&str> {
        self.formats
            .as_ref()?
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, f)| f.as_str())
    }

    /// Column names in first-seen order across all rows.
    pub fn columns(&self) -> Vec<&str> {
        let mut columns: Vec<&str> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !columns.contains(&key.as_str()) {
                    columns.push(key);
                }
            }
        }
        columns
    }

    fn to_value(&self) -> Value {
        Value::Array(self.rows.iter().cloned().map(Value::Object).collect())
    }
}

/// Named tables in the order they were supplied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSet {
    tables: Vec<Table>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, table: Table) -> Self {
        self.push(table);
        self
    }

    /// Add a table, replacing any earlier table with the same name in place.
    pub fn push(&mut self, table: Table) {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Parse the caller-facing JSON shape (see module docs).
    pub fn from_value(value: &Value) -> Result<Self, EncodeError> {
        let obj = value.as_object().ok_or_else(|| EncodeError::NotATable {
            name: "<root>".into(),
            reason: "expected an object of named tables".into(),
        })?;

        let mut set = TableSet::new();
        for (name, entry) in obj {
            if name.starts_with(FORMAT_PREFIX) {
                continue;
            }
            let rows = parse_rows(name, entry)?;
            let mut table = Table::new(name.clone(), rows);
            if let Some(formats) = obj.get(&format!("{FORMAT_PREFIX}{name}")) {
                table.formats = Some(parse_formats(name, formats)?);
            }
            set.push(table);
        }
        Ok(set)
    }

    /// Render back to the caller-facing JSON shape, format entries included.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        for table in &self.tables {
            obj.insert(table.name.clone(), table.to_value());
            if let Some(formats) = &table.formats {
                let formats: Map<String, Value> = formats
                    .iter()
                    .map(|(c, f)| (c.clone(), Value::String(f.clone())))
                    .collect();
                obj.insert(
                    format!("{FORMAT_PREFIX}{}", table.name),
                    serde_json::json!({ "formats": formats }),
                );
            }
        }
        Value::Object(obj)
    }

    /// Compact JSON text of the payload, used by the upload-mode heuristics.
    pub fn to_json_string(&self) -> String {
        self.to_value().to_string()
    }
}

fn parse_rows(name: &str, entry: &Value) -> Result<Vec<Row>, EncodeError> {
    let items = entry.as_array().ok_or_else(|| EncodeError::NotATable {
        name: name.to_string(),
        reason: "expected an array of row records".into(),
    })?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_object().cloned().ok_or_else(|| EncodeError::NotATable {
                name: name.to_string(),
                reason: format!("row {} is not an object", i + 1),
            })
        })
        .collect()
}

fn parse_formats(name: &str, entry: &Value) -> Result<Vec<(String, String)>, EncodeError> {
    // Accept both `{ "formats": {..} }` and a bare mapping.
    let mapping = entry
        .get("formats")
        .unwrap_or(entry)
        .as_object()
        .ok_or_else(|| EncodeError::NotATable {
            name: format!("{FORMAT_PREFIX}{name}"),
            reason: "expected a column to format mapping".into(),
        })?;

    mapping
        .iter()
        .map(|(column, format)| match format.as_str() {
            Some(f) => Ok((column.clone(), f.to_string())),
            None => Err(EncodeError::NotATable {
                name: format!("{FORMAT_PREFIX}{name}"),
                reason: format!("format for column '{column}' is not a string"),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_keeps_table_order_and_formats() {
        let value = json!({
            "zeta": [{ "a": 1 }],
            "alpha": [{ "b": "x" }],
            "$alpha": { "formats": { "b": "$char5." } }
        });

        let set = TableSet::from_value(&value).unwrap();
        let names: Vec<&str> = set.tables().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(set.get("alpha").unwrap().format_for("b"), Some("$char5."));
        assert!(set.get("zeta").unwrap().formats().is_none());
    }

    #[test]
    fn test_bare_format_mapping_accepted() {
        let value = json!({
            "t": [{ "a": null }],
            "$t": { "a": "best." }
        });
        let set = TableSet::from_value(&value).unwrap();
        assert_eq!(set.get("t").unwrap().format_for("a"), Some("best."));
    }

    #[test]
    fn test_columns_union_in_first_seen_order() {
        let value = json!({
            "t": [{ "a": 1, "b": 2 }, { "c": 3, "a": 4 }]
        });
        let set = TableSet::from_value(&value).unwrap();
        assert_eq!(set.get("t").unwrap().columns(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_non_array_table_rejected() {
        let err = TableSet::from_value(&json!({ "t": { "a": 1 } })).unwrap_err();
        assert!(matches!(err, EncodeError::NotATable { ref name, .. } if name == "t"));
    }

    #[test]
    fn test_to_value_includes_format_entries() {
        let set = TableSet::new().with_table(
            Table::new("t", vec![json!({ "a": "x" }).as_object().unwrap().clone()])
                .with_formats([("a", "$char1.")]),
        );
        let value = set.to_value();
        assert_eq!(value["$t"]["formats"]["a"], "$char1.");
        assert_eq!(value["t"][0]["a"], "x");
    }
}
