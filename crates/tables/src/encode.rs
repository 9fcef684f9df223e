//! Row records → SAS upload text.
//!
//! The header is a single line of space-separated `column:format` tokens.
//! Data rows follow, comma-separated, one per line, lines joined by CRLF.
//! Only three kinds of format are produced: `$charN.` (character),
//! `N.`/`best.` (numeric) and `best.` for columns carrying special missing
//! values (`.A`–`.Z`, `._`).

use serde_json::Value;

use crate::error::{EncodeError, MAX_VALUE_BYTES};
use crate::table::Table;

pub const ROW_SEPARATOR: &str = "\r\n";

/// Format token used for numeric and special-missing columns.
pub const BEST_FORMAT: &str = "best.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Character,
    Numeric,
    /// Numeric with special missing values; strings are written as `.x`.
    Missing,
}

impl ColumnKind {
    fn from_format(format: &str) -> Self {
        if format.starts_with('$') {
            ColumnKind::Character
        } else if format.eq_ignore_ascii_case(BEST_FORMAT) {
            ColumnKind::Missing
        } else {
            ColumnKind::Numeric
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub format: String,
    pub kind: ColumnKind,
}

impl ColumnSpec {
    pub fn header_token(&self) -> String {
        format!("{}:{}", self.name, self.format)
    }
}

/// A column whose values were not all the same type. Encoding still succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixedTypes {
    pub column: String,
    /// 1-based row where the type first changed.
    pub row: usize,
}

/// Wire rendering of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTable {
    name: String,
    columns: Vec<ColumnSpec>,
    rows: Vec<String>,
    mixed_types: Vec<MixedTypes>,
}

impl EncodedTable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn header(&self) -> String {
        self.columns
            .iter()
            .map(ColumnSpec::header_token)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    pub fn mixed_types(&self) -> &[MixedTypes] {
        &self.mixed_types
    }

    /// Header line followed by the data rows, CRLF-joined.
    pub fn to_wire(&self) -> String {
        let mut out = self.header();
        for row in &self.rows {
            out.push_str(ROW_SEPARATOR);
            out.push_str(row);
        }
        out
    }
}

/// `A`, `z`, `_`, `.a`, `._` … but not `.` or `AB`.
pub fn is_special_missing(value: &str) -> bool {
    let token = value.strip_prefix('.').unwrap_or(value);
    let mut chars = token.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(c), None) if c.is_ascii_alphabetic() || c == '_'
    )
}

/// Encode one table. Fails without partial output if an inferred character
/// column is wider than [`MAX_VALUE_BYTES`]. Columns with an explicit format
/// are sent as given.
pub fn encode_table(table: &Table) -> Result<EncodedTable, EncodeError> {
    validate_cells(table)?;

    let mut columns = Vec::new();
    let mut mixed_types = Vec::new();

    for column in table.columns() {
        let spec = match table.format_for(column) {
            Some(format) => ColumnSpec {
                name: column.to_string(),
                format: format.to_string(),
                kind: ColumnKind::from_format(format),
            },
            None => {
                let (spec, mixed) = infer_column(table, column)?;
                if let Some(mixed) = mixed {
                    log::warn!(
                        "table '{}': row ({}), column ({}) has mixed types",
                        table.name(),
                        mixed.row,
                        mixed.column
                    );
                    mixed_types.push(mixed);
                }
                spec
            }
        };
        columns.push(spec);
    }

    // Columns named only in the format mapping are sent empty.
    if let Some(formats) = table.formats() {
        for (name, format) in formats {
            if !columns.iter().any(|c| &c.name == name) {
                columns.push(ColumnSpec {
                    name: name.clone(),
                    format: format.clone(),
                    kind: ColumnKind::from_format(format),
                });
            }
        }
    }

    let rows = table
        .rows()
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| encode_cell(row.get(&c.name), c.kind))
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect();

    Ok(EncodedTable {
        name: table.name().to_string(),
        columns,
        rows,
        mixed_types,
    })
}

/// Cells must be string / number / null.
fn validate_cells(table: &Table) -> Result<(), EncodeError> {
    for (i, row) in table.rows().iter().enumerate() {
        for (column, value) in row {
            if !matches!(value, Value::Null | Value::Number(_) | Value::String(_)) {
                return Err(EncodeError::UnsupportedValue {
                    table: table.name().to_string(),
                    row: i + 1,
                    column: column.clone(),
                    value: value.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn infer_column(
    table: &Table,
    column: &str,
) -> Result<(ColumnSpec, Option<MixedTypes>), EncodeError> {
    let mut has_null_or_number = false;
    let mut has_special_missing = false;
    for row in table.rows() {
        match row.get(column) {
            Some(Value::Null) | Some(Value::Number(_)) => has_null_or_number = true,
            Some(Value::String(s)) if is_special_missing(s) => has_special_missing = true,
            _ => {}
        }
    }

    if has_null_or_number && has_special_missing {
        let spec = ColumnSpec {
            name: column.to_string(),
            format: BEST_FORMAT.to_string(),
            kind: ColumnKind::Missing,
        };
        return Ok((spec, None));
    }

    let mut first_kind: Option<ColumnKind> = None;
    let mut mixed: Option<MixedTypes> = None;
    let mut has_string = false;
    let mut width = 0usize;

    for (i, row) in table.rows().iter().enumerate() {
        let (kind, cell_width) = match row.get(column) {
            Some(Value::String(s)) => {
                has_string = true;
                (ColumnKind::Character, s.len())
            }
            Some(Value::Number(n)) => (ColumnKind::Numeric, n.to_string().len()),
            _ => continue,
        };
        width = width.max(cell_width);
        match first_kind {
            None => first_kind = Some(kind),
            Some(first) if first != kind && mixed.is_none() => {
                mixed = Some(MixedTypes { column: column.to_string(), row: i + 1 });
            }
            Some(_) => {}
        }
    }

    if width > MAX_VALUE_BYTES {
        return Err(EncodeError::LengthExceeded {
            table: table.name().to_string(),
            column: column.to_string(),
            width,
        });
    }

    // Any string makes the column character; numbers in it are written as text.
    let spec = if has_string {
        ColumnSpec {
            name: column.to_string(),
            format: format!("$char{}.", width.max(1)),
            kind: ColumnKind::Character,
        }
    } else {
        ColumnSpec {
            name: column.to_string(),
            format: BEST_FORMAT.to_string(),
            kind: ColumnKind::Numeric,
        }
    };
    Ok((spec, mixed))
}

fn encode_cell(value: Option<&Value>, kind: ColumnKind) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) if kind == ColumnKind::Missing && is_special_missing(s) => {
            format!(".{}", s.trim_start_matches('.').to_lowercase())
        }
        Some(Value::String(s)) if kind == ColumnKind::Missing && s.is_empty() => ".".to_string(),
        Some(Value::String(s)) => quote_value(s),
        // Rejected by validate_cells.
        Some(_) => String::new(),
    }
}

/// Double embedded quotes; keep the surrounding quotes only when the value
/// would otherwise break the row.
fn quote_value(raw: &str) -> String {
    let normalized = raw.replace("\r\n", "\n");
    let needs_quotes = normalized.contains(['\t', '\r', '\n', ',', '"']);
    let escaped = normalized.replace('"', "\"\"");
    if needs_quotes {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::TableSet;
    use serde_json::json;

    fn encode(value: serde_json::Value, name: &str) -> Result<EncodedTable, EncodeError> {
        let set = TableSet::from_value(&value).unwrap();
        encode_table(set.get(name).unwrap())
    }

    #[test]
    fn test_numeric_and_character_headers() {
        let encoded = encode(
            json!({ "t": [
                { "num": 1, "str": "abc" },
                { "num": null, "str": "abcdef" }
            ]}),
            "t",
        )
        .unwrap();
        assert_eq!(encoded.header(), "num:best. str:$char6.");
        assert_eq!(encoded.to_wire(), "num:best. str:$char6.\r\n1,abc\r\n,abcdef");
    }

    #[test]
    fn test_width_counts_utf8_bytes() {
        // '€' is 3 bytes, '😀' (a surrogate pair in UTF-16) is 4.
        let encoded = encode(json!({ "t": [{ "c": "€euro" }, { "c": "😀" }] }), "t").unwrap();
        assert_eq!(encoded.header(), "c:$char7.");
    }

    #[test]
    fn test_empty_strings_are_character() {
        let encoded = encode(json!({ "t": [{ "c": "" }, { "c": "" }] }), "t").unwrap();
        assert_eq!(encoded.header(), "c:$char1.");
        assert_eq!(encoded.rows(), &["".to_string(), "".to_string()]);
    }

    #[test]
    fn test_special_missing_column_uses_best() {
        let encoded = encode(
            json!({ "t": [{ "m": 5 }, { "m": "A" }, { "m": ".b" }, { "m": "_" }, { "m": null }] }),
            "t",
        )
        .unwrap();
        assert_eq!(encoded.header(), "m:best.");
        assert_eq!(encoded.rows(), &["5", ".a", ".b", "._", ""]);
    }

    #[test]
    fn test_special_missing_without_numbers_stays_character() {
        let encoded = encode(json!({ "t": [{ "m": "A" }, { "m": "B" }] }), "t").unwrap();
        assert_eq!(encoded.header(), "m:$char1.");
        assert_eq!(encoded.rows(), &["A", "B"]);
    }

    #[test]
    fn test_explicit_formats_used_verbatim() {
        let encoded = encode(
            json!({
                "t": [{ "a": "x", "b": 1 }, { "a": "", "b": "Z" }],
                "$t": { "formats": { "b": "best.", "a": "$char10." } }
            }),
            "t",
        )
        .unwrap();
        assert_eq!(encoded.header(), "a:$char10. b:best.");
        assert_eq!(encoded.rows(), &["x,1", ",.z"]);
    }

    #[test]
    fn test_empty_value_under_best_is_dot() {
        let encoded = encode(
            json!({ "t": [{ "a": "" }], "$t": { "formats": { "a": "best." } } }),
            "t",
        )
        .unwrap();
        assert_eq!(encoded.rows(), &["."]);
    }

    #[test]
    fn test_quoting_rules() {
        assert_eq!(quote_value("plain"), "plain");
        assert_eq!(quote_value("a,b"), "\"a,b\"");
        assert_eq!(quote_value("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(quote_value("tab\there"), "\"tab\there\"");
        assert_eq!(quote_value("line\r\nbreak"), "\"line\nbreak\"");
        assert_eq!(quote_value("semi;colon"), "semi;colon");
        assert_eq!(quote_value("it's"), "it's");
    }

    #[test]
    fn test_length_exceeded_is_all_or_nothing() {
        let long = "x".repeat(MAX_VALUE_BYTES + 1);
        let err = encode(json!({ "t": [{ "ok": "a", "big": long }] }), "t").unwrap_err();
        assert_eq!(
            err,
            EncodeError::LengthExceeded {
                table: "t".into(),
                column: "big".into(),
                width: MAX_VALUE_BYTES + 1,
            }
        );
    }

    #[test]
    fn test_explicit_format_skips_width_limit() {
        let long = "x".repeat(MAX_VALUE_BYTES + 1);
        let encoded = encode(
            json!({ "t": [{ "big": long }], "$t": { "formats": { "big": "$char40000." } } }),
            "t",
        )
        .unwrap();
        assert_eq!(encoded.header(), "big:$char40000.");
        assert_eq!(encoded.rows()[0].len(), MAX_VALUE_BYTES + 1);
    }

    #[test]
    fn test_length_limit_is_in_bytes_not_chars() {
        // 10923 * 3 bytes = 32769 > 32765, but only 10923 chars.
        let wide = "€".repeat(10923);
        let err = encode(json!({ "t": [{ "c": wide }] }), "t").unwrap_err();
        assert!(matches!(err, EncodeError::LengthExceeded { width: 32769, .. }));

        let fits = "x".repeat(MAX_VALUE_BYTES);
        let encoded = encode(json!({ "t": [{ "c": fits }] }), "t").unwrap();
        assert_eq!(encoded.header(), format!("c:$char{MAX_VALUE_BYTES}."));
    }

    #[test]
    fn test_mixed_types_are_reported_not_fatal() {
        let encoded = encode(json!({ "t": [{ "c": 10 }, { "c": "abc" }] }), "t").unwrap();
        assert_eq!(encoded.header(), "c:$char3.");
        assert_eq!(encoded.rows(), &["10", "abc"]);
        assert_eq!(
            encoded.mixed_types(),
            &[MixedTypes { column: "c".into(), row: 2 }]
        );
    }

    #[test]
    fn test_unsupported_value_rejected() {
        let err = encode(json!({ "t": [{ "c": true }] }), "t").unwrap_err();
        assert!(matches!(err, EncodeError::UnsupportedValue { row: 1, .. }));
    }

    #[test]
    fn test_missing_cells_align_to_header() {
        let encoded = encode(json!({ "t": [{ "a": 1 }, { "b": "x", "a": 2 }] }), "t").unwrap();
        assert_eq!(encoded.header(), "a:best. b:$char1.");
        assert_eq!(encoded.rows(), &["1,", "2,x"]);
    }

    #[test]
    fn test_is_special_missing() {
        for ok in ["A", "z", "_", ".a", "._", ".Z"] {
            assert!(is_special_missing(ok), "{ok}");
        }
        for no in [".", "", "AB", ".ab", "1", ".1", "a."] {
            assert!(!is_special_missing(no), "{no}");
        }
    }
}
