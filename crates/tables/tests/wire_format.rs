//! Round-trip tests against a minimal reader that ingests the upload text the
//! way the SAS-side macros do: header tokens give column names and formats,
//! rows are CRLF-separated, fields are comma-separated with `""` escaping.

use proptest::prelude::*;
use serde_json::{json, Value};

use sasjs_tables::{
    build_request_fields, encode_table, split_chunks, TableSet, CHUNK_SIZE, MAX_VALUE_BYTES,
};

/// Decoded cell: character values stay strings, numbers parse, `.x` stays a
/// special missing token, empty numerics are null.
fn ingest(wire: &str) -> Vec<Vec<(String, Value)>> {
    let mut lines = wire.split("\r\n");
    let header = lines.next().unwrap();
    let columns: Vec<(String, String)> = header
        .split(' ')
        .map(|token| {
            let (name, format) = token.split_once(':').unwrap();
            (name.to_string(), format.to_string())
        })
        .collect();

    lines
        .map(|line| {
            let fields = split_fields(line);
            assert_eq!(fields.len(), columns.len(), "row: {line:?}");
            columns
                .iter()
                .zip(fields)
                .map(|((name, format), raw)| {
                    let value = if format.starts_with('$') {
                        Value::String(raw)
                    } else if raw.is_empty() || raw == "." {
                        Value::Null
                    } else if let Some(token) = raw.strip_prefix('.') {
                        Value::String(format!(".{token}"))
                    } else {
                        serde_json::from_str(&raw).unwrap()
                    };
                    (name.clone(), value)
                })
                .collect()
        })
        .collect()
}

fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;
    let mut at_start = true;

    while let Some(c) = chars.next() {
        match c {
            '"' if at_start => {
                quoted = true;
                at_start = false;
            }
            '"' if quoted => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    quoted = false;
                }
            }
            ',' if !quoted => {
                fields.push(std::mem::take(&mut current));
                at_start = true;
            }
            _ => {
                current.push(c);
                at_start = false;
            }
        }
    }
    fields.push(current);
    fields
}

fn wire_for(value: Value) -> String {
    let set = TableSet::from_value(&value).unwrap();
    encode_table(&set.tables()[0]).unwrap().to_wire()
}

#[test]
fn test_special_characters_survive_ingestion() {
    let vectors = [
        "\t",
        "\n",
        "\r",
        "'",
        "\"",
        ",",
        ";",
        "%",
        "%abc",
        "&amp;",
        "€euro",
        "汉字",
        "😀 emoji",
        "quote \" inside",
        "both\t\"and\"\n",
        "  padded  ",
    ];

    let rows: Vec<Value> = vectors.iter().map(|v| json!({ "var": v })).collect();
    let decoded = ingest(&wire_for(json!({ "data": rows })));

    assert_eq!(decoded.len(), vectors.len());
    for (row, expected) in decoded.iter().zip(vectors) {
        assert_eq!(row[0].1, Value::String(expected.to_string()));
    }
}

#[test]
fn test_crlf_inside_values_normalised_to_lf() {
    let decoded = ingest(&wire_for(json!({ "t": [{ "v": "a\r\nb" }] })));
    assert_eq!(decoded[0][0].1, json!("a\nb"));
}

#[test]
fn test_numbers_nulls_and_special_missings() {
    let decoded = ingest(&wire_for(json!({ "t": [
        { "n": 42, "m": 1.5 },
        { "n": null, "m": "A" },
        { "n": -3, "m": "._" }
    ]})));

    assert_eq!(decoded[0][0].1, json!(42));
    assert_eq!(decoded[1][0].1, Value::Null);
    assert_eq!(decoded[2][0].1, json!(-3));
    assert_eq!(decoded[0][1].1, json!(1.5));
    assert_eq!(decoded[1][1].1, json!(".a"));
    assert_eq!(decoded[2][1].1, json!("._"));
}

#[test]
fn test_length_boundary() {
    let fits = wire_for(json!({ "t": [{ "v": "x".repeat(MAX_VALUE_BYTES) }] }));
    assert!(fits.starts_with(&format!("v:$char{MAX_VALUE_BYTES}.")));

    let set = TableSet::from_value(&json!({ "t": [{ "v": "x".repeat(MAX_VALUE_BYTES + 1) }] }))
        .unwrap();
    assert!(encode_table(&set.tables()[0]).is_err());
    assert!(build_request_fields(&set).is_err());
}

proptest! {
    #[test]
    fn prop_chunks_concatenate_to_original(content in "\\PC{0,2000}", size in 1usize..300) {
        let chunks = split_chunks(&content, size);
        prop_assert!(chunks.iter().all(|c| !c.is_empty() && c.chars().count() <= size));
        prop_assert_eq!(chunks.concat(), content);
    }

    #[test]
    fn prop_character_width_is_max_utf8_len(values in prop::collection::vec("\\PC{1,40}", 1..20)) {
        let rows: Vec<Value> = values.iter().map(|v| json!({ "c": v })).collect();
        let wire = wire_for(json!({ "t": rows }));
        let width = values.iter().map(|v| v.len()).max().unwrap();
        let expected = format!("c:$char{width}.");
        prop_assert!(wire.starts_with(&expected));
    }

    #[test]
    fn prop_numeric_columns_get_numeric_format(values in prop::collection::vec(prop::option::of(-1_000_000i64..1_000_000), 1..20)) {
        let rows: Vec<Value> = values.iter().map(|v| json!({ "n": v })).collect();
        let wire = wire_for(json!({ "t": rows }));
        prop_assert!(wire.starts_with("n:best."));
    }

    #[test]
    fn prop_fragment_count_matches_fragments(count in 1usize..3000) {
        let rows: Vec<Value> = (0..count).map(|i| json!({ "v": format!("row {i} value") })).collect();
        let set = TableSet::from_value(&json!({ "t": rows })).unwrap();
        let fields = build_request_fields(&set).unwrap();
        let wire = encode_table(&set.tables()[0]).unwrap().to_wire();

        match fields.iter().find(|(k, _)| k == "sasjs1data0") {
            Some((_, n)) => {
                let n: usize = n.parse().unwrap();
                let fragments: Vec<&str> = fields
                    .iter()
                    .filter(|(k, _)| k.starts_with("sasjs1data") && k != "sasjs1data0")
                    .map(|(_, v)| v.as_str())
                    .collect();
                prop_assert_eq!(fragments.len(), n);
                prop_assert_eq!(fragments.concat(), wire);
            }
            None => {
                prop_assert!(wire.chars().count() <= CHUNK_SIZE);
                prop_assert!(fields.iter().any(|(k, v)| k == "sasjs1data" && *v == wire));
            }
        }
    }
}
