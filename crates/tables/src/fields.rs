//! Request fields carrying encoded tables.
//!
//! Table `n` (1-based, in supplied order) is sent as `sasjs<n>data`. When the
//! encoded text is longer than [`CHUNK_SIZE`] characters it is split: the
//! `sasjs<n>data0` field holds the fragment count and `sasjs<n>data1..N`
//! hold the fragments in order. `sasjs_tables` lists the table names.

use crate::encode::encode_table;
use crate::error::EncodeError;
use crate::table::TableSet;

pub const CHUNK_SIZE: usize = 16000;
pub const TABLES_FIELD: &str = "sasjs_tables";
pub const CSV_CONTENT_TYPE: &str = "application/csv";

/// Ordered (field name, value) pairs for a form or a job's variables.
pub type RequestFields = Vec<(String, String)>;

/// A table rendered as an uploadable CSV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvFile {
    pub table: String,
    pub file_name: String,
    pub content: String,
}

/// Split into fragments of at most `size` characters. Concatenating the
/// fragments gives back `content` exactly.
pub fn split_chunks(content: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (idx, _) in content.char_indices() {
        if count == size {
            chunks.push(content[start..idx].to_string());
            start = idx;
            count = 0;
        }
        count += 1;
    }
    if start < content.len() {
        chunks.push(content[start..].to_string());
    }
    chunks
}

pub fn build_request_fields(set: &TableSet) -> Result<RequestFields, EncodeError> {
    let mut fields = RequestFields::new();
    let mut names = Vec::with_capacity(set.len());

    for (i, table) in set.tables().iter().enumerate() {
        let index = i + 1;
        let wire = encode_table(table)?.to_wire();
        names.push(table.name().to_string());

        if wire.chars().count() > CHUNK_SIZE {
            let chunks = split_chunks(&wire, CHUNK_SIZE);
            fields.push((format!("sasjs{index}data0"), chunks.len().to_string()));
            for (n, chunk) in chunks.into_iter().enumerate() {
                fields.push((format!("sasjs{index}data{}", n + 1), chunk));
            }
        } else {
            fields.push((format!("sasjs{index}data"), wire));
        }
    }

    fields.push((TABLES_FIELD.to_string(), names.join(" ")));
    Ok(fields)
}

/// Every table as `<name>.csv`, for the file-upload transport.
pub fn csv_files(set: &TableSet) -> Result<Vec<CsvFile>, EncodeError> {
    set.tables()
        .iter()
        .map(|table| {
            let content = encode_table(table)?.to_wire();
            Ok(CsvFile {
                table: table.name().to_string(),
                file_name: format!("{}.csv", table.name()),
                content,
            })
        })
        .collect()
}
