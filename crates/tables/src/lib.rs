//! Table codec, shared by every job executor.
//!
//! Turns named sets of row records into the line-oriented text SAS programs
//! read their input tables from, either as request fields (chunked when
//! large) or as CSV files for upload.
//!
//! Pure functions only. No I/O, no network.

mod encode;
mod error;
mod fields;
mod table;

pub use encode::{
    encode_table, is_special_missing, ColumnKind, ColumnSpec, EncodedTable, MixedTypes,
    BEST_FORMAT, ROW_SEPARATOR,
};
pub use error::{EncodeError, MAX_VALUE_BYTES};
pub use fields::{
    build_request_fields, csv_files, split_chunks, CsvFile, RequestFields, CHUNK_SIZE,
    CSV_CONTENT_TYPE, TABLES_FIELD,
};
pub use table::{Row, Table, TableSet, FORMAT_PREFIX};
