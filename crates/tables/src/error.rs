use thiserror::Error;

/// Longest character value (in encoded bytes) a SAS variable can hold.
pub const MAX_VALUE_BYTES: usize = 32765;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A character value is wider than SAS can store. Raised before anything is sent.
    #[error(
        "table '{table}', column '{column}': value is {width} bytes, the max length of a string value is {MAX_VALUE_BYTES} bytes"
    )]
    LengthExceeded {
        table: String,
        column: String,
        width: usize,
    },
    /// Cells may only hold strings, numbers or null.
    #[error("table '{table}', row {row}, column '{column}': unsupported value {value}")]
    UnsupportedValue {
        table: String,
        row: usize,
        column: String,
        value: String,
    },
    /// The payload (or one of its entries) is not shaped like a table.
    #[error("'{name}' is not a table: {reason}")]
    NotATable { name: String, reason: String },
}
