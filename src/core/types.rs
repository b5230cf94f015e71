use super::Value;

pub type Row = Vec<Value>;

/// Approximate wire size of a row.
pub fn estimated_row_bytes(row: &Row) -> usize {
    row.iter().map(Value::byte_len).sum()
}
