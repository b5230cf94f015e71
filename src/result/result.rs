use crate::core::{Row, estimated_row_bytes};
use serde::{Deserialize, Serialize};

/// Result of one statement on one or more backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<String>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    pub insert_id: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(fields: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            fields,
            rows,
            rows_affected: 0,
            insert_id: 0,
        }
    }

    /// A result for a statement that touched rows but returned none.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.rows.iter().map(estimated_row_bytes).sum()
    }

    /// Position of a column by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.eq_ignore_ascii_case(name))
    }

    /// Merges a result from another backend into this one.
    ///
    /// Fields come from the first non-empty result, rows are concatenated
    /// and affected-row counts summed. Row order is whatever order the
    /// merges happen in.
    pub fn append(&mut self, other: QueryResult) {
        if self.fields.is_empty() {
            self.fields = other.fields;
        }
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
        self.insert_id = self.insert_id.max(other.insert_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[test]
    fn test_append_merges_rows_and_counts() {
        let mut merged = QueryResult::empty();
        merged.append(QueryResult::new(
            vec!["id".into()],
            vec![vec![Value::Integer(1)]],
        ));
        merged.append(QueryResult {
            rows_affected: 3,
            insert_id: 9,
            ..QueryResult::new(vec!["other".into()], vec![vec![Value::Integer(2)]])
        });

        assert_eq!(merged.fields, vec!["id".to_string()]);
        assert_eq!(merged.row_count(), 2);
        assert_eq!(merged.rows_affected, 3);
        assert_eq!(merged.insert_id, 9);
    }

    #[test]
    fn test_field_index_is_case_insensitive() {
        let result = QueryResult::new(vec!["formatID".into(), "data".into()], vec![]);
        assert_eq!(result.field_index("DATA"), Some(1));
        assert_eq!(result.field_index("missing"), None);
    }
}
