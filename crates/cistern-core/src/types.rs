//! Value and result types passed between drivers and the pool

/// A statement parameter or column value. The pool never inspects these;
/// it hands them to the driver unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

/// A row from a query result
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub values: Vec<Value>,
    columns: Vec<String>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Get a value by column index
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// Column metadata reported by a result set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnMeta {
    pub name: String,
    /// 0-based position
    pub ordinal: usize,
}

/// Fully materialized query result
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a result from rows, deriving column metadata from the first row
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(ordinal, name)| ColumnMeta {
                        name: name.clone(),
                        ordinal,
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { columns, rows }
    }

    pub fn has_rows(&self) -> bool {
        !self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Update count of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatementResult {
    pub affected_rows: u64,
}

impl StatementResult {
    pub fn affected(rows: u64) -> Self {
        Self {
            affected_rows: rows,
        }
    }
}
