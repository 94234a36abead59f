use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::ser::{SerializeMap, SerializeStruct};
use serde::{Serialize, Serializer};
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;
use tokio_postgres::{types::Type, Row};

use crate::error::AdapterError;

/// Categorized error types for SQL query failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorCategory {
    /// Syntax errors (SQLSTATE class 42 - syntax_error, etc.)
    Syntax,
    /// Semantic errors (missing table/column, ambiguous reference)
    Semantic,
    /// Execution/runtime errors (division by zero, constraint violation)
    Execution,
    /// Transaction state errors (e.g., transaction aborted)
    Transaction,
    /// Connection/communication errors
    Connection,
    /// Statement cancelled by the server (SQLSTATE 57014)
    Cancelled,
    /// Unknown or unclassified errors
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Syntax => write!(f, "Syntax Error"),
            ErrorCategory::Semantic => write!(f, "Semantic Error"),
            ErrorCategory::Execution => write!(f, "Execution Error"),
            ErrorCategory::Transaction => write!(f, "Transaction Error"),
            ErrorCategory::Connection => write!(f, "Connection Error"),
            ErrorCategory::Cancelled => write!(f, "Query Cancelled"),
            ErrorCategory::Unknown => write!(f, "Error"),
        }
    }
}

/// Structured error with context from PostgreSQL error responses.
#[derive(Debug, Clone)]
pub struct StructuredError {
    pub category: ErrorCategory,
    /// SQLSTATE error code (e.g., "42601" for syntax_error)
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// Table associated with the error
    pub table: Option<String>,
    /// Column associated with the error
    pub column: Option<String>,
    /// Computed line number (1-based) from position, if available
    pub line: Option<usize>,
    /// Computed column number (1-based) from position, if available
    pub col: Option<usize>,
}

impl StructuredError {
    /// Create a StructuredError from a tokio_postgres error, using the query text
    /// to compute line/column from the byte position.
    pub fn from_pg_error(err: &tokio_postgres::Error, query: &str) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let code_str = db_err.code().code().to_string();
            let category = categorize_sqlstate(&code_str);
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });

            let (line, col) = match position {
                Some(pos) => byte_offset_to_line_col(query, pos as usize),
                None => (None, None),
            };

            StructuredError {
                category,
                code: code_str,
                message: db_err.message().to_string(),
                detail: db_err.detail().map(|s| s.to_string()),
                hint: db_err.hint().map(|s| s.to_string()),
                table: db_err.table().map(|s| s.to_string()),
                column: db_err.column().map(|s| s.to_string()),
                line,
                col,
            }
        } else {
            // Non-database error: closed socket, protocol failure, parameter encoding.
            let io_failure = err
                .source()
                .is_some_and(|s| s.is::<std::io::Error>());
            let category = if err.is_closed() || io_failure {
                ErrorCategory::Connection
            } else {
                ErrorCategory::Unknown
            };
            StructuredError {
                category,
                code: String::new(),
                message: err.to_string(),
                detail: err.source().map(|e| e.to_string()),
                hint: None,
                table: None,
                column: None,
                line: None,
                col: None,
            }
        }
    }

    /// Format as a single line suitable for an error message.
    pub fn display_full(&self) -> String {
        let mut parts = vec![format!("{}: {}", self.category, self.message)];

        if let (Some(line), Some(col)) = (self.line, self.col) {
            parts.push(format!("at line {}, column {}", line, col));
        }
        if !self.code.is_empty() {
            parts.push(format!("SQLSTATE {}", self.code));
        }
        if let Some(detail) = &self.detail {
            parts.push(format!("detail: {}", detail));
        }
        if let Some(hint) = &self.hint {
            parts.push(format!("hint: {}", hint));
        }
        match (&self.table, &self.column) {
            (Some(table), Some(column)) => parts.push(format!("object: {}.{}", table, column)),
            (Some(table), None) => parts.push(format!("table: {}", table)),
            _ => {}
        }

        parts.join("; ")
    }

    /// Map onto the adapter error taxonomy.
    pub fn into_adapter_error(self) -> AdapterError {
        match self.category {
            ErrorCategory::Connection => AdapterError::Connection(self.display_full()),
            _ => AdapterError::Execution(self.display_full()),
        }
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Convert a 1-based byte offset in a query string to (line, column) both 1-based.
fn byte_offset_to_line_col(query: &str, byte_pos: usize) -> (Option<usize>, Option<usize>) {
    if byte_pos == 0 || query.is_empty() {
        return (Some(1), Some(1));
    }
    let target = (byte_pos - 1).min(query.len()); // PostgreSQL positions are 1-based
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in query.char_indices() {
        if i >= target {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (Some(line), Some(col))
}

/// Categorize a SQLSTATE code into an ErrorCategory.
fn categorize_sqlstate(code: &str) -> ErrorCategory {
    if code.len() < 2 {
        return ErrorCategory::Unknown;
    }
    if code == "57014" {
        return ErrorCategory::Cancelled;
    }
    let class = &code[..2];
    match class {
        // Class 42: Syntax Error or Access Rule Violation
        "42" => {
            if code == "42601" || code == "42000" {
                ErrorCategory::Syntax
            } else {
                // 42P01 = undefined_table, 42703 = undefined_column, etc.
                ErrorCategory::Semantic
            }
        }
        // Data exceptions, constraint violations, resource limits
        "22" | "23" | "53" | "54" | "55" | "57" => ErrorCategory::Execution,
        // Invalid transaction state, transaction rollback
        "25" | "40" => ErrorCategory::Transaction,
        // Class 08: Connection Exception
        "08" => ErrorCategory::Connection,
        _ => ErrorCategory::Unknown,
    }
}

/// A result column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Backend-neutral cell value.
///
/// Integers of every width collapse into `Int` and floating/numeric values
/// into `Float`, so the same query yields the same variants on every backend.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
    Array(Vec<CellValue>),
    Unknown(String),
}

impl CellValue {
    pub fn display(&self) -> String {
        match self {
            CellValue::Null => "NULL".to_string(),
            CellValue::Bool(b) => b.to_string(),
            CellValue::Int(i) => i.to_string(),
            CellValue::Float(f) => f.to_string(),
            CellValue::Text(s) => s.clone(),
            CellValue::Bytes(b) => format!("[{} bytes]", b.len()),
            CellValue::Date(d) => d.to_string(),
            CellValue::Time(t) => t.to_string(),
            CellValue::DateTime(dt) => dt.to_string(),
            CellValue::TimestampTz(dt) => dt.to_rfc3339(),
            CellValue::Json(j) => j.to_string(),
            CellValue::Array(arr) => {
                let items: Vec<String> = arr.iter().map(|v| v.display()).collect();
                format!("{{{}}}", items.join(", "))
            }
            CellValue::Unknown(s) => s.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CellValue::Null => "null",
            CellValue::Bool(_) => "bool",
            CellValue::Int(_) => "int",
            CellValue::Float(_) => "float",
            CellValue::Text(_) => "text",
            CellValue::Bytes(_) => "bytes",
            CellValue::Date(_) => "date",
            CellValue::Time(_) => "time",
            CellValue::DateTime(_) => "datetime",
            CellValue::TimestampTz(_) => "timestamptz",
            CellValue::Json(_) => "json",
            CellValue::Array(_) => "array",
            CellValue::Unknown(_) => "unknown",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            CellValue::Null => serde_json::Value::Null,
            CellValue::Bool(b) => serde_json::Value::Bool(*b),
            CellValue::Int(i) => serde_json::json!(*i),
            CellValue::Float(f) => serde_json::json!(*f),
            CellValue::Json(j) => j.clone(),
            CellValue::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(CellValue::to_json).collect())
            }
            other => serde_json::Value::String(other.display()),
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Normalized, backend-independent query output.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Vec<CellValue>>,
    pub row_count: usize,
    /// True when `limit` cut rows off the unrestricted result.
    pub truncated: bool,
    pub execution_time: Duration,
}

impl ResultSet {
    pub fn new(
        columns: Vec<ColumnInfo>,
        rows: Vec<Vec<CellValue>>,
        truncated: bool,
        execution_time: Duration,
    ) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            truncated,
            execution_time,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Value of `field` in row `row`.
    pub fn get(&self, row: usize, field: &str) -> Option<&CellValue> {
        let idx = self.column_index(field)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Iterate row `row` as `(field, value)` pairs in column order.
    pub fn row(&self, row: usize) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns
            .iter()
            .map(|c| c.name.as_str())
            .zip(self.rows.get(row).into_iter().flatten())
    }
}

/// Trim rows fetched with one extra row down to `limit`.
///
/// Returns whether anything was cut off.
pub fn apply_limit<T>(rows: &mut Vec<T>, limit: Option<u64>) -> bool {
    match limit {
        Some(limit) if rows.len() as u64 > limit => {
            rows.truncate(limit as usize);
            true
        }
        _ => false,
    }
}

struct RowMap<'a> {
    columns: &'a [ColumnInfo],
    row: &'a [CellValue],
}

impl Serialize for RowMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (col, value) in self.columns.iter().zip(self.row) {
            map.serialize_entry(&col.name, value)?;
        }
        map.end()
    }
}

impl Serialize for ResultSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let rows: Vec<RowMap<'_>> = self
            .rows
            .iter()
            .map(|row| RowMap {
                columns: &self.columns,
                row,
            })
            .collect();
        let mut state = serializer.serialize_struct("ResultSet", 5)?;
        state.serialize_field("columns", &self.columns)?;
        state.serialize_field("rows", &rows)?;
        state.serialize_field("row_count", &self.row_count)?;
        state.serialize_field("truncated", &self.truncated)?;
        state.serialize_field("execution_ms", &(self.execution_time.as_millis() as u64))?;
        state.end()
    }
}

/// Convert PostgreSQL rows into a result set. A value that cannot be
/// decoded fails the whole result.
pub fn parse_rows(
    rows: &[Row],
    truncated: bool,
    execution_time: Duration,
) -> Result<ResultSet, AdapterError> {
    let Some(first_row) = rows.first() else {
        return Ok(ResultSet::new(vec![], vec![], truncated, execution_time));
    };

    let columns: Vec<ColumnInfo> = first_row
        .columns()
        .iter()
        .map(|col| ColumnInfo::new(col.name(), col.type_().name()))
        .collect();

    let result_rows: Vec<Vec<CellValue>> = rows
        .iter()
        .map(|row| {
            row.columns()
                .iter()
                .enumerate()
                .map(|(i, col)| extract_value(row, i, col.type_()))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ResultSet::new(columns, result_rows, truncated, execution_time))
}

fn get<'a, T>(
    row: &'a Row,
    idx: usize,
    wrap: impl FnOnce(T) -> CellValue,
) -> Result<CellValue, AdapterError>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    let column = row.columns().get(idx).map_or("?", |c| c.name());
    to_cell(row.try_get::<_, Option<T>>(idx), column, wrap)
}

fn to_cell<T, E: fmt::Display>(
    decoded: Result<Option<T>, E>,
    column: &str,
    wrap: impl FnOnce(T) -> CellValue,
) -> Result<CellValue, AdapterError> {
    match decoded {
        Ok(value) => Ok(value.map_or(CellValue::Null, wrap)),
        Err(e) => Err(AdapterError::Execution(format!(
            "cannot decode column '{}': {}",
            column, e
        ))),
    }
}

fn extract_value(row: &Row, idx: usize, pg_type: &Type) -> Result<CellValue, AdapterError> {
    match *pg_type {
        Type::BOOL => get(row, idx, CellValue::Bool),
        Type::INT2 => get(row, idx, |v: i16| CellValue::Int(v as i64)),
        Type::INT4 => get(row, idx, |v: i32| CellValue::Int(v as i64)),
        Type::INT8 => get(row, idx, CellValue::Int),
        Type::FLOAT4 => get(row, idx, |v: f32| CellValue::Float(v as f64)),
        Type::FLOAT8 => get(row, idx, CellValue::Float),
        Type::NUMERIC => get(row, idx, numeric_to_cell),
        Type::TEXT | Type::VARCHAR | Type::NAME | Type::CHAR | Type::BPCHAR => {
            get(row, idx, CellValue::Text)
        }
        Type::BYTEA => get(row, idx, CellValue::Bytes),
        Type::DATE => get(row, idx, CellValue::Date),
        Type::TIME => get(row, idx, CellValue::Time),
        Type::TIMESTAMP => get(row, idx, CellValue::DateTime),
        Type::TIMESTAMPTZ => get(row, idx, CellValue::TimestampTz),
        Type::JSON | Type::JSONB => get(row, idx, CellValue::Json),
        Type::INT4_ARRAY => get(row, idx, |v: Vec<Option<i32>>| {
            CellValue::Array(
                v.into_iter()
                    .map(|i| i.map_or(CellValue::Null, |i| CellValue::Int(i as i64)))
                    .collect(),
            )
        }),
        Type::INT8_ARRAY => get(row, idx, |v: Vec<Option<i64>>| {
            CellValue::Array(
                v.into_iter()
                    .map(|i| i.map_or(CellValue::Null, CellValue::Int))
                    .collect(),
            )
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get(row, idx, |v: Vec<Option<String>>| {
            CellValue::Array(
                v.into_iter()
                    .map(|s| s.map_or(CellValue::Null, CellValue::Text))
                    .collect(),
            )
        }),
        // Types without a decoder are passed through labelled, not failed.
        _ => Ok(match row.try_get::<_, Option<String>>(idx) {
            Ok(Some(s)) => CellValue::Text(s),
            Ok(None) => CellValue::Null,
            Err(_) => CellValue::Unknown(format!("<{}>", pg_type.name())),
        }),
    }
}

/// Whole numbers (`SUM` over integers yields NUMERIC) become `Int`, matching
/// what MongoDB returns for the same aggregate.
fn numeric_to_cell(d: Decimal) -> CellValue {
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return CellValue::Int(i);
        }
    }
    match d.to_f64() {
        Some(f) => CellValue::Float(f),
        None => CellValue::Text(d.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet::new(
            vec![ColumnInfo::new("id", "int4"), ColumnInfo::new("name", "text")],
            vec![
                vec![CellValue::Int(1), CellValue::Text("Alice".into())],
                vec![CellValue::Int(2), CellValue::Null],
            ],
            false,
            Duration::from_millis(3),
        )
    }

    #[test]
    fn test_cell_display() {
        assert_eq!(CellValue::Null.display(), "NULL");
        assert_eq!(CellValue::Bool(true).display(), "true");
        assert_eq!(CellValue::Int(-100).display(), "-100");
        assert_eq!(CellValue::Float(2.5).display(), "2.5");
        assert_eq!(CellValue::Bytes(vec![1, 2, 3]).display(), "[3 bytes]");
        let arr = CellValue::Array(vec![CellValue::Int(1), CellValue::Int(2)]);
        assert_eq!(arr.display(), "{1, 2}");
    }

    #[test]
    fn test_cell_to_json() {
        assert_eq!(CellValue::Int(42).to_json(), serde_json::json!(42));
        assert_eq!(CellValue::Null.to_json(), serde_json::Value::Null);
        assert_eq!(
            CellValue::Array(vec![CellValue::Bool(true), CellValue::Text("x".into())]).to_json(),
            serde_json::json!([true, "x"])
        );
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(CellValue::Date(date).to_json(), serde_json::json!("2024-03-01"));
    }

    #[test]
    fn test_numeric_to_cell() {
        assert_eq!(numeric_to_cell(Decimal::new(25, 1)), CellValue::Float(2.5));
        assert_eq!(numeric_to_cell(Decimal::new(4200, 2)), CellValue::Float(42.0));
    }

    #[test]
    fn test_integral_numeric_is_int() {
        assert_eq!(numeric_to_cell(Decimal::new(1_250, 0)), CellValue::Int(1_250));
        assert_eq!(numeric_to_cell(Decimal::new(-7, 0)), CellValue::Int(-7));
        assert_eq!(
            numeric_to_cell(Decimal::MAX),
            CellValue::Float(Decimal::MAX.to_f64().unwrap())
        );
    }

    #[test]
    fn test_decode_failure_is_execution_error() {
        use tokio_postgres::types::FromSql;

        let bad = <Option<i32> as FromSql>::from_sql_nullable(&Type::INT4, Some(&[1u8, 2][..]));
        match to_cell(bad, "qty", |v| CellValue::Int(v as i64)) {
            Err(AdapterError::Execution(msg)) => assert!(msg.contains("'qty'"), "{}", msg),
            other => panic!("expected execution error, got {:?}", other),
        }

        let null = <Option<i32> as FromSql>::from_sql_nullable(&Type::INT4, None);
        assert_eq!(to_cell(null, "qty", |v| CellValue::Int(v as i64)).unwrap(), CellValue::Null);
    }

    #[test]
    fn test_result_set_accessors() {
        let rs = sample();
        assert_eq!(rs.row_count, 2);
        assert_eq!(rs.column_names(), vec!["id", "name"]);
        assert_eq!(rs.get(0, "name"), Some(&CellValue::Text("Alice".into())));
        assert_eq!(rs.get(1, "name"), Some(&CellValue::Null));
        assert_eq!(rs.get(0, "missing"), None);
        assert_eq!(rs.get(5, "id"), None);
        let pairs: Vec<(&str, &CellValue)> = rs.row(0).collect();
        assert_eq!(pairs[0], ("id", &CellValue::Int(1)));
        assert_eq!(rs.row(9).count(), 0);
    }

    #[test]
    fn test_result_set_serializes_rows_as_maps() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["row_count"], 2);
        assert_eq!(json["truncated"], false);
        assert_eq!(json["rows"][0]["id"], 1);
        assert_eq!(json["rows"][0]["name"], "Alice");
        assert!(json["rows"][1]["name"].is_null());
        assert_eq!(json["columns"][1]["type_name"], "text");
    }

    #[test]
    fn test_apply_limit() {
        let mut rows = vec![1, 2, 3, 4];
        assert!(apply_limit(&mut rows, Some(3)));
        assert_eq!(rows, vec![1, 2, 3]);

        let mut exact = vec![1, 2, 3];
        assert!(!apply_limit(&mut exact, Some(3)));
        assert_eq!(exact.len(), 3);

        let mut unlimited = vec![1, 2];
        assert!(!apply_limit(&mut unlimited, None));

        let mut zero = vec![1];
        assert!(apply_limit(&mut zero, Some(0)));
        assert!(zero.is_empty());
    }

    #[test]
    fn test_structured_error_category_display() {
        assert_eq!(ErrorCategory::Syntax.to_string(), "Syntax Error");
        assert_eq!(ErrorCategory::Semantic.to_string(), "Semantic Error");
        assert_eq!(ErrorCategory::Connection.to_string(), "Connection Error");
        assert_eq!(ErrorCategory::Cancelled.to_string(), "Query Cancelled");
        assert_eq!(ErrorCategory::Unknown.to_string(), "Error");
    }

    fn structured(category: ErrorCategory) -> StructuredError {
        StructuredError {
            category,
            code: "42P01".to_string(),
            message: "relation \"ordrs\" does not exist".to_string(),
            detail: None,
            hint: Some("Check the table name.".to_string()),
            table: None,
            column: None,
            line: Some(1),
            col: Some(15),
        }
    }

    #[test]
    fn test_structured_error_display_full() {
        let full = structured(ErrorCategory::Semantic).display_full();
        assert!(full.contains("Semantic Error"));
        assert!(full.contains("at line 1, column 15"));
        assert!(full.contains("42P01"));
        assert!(full.contains("Check the table name"));
    }

    #[test]
    fn test_structured_error_mapping() {
        assert!(matches!(
            structured(ErrorCategory::Semantic).into_adapter_error(),
            AdapterError::Execution(_)
        ));
        assert!(matches!(
            structured(ErrorCategory::Connection).into_adapter_error(),
            AdapterError::Connection(_)
        ));
    }

    #[test]
    fn test_byte_offset_to_line_col() {
        let query = "SELECT *\nFROM users\nWHERE id = 1";
        assert_eq!(byte_offset_to_line_col(query, 1), (Some(1), Some(1)));
        assert_eq!(byte_offset_to_line_col(query, 10), (Some(2), Some(1)));
        assert_eq!(byte_offset_to_line_col(query, 21), (Some(3), Some(1)));
    }

    #[test]
    fn test_categorize_sqlstate() {
        assert_eq!(categorize_sqlstate("42601"), ErrorCategory::Syntax);
        assert_eq!(categorize_sqlstate("42P01"), ErrorCategory::Semantic);
        assert_eq!(categorize_sqlstate("23505"), ErrorCategory::Execution);
        assert_eq!(categorize_sqlstate("25001"), ErrorCategory::Transaction);
        assert_eq!(categorize_sqlstate("08006"), ErrorCategory::Connection);
        assert_eq!(categorize_sqlstate("57014"), ErrorCategory::Cancelled);
        assert_eq!(categorize_sqlstate("XX000"), ErrorCategory::Unknown);
    }
}
