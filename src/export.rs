//! Rendering result sets for the command line.
use crate::db::{CellValue, ResultSet};

pub fn to_csv(result: &ResultSet) -> String {
    render_delimited(result, ",", |s| csv_escape(s))
}

pub fn to_tsv(result: &ResultSet) -> String {
    render_delimited(result, "\t", |s| s.replace(['\t', '\n'], " "))
}

/// Pretty JSON document with `columns`, `rows` (one object per row),
/// `row_count`, `truncated` and `execution_ms`.
pub fn to_json(result: &ResultSet) -> String {
    serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
}

fn render_delimited(result: &ResultSet, sep: &str, escape: impl Fn(&str) -> String) -> String {
    let mut output = String::new();

    // Header
    let headers: Vec<String> = result.columns.iter().map(|c| escape(&c.name)).collect();
    output.push_str(&headers.join(sep));
    output.push('\n');

    // Rows
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|cell| escape(&cell_text(cell))).collect();
        output.push_str(&cells.join(sep));
        output.push('\n');
    }

    output
}

fn cell_text(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => String::new(),
        other => other.display(),
    }
}

fn csv_escape(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
