//! BSON document normalization.
use std::collections::HashMap;

use chrono::DateTime;
use mongodb::bson::{Bson, Document};

use super::query::{CellValue, ColumnInfo};

/// Convert a BSON value into the backend-neutral cell representation.
pub fn bson_to_cell(value: &Bson) -> CellValue {
    match value {
        Bson::Null | Bson::Undefined => CellValue::Null,
        Bson::Boolean(b) => CellValue::Bool(*b),
        Bson::Int32(i) => CellValue::Int(*i as i64),
        Bson::Int64(i) => CellValue::Int(*i),
        Bson::Double(f) => CellValue::Float(*f),
        Bson::Decimal128(d) => {
            let text = d.to_string();
            text.parse::<f64>()
                .map(CellValue::Float)
                .unwrap_or(CellValue::Text(text))
        }
        Bson::String(s) => CellValue::Text(s.clone()),
        Bson::Symbol(s) => CellValue::Text(s.clone()),
        Bson::ObjectId(oid) => CellValue::Text(oid.to_hex()),
        Bson::DateTime(dt) => match DateTime::from_timestamp_millis(dt.timestamp_millis()) {
            Some(ts) => CellValue::TimestampTz(ts),
            None => CellValue::Unknown(dt.to_string()),
        },
        Bson::Binary(bin) => CellValue::Bytes(bin.bytes.clone()),
        Bson::Array(items) => CellValue::Array(items.iter().map(bson_to_cell).collect()),
        Bson::Document(doc) => CellValue::Json(Bson::Document(doc.clone()).into_relaxed_extjson()),
        other => CellValue::Unknown(other.to_string()),
    }
}

/// Lift the fields of a `$group` `_id` sub-document to the top level.
///
/// Group keys come first, then the accumulators, matching the column order of
/// the equivalent SQL `SELECT group..., agg...`. A null `_id` (global
/// aggregate) is dropped.
pub fn flatten_group_id(mut doc: Document) -> Document {
    match doc.remove("_id") {
        Some(Bson::Document(id)) => {
            let mut out = id;
            for (key, value) in doc {
                out.insert(key, value);
            }
            out
        }
        Some(Bson::Null) | None => doc,
        Some(other) => {
            let mut out = Document::new();
            out.insert("_id", other);
            for (key, value) in doc {
                out.insert(key, value);
            }
            out
        }
    }
}

/// Build result columns and rows from documents.
///
/// `leading` columns come first, in the given order, even when no document
/// carries them. The remaining columns are the union of keys in first-seen
/// order; a key missing from a document reads as null.
pub fn documents_to_rows(
    docs: &[Document],
    leading: &[String],
) -> (Vec<ColumnInfo>, Vec<Vec<CellValue>>) {
    let mut columns: Vec<ColumnInfo> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for name in leading {
        if !index.contains_key(name) {
            index.insert(name.clone(), columns.len());
            columns.push(ColumnInfo::new(name.clone(), "null"));
        }
    }

    for doc in docs {
        for (key, value) in doc {
            match index.get(key) {
                Some(&i) => {
                    if columns[i].type_name == "null" && !matches!(value, Bson::Null) {
                        columns[i].type_name = bson_type_name(value).to_string();
                    }
                }
                None => {
                    index.insert(key.clone(), columns.len());
                    columns.push(ColumnInfo::new(key.clone(), bson_type_name(value)));
                }
            }
        }
    }

    let rows = docs
        .iter()
        .map(|doc| {
            columns
                .iter()
                .map(|col| doc.get(&col.name).map_or(CellValue::Null, bson_to_cell))
                .collect()
        })
        .collect();

    (columns, rows)
}

fn bson_type_name(value: &Bson) -> &'static str {
    match value {
        Bson::Null | Bson::Undefined => "null",
        Bson::Boolean(_) => "bool",
        Bson::Int32(_) => "int",
        Bson::Int64(_) => "long",
        Bson::Double(_) => "double",
        Bson::Decimal128(_) => "decimal",
        Bson::String(_) | Bson::Symbol(_) => "string",
        Bson::ObjectId(_) => "objectId",
        Bson::DateTime(_) => "date",
        Bson::Binary(_) => "binData",
        Bson::Array(_) => "array",
        Bson::Document(_) => "object",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{doc, oid::ObjectId};

    #[test]
    fn test_bson_scalars() {
        assert_eq!(bson_to_cell(&Bson::Null), CellValue::Null);
        assert_eq!(bson_to_cell(&Bson::Int32(4)), CellValue::Int(4));
        assert_eq!(bson_to_cell(&Bson::Int64(4)), CellValue::Int(4));
        assert_eq!(bson_to_cell(&Bson::Double(1.5)), CellValue::Float(1.5));
        assert_eq!(bson_to_cell(&Bson::Boolean(false)), CellValue::Bool(false));
        assert_eq!(
            bson_to_cell(&Bson::String("eu".into())),
            CellValue::Text("eu".into())
        );
    }

    #[test]
    fn test_object_id_becomes_hex() {
        let oid = ObjectId::new();
        assert_eq!(bson_to_cell(&Bson::ObjectId(oid)), CellValue::Text(oid.to_hex()));
    }

    #[test]
    fn test_datetime_becomes_timestamptz() {
        let dt = mongodb::bson::DateTime::from_millis(1_700_000_000_000);
        match bson_to_cell(&Bson::DateTime(dt)) {
            CellValue::TimestampTz(ts) => assert_eq!(ts.timestamp_millis(), 1_700_000_000_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_nested_values() {
        let arr = Bson::Array(vec![Bson::Int32(1), Bson::Null]);
        assert_eq!(
            bson_to_cell(&arr),
            CellValue::Array(vec![CellValue::Int(1), CellValue::Null])
        );
        let nested = Bson::Document(doc! {"city": "Oslo"});
        assert_eq!(
            bson_to_cell(&nested),
            CellValue::Json(serde_json::json!({"city": "Oslo"}))
        );
    }

    #[test]
    fn test_flatten_group_id() {
        let flat = flatten_group_id(doc! {"_id": {"region": "eu", "status": "open"}, "total": 3});
        let keys: Vec<&String> = flat.keys().collect();
        assert_eq!(keys, vec!["region", "status", "total"]);
        assert_eq!(flat.get_i32("total").unwrap(), 3);
    }

    #[test]
    fn test_flatten_null_id() {
        let flat = flatten_group_id(doc! {"_id": Bson::Null, "total": 3});
        assert_eq!(flat, doc! {"total": 3});
    }

    #[test]
    fn test_flatten_keeps_scalar_id() {
        let flat = flatten_group_id(doc! {"_id": 7, "name": "x"});
        assert_eq!(flat, doc! {"_id": 7, "name": "x"});
    }

    #[test]
    fn test_documents_to_rows_unions_keys() {
        let docs = vec![
            doc! {"name": "a", "score": Bson::Null},
            doc! {"name": "b", "score": 10, "extra": true},
        ];
        let (columns, rows) = documents_to_rows(&docs, &[]);
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["name", "score", "extra"]);
        assert_eq!(columns[1].type_name, "int");
        assert_eq!(rows[0][2], CellValue::Null);
        assert_eq!(rows[1][1], CellValue::Int(10));
        assert_eq!(rows[1][2], CellValue::Bool(true));
    }

    #[test]
    fn test_leading_columns_fix_order() {
        let docs = vec![doc! {"total": 5, "region": "eu"}, doc! {"total": 2}];
        let leading = vec!["region".to_string(), "total".to_string()];
        let (columns, rows) = documents_to_rows(&docs, &leading);
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["region", "total"]);
        assert_eq!(columns[0].type_name, "string");
        assert_eq!(rows[0], vec![CellValue::Text("eu".into()), CellValue::Int(5)]);
        assert_eq!(rows[1], vec![CellValue::Null, CellValue::Int(2)]);
    }

    #[test]
    fn test_documents_to_rows_empty() {
        let (columns, rows) = documents_to_rows(&[], &[]);
        assert!(columns.is_empty());
        assert!(rows.is_empty());
    }
}
