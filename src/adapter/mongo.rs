//! MongoDB adapter.
//!
//! Intents become aggregation pipelines with a fixed stage order:
//!
//! ```text
//!   $match ─▶ $group ─▶ $sort ─▶ $skip ─▶ $limit ─▶ $project
//! ```
//!
//! Stages that the intent does not need are left out. Semantics follow the SQL
//! adapter: `ne` excludes missing values the way `<>` excludes NULL, nulls sort
//! lowest, and a global aggregate over nothing still yields one row.
use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use tracing::{debug, info, warn};

use super::{PipelineQuery, QueryAdapter, QueryArtifact};
use crate::db::{
    apply_limit, documents_to_rows, flatten_group_id, ConnectionHandle, DatabaseType,
    DbContext, ResultSet,
};
use crate::error::{AdapterError, Result};
use crate::intent::{
    output_key, AggregateFunction, Aggregation, AnalysisIntent, Filter, Operator, Predicate,
    SortDirection, Value,
};

/// MongoDB server error code for an exceeded `maxTimeMS`.
const MAX_TIME_MS_EXPIRED: i32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MongoDbAdapter;

impl MongoDbAdapter {
    pub fn build_pipeline(
        &self,
        intent: &AnalysisIntent,
        context: &DbContext<'_>,
    ) -> Result<PipelineQuery> {
        intent.validate()?;
        let collection = intent.resolve_target(context.target_hint.as_deref())?;
        check_names(intent)?;

        let mut stages = Vec::new();

        if !intent.filters.is_empty() {
            let conditions = intent
                .filters
                .iter()
                .map(filter_doc)
                .collect::<Result<Vec<_>>>()?;
            stages.push(doc! { "$match": merge_conditions(conditions) });
        }

        let grouped = intent.is_aggregate();
        if grouped {
            stages.push(doc! { "$group": group_stage(intent) });
        }

        if !intent.sort.is_empty() {
            let mut sort = Document::new();
            for key in &intent.sort {
                let path = if grouped && intent.group_by.contains(&key.field) {
                    format!("_id.{}", output_key(&key.field))
                } else {
                    key.field.clone()
                };
                let direction = match key.direction {
                    SortDirection::Asc => 1,
                    SortDirection::Desc => -1,
                };
                sort.insert(path, direction);
            }
            stages.push(doc! { "$sort": sort });
        }

        if let Some(offset) = intent.offset.filter(|&n| n > 0) {
            stages.push(doc! { "$skip": offset });
        }
        if let Some(limit) = intent.limit {
            stages.push(doc! { "$limit": limit });
        }

        let projected = if grouped {
            Vec::new()
        } else if !intent.fields.is_empty() {
            intent.fields.clone()
        } else {
            context.columns.clone().unwrap_or_default()
        };
        if !projected.is_empty() {
            let mut project = Document::new();
            if !projected.iter().any(|f| f == "_id") {
                project.insert("_id", 0);
            }
            for field in &projected {
                if field.contains('.') {
                    project.insert(output_key(field), format!("${}", field));
                } else {
                    project.insert(field.clone(), 1);
                }
            }
            stages.push(doc! { "$project": project });
        }

        let columns = if grouped {
            intent
                .group_by
                .iter()
                .map(|g| output_key(g))
                .chain(intent.aggregations.iter().map(Aggregation::output_name))
                .collect()
        } else {
            projected.iter().map(|f| output_key(f)).collect()
        };

        // SQL returns one row for a global aggregate over an empty input. The
        // limit is applied to it like any other row.
        let empty_aggregate = (intent.group_by.is_empty()
            && !intent.aggregations.is_empty()
            && intent.offset.unwrap_or(0) == 0)
            .then(|| {
                let mut row = Document::new();
                for agg in &intent.aggregations {
                    let value = match agg.function {
                        AggregateFunction::Count => Bson::Int64(0),
                        _ => Bson::Null,
                    };
                    row.insert(agg.output_name(), value);
                }
                row
            });

        Ok(PipelineQuery {
            collection,
            stages,
            limit: intent.limit.map(|n| n as u64),
            grouped,
            columns,
            empty_aggregate,
        })
    }
}

impl PipelineQuery {
    /// Stages to send to the server: the `$limit` stage is raised by one so
    /// that a full page can be told apart from a truncated one.
    pub fn fetch_stages(&self) -> Vec<Document> {
        let mut stages = self.stages.clone();
        if let Some(limit) = self.limit {
            let raised = i64::try_from(limit).unwrap_or(i64::MAX).saturating_add(1);
            for stage in stages.iter_mut().filter(|s| s.contains_key("$limit")) {
                stage.insert("$limit", raised);
            }
        }
        stages
    }

    /// Normalize the documents returned by [`fetch_stages`](Self::fetch_stages)
    /// into rows, trimming the extra document and recording truncation.
    pub fn result_from_documents(&self, mut docs: Vec<Document>, elapsed: Duration) -> ResultSet {
        if docs.is_empty() {
            docs.extend(self.empty_aggregate.clone());
        }
        let truncated = apply_limit(&mut docs, self.limit);
        if self.grouped {
            docs = docs.into_iter().map(flatten_group_id).collect();
        }
        let (columns, rows) = documents_to_rows(&docs, &self.columns);
        ResultSet::new(columns, rows, truncated, elapsed)
    }
}

fn check_names(intent: &AnalysisIntent) -> Result<()> {
    let mut names: HashSet<&str> = HashSet::new();
    names.extend(intent.fields.iter().map(String::as_str));
    names.extend(intent.group_by.iter().map(String::as_str));
    names.extend(intent.sort.iter().map(|k| k.field.as_str()));
    names.extend(
        intent
            .aggregations
            .iter()
            .filter(|a| !a.is_wildcard())
            .map(|a| a.field.as_str()),
    );
    collect_filter_fields(&intent.filters, &mut names);

    if let Some(bad) = names.iter().find(|n| n.starts_with('$')) {
        return Err(AdapterError::translation(format!(
            "field name '{}' may not start with '$'",
            bad
        )));
    }
    for agg in &intent.aggregations {
        let alias = agg.output_name();
        if alias.starts_with('$') || alias.contains('.') {
            return Err(AdapterError::translation(format!(
                "alias '{}' may not start with '$' or contain '.'",
                alias
            )));
        }
    }
    Ok(())
}

fn collect_filter_fields<'a>(filters: &'a [Filter], names: &mut HashSet<&'a str>) {
    for filter in filters {
        match filter {
            Filter::Predicate(p) => {
                names.insert(p.field.as_str());
            }
            Filter::Any { or: children } | Filter::All { and: children } => {
                collect_filter_fields(children, names)
            }
        }
    }
}

fn group_stage(intent: &AnalysisIntent) -> Document {
    let id = if intent.group_by.is_empty() {
        Bson::Null
    } else {
        let mut id = Document::new();
        for field in &intent.group_by {
            id.insert(output_key(field), format!("${}", field));
        }
        Bson::Document(id)
    };

    let mut group = doc! { "_id": id };
    for agg in &intent.aggregations {
        let path = format!("${}", agg.field);
        let accumulator = match agg.function {
            AggregateFunction::Count if agg.is_wildcard() => doc! { "$sum": 1 },
            AggregateFunction::Count => doc! {
                "$sum": { "$cond": [{ "$gt": [path, Bson::Null] }, 1, 0] }
            },
            AggregateFunction::Sum => doc! { "$sum": path },
            AggregateFunction::Avg => doc! { "$avg": path },
            AggregateFunction::Min => doc! { "$min": path },
            AggregateFunction::Max => doc! { "$max": path },
        };
        group.insert(agg.output_name(), accumulator);
    }
    group
}

fn filter_doc(filter: &Filter) -> Result<Document> {
    match filter {
        Filter::Predicate(p) => Ok(predicate_doc(p)),
        Filter::Any { or } => group_doc("$or", or),
        Filter::All { and } => group_doc("$and", and),
    }
}

fn group_doc(op: &str, children: &[Filter]) -> Result<Document> {
    if children.is_empty() {
        return Err(AdapterError::translation("empty filter group"));
    }
    let docs = children
        .iter()
        .map(filter_doc)
        .collect::<Result<Vec<_>>>()?;
    Ok(doc! { op: docs })
}

/// Merge top-level conditions into one document, falling back to `$and`
/// when two of them constrain the same key.
fn merge_conditions(conditions: Vec<Document>) -> Document {
    let mut seen = HashSet::new();
    let distinct = conditions
        .iter()
        .flat_map(|d| d.keys())
        .all(|k| seen.insert(k.clone()));
    if distinct {
        let mut merged = Document::new();
        for condition in conditions {
            for (key, value) in condition {
                merged.insert(key, value);
            }
        }
        merged
    } else {
        doc! { "$and": conditions }
    }
}

fn predicate_doc(p: &Predicate) -> Document {
    let field = p.field.as_str();
    let value = to_bson(&p.value);
    match p.operator {
        Operator::Eq => doc! { field: value },
        Operator::Ne if p.value.is_null() => doc! { field: { "$ne": Bson::Null } },
        Operator::Ne => doc! { field: { "$nin": [value, Bson::Null] } },
        Operator::Gt => doc! { field: { "$gt": value } },
        Operator::Gte => doc! { field: { "$gte": value } },
        Operator::Lt => doc! { field: { "$lt": value } },
        Operator::Lte => doc! { field: { "$lte": value } },
        Operator::In => {
            let items = match value {
                Bson::Array(items) => items,
                scalar => vec![scalar],
            };
            doc! { field: { "$in": items } }
        }
        Operator::Contains => {
            let text = match &p.value {
                Value::Text(s) => s.as_str(),
                _ => "",
            };
            doc! { field: { "$regex": escape_regex(text) } }
        }
    }
}

pub(crate) fn to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) => Bson::Int64(*i),
        Value::Float(f) => Bson::Double(*f),
        Value::Text(s) => Bson::String(s.clone()),
        Value::List(items) => Bson::Array(items.iter().map(to_bson).collect()),
    }
}

/// Escape regex metacharacters so `contains` matches literally.
fn escape_regex(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if "\\^$.|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn map_mongo_error(err: mongodb::error::Error, timeout: Duration) -> AdapterError {
    match err.kind.as_ref() {
        ErrorKind::Command(cmd) if cmd.code == MAX_TIME_MS_EXPIRED => AdapterError::Timeout(timeout),
        ErrorKind::ServerSelection { .. }
        | ErrorKind::Io(_)
        | ErrorKind::ConnectionPoolCleared { .. }
        | ErrorKind::Authentication { .. }
        | ErrorKind::DnsResolve { .. } => AdapterError::Connection(err.to_string()),
        _ => AdapterError::Execution(err.to_string()),
    }
}

#[async_trait]
impl QueryAdapter for MongoDbAdapter {
    fn name(&self) -> &'static str {
        "MongoDB"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::MongoDb
    }

    fn translate(&self, intent: &AnalysisIntent, context: &DbContext<'_>) -> Result<QueryArtifact> {
        let pipeline = self.build_pipeline(intent, context)?;
        debug!(
            collection = %pipeline.collection,
            stages = pipeline.stages.len(),
            "translated intent"
        );
        Ok(QueryArtifact::Pipeline(pipeline))
    }

    async fn execute(&self, artifact: &QueryArtifact, context: &DbContext<'_>) -> Result<ResultSet> {
        let QueryArtifact::Pipeline(query) = artifact else {
            return Err(AdapterError::Execution(
                "MongoDB adapter cannot execute SQL".to_string(),
            ));
        };
        let connection = context.connection()?;
        let ConnectionHandle::MongoDb(client) = connection.handle() else {
            return Err(AdapterError::Connection(format!(
                "expected a MongoDB connection, got {}",
                connection.database_type()
            )));
        };

        let collection = client
            .database(&connection.database)
            .collection::<Document>(&query.collection);
        let stages = query.fetch_stages();

        let start = Instant::now();
        let fetch = async {
            let cursor = collection
                .aggregate(stages)
                .max_time(context.timeout)
                .await?;
            cursor.try_collect::<Vec<Document>>().await
        };
        // Dropping the cursor on timeout kills it server-side.
        let docs = match tokio::time::timeout(context.timeout, fetch).await {
            Ok(Ok(docs)) => docs,
            Ok(Err(e)) => {
                let err = map_mongo_error(e, context.timeout);
                warn!(error = %err, collection = %query.collection, "aggregate failed");
                return Err(err);
            }
            Err(_) => {
                warn!(timeout = ?context.timeout, collection = %query.collection, "aggregate timed out");
                return Err(AdapterError::Timeout(context.timeout));
            }
        };
        let result = query.result_from_documents(docs, start.elapsed());

        info!(
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = result.execution_time.as_millis() as u64,
            "executed aggregation pipeline"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> DbContext<'static> {
        DbContext::detached(DatabaseType::MongoDb)
    }

    fn pipeline(intent: &AnalysisIntent) -> PipelineQuery {
        match MongoDbAdapter.translate(intent, &ctx()).unwrap() {
            QueryArtifact::Pipeline(p) => p,
            other => panic!("unexpected artifact {:?}", other),
        }
    }

    fn assert_translation_err(intent: &AnalysisIntent, needle: &str) {
        match MongoDbAdapter.translate(intent, &ctx()) {
            Err(AdapterError::Translation(msg)) => assert!(msg.contains(needle), "{}", msg),
            other => panic!("expected translation error, got {:?}", other),
        }
    }

    #[test]
    fn test_filter_with_limit() {
        let intent = AnalysisIntent::new("orders")
            .filter(Filter::eq("status", "shipped"))
            .limit(10);
        let p = pipeline(&intent);
        assert_eq!(p.collection, "orders");
        assert_eq!(
            p.stages,
            vec![
                doc! { "$match": { "status": "shipped" } },
                doc! { "$limit": 10_i64 },
            ]
        );
        assert_eq!(p.limit, Some(10));
        assert!(!p.grouped);
    }

    #[test]
    fn test_fetch_stages_fetch_one_extra() {
        let p = pipeline(&AnalysisIntent::new("orders").limit(10));
        assert_eq!(p.fetch_stages(), vec![doc! { "$limit": 11_i64 }]);
        assert_eq!(p.stages, vec![doc! { "$limit": 10_i64 }]);
    }

    #[test]
    fn test_group_sort_page() {
        let intent = AnalysisIntent::new("orders")
            .filter(Filter::predicate("total", Operator::Gt, 0))
            .group_by("region")
            .aggregate(AggregateFunction::Sum, "total", "revenue")
            .aggregate(AggregateFunction::Count, "*", "orders")
            .sort_by("revenue", SortDirection::Desc)
            .sort_by("region", SortDirection::Asc)
            .offset(5)
            .limit(5);
        let p = pipeline(&intent);
        assert_eq!(
            p.stages,
            vec![
                doc! { "$match": { "total": { "$gt": 0_i64 } } },
                doc! { "$group": {
                    "_id": { "region": "$region" },
                    "revenue": { "$sum": "$total" },
                    "orders": { "$sum": 1 },
                } },
                doc! { "$sort": { "revenue": -1, "_id.region": 1 } },
                doc! { "$skip": 5_i64 },
                doc! { "$limit": 5_i64 },
            ]
        );
        assert!(p.grouped);
        assert_eq!(p.columns, vec!["region", "revenue", "orders"]);
        assert!(p.empty_aggregate.is_none());
    }

    #[test]
    fn test_count_field_skips_nulls() {
        let p = pipeline(&AnalysisIntent::new("users").aggregate(
            AggregateFunction::Count,
            "email",
            "with_email",
        ));
        assert_eq!(
            p.stages,
            vec![doc! { "$group": {
                "_id": Bson::Null,
                "with_email": { "$sum": { "$cond": [{ "$gt": ["$email", Bson::Null] }, 1, 0] } },
            } }]
        );
    }

    #[test]
    fn test_global_aggregate_empty_row() {
        let p = pipeline(
            &AnalysisIntent::new("orders")
                .aggregate(AggregateFunction::Count, "*", "n")
                .aggregate(AggregateFunction::Avg, "total", "avg_total"),
        );
        assert_eq!(
            p.empty_aggregate,
            Some(doc! { "n": 0_i64, "avg_total": Bson::Null })
        );

        let paged = pipeline(
            &AnalysisIntent::new("orders")
                .aggregate(AggregateFunction::Count, "*", "n")
                .offset(1),
        );
        assert!(paged.empty_aggregate.is_none());
    }

    #[test]
    fn test_zero_limit_global_aggregate_reports_truncation() {
        let p = pipeline(
            &AnalysisIntent::new("orders")
                .aggregate(AggregateFunction::Count, "*", "n")
                .limit(0),
        );
        assert_eq!(p.empty_aggregate, Some(doc! { "n": 0_i64 }));

        let result = p.result_from_documents(Vec::new(), Duration::ZERO);
        assert!(result.truncated);
        assert_eq!(result.row_count, 0);

        let unlimited = pipeline(
            &AnalysisIntent::new("orders").aggregate(AggregateFunction::Count, "*", "n"),
        );
        let result = unlimited.result_from_documents(Vec::new(), Duration::ZERO);
        assert!(!result.truncated);
        assert_eq!(result.rows, vec![vec![crate::db::CellValue::Int(0)]]);
    }

    #[test]
    fn test_result_trims_extra_document() {
        let p = pipeline(&AnalysisIntent::new("orders").select(["id"]).limit(2));
        let docs = vec![doc! { "id": 1 }, doc! { "id": 2 }, doc! { "id": 3 }];
        let result = p.result_from_documents(docs, Duration::ZERO);
        assert!(result.truncated);
        assert_eq!(result.row_count, 2);
    }

    #[test]
    fn test_operators() {
        let intent = AnalysisIntent::new("users")
            .filter(Filter::predicate("plan", Operator::Ne, "free"))
            .filter(Filter::predicate("deleted_at", Operator::Eq, Value::Null))
            .filter(Filter::predicate("email", Operator::Ne, Value::Null))
            .filter(Filter::predicate("age", Operator::Lte, 65))
            .filter(Filter::predicate("tier", Operator::In, vec!["gold", "silver"]))
            .filter(Filter::predicate("name", Operator::Contains, "a.b"));
        let p = pipeline(&intent);
        assert_eq!(
            p.stages[0],
            doc! { "$match": {
                "plan": { "$nin": ["free", Bson::Null] },
                "deleted_at": Bson::Null,
                "email": { "$ne": Bson::Null },
                "age": { "$lte": 65_i64 },
                "tier": { "$in": ["gold", "silver"] },
                "name": { "$regex": "a\\.b" },
            } }
        );
    }

    #[test]
    fn test_repeated_field_uses_and() {
        let intent = AnalysisIntent::new("orders")
            .filter(Filter::predicate("total", Operator::Gte, 10))
            .filter(Filter::predicate("total", Operator::Lt, 100));
        assert_eq!(
            pipeline(&intent).stages[0],
            doc! { "$match": { "$and": [
                { "total": { "$gte": 10_i64 } },
                { "total": { "$lt": 100_i64 } },
            ] } }
        );
    }

    #[test]
    fn test_or_group() {
        let intent = AnalysisIntent::new("orders").filter(Filter::or(vec![
            Filter::eq("region", "eu"),
            Filter::and(vec![
                Filter::eq("region", "us"),
                Filter::predicate("total", Operator::Gt, 1.5),
            ]),
        ]));
        assert_eq!(
            pipeline(&intent).stages[0],
            doc! { "$match": { "$or": [
                { "region": "eu" },
                { "$and": [ { "region": "us" }, { "total": { "$gt": 1.5 } } ] },
            ] } }
        );
    }

    #[test]
    fn test_projection_is_last() {
        let intent = AnalysisIntent::new("orders")
            .select(["status", "total"])
            .sort_by("total", SortDirection::Desc)
            .limit(3);
        let p = pipeline(&intent);
        assert_eq!(
            p.stages,
            vec![
                doc! { "$sort": { "total": -1 } },
                doc! { "$limit": 3_i64 },
                doc! { "$project": { "_id": 0, "status": 1, "total": 1 } },
            ]
        );
        assert_eq!(p.columns, vec!["status", "total"]);
    }

    #[test]
    fn test_projection_keeps_requested_id() {
        let p = pipeline(&AnalysisIntent::new("orders").select(["_id", "status"]));
        assert_eq!(p.stages, vec![doc! { "$project": { "_id": 1, "status": 1 } }]);
    }

    #[test]
    fn test_dotted_group_key() {
        let p = pipeline(
            &AnalysisIntent::new("orders")
                .group_by("customer.country")
                .aggregate(AggregateFunction::Count, "*", "n"),
        );
        assert_eq!(
            p.stages[0],
            doc! { "$group": { "_id": { "customer_country": "$customer.country" }, "n": { "$sum": 1 } } }
        );
        assert_eq!(p.columns, vec!["customer_country", "n"]);
    }

    #[test]
    fn test_dotted_projection_flattens_column() {
        let p = pipeline(
            &AnalysisIntent::new("orders")
                .select(["id", "customer.country"])
                .sort_by("customer.country", SortDirection::Desc),
        );
        assert_eq!(
            p.stages,
            vec![
                doc! { "$sort": { "customer.country": -1 } },
                doc! { "$project": { "_id": 0, "id": 1, "customer_country": "$customer.country" } },
            ]
        );
        assert_eq!(p.columns, vec!["id", "customer_country"]);
    }

    #[test]
    fn test_dollar_names_rejected() {
        assert_translation_err(
            &AnalysisIntent::new("t").filter(Filter::eq("$where", "1")),
            "'$where'",
        );
        assert_translation_err(&AnalysisIntent::new("t").select(["$x"]), "'$x'");
        assert_translation_err(
            &AnalysisIntent::new("t").aggregate(AggregateFunction::Count, "*", "a.b"),
            "alias 'a.b'",
        );
    }

    #[test]
    fn test_translation_errors_match_sql() {
        assert_translation_err(&AnalysisIntent::new("t").limit(-3), "limit");
        assert_translation_err(
            &AnalysisIntent::new("t").filter(Filter::predicate("x", Operator::In, Value::List(vec![]))),
            "non-empty",
        );
    }

    #[test]
    fn test_escape_regex() {
        assert_eq!(escape_regex("plain"), "plain");
        assert_eq!(escape_regex("(a+b)*"), "\\(a\\+b\\)\\*");
    }

    #[test]
    fn test_translation_is_deterministic() {
        let intent = AnalysisIntent::new("orders")
            .group_by("region")
            .aggregate(AggregateFunction::Max, "total", "top")
            .sort_by("top", SortDirection::Desc);
        assert_eq!(pipeline(&intent), pipeline(&intent));
    }

    #[tokio::test]
    async fn test_execute_without_connection() {
        let artifact = MongoDbAdapter
            .translate(&AnalysisIntent::new("orders"), &ctx())
            .unwrap();
        let err = MongoDbAdapter.execute(&artifact, &ctx()).await.unwrap_err();
        assert!(matches!(err, AdapterError::Connection(_)));
    }
}
