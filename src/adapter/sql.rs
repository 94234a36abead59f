//! PostgreSQL adapter.
//!
//! Builds a [`SelectQuery`] from the intent and compiles it with
//! [`ast::compile`]. Identifiers are always quoted and values always become
//! `$n` placeholders, numbered in the order they appear in the text.
use std::time::Instant;

use async_trait::async_trait;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use super::{QueryAdapter, QueryArtifact, SqlQuery};
use crate::ast::{
    self, BinaryOperator, Expression, OrderByExpr, SelectItem, SelectQuery, TableRef,
};
use crate::db::{
    apply_limit, parse_rows, ColumnInfo, ConnectionHandle, DatabaseType, DbContext, ResultSet,
    StructuredError,
};
use crate::error::{AdapterError, Result};
use crate::intent::{
    output_key, AggregateFunction, AnalysisIntent, Filter, Operator, Predicate, SortDirection,
    Value,
};
use postgres_native_tls::MakeTlsConnector;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqlAdapter;

impl SqlAdapter {
    /// Build the SELECT AST for an intent. Bound values are appended to
    /// `params` as placeholders are allocated.
    pub fn build_select(
        &self,
        intent: &AnalysisIntent,
        context: &DbContext<'_>,
        params: &mut Vec<Value>,
    ) -> Result<SelectQuery> {
        intent.validate()?;
        let target = intent.resolve_target(context.target_hint.as_deref())?;

        let projections = if intent.is_aggregate() {
            let groups = intent.group_by.iter().map(|g| column_item(g));
            let aggregates = intent.aggregations.iter().map(|agg| {
                let arg = if agg.is_wildcard() {
                    Expression::Wildcard
                } else {
                    Expression::column(&agg.field)
                };
                SelectItem::Expression {
                    expr: Expression::Aggregate {
                        name: aggregate_name(agg.function).to_string(),
                        args: vec![arg],
                    },
                    alias: Some(agg.output_name()),
                }
            });
            groups.chain(aggregates).collect()
        } else if !intent.fields.is_empty() {
            intent.fields.iter().map(|f| column_item(f)).collect()
        } else if let Some(columns) = context.columns.as_ref().filter(|c| !c.is_empty()) {
            columns.iter().map(|c| column_item(c)).collect()
        } else {
            Vec::new()
        };

        let conditions = intent
            .filters
            .iter()
            .map(|f| filter_expr(f, params))
            .collect::<Result<Vec<_>>>()?;
        let filter = Expression::fold(conditions, BinaryOperator::And);

        let aliases: Vec<String> = intent.aggregations.iter().map(|a| a.output_name()).collect();
        let order_by = intent
            .sort
            .iter()
            .map(|key| {
                let expr = if aliases.contains(&key.field) {
                    Expression::plain_column(&key.field)
                } else {
                    Expression::column(&key.field)
                };
                let asc = key.direction == SortDirection::Asc;
                // Nulls sort lowest, as in MongoDB.
                OrderByExpr {
                    expr,
                    asc: Some(asc),
                    nulls_first: Some(asc),
                }
            })
            .collect();

        Ok(SelectQuery {
            projections,
            from: Some(TableRef::parse(&target)),
            filter,
            group_by: intent.group_by.iter().map(|g| Expression::column(g)).collect(),
            order_by,
            limit: intent.limit.map(|n| n as u64),
            offset: intent.offset.map(|n| n as u64),
        })
    }
}

/// A path column is renamed to its flattened key so both backends agree on
/// the output name.
fn column_item(name: &str) -> SelectItem {
    let expr = Expression::column(name);
    let alias = expr.is_path().then(|| output_key(name));
    SelectItem::Expression { expr, alias }
}

fn aggregate_name(function: AggregateFunction) -> &'static str {
    match function {
        AggregateFunction::Count => "COUNT",
        AggregateFunction::Sum => "SUM",
        AggregateFunction::Avg => "AVG",
        AggregateFunction::Min => "MIN",
        AggregateFunction::Max => "MAX",
    }
}

fn bind(params: &mut Vec<Value>, value: Value) -> Expression {
    params.push(value);
    Expression::Parameter(params.len())
}

fn filter_expr(filter: &Filter, params: &mut Vec<Value>) -> Result<Expression> {
    match filter {
        Filter::Predicate(p) => Ok(predicate_expr(p, params)),
        Filter::Any { or } => group_expr(or, BinaryOperator::Or, params),
        Filter::All { and } => group_expr(and, BinaryOperator::And, params),
    }
}

fn group_expr(
    children: &[Filter],
    op: BinaryOperator,
    params: &mut Vec<Value>,
) -> Result<Expression> {
    let exprs = children
        .iter()
        .map(|f| filter_expr(f, params))
        .collect::<Result<Vec<_>>>()?;
    Expression::fold(exprs, op).ok_or_else(|| AdapterError::translation("empty filter group"))
}

fn predicate_expr(p: &Predicate, params: &mut Vec<Value>) -> Expression {
    let column = Expression::column(&p.field);
    let op = match (p.operator, &p.value) {
        (Operator::Eq, Value::Null) => {
            return Expression::IsNull {
                expr: Box::new(column),
                negated: false,
            }
        }
        (Operator::Ne, Value::Null) => {
            return Expression::IsNull {
                expr: Box::new(column),
                negated: true,
            }
        }
        (Operator::In, Value::List(items)) => return in_list_expr(column, items, params),
        (Operator::Contains, value) => {
            let text = match value {
                Value::Text(s) => s.as_str(),
                _ => "",
            };
            let pattern = format!("%{}%", escape_like(text));
            let param = bind(params, Value::Text(pattern));
            return Expression::binary(column, BinaryOperator::Like, param);
        }
        (Operator::Eq, _) => BinaryOperator::Eq,
        (Operator::Ne, _) => BinaryOperator::NotEq,
        (Operator::Gt, _) => BinaryOperator::Gt,
        (Operator::Gte, _) => BinaryOperator::GtEq,
        (Operator::Lt, _) => BinaryOperator::Lt,
        (Operator::Lte, _) => BinaryOperator::LtEq,
        (Operator::In, scalar) => {
            return in_list_expr(column, std::slice::from_ref(scalar), params);
        }
    };
    let param = bind(params, p.value.clone());
    Expression::binary(column, op, param)
}

/// `IN` never matches NULL, so a null member becomes an `IS NULL` branch.
fn in_list_expr(column: Expression, items: &[Value], params: &mut Vec<Value>) -> Expression {
    let has_null = items.iter().any(Value::is_null);
    let list: Vec<Expression> = items
        .iter()
        .filter(|v| !v.is_null())
        .map(|v| bind(params, v.clone()))
        .collect();
    let is_null = Expression::IsNull {
        expr: Box::new(column.clone()),
        negated: false,
    };
    if list.is_empty() {
        return is_null;
    }
    let in_list = Expression::InList {
        expr: Box::new(column),
        list,
        negated: false,
    };
    if has_null {
        Expression::Nested(Box::new(Expression::binary(
            in_list,
            BinaryOperator::Or,
            is_null,
        )))
    } else {
        in_list
    }
}

/// Escape LIKE metacharacters (backslash is PostgreSQL's default escape).
fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl QueryAdapter for SqlAdapter {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Sql
    }

    fn translate(&self, intent: &AnalysisIntent, context: &DbContext<'_>) -> Result<QueryArtifact> {
        let mut params = Vec::new();
        let mut select = self.build_select(intent, context, &mut params)?;
        let text = ast::compile(&select);
        let limit = select.limit;
        // bigint caps LIMIT; at i64::MAX no row can lie past the limit.
        let fetch_text = match limit {
            Some(n) if n < i64::MAX as u64 => {
                select.limit = Some(n + 1);
                ast::compile(&select)
            }
            _ => text.clone(),
        };
        debug!(sql = %text, params = params.len(), "translated intent");
        Ok(QueryArtifact::Sql(SqlQuery {
            text,
            bound_parameters: params,
            fetch_text,
            limit,
        }))
    }

    async fn execute(&self, artifact: &QueryArtifact, context: &DbContext<'_>) -> Result<ResultSet> {
        let QueryArtifact::Sql(query) = artifact else {
            return Err(AdapterError::Execution(
                "PostgreSQL adapter cannot execute a MongoDB pipeline".to_string(),
            ));
        };
        let connection = context.connection()?;
        let ConnectionHandle::Postgres { client, tls } = connection.handle() else {
            return Err(AdapterError::Connection(format!(
                "expected a PostgreSQL connection, got {}",
                connection.database_type()
            )));
        };
        if client.is_closed() {
            return Err(AdapterError::Connection(
                "PostgreSQL connection is closed".to_string(),
            ));
        }

        let params: Vec<&(dyn ToSql + Sync)> = query
            .bound_parameters
            .iter()
            .map(|v| v as &(dyn ToSql + Sync))
            .collect();
        let sql = query.fetch_text.as_str();

        let start = Instant::now();
        let fetch = async {
            let statement = client.prepare(sql).await?;
            let rows = client.query(&statement, &params).await?;
            Ok::<_, tokio_postgres::Error>((statement, rows))
        };
        let (statement, mut rows) = match tokio::time::timeout(context.timeout, fetch).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let err = StructuredError::from_pg_error(&e, sql);
                warn!(error = %err.display_full(), "query failed");
                return Err(err.into_adapter_error());
            }
            Err(_) => {
                warn!(timeout = ?context.timeout, "query timed out, cancelling");
                cancel_query(client, tls.as_ref()).await;
                return Err(AdapterError::Timeout(context.timeout));
            }
        };
        let elapsed = start.elapsed();

        let truncated = apply_limit(&mut rows, query.limit);
        let mut result = parse_rows(&rows, truncated, elapsed)?;
        if result.columns.is_empty() {
            result.columns = statement
                .columns()
                .iter()
                .map(|c| ColumnInfo::new(c.name(), c.type_().name()))
                .collect();
        }
        info!(
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = elapsed.as_millis() as u64,
            "executed SQL query"
        );
        Ok(result)
    }
}

async fn cancel_query(client: &Client, tls: Option<&MakeTlsConnector>) {
    let token = client.cancel_token();
    let outcome = match tls {
        Some(tls) => token.cancel_query(tls.clone()).await,
        None => token.cancel_query(NoTls).await,
    };
    if let Err(e) = outcome {
        warn!(error = %e, "failed to cancel query");
    }
}
