//! Analysis intent types.
//!
//! An intent is the backend-agnostic description of one analytical read:
//! what to read, how to filter it, how to group and aggregate it, and how to
//! order and page the result. Intents arrive as JSON from the model layer, so
//! every type here is serde-deserializable and tolerant of common spellings
//! (`"="` for `eq`, `"descending"` for `desc`, ...).
use serde::{Deserialize, Serialize};

/// A single analytical read request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisIntent {
    /// Table or collection to query. Empty means "use the context hint".
    pub target: String,
    /// Optional projection. Empty selects every column.
    pub fields: Vec<String>,
    /// Conjunctive list of filters.
    pub filters: Vec<Filter>,
    pub group_by: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub sort: Vec<SortKey>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Column name a field gets in the result. A dotted field is a path into a
/// nested value, and its column joins the segments with `_`.
pub fn output_key(field: &str) -> String {
    field.replace('.', "_")
}

/// A filter node: a single predicate or a nested boolean group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Predicate(Predicate),
    /// Disjunction group: `{"or": [...]}`.
    Any { or: Vec<Filter> },
    /// Explicit conjunction group: `{"and": [...]}`.
    All { and: Vec<Filter> },
}

/// `field operator value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    #[serde(alias = "=", alias = "==", alias = "equals")]
    Eq,
    #[serde(alias = "!=", alias = "<>", alias = "neq")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    In,
    #[serde(alias = "like")]
    Contains,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Ne => "ne",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::Contains => "contains",
        }
    }

    /// Range comparisons (`gt`, `gte`, `lt`, `lte`).
    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte
        )
    }
}

/// Literal operand of a predicate.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "string",
            Value::List(_) => "list",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    #[serde(alias = "average", alias = "mean")]
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// `function(field) AS alias`. A field of `*` is only meaningful for `count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    #[serde(default = "wildcard")]
    pub field: String,
    #[serde(default)]
    pub alias: Option<String>,
}

fn wildcard() -> String {
    "*".to_string()
}

impl Aggregation {
    pub fn is_wildcard(&self) -> bool {
        self.field == "*"
    }

    /// Name of the output column: the alias, or `<function>_<field>`.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) if !alias.is_empty() => alias.clone(),
            _ if self.is_wildcard() => format!("{}_all", self.function.as_str()),
            _ => format!("{}_{}", self.function.as_str(), output_key(&self.field)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    #[serde(alias = "ascending", alias = "ASC")]
    Asc,
    #[serde(alias = "descending", alias = "DESC")]
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

// Builders, mostly for callers assembling intents in code.

impl AnalysisIntent {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    pub fn select<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn aggregate(
        mut self,
        function: AggregateFunction,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.aggregations.push(Aggregation {
            function,
            field: field.into(),
            alias: Some(alias.into()),
        });
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn is_aggregate(&self) -> bool {
        !self.aggregations.is_empty() || !self.group_by.is_empty()
    }
}

impl Filter {
    pub fn predicate(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Filter::Predicate(Predicate {
            field: field.into(),
            operator,
            value: value.into(),
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::predicate(field, Operator::Eq, value)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Any { or: filters }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::All { and: filters }
    }
}
