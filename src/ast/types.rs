//! SQL AST types for generated queries.
//!
//! This is the representation the SQL adapter builds from an intent before
//! compiling it to text. It only covers the read-only SELECT shapes an
//! analysis intent can express, so every node maps to exactly one piece of
//! PostgreSQL syntax. Values never appear as literals in a filter: they are
//! `Parameter` placeholders whose bound values travel next to the text.

/// A SELECT query with the clauses an intent can produce.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// A single item in the SELECT projection list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    /// An expression, optionally aliased: `expr AS alias`.
    Expression {
        expr: Expression,
        alias: Option<String>,
    },
}

/// Table reference in FROM clause: `schema.table`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    /// Split a dotted target (`analytics.orders`) into schema and table.
    pub fn parse(target: &str) -> Self {
        match target.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => TableRef {
                schema: Some(schema.to_string()),
                name: name.to_string(),
            },
            _ => TableRef {
                schema: None,
                name: target.to_string(),
            },
        }
    }
}

/// Core expression type. Recursive to support nested boolean groups.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Column reference. A path longer than one segment selects a field of
    /// a composite value: `("customer")."country"`.
    Column { path: Vec<String> },
    /// Binary operation: `left op right`.
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    /// Aggregate function: `COUNT(*)`, `SUM(col)`.
    Aggregate { name: String, args: Vec<Expression> },
    /// expr [NOT] IN (list).
    InList {
        expr: Box<Expression>,
        list: Vec<Expression>,
        negated: bool,
    },
    /// expr IS NULL / IS NOT NULL.
    IsNull {
        expr: Box<Expression>,
        negated: bool,
    },
    /// Wildcard `*` (used in COUNT(*)).
    Wildcard,
    /// Parameter placeholder: `$1`, `$2`, etc.
    Parameter(usize),
    /// Nested expression (parenthesized).
    Nested(Box<Expression>),
}

impl Expression {
    /// Column reference; `customer.country` becomes a field path.
    pub fn column(name: &str) -> Self {
        let path: Vec<String> = name.split('.').map(str::to_string).collect();
        if path.iter().any(String::is_empty) {
            return Expression::plain_column(name);
        }
        Expression::Column { path }
    }

    /// Column reference taken verbatim, dots included.
    pub fn plain_column(name: &str) -> Self {
        Expression::Column {
            path: vec![name.to_string()],
        }
    }

    pub fn is_path(&self) -> bool {
        matches!(self, Expression::Column { path } if path.len() > 1)
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// Fold expressions with a logical operator, parenthesizing each operand
    /// that is itself a boolean combination.
    pub fn fold(exprs: Vec<Expression>, op: BinaryOperator) -> Option<Expression> {
        exprs
            .into_iter()
            .map(|e| match e {
                Expression::BinaryOp {
                    op: BinaryOperator::And | BinaryOperator::Or,
                    ..
                } => Expression::Nested(Box::new(e)),
                other => other,
            })
            .reduce(|acc, e| Expression::binary(acc, op.clone(), e))
    }
}

/// Binary operators.
#[derive(Debug, Clone, PartialEq)]
pub enum BinaryOperator {
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
    // String
    Like,
}

/// ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: Option<bool>,
    pub nulls_first: Option<bool>,
}
