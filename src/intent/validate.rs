//! Backend-independent intent checks.
//!
//! Both adapters call [`AnalysisIntent::validate`] before building anything,
//! so an intent that breaks these rules never reaches a live connection.
use std::collections::HashSet;

use super::types::*;
use crate::error::{AdapterError, Result};

impl AnalysisIntent {
    /// Resolve the table/collection name, falling back to the context hint.
    pub fn resolve_target(&self, hint: Option<&str>) -> Result<String> {
        let target = self.target.trim();
        if !target.is_empty() {
            return Ok(target.to_string());
        }
        match hint.map(str::trim) {
            Some(h) if !h.is_empty() => Ok(h.to_string()),
            _ => Err(AdapterError::translation(
                "intent has no target and the context gives no target hint",
            )),
        }
    }

    /// Check the structural invariants every adapter relies on.
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if limit < 0 {
                return Err(AdapterError::translation(format!(
                    "limit must be non-negative, got {}",
                    limit
                )));
            }
        }
        if let Some(offset) = self.offset {
            if offset < 0 {
                return Err(AdapterError::translation(format!(
                    "offset must be non-negative, got {}",
                    offset
                )));
            }
        }

        for field in self.fields.iter().chain(&self.group_by) {
            check_field_name(field)?;
        }
        let mut sorted = HashSet::new();
        for key in &self.sort {
            check_field_name(&key.field)?;
            if !sorted.insert(key.field.as_str()) {
                return Err(AdapterError::translation(format!(
                    "field '{}' appears more than once in sort",
                    key.field
                )));
            }
        }
        if !self.is_aggregate() {
            unique_columns(&self.fields, "field")?;
        }
        for filter in &self.filters {
            validate_filter(filter)?;
        }
        self.validate_aggregations()
    }

    fn validate_aggregations(&self) -> Result<()> {
        let group_keys = unique_columns(&self.group_by, "group_by field")?;
        let mut outputs: HashSet<String> = HashSet::new();
        for agg in &self.aggregations {
            if agg.field.trim().is_empty() {
                return Err(AdapterError::translation(format!(
                    "{} aggregation has an empty field",
                    agg.function.as_str()
                )));
            }
            if !agg.is_wildcard() {
                check_field_name(&agg.field)?;
            }
            if agg.is_wildcard() && agg.function != AggregateFunction::Count {
                return Err(AdapterError::translation(format!(
                    "{}(*) is not supported; only count accepts '*'",
                    agg.function.as_str()
                )));
            }
            let name = agg.output_name();
            if group_keys.contains(&name) {
                return Err(AdapterError::translation(format!(
                    "aggregation alias '{}' collides with a group_by field",
                    name
                )));
            }
            if !outputs.insert(name.clone()) {
                return Err(AdapterError::translation(format!(
                    "duplicate aggregation alias '{}'",
                    name
                )));
            }
        }

        if self.is_aggregate() {
            if let Some(field) = self.fields.iter().find(|f| !self.group_by.contains(f)) {
                return Err(AdapterError::translation(format!(
                    "field '{}' is selected in a grouped read but is not in group_by",
                    field
                )));
            }
            for key in &self.sort {
                if !self.group_by.contains(&key.field) && !outputs.contains(&key.field) {
                    return Err(AdapterError::translation(format!(
                        "cannot sort aggregated result by '{}': not a group_by field or aggregation alias",
                        key.field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Map each field to its output column, rejecting two fields that would
/// land in the same column.
fn unique_columns(fields: &[String], what: &str) -> Result<HashSet<String>> {
    let mut columns = HashSet::new();
    for field in fields {
        let key = output_key(field);
        if !columns.insert(key.clone()) {
            return Err(AdapterError::translation(format!(
                "{} '{}' repeats output column '{}'",
                what, field, key
            )));
        }
    }
    Ok(columns)
}

fn check_field_name(field: &str) -> Result<()> {
    if field.trim().is_empty() {
        return Err(AdapterError::translation("field names must be non-empty"));
    }
    if field.split('.').any(|segment| segment.is_empty()) {
        return Err(AdapterError::translation(format!(
            "field name '{}' has an empty path segment",
            field
        )));
    }
    if field.contains('\0') {
        return Err(AdapterError::translation(format!(
            "field name {:?} contains a NUL byte",
            field
        )));
    }
    Ok(())
}

fn validate_filter(filter: &Filter) -> Result<()> {
    match filter {
        Filter::Predicate(p) => validate_predicate(p),
        Filter::Any { or: children } | Filter::All { and: children } => {
            if children.is_empty() {
                return Err(AdapterError::translation("empty filter group"));
            }
            children.iter().try_for_each(validate_filter)
        }
    }
}

fn validate_predicate(p: &Predicate) -> Result<()> {
    check_field_name(&p.field)?;
    let invalid = |expected: &str| {
        Err(AdapterError::translation(format!(
            "operator '{}' on '{}' expects {}, got {}",
            p.operator.as_str(),
            p.field,
            expected,
            p.value.type_name()
        )))
    };
    match (&p.operator, &p.value) {
        (Operator::In, Value::List(items)) if items.is_empty() => {
            invalid("a non-empty list")
        }
        (Operator::In, Value::List(items)) => {
            if items.iter().any(|v| matches!(v, Value::List(_))) {
                return invalid("a list of scalars");
            }
            Ok(())
        }
        (Operator::In, _) => invalid("a list"),
        (Operator::Contains, Value::Text(_)) => Ok(()),
        (Operator::Contains, _) => invalid("a string"),
        (op, Value::Null | Value::List(_)) if op.is_ordering() => invalid("a scalar"),
        (Operator::Eq | Operator::Ne, Value::List(_)) => invalid("a scalar"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_translation_err(intent: &AnalysisIntent, needle: &str) {
        match intent.validate() {
            Err(AdapterError::Translation(msg)) => {
                assert!(msg.contains(needle), "message {:?} lacks {:?}", msg, needle)
            }
            other => panic!("expected translation error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_intent() {
        let intent = AnalysisIntent::new("orders")
            .filter(Filter::eq("status", "shipped"))
            .group_by("region")
            .aggregate(AggregateFunction::Sum, "total", "revenue")
            .sort_by("revenue", SortDirection::Desc)
            .limit(10);
        assert!(intent.validate().is_ok());
    }

    #[test]
    fn test_negative_limit_and_offset() {
        assert_translation_err(&AnalysisIntent::new("t").limit(-1), "limit");
        assert_translation_err(&AnalysisIntent::new("t").offset(-5), "offset");
    }

    #[test]
    fn test_zero_limit_is_valid() {
        assert!(AnalysisIntent::new("t").limit(0).validate().is_ok());
    }

    #[test]
    fn test_ungrouped_field_with_aggregation() {
        let intent = AnalysisIntent::new("orders")
            .select(["region", "status"])
            .group_by("region")
            .aggregate(AggregateFunction::Count, "*", "n");
        assert_translation_err(&intent, "'status'");
    }

    #[test]
    fn test_ungrouped_field_without_aggregation() {
        let intent = AnalysisIntent::new("orders")
            .select(["region", "status"])
            .group_by("region");
        assert_translation_err(&intent, "'status'");
        let grouped_only = AnalysisIntent::new("orders")
            .select(["region"])
            .group_by("region");
        assert!(grouped_only.validate().is_ok());
    }

    #[test]
    fn test_repeated_sort_field_rejected() {
        let intent = AnalysisIntent::new("orders")
            .sort_by("total", SortDirection::Asc)
            .sort_by("total", SortDirection::Desc);
        assert_translation_err(&intent, "more than once in sort");
    }

    #[test]
    fn test_alias_collides_with_flattened_group_key() {
        let intent = AnalysisIntent::new("orders")
            .group_by("customer.country")
            .aggregate(AggregateFunction::Count, "*", "customer_country");
        assert_translation_err(&intent, "collides");
    }

    #[test]
    fn test_fields_sharing_an_output_column() {
        let grouped = AnalysisIntent::new("orders")
            .group_by("customer.country")
            .group_by("customer_country")
            .aggregate(AggregateFunction::Count, "*", "n");
        assert_translation_err(&grouped, "repeats output column 'customer_country'");
        let selected = AnalysisIntent::new("orders").select(["id", "id"]);
        assert_translation_err(&selected, "repeats output column 'id'");
    }

    #[test]
    fn test_empty_path_segment_rejected() {
        for field in ["customer.", ".country", "a..b"] {
            assert_translation_err(&AnalysisIntent::new("t").select([field]), "empty path segment");
        }
    }

    #[test]
    fn test_wildcard_only_for_count() {
        let intent = AnalysisIntent::new("orders").aggregate(AggregateFunction::Sum, "*", "s");
        assert_translation_err(&intent, "sum(*)");
    }

    #[test]
    fn test_duplicate_alias() {
        let intent = AnalysisIntent::new("orders")
            .aggregate(AggregateFunction::Count, "*", "n")
            .aggregate(AggregateFunction::Max, "total", "n");
        assert_translation_err(&intent, "duplicate");
    }

    #[test]
    fn test_alias_collides_with_group() {
        let intent = AnalysisIntent::new("orders")
            .group_by("region")
            .aggregate(AggregateFunction::Count, "*", "region");
        assert_translation_err(&intent, "collides");
    }

    #[test]
    fn test_sort_must_reference_output_when_grouped() {
        let intent = AnalysisIntent::new("orders")
            .group_by("region")
            .aggregate(AggregateFunction::Count, "*", "n")
            .sort_by("created_at", SortDirection::Asc);
        assert_translation_err(&intent, "created_at");
    }

    #[test]
    fn test_operator_value_shapes() {
        let cases = vec![
            (Filter::predicate("id", Operator::In, Value::List(vec![])), "non-empty"),
            (Filter::predicate("id", Operator::In, 3), "a list"),
            (Filter::predicate("name", Operator::Contains, 3), "a string"),
            (Filter::predicate("age", Operator::Gt, Value::Null), "a scalar"),
            (Filter::predicate("age", Operator::Eq, vec![1, 2]), "a scalar"),
        ];
        for (filter, needle) in cases {
            assert_translation_err(&AnalysisIntent::new("t").filter(filter), needle);
        }
    }

    #[test]
    fn test_empty_group_rejected() {
        let intent = AnalysisIntent::new("t").filter(Filter::or(vec![]));
        assert_translation_err(&intent, "empty filter group");
        let nested = AnalysisIntent::new("t").filter(Filter::or(vec![Filter::and(vec![])]));
        assert_translation_err(&nested, "empty filter group");
    }

    #[test]
    fn test_empty_field_rejected() {
        assert_translation_err(&AnalysisIntent::new("t").filter(Filter::eq(" ", 1)), "non-empty");
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(
            AnalysisIntent::new("orders").resolve_target(Some("other")).unwrap(),
            "orders"
        );
        assert_eq!(
            AnalysisIntent::new("").resolve_target(Some("fallback")).unwrap(),
            "fallback"
        );
        assert!(matches!(
            AnalysisIntent::new("  ").resolve_target(None),
            Err(AdapterError::Translation(_))
        ));
    }
}
