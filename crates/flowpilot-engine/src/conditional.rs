//! Condition evaluation
//!
//! Evaluates the condition tree against run state: `complex_and` folds
//! AND over its children, `complex_or` folds OR, `complex_not` inverts.
//! Simple conditions resolve their field reference and compare with the
//! operator table; raw strings go through the sandboxed expression
//! evaluator with JS-like truthiness.
//!
//! A field that fails to resolve behaves as undefined: existence checks
//! answer accordingly and every comparison is false (except
//! `not_equals`/`not_contains`/`not_in`, which are vacuously true).

use crate::context::ExecutionContext;
use crate::expression::{compare, evaluate_expression, loose_eq, truthy};
use crate::resolver::{resolve_reference, sole_reference};
use chrono::{DateTime, NaiveDate, Utc};
use flowpilot_core::condition::{ComplexCondition, Condition, ConditionOperator, SimpleCondition};
use flowpilot_core::error::{ConditionError, WorkflowError};
use log::debug;
use regex::Regex;
use serde_json::{Map, Value};

pub fn evaluate_condition(
    ctx: &ExecutionContext,
    condition: &Condition,
) -> Result<bool, WorkflowError> {
    match condition {
        Condition::Complex(complex) => match complex {
            ComplexCondition::ComplexAnd { conditions } => {
                for child in conditions {
                    if !evaluate_condition(ctx, child)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ComplexCondition::ComplexOr { conditions } => {
                for child in conditions {
                    if evaluate_condition(ctx, child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ComplexCondition::ComplexNot { condition } => {
                Ok(!evaluate_condition(ctx, condition)?)
            }
        },
        Condition::Simple(simple) => evaluate_simple(ctx, simple),
        Condition::Raw(expression) => {
            let value = evaluate_expression(ctx, expression, &Map::new())?;
            Ok(truthy(&value))
        }
    }
}

/// Evaluate a simple predicate against an explicit item (per-item filter
/// transforms bind the item before delegating here)
pub fn evaluate_simple(
    ctx: &ExecutionContext,
    condition: &SimpleCondition,
) -> Result<bool, WorkflowError> {
    let field = resolve_field(ctx, &condition.field);
    debug!(
        "condition field '{}' resolved to {:?} (op {})",
        condition.field, field, condition.operator
    );
    apply_operator(condition.operator, field.as_ref(), &condition.value)
        .map_err(WorkflowError::from)
}

/// Resolve a condition field. The field is a reference path, with or
/// without the `{{ }}` wrapper; failures mean "undefined".
fn resolve_field(ctx: &ExecutionContext, field: &str) -> Option<Value> {
    let path = sole_reference(field).unwrap_or_else(|| field.trim());
    resolve_reference(ctx, path).ok()
}

/// Apply an operator to an already-resolved field value; `None` means the
/// field is undefined. Shared with the per-item filter transform.
pub fn apply_operator(
    operator: ConditionOperator,
    field: Option<&Value>,
    expected: &Value,
) -> Result<bool, ConditionError> {
    use ConditionOperator::*;

    match operator {
        Exists => return Ok(matches!(field, Some(v) if !v.is_null())),
        NotExists => return Ok(!matches!(field, Some(v) if !v.is_null())),
        IsEmpty => return Ok(is_empty(field)),
        IsNotEmpty => return Ok(!is_empty(field)),
        _ => {}
    }

    let field = match field {
        Some(value) => value,
        None => {
            // undefined: only the negative operators hold
            return Ok(matches!(operator, NotEquals | NotContains | NotIn));
        }
    };

    match operator {
        Equals => Ok(loose_eq(field, expected)),
        NotEquals => Ok(!loose_eq(field, expected)),
        GreaterThan => Ok(compare(field, expected) == Some(std::cmp::Ordering::Greater)),
        GreaterThanOrEqual => Ok(matches!(
            compare(field, expected),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        )),
        LessThan => Ok(compare(field, expected) == Some(std::cmp::Ordering::Less)),
        LessThanOrEqual => Ok(matches!(
            compare(field, expected),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        )),
        Contains => Ok(contains(field, expected)),
        NotContains => Ok(!contains(field, expected)),
        StartsWith => Ok(as_text(field).starts_with(&as_text(expected))),
        EndsWith => Ok(as_text(field).ends_with(&as_text(expected))),
        In => match expected {
            Value::Array(options) => Ok(options.iter().any(|option| loose_eq(field, option))),
            other => Err(ConditionError::NotComparable {
                operator: "in".into(),
                detail: format!("expected an array of options, found {:?}", other),
            }),
        },
        NotIn => match expected {
            Value::Array(options) => Ok(!options.iter().any(|option| loose_eq(field, option))),
            other => Err(ConditionError::NotComparable {
                operator: "not_in".into(),
                detail: format!("expected an array of options, found {:?}", other),
            }),
        },
        Matches => {
            let pattern = expected.as_str().ok_or_else(|| ConditionError::NotComparable {
                operator: "matches".into(),
                detail: "pattern must be a string".into(),
            })?;
            let regex = Regex::new(pattern)
                .map_err(|e| ConditionError::BadExpression(format!("bad pattern: {}", e)))?;
            Ok(regex.is_match(&as_text(field)))
        }
        WithinLastDays => {
            let days = expected.as_f64().ok_or_else(|| ConditionError::NotComparable {
                operator: "within_last_days".into(),
                detail: "expected a number of days".into(),
            })?;
            let date = parse_date(field).ok_or_else(|| ConditionError::NotComparable {
                operator: "within_last_days".into(),
                detail: format!("field is not a date: {:?}", field),
            })?;
            let cutoff = Utc::now() - chrono::Duration::seconds((days * 86_400.0) as i64);
            Ok(date >= cutoff)
        }
        Before => match (parse_date(field), parse_date(expected)) {
            (Some(lhs), Some(rhs)) => Ok(lhs < rhs),
            _ => Err(ConditionError::NotComparable {
                operator: "before".into(),
                detail: "both sides must be dates".into(),
            }),
        },
        After => match (parse_date(field), parse_date(expected)) {
            (Some(lhs), Some(rhs)) => Ok(lhs > rhs),
            _ => Err(ConditionError::NotComparable {
                operator: "after".into(),
                detail: "both sides must be dates".into(),
            }),
        },
        Exists | NotExists | IsEmpty | IsNotEmpty => unreachable!("handled above"),
    }
}

fn is_empty(field: Option<&Value>) -> bool {
    match field {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::Object(object)) => object.is_empty(),
        Some(_) => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::String(s) => s.contains(&as_text(needle)),
        Value::Object(object) => needle
            .as_str()
            .map(|key| object.contains_key(key))
            .unwrap_or(false),
        _ => false,
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Accept RFC3339 timestamps, bare dates, and epoch milliseconds
pub fn parse_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
            }
            None
        }
        Value::Number(n) => {
            let millis = n.as_i64()?;
            DateTime::<Utc>::from_timestamp_millis(millis)
        }
        _ => None,
    }
}
