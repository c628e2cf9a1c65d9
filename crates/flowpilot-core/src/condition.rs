//! Condition data model
//!
//! A condition is either a raw expression string, a simple
//! `{field, operator, value}` predicate, or a complex and/or/not tree.
//! Evaluation lives in the engine; this module only defines the shapes
//! the workflow language serializes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Comparison operator of a simple condition
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "==", alias = "eq")]
    #[strum(to_string = "equals", serialize = "==", serialize = "eq")]
    Equals,
    #[serde(alias = "!=", alias = "ne")]
    #[strum(to_string = "not_equals", serialize = "!=", serialize = "ne")]
    NotEquals,
    #[serde(alias = ">", alias = "gt")]
    #[strum(to_string = "greater_than", serialize = ">", serialize = "gt")]
    GreaterThan,
    #[serde(alias = ">=", alias = "gte")]
    #[strum(to_string = "greater_than_or_equal", serialize = ">=", serialize = "gte")]
    GreaterThanOrEqual,
    #[serde(alias = "<", alias = "lt")]
    #[strum(to_string = "less_than", serialize = "<", serialize = "lt")]
    LessThan,
    #[serde(alias = "<=", alias = "lte")]
    #[strum(to_string = "less_than_or_equal", serialize = "<=", serialize = "lte")]
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    /// Value is an array; true when the resolved field is one of its elements
    In,
    NotIn,
    /// Regular-expression match against the string form of the field
    Matches,
    Exists,
    NotExists,
    IsEmpty,
    IsNotEmpty,
    /// Field is a date within the last `value` days
    WithinLastDays,
    /// Field is a date strictly before `value`
    Before,
    /// Field is a date strictly after `value`
    After,
}

/// A `{field, operator, value}` predicate; `field` is a reference path
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SimpleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

/// Boolean combinators over nested conditions
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComplexCondition {
    ComplexAnd { conditions: Vec<Condition> },
    ComplexOr { conditions: Vec<Condition> },
    ComplexNot { condition: Box<Condition> },
}

/// The condition sum type
///
/// Deserialization tries the tagged complex form first, then the simple
/// predicate, and falls back to a raw expression string.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Condition {
    Complex(ComplexCondition),
    Simple(SimpleCondition),
    Raw(String),
}

impl Condition {
    /// Convenience constructor for an equality predicate
    pub fn field_equals(field: &str, value: Value) -> Self {
        Condition::Simple(SimpleCondition {
            field: field.to_string(),
            operator: ConditionOperator::Equals,
            value,
        })
    }
}
