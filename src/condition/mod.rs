//! Condition Algebra
//!
//! Nested AND/OR expression trees over named snapshot fields, used by
//! condition nodes for branching and by order templates for entry rules.

mod evaluator;
mod parse;

pub use evaluator::{lookup_field, ConditionEvaluator, EvaluationDetail, EvaluationResult};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Boolean connective of a condition group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

impl std::fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogicalOperator::And => write!(f, "AND"),
            LogicalOperator::Or => write!(f, "OR"),
        }
    }
}

/// Leaf comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Gt,
    Lt,
    Gte,
    Lte,
    Eq,
    Neq,
    Contains,
    NotContains,
    In,
    NotIn,
    Exists,
}

impl ComparisonOperator {
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ComparisonOperator::Gt
                | ComparisonOperator::Lt
                | ComparisonOperator::Gte
                | ComparisonOperator::Lte
        )
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::Gt => ">",
            ComparisonOperator::Lt => "<",
            ComparisonOperator::Gte => ">=",
            ComparisonOperator::Lte => "<=",
            ComparisonOperator::Eq => "==",
            ComparisonOperator::Neq => "!=",
            ComparisonOperator::Contains => "contains",
            ComparisonOperator::NotContains => "not_contains",
            ComparisonOperator::In => "in",
            ComparisonOperator::NotIn => "not_in",
            ComparisonOperator::Exists => "exists",
        }
    }
}

impl std::fmt::Display for ComparisonOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// A single `field <op> value` comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ComparisonOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ComparisonOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.operator == ComparisonOperator::Exists {
            return write!(f, "{} exists", self.field);
        }
        write!(f, "{} {} {}", self.field, self.operator, self.value)
    }
}

/// Either a leaf comparison or a nested group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionItem {
    Group(ConditionGroup),
    Condition(Condition),
}

impl From<Condition> for ConditionItem {
    fn from(condition: Condition) -> Self {
        ConditionItem::Condition(condition)
    }
}

impl From<ConditionGroup> for ConditionItem {
    fn from(group: ConditionGroup) -> Self {
        ConditionItem::Group(group)
    }
}

/// Recursive AND/OR expression tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionGroup {
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<ConditionItem>,
}

impl ConditionGroup {
    pub fn new(operator: LogicalOperator, conditions: Vec<ConditionItem>) -> Self {
        Self {
            operator,
            conditions,
        }
    }

    /// AND over the given items
    pub fn all<I: Into<ConditionItem>>(items: impl IntoIterator<Item = I>) -> Self {
        Self::new(LogicalOperator::And, items.into_iter().map(Into::into).collect())
    }

    /// OR over the given items
    pub fn any<I: Into<ConditionItem>>(items: impl IntoIterator<Item = I>) -> Self {
        Self::new(LogicalOperator::Or, items.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Number of leaf comparisons in the whole tree
    pub fn leaf_count(&self) -> usize {
        self.conditions
            .iter()
            .map(|item| match item {
                ConditionItem::Condition(_) => 1,
                ConditionItem::Group(group) => group.leaf_count(),
            })
            .sum()
    }
}

impl std::fmt::Display for ConditionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .conditions
            .iter()
            .map(|item| match item {
                ConditionItem::Condition(c) => c.to_string(),
                ConditionItem::Group(g) => format!("({})", g),
            })
            .collect();
        write!(f, "{}", parts.join(&format!(" {} ", self.operator)))
    }
}
