//! Condition Evaluator
//!
//! Pure evaluation of a `ConditionGroup` against a JSON snapshot. Never
//! fails: non-numeric data under a numeric operator and missing fields both
//! evaluate the leaf as unmet.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ComparisonOperator, Condition, ConditionGroup, ConditionItem, LogicalOperator};

/// Outcome of a single leaf comparison, recorded when details are requested
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationDetail {
    pub field: String,
    pub operator: ComparisonOperator,
    pub expected: Value,
    /// `None` when the field was absent from the snapshot
    pub actual: Option<Value>,
    pub met: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

/// Result of evaluating a whole group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub met: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<EvaluationDetail>>,
}

/// Evaluates condition trees against data snapshots.
///
/// With `collect_details` off, AND stops at the first unmet child and OR at
/// the first met one. With it on, every leaf is evaluated and recorded so a
/// caller can explain why a branch was or was not taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator {
    collect_details: bool,
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_details() -> Self {
        Self {
            collect_details: true,
        }
    }

    pub fn collects_details(&self) -> bool {
        self.collect_details
    }

    pub fn evaluate(
        &self,
        group: &ConditionGroup,
        snapshot: &Value,
        subject_id: Option<&str>,
    ) -> EvaluationResult {
        let mut details = self.collect_details.then(Vec::new);
        let met = self.eval_group(group, snapshot, subject_id, &mut details);
        EvaluationResult { met, details }
    }

    fn eval_group(
        &self,
        group: &ConditionGroup,
        snapshot: &Value,
        subject_id: Option<&str>,
        details: &mut Option<Vec<EvaluationDetail>>,
    ) -> bool {
        let short_circuit = details.is_none();
        let mut acc = match group.operator {
            LogicalOperator::And => true,
            LogicalOperator::Or => false,
        };

        for item in &group.conditions {
            let met = match item {
                ConditionItem::Condition(condition) => {
                    let (met, actual) = evaluate_condition(condition, snapshot);
                    if let Some(details) = details.as_mut() {
                        details.push(EvaluationDetail {
                            field: condition.field.clone(),
                            operator: condition.operator,
                            expected: condition.value.clone(),
                            actual: actual.cloned(),
                            met,
                            subject_id: subject_id.map(String::from),
                        });
                    }
                    met
                }
                ConditionItem::Group(nested) => {
                    self.eval_group(nested, snapshot, subject_id, details)
                }
            };

            match group.operator {
                LogicalOperator::And => {
                    acc = acc && met;
                    if !acc && short_circuit {
                        return false;
                    }
                }
                LogicalOperator::Or => {
                    acc = acc || met;
                    if acc && short_circuit {
                        return true;
                    }
                }
            }
        }

        acc
    }
}

/// Evaluate one leaf; returns whether it is met and the snapshot value used
pub fn evaluate_condition<'a>(condition: &Condition, snapshot: &'a Value) -> (bool, Option<&'a Value>) {
    let actual = match lookup_field(snapshot, &condition.field) {
        Some(value) => value,
        None => return (false, None),
    };
    let expected = &condition.value;

    let met = match condition.operator {
        ComparisonOperator::Gt => compare_numbers(actual, expected, |a, b| a > b),
        ComparisonOperator::Lt => compare_numbers(actual, expected, |a, b| a < b),
        ComparisonOperator::Gte => compare_numbers(actual, expected, |a, b| a >= b),
        ComparisonOperator::Lte => compare_numbers(actual, expected, |a, b| a <= b),
        ComparisonOperator::Eq => values_equal(actual, expected),
        ComparisonOperator::Neq => !values_equal(actual, expected),
        ComparisonOperator::Contains => contains(actual, expected).unwrap_or(false),
        ComparisonOperator::NotContains => contains(actual, expected).map(|c| !c).unwrap_or(false),
        ComparisonOperator::In => match expected {
            Value::Array(items) => items.iter().any(|item| values_equal(actual, item)),
            _ => false,
        },
        ComparisonOperator::NotIn => match expected {
            Value::Array(items) => !items.iter().any(|item| values_equal(actual, item)),
            _ => false,
        },
        ComparisonOperator::Exists => true,
    };

    (met, Some(actual))
}

/// Resolve a field against the snapshot. An exact key wins over a dotted
/// path; `null` counts as missing.
pub fn lookup_field<'a>(snapshot: &'a Value, field: &str) -> Option<&'a Value> {
    if let Some(value) = snapshot.get(field) {
        return (!value.is_null()).then_some(value);
    }
    if !field.contains('.') {
        return None;
    }

    let mut current = snapshot;
    for segment in field.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!current.is_null()).then_some(current)
}

fn as_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            trimmed.parse::<f64>().ok()?
        }
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn compare_numbers(actual: &Value, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Strict equality, except that JSON integers and floats with the same
/// numeric value compare equal.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match actual {
        Value::String(haystack) => match expected {
            Value::String(needle) => Some(haystack.contains(needle.as_str())),
            _ => Some(false),
        },
        Value::Array(items) => Some(items.iter().any(|item| values_equal(item, expected))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ComparisonOperator as Op, Condition, ConditionGroup};
    use serde_json::json;

    fn leaf(field: &str, op: Op, value: Value) -> Condition {
        Condition::new(field, op, value)
    }

    #[test]
    fn test_numeric_operators_coerce_strings() {
        let snapshot = json!({ "price": "2950.5", "mcap": 60000 });
        let evaluator = ConditionEvaluator::new();

        let group = ConditionGroup::all([
            leaf("price", Op::Lt, json!(3000)),
            leaf("mcap", Op::Gte, json!("50000")),
        ]);
        assert!(evaluator.evaluate(&group, &snapshot, None).met);
    }

    #[test]
    fn test_numeric_operators_fail_closed_on_garbage() {
        let snapshot = json!({ "price": "n/a", "flag": true });
        let evaluator = ConditionEvaluator::new();

        for op in [Op::Gt, Op::Lt, Op::Gte, Op::Lte] {
            let group = ConditionGroup::all([leaf("price", op, json!(1))]);
            assert!(!evaluator.evaluate(&group, &snapshot, None).met);
            let group = ConditionGroup::all([leaf("flag", op, json!(0))]);
            assert!(!evaluator.evaluate(&group, &snapshot, None).met);
        }
    }

    #[test]
    fn test_missing_field_is_unmet_for_every_operator() {
        let snapshot = json!({ "present": 1, "nothing": null });
        let evaluator = ConditionEvaluator::new();

        for op in [
            Op::Gt,
            Op::Lt,
            Op::Gte,
            Op::Lte,
            Op::Eq,
            Op::Neq,
            Op::Contains,
            Op::NotContains,
            Op::In,
            Op::NotIn,
            Op::Exists,
        ] {
            for field in ["absent", "nothing"] {
                let group = ConditionGroup::all([leaf(field, op, json!([1]))]);
                assert!(
                    !evaluator.evaluate(&group, &snapshot, None).met,
                    "{op} on missing field must be unmet"
                );
            }
        }
    }

    #[test]
    fn test_strict_equality() {
        let snapshot = json!({ "n": 3000, "s": "3000", "f": 3000.0 });
        let evaluator = ConditionEvaluator::new();

        let eq = |field: &str, v: Value| {
            evaluator
                .evaluate(&ConditionGroup::all([leaf(field, Op::Eq, v)]), &snapshot, None)
                .met
        };
        assert!(eq("n", json!(3000)));
        assert!(eq("f", json!(3000)));
        assert!(!eq("s", json!(3000)));
        assert!(!eq("n", json!("3000")));

        let neq = ConditionGroup::all([leaf("s", Op::Neq, json!(3000))]);
        assert!(evaluator.evaluate(&neq, &snapshot, None).met);
    }

    #[test]
    fn test_contains_requires_string_or_array() {
        let snapshot = json!({ "name": "PEPE inu", "tags": ["meme", "new"], "mcap": 5 });
        let evaluator = ConditionEvaluator::new();
        let check = |field: &str, op: Op, v: Value| {
            evaluator
                .evaluate(&ConditionGroup::all([leaf(field, op, v)]), &snapshot, None)
                .met
        };

        assert!(check("name", Op::Contains, json!("PEPE")));
        assert!(check("tags", Op::Contains, json!("meme")));
        assert!(!check("mcap", Op::Contains, json!(5)));
        assert!(!check("mcap", Op::NotContains, json!(5)));
        assert!(check("tags", Op::NotContains, json!("old")));
    }

    #[test]
    fn test_in_and_dotted_paths() {
        let snapshot = json!({
            "get-price": { "price": 2900, "venues": [{ "name": "uniswap" }] },
            "chain": "base"
        });
        let evaluator = ConditionEvaluator::new();

        let group = ConditionGroup::all([
            leaf("get-price.price", Op::Lte, json!(3000)),
            leaf("get-price.venues.0.name", Op::Eq, json!("uniswap")),
            leaf("chain", Op::In, json!(["base", "ethereum"])),
            leaf("chain", Op::NotIn, json!(["solana"])),
        ]);
        assert!(evaluator.evaluate(&group, &snapshot, None).met);
    }

    #[test]
    fn test_short_circuit_skips_details_when_disabled() {
        let snapshot = json!({ "a": 1, "b": 2 });
        let group = ConditionGroup::all([leaf("a", Op::Gt, json!(5)), leaf("b", Op::Gt, json!(1))]);

        let plain = ConditionEvaluator::new().evaluate(&group, &snapshot, None);
        assert!(!plain.met);
        assert!(plain.details.is_none());

        let detailed = ConditionEvaluator::with_details().evaluate(&group, &snapshot, Some("tok-1"));
        assert!(!detailed.met);
        let details = detailed.details.unwrap();
        assert_eq!(details.len(), 2);
        assert!(!details[0].met);
        assert!(details[1].met);
        assert_eq!(details[1].actual, Some(json!(2)));
        assert_eq!(details[0].subject_id.as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_or_records_every_leaf_with_details() {
        let snapshot = json!({ "a": 10 });
        let group = ConditionGroup::any([
            leaf("a", Op::Gt, json!(5)),
            leaf("missing", Op::Eq, json!(1)),
        ]);

        let result = ConditionEvaluator::with_details().evaluate(&group, &snapshot, None);
        assert!(result.met);
        let details = result.details.unwrap();
        assert_eq!(details.len(), 2);
        assert_eq!(details[1].actual, None);
    }

    #[test]
    fn test_empty_groups_use_identity() {
        let snapshot = json!({});
        let evaluator = ConditionEvaluator::new();
        assert!(evaluator.evaluate(&ConditionGroup::all(Vec::<Condition>::new()), &snapshot, None).met);
        assert!(!evaluator.evaluate(&ConditionGroup::any(Vec::<Condition>::new()), &snapshot, None).met);
    }

    /// (a AND (b OR c)) OR (NOT-present d AND a) checked against plain
    /// boolean algebra for every assignment, including missing leaves.
    #[test]
    fn test_agrees_with_boolean_algebra_for_every_assignment() {
        let group = ConditionGroup::any([
            ConditionItem::Group(ConditionGroup::all([
                ConditionItem::Condition(leaf("a", Op::Eq, json!(1))),
                ConditionItem::Group(ConditionGroup::any([
                    leaf("b", Op::Gt, json!(0)),
                    leaf("c", Op::Lte, json!(0)),
                ])),
            ])),
            ConditionItem::Group(ConditionGroup::all([
                leaf("d", Op::Neq, json!(0)),
                leaf("a", Op::Eq, json!(1)),
            ])),
        ]);

        // Each field is either absent, or holds a value making its leaf true/false.
        let states = [None, Some(true), Some(false)];
        for a in states {
            for b in states {
                for c in states {
                    for d in states {
                        let mut snap = serde_json::Map::new();
                        if let Some(v) = a {
                            snap.insert("a".into(), json!(if v { 1 } else { 2 }));
                        }
                        if let Some(v) = b {
                            snap.insert("b".into(), json!(if v { 1 } else { -1 }));
                        }
                        if let Some(v) = c {
                            snap.insert("c".into(), json!(if v { 0 } else { 1 }));
                        }
                        if let Some(v) = d {
                            snap.insert("d".into(), json!(if v { 7 } else { 0 }));
                        }
                        let t = |x: Option<bool>| x.unwrap_or(false);
                        let expected = (t(a) && (t(b) || t(c))) || (t(d) && t(a));

                        let snapshot = Value::Object(snap);
                        for evaluator in [ConditionEvaluator::new(), ConditionEvaluator::with_details()] {
                            assert_eq!(
                                evaluator.evaluate(&group, &snapshot, None).met,
                                expected,
                                "a={a:?} b={b:?} c={c:?} d={d:?}"
                            );
                        }
                    }
                }
            }
        }
    }
}
