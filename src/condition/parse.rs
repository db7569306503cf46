//! Textual condition syntax used by the CLI: `mcap>50000`, `name contains PEPE`

use serde_json::Value;
use std::str::FromStr;

use super::{ComparisonOperator, Condition};
use crate::error::TradeflowError;

// Longer symbols first so `>=` is not read as `>`.
const SYMBOLS: &[(&str, ComparisonOperator)] = &[
    (">=", ComparisonOperator::Gte),
    ("<=", ComparisonOperator::Lte),
    ("!=", ComparisonOperator::Neq),
    ("==", ComparisonOperator::Eq),
    (">", ComparisonOperator::Gt),
    ("<", ComparisonOperator::Lt),
    ("=", ComparisonOperator::Eq),
];

const WORDS: &[(&str, ComparisonOperator)] = &[
    (" not_contains ", ComparisonOperator::NotContains),
    (" contains ", ComparisonOperator::Contains),
    (" not_in ", ComparisonOperator::NotIn),
    (" in ", ComparisonOperator::In),
];

impl FromStr for Condition {
    type Err = TradeflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(field) = s.strip_suffix(" exists") {
            return build(field, ComparisonOperator::Exists, "null", s);
        }

        for (word, op) in WORDS {
            if let Some(idx) = s.find(word) {
                return build(&s[..idx], *op, &s[idx + word.len()..], s);
            }
        }

        let hit = SYMBOLS
            .iter()
            .filter_map(|(sym, op)| s.find(sym).map(|idx| (idx, *sym, *op)))
            .min_by_key(|(idx, sym, _)| (*idx, std::cmp::Reverse(sym.len())));

        match hit {
            Some((idx, sym, op)) => build(&s[..idx], op, &s[idx + sym.len()..], s),
            None => Err(TradeflowError::Validation(format!(
                "condition '{}' has no comparison operator",
                s
            ))),
        }
    }
}

fn build(field: &str, operator: ComparisonOperator, raw: &str, source: &str) -> Result<Condition, TradeflowError> {
    let field = field.trim();
    if field.is_empty() {
        return Err(TradeflowError::Validation(format!(
            "condition '{}' is missing a field name",
            source
        )));
    }
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(TradeflowError::Validation(format!(
            "condition '{}' is missing a value",
            source
        )));
    }

    // JSON literals (numbers, booleans, arrays, quoted strings) parse as such;
    // anything else is taken as a bare string.
    let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    Ok(Condition {
        field: field.to_string(),
        operator,
        value,
    })
}
