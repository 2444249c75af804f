use serde_json::Value;

use weave_core::error::{Result, WeaveError};
use weave_core::types::ValueMap;

use crate::definition::{Condition, Operator};

/// Which branch a condition step selected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    /// Index of the predicate that matched, if any.
    pub matched: Option<usize>,
    /// Step selected to run, if the matching predicate names one.
    pub branch: Option<String>,
}

/// Evaluate ordered predicates against `context`.
///
/// The first true predicate selects its `then` target. When none match, the
/// first predicate that declares an `else` supplies the target. With no
/// match and no `else` the evaluation fails.
pub fn evaluate(step_id: &str, conditions: &[Condition], context: &ValueMap) -> Result<ConditionOutcome> {
    if conditions.is_empty() {
        return Err(WeaveError::StepFailed {
            step: step_id.to_string(),
            message: "no conditions defined".into(),
        });
    }

    for (i, cond) in conditions.iter().enumerate() {
        if check(cond, context)? {
            return Ok(ConditionOutcome {
                matched: Some(i),
                branch: cond.then.clone(),
            });
        }
    }

    match conditions.iter().find_map(|c| c.otherwise.clone()) {
        Some(target) => Ok(ConditionOutcome {
            matched: None,
            branch: Some(target),
        }),
        None => Err(WeaveError::StepFailed {
            step: step_id.to_string(),
            message: "no condition matched and no else branch".into(),
        }),
    }
}

/// Evaluate one predicate. A variable missing from `context` is an error.
///
/// Ordering against a non-numeric value and membership in a non-list value
/// are false, so `not_in` holds.
pub fn check(cond: &Condition, context: &ValueMap) -> Result<bool> {
    let actual = context
        .get(&cond.variable)
        .ok_or_else(|| WeaveError::MissingInput(cond.variable.clone()))?;
    let expected = &cond.value;

    let result = match cond.operator {
        Operator::Eq => loosely_equal(actual, expected),
        Operator::Ne => !loosely_equal(actual, expected),
        Operator::Gt | Operator::Lt | Operator::Gte | Operator::Lte => {
            match (coerce_number(actual), coerce_number(expected)) {
                (Some(a), Some(b)) => match cond.operator {
                    Operator::Gt => a > b,
                    Operator::Lt => a < b,
                    Operator::Gte => a >= b,
                    _ => a <= b,
                },
                _ => false,
            }
        }
        Operator::In => expected
            .as_array()
            .is_some_and(|items| items.iter().any(|v| loosely_equal(actual, v))),
        Operator::NotIn => !expected
            .as_array()
            .is_some_and(|items| items.iter().any(|v| loosely_equal(actual, v))),
        Operator::Contains => match actual {
            Value::Array(items) => items.iter().any(|v| loosely_equal(v, expected)),
            other => text(other).contains(&text(expected)),
        },
    };
    Ok(result)
}

/// Equality on the textual form, so `1`, `1.0` and `"1"` compare equal.
fn loosely_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (coerce_number(a), coerce_number(b)) {
        return x == y;
    }
    text(a) == text(b)
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(pairs: &[(&str, Value)]) -> ValueMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn cond(op: Operator, value: Value) -> Condition {
        Condition::new("x", op, value)
    }

    #[test]
    fn test_falls_through_to_else() {
        let conditions = vec![
            cond(Operator::Eq, json!(1)).then("A"),
            cond(Operator::Eq, json!(2)).then("B").otherwise("C"),
        ];
        let out = evaluate("route", &conditions, &ctx(&[("x", json!(5))])).unwrap();
        assert_eq!(out.branch.as_deref(), Some("C"));
        assert_eq!(out.matched, None);

        let out = evaluate("route", &conditions, &ctx(&[("x", json!(2))])).unwrap();
        assert_eq!(out.branch.as_deref(), Some("B"));
        assert_eq!(out.matched, Some(1));
    }

    #[test]
    fn test_no_match_without_else_fails() {
        let conditions = vec![cond(Operator::Eq, json!(1)).then("A")];
        let err = evaluate("route", &conditions, &ctx(&[("x", json!(9))])).unwrap_err();
        assert!(err.to_string().contains("no else branch"));
    }

    #[test]
    fn test_missing_variable_fails() {
        let conditions = vec![cond(Operator::Eq, json!(1)).then("A")];
        let err = evaluate("route", &conditions, &ValueMap::new()).unwrap_err();
        assert!(matches!(err, WeaveError::MissingInput(v) if v == "x"));
    }

    #[test]
    fn test_numeric_coercion() {
        let c = ctx(&[("x", json!("42"))]);
        assert!(check(&cond(Operator::Gt, json!(40)), &c).unwrap());
        assert!(check(&cond(Operator::Lte, json!("42.0")), &c).unwrap());
        assert!(!check(&cond(Operator::Lt, json!(42)), &c).unwrap());
        assert!(check(&cond(Operator::Gte, json!(42)), &c).unwrap());
        assert!(check(&cond(Operator::Eq, json!(42)), &c).unwrap());

        let c = ctx(&[("x", json!("high"))]);
        for op in [Operator::Gt, Operator::Lt, Operator::Gte, Operator::Lte] {
            assert!(!check(&cond(op, json!(1)), &c).unwrap());
        }
        assert!(!check(&cond(Operator::Gt, json!("n/a")), &ctx(&[("x", json!(3))])).unwrap());
    }

    #[test]
    fn test_non_numeric_comparison_falls_through() {
        let conditions = vec![
            cond(Operator::Gt, json!(5)).then("A"),
            cond(Operator::Eq, json!("low")).then("C").otherwise("B"),
        ];
        let out = evaluate("route", &conditions, &ctx(&[("x", json!("high"))])).unwrap();
        assert_eq!(out.branch.as_deref(), Some("B"));
        assert_eq!(out.matched, None);
    }

    #[test]
    fn test_membership_and_contains() {
        let c = ctx(&[("x", json!("b"))]);
        assert!(check(&cond(Operator::In, json!(["a", "b"])), &c).unwrap());
        assert!(!check(&cond(Operator::NotIn, json!(["a", "b"])), &c).unwrap());
        assert!(!check(&cond(Operator::In, json!("ab")), &c).unwrap());
        assert!(check(&cond(Operator::NotIn, json!("ab")), &c).unwrap());

        let c = ctx(&[("x", json!("error: disk full"))]);
        assert!(check(&cond(Operator::Contains, json!("disk")), &c).unwrap());

        let c = ctx(&[("x", json!(["red", "green"]))]);
        assert!(check(&cond(Operator::Contains, json!("green")), &c).unwrap());
        assert!(!check(&cond(Operator::Contains, json!("blue")), &c).unwrap());
    }

    #[test]
    fn test_not_in_scalar_selects_branch() {
        let conditions = vec![cond(Operator::NotIn, json!("blocked")).then("A").otherwise("B")];
        let out = evaluate("route", &conditions, &ctx(&[("x", json!("blocked"))])).unwrap();
        assert_eq!(out.branch.as_deref(), Some("A"));
    }

    #[test]
    fn test_ne_on_strings() {
        let c = ctx(&[("x", json!("ok"))]);
        assert!(check(&cond(Operator::Ne, json!("failed")), &c).unwrap());
        assert!(!check(&cond(Operator::Ne, json!("ok")), &c).unwrap());
    }
}
