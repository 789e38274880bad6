//! Finite-number coercion for upstream payloads.
//!
//! The leaderboard and stats APIs mix JSON numbers with numeric strings and
//! occasionally emit `null`, empty strings, or nonsense where a number is
//! expected. Every ingest boundary goes through these helpers; nothing
//! downstream ever sees a NaN or infinity.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Coerce a JSON value into a finite f64, or `None`.
pub fn as_finite_f64(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Coerce a JSON value into a non-negative integer count, or `None`.
pub fn as_count(v: &Value) -> Option<i64> {
    as_finite_f64(v)
        .filter(|n| *n >= 0.0)
        .map(|n| n.round() as i64)
}

/// Serde field helper: number-or-string → `Option<f64>`, non-finite → `None`.
pub fn de_opt_finite<'de, D>(de: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    Ok(v.as_ref().and_then(as_finite_f64))
}

/// Serde field helper: number-or-string → `Option<i64>` count.
pub fn de_opt_count<'de, D>(de: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<Value>::deserialize(de)?;
    Ok(v.as_ref().and_then(as_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_as_finite_f64_accepts_numbers_and_numeric_strings() {
        assert_eq!(as_finite_f64(&json!(0.75)), Some(0.75));
        assert_eq!(as_finite_f64(&json!("0.75")), Some(0.75));
        assert_eq!(as_finite_f64(&json!(" 42 ")), Some(42.0));
        assert_eq!(as_finite_f64(&json!(-3)), Some(-3.0));
    }

    #[test]
    fn test_as_finite_f64_rejects_garbage() {
        assert_eq!(as_finite_f64(&json!(null)), None);
        assert_eq!(as_finite_f64(&json!("")), None);
        assert_eq!(as_finite_f64(&json!("abc")), None);
        assert_eq!(as_finite_f64(&json!({"x": 1})), None);
        assert_eq!(as_finite_f64(&json!("NaN")), None);
        assert_eq!(as_finite_f64(&json!("inf")), None);
    }

    #[test]
    fn test_as_count_rounds_and_rejects_negatives() {
        assert_eq!(as_count(&json!(80)), Some(80));
        assert_eq!(as_count(&json!("80")), Some(80));
        assert_eq!(as_count(&json!(79.6)), Some(80));
        assert_eq!(as_count(&json!(-1)), None);
    }

    #[test]
    fn test_de_opt_finite_via_struct() {
        #[derive(serde::Deserialize)]
        struct S {
            #[serde(default, deserialize_with = "de_opt_finite")]
            x: Option<f64>,
        }
        let s: S = serde_json::from_str(r#"{"x": "1.5"}"#).unwrap();
        assert_eq!(s.x, Some(1.5));
        let s: S = serde_json::from_str(r#"{"x": "nope"}"#).unwrap();
        assert_eq!(s.x, None);
        let s: S = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(s.x, None);
    }
}
