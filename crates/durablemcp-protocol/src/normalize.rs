//! Numeric normalization for log round-trips.
//!
//! JSON treats `1` and `1.0` as the same number, but a message that goes
//! through the durable log and back can come out with integral fields
//! re-tagged as floats, which strict model validation then rejects. Every
//! decode from persisted form runs through [`normalize_numbers`] to coerce
//! integral floats back to integers before validation.

use serde_json::{Number, Value};

/// Recursively coerce any floating-point number whose value is integral
/// into an integer.
///
/// Values outside the exactly-representable integer range of `f64` are left
/// untouched.
pub fn normalize_numbers(value: &mut Value) {
    match value {
        Value::Number(number) => {
            if let Some(normalized) = normalize_number(number) {
                *number = normalized;
            }
        }
        Value::Array(items) => {
            for item in items {
                normalize_numbers(item);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                normalize_numbers(item);
            }
        }
        _ => {}
    }
}

// f64 represents integers exactly up to 2^53.
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;

fn normalize_number(number: &Number) -> Option<Number> {
    if number.is_i64() || number.is_u64() {
        return None;
    }
    let float = number.as_f64()?;
    if float.fract() == 0.0 && float.abs() < MAX_EXACT_INT {
        Some(Number::from(float as i64))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn integral_floats_become_integers() {
        let mut value = json!({"progress": 1.0, "total": 2.0});
        normalize_numbers(&mut value);
        assert_eq!(value, json!({"progress": 1, "total": 2}));
        assert!(value["progress"].is_i64());
    }

    #[test]
    fn fractional_floats_are_untouched() {
        let mut value = json!({"progress": 0.5});
        normalize_numbers(&mut value);
        assert!(value["progress"].is_f64());
    }

    #[test]
    fn nested_structures_are_walked() {
        let mut value = json!({
            "params": {"items": [1.0, 2.5, {"count": 3.0}]},
            "id": 4
        });
        normalize_numbers(&mut value);
        assert_eq!(
            value,
            json!({"params": {"items": [1, 2.5, {"count": 3}]}, "id": 4})
        );
    }

    #[test]
    fn huge_floats_are_left_alone() {
        let mut value = json!(1.0e300);
        normalize_numbers(&mut value);
        assert!(value.is_f64());
    }

    #[test]
    fn round_trip_through_text_is_identity_after_normalization() {
        // A message whose integral fields were widened to floats compares
        // equal to the original once normalized.
        let original = json!({"jsonrpc": "2.0", "result": {"value": 8}, "id": 1});
        let mut widened = json!({"jsonrpc": "2.0", "result": {"value": 8.0}, "id": 1.0});
        normalize_numbers(&mut widened);
        assert_eq!(original, widened);
    }
}
