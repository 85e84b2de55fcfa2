use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

const DEFAULT_RTOL: f64 = 1e-5;
const DEFAULT_ATOL: f64 = 1e-8;

fn default_rtol() -> f64 {
    DEFAULT_RTOL
}

fn default_atol() -> f64 {
    DEFAULT_ATOL
}

/// How an actual value is compared against an expected value.
///
/// Wire form: `{"type": "exact"}` or `{"type": "allclose", "rtol": r, "atol": a}`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Comparison {
    Exact,
    Allclose {
        #[serde(default = "default_rtol")]
        rtol: f64,
        #[serde(default = "default_atol")]
        atol: f64,
    },
}

impl Default for Comparison {
    fn default() -> Self {
        Comparison::Exact
    }
}

impl Comparison {
    pub fn matches(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Comparison::Exact => exact_eq(actual, expected),
            Comparison::Allclose { rtol, atol } => allclose(actual, expected, *rtol, *atol),
        }
    }
}

/// Structural equality with numeric leaves compared by value, so `3` and
/// `3.0` are equal the way they are under the source language's `==`.
fn exact_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| exact_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| exact_eq(x, y)))
        }
        _ => a == b,
    }
}

/// Tolerant comparison recursing into sequences and mappings, applying the
/// symmetric isclose rule at scalar leaves. Mapping comparison requires
/// identical key sets.
pub fn allclose(a: &Value, b: &Value, rtol: f64, atol: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => isclose(x, y, rtol, atol),
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len()
                && xs.iter().zip(ys).all(|(x, y)| allclose(x, y, rtol, atol))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs.keys().all(|key| ys.contains_key(key))
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| allclose(x, y, rtol, atol)))
        }
        _ => a == b,
    }
}

fn isclose(a: f64, b: f64, rtol: f64, atol: f64) -> bool {
    if a == b {
        return true;
    }
    if !a.is_finite() || !b.is_finite() {
        return false;
    }
    (a - b).abs() <= f64::max(rtol * f64::max(a.abs(), b.abs()), atol)
}
