//! Typed comparison of property values against filter patterns.

use super::{CompareOp, WILDCARD};
use crate::properties::PropertyValue;

/// Compares one property value with a comparison's pattern.
pub(crate) fn compare(value: &PropertyValue, op: CompareOp, pattern: &str) -> bool {
    match value {
        PropertyValue::Null => false,
        PropertyValue::Str(s) => compare_string(s, op, pattern),
        PropertyValue::Char(c) => compare_string(&c.to_string(), op, pattern),
        PropertyValue::Bool(b) => compare_bool(*b, op, pattern),
        PropertyValue::Int(i) => compare_integer(i128::from(*i), op, pattern),
        PropertyValue::UInt(u) => compare_integer(i128::from(*u), op, pattern),
        PropertyValue::Float(f) => compare_float(*f, op, pattern),
        PropertyValue::List(items) => items.iter().any(|item| compare(item, op, pattern)),
        PropertyValue::Map(_) => false,
    }
}

fn compare_string(s: &str, op: CompareOp, pattern: &str) -> bool {
    match op {
        CompareOp::Le => s <= pattern,
        CompareOp::Ge => s >= pattern,
        CompareOp::Eq => wildcard_match(s, pattern),
        CompareOp::Approx => approx_fold(s) == approx_fold(pattern),
    }
}

fn compare_bool(b: bool, op: CompareOp, pattern: &str) -> bool {
    match op {
        CompareOp::Le | CompareOp::Ge => false,
        CompareOp::Eq | CompareOp::Approx => {
            pattern.eq_ignore_ascii_case(if b { "true" } else { "false" })
        }
    }
}

fn compare_integer(v: i128, op: CompareOp, pattern: &str) -> bool {
    let Ok(p) = pattern.trim().parse::<i128>() else {
        return false;
    };
    match op {
        CompareOp::Le => v <= p,
        CompareOp::Ge => v >= p,
        CompareOp::Eq | CompareOp::Approx => v == p,
    }
}

fn compare_float(v: f64, op: CompareOp, pattern: &str) -> bool {
    let Ok(p) = pattern.trim().parse::<f64>() else {
        return false;
    };
    match op {
        CompareOp::Le => v <= p,
        CompareOp::Ge => v >= p,
        CompareOp::Eq | CompareOp::Approx => {
            let diff = (v - p).abs();
            diff < f64::EPSILON || diff <= f64::EPSILON * v.abs().max(p.abs())
        }
    }
}

/// Drops whitespace and lowercases, for `~=` comparisons.
fn approx_fold(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Matches `s` against a pattern where [`WILDCARD`] stands for any run of characters.
fn wildcard_match(s: &str, pattern: &str) -> bool {
    let text: Vec<char> = s.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pat.len() && pat[p] == WILDCARD {
            backtrack = Some((p, t));
            p += 1;
        } else if p < pat.len() && pat[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pat[p..].iter().all(|&c| c == WILDCARD)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(p: &str) -> String {
        p.replace('*', &WILDCARD.to_string())
    }

    #[test]
    fn wildcard_substrings() {
        assert!(wildcard_match("hello world", &w("hello*")));
        assert!(wildcard_match("hello world", &w("*world")));
        assert!(wildcard_match("hello world", &w("h*o*d")));
        assert!(wildcard_match("", &w("*")));
        assert!(!wildcard_match("hello", &w("h*x")));
        assert!(!wildcard_match("hello", "hell"));
        assert!(wildcard_match("a*b", "a*b"));
    }

    #[test]
    fn approx_ignores_case_and_whitespace() {
        assert!(compare_string("Hello World", CompareOp::Approx, "helloworld"));
        assert!(!compare_string("Hello", CompareOp::Approx, "help"));
    }

    #[test]
    fn numbers_compare_numerically() {
        assert!(compare(&PropertyValue::Int(10), CompareOp::Ge, "9"));
        assert!(compare(&PropertyValue::Int(10), CompareOp::Le, " 10"));
        assert!(compare(&PropertyValue::UInt(3), CompareOp::Ge, "-1"));
        assert!(!compare(&PropertyValue::Int(10), CompareOp::Eq, "1*"));
        assert!(!compare(&PropertyValue::Int(10), CompareOp::Eq, "ten"));
        assert!(compare(&PropertyValue::Float(1.5), CompareOp::Eq, "1.5"));
        assert!(compare(&PropertyValue::Float(1.5), CompareOp::Le, "2"));
    }

    #[test]
    fn booleans_only_support_equality() {
        assert!(compare(&PropertyValue::Bool(true), CompareOp::Eq, "TRUE"));
        assert!(!compare(&PropertyValue::Bool(true), CompareOp::Eq, "t"));
        assert!(!compare(&PropertyValue::Bool(true), CompareOp::Ge, "true"));
    }

    #[test]
    fn lists_match_any_element() {
        let list = PropertyValue::from(vec!["a", "b"]);
        assert!(compare(&list, CompareOp::Eq, "b"));
        assert!(!compare(&list, CompareOp::Eq, "c"));
        assert!(!compare(&PropertyValue::Null, CompareOp::Eq, "x"));
    }
}
