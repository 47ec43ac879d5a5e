//! LDAP-style (RFC 1960) filter expressions over property maps.
//!
//! A [`Filter`] is parsed once and is immutable afterwards; clones share the
//! parsed tree. Evaluation is typed: strings use substring wildcards, numbers
//! compare numerically, lists match when any element matches.

mod builder;
mod eval;
mod parser;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::properties::{PropertyMap, OBJECTCLASS};

pub use builder::Prop;

/// Internal marker for an unescaped `*` in a comparison value.
pub(crate) const WILDCARD: char = '\u{FFFF}';

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("{message}: {rest}")]
    Syntax { message: &'static str, rest: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Le,
    Ge,
    Approx,
}

impl CompareOp {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Le => "<=",
            CompareOp::Ge => ">=",
            CompareOp::Approx => "~=",
        }
    }
}

/// Parsed filter tree.
///
/// `value` holds the unescaped pattern; wildcards are stored as [`WILDCARD`]
/// so that an escaped `\*` stays a literal asterisk.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        attr: String,
        value: String,
    },
}

impl Expr {
    fn evaluate(&self, props: &PropertyMap, match_case: bool) -> bool {
        match self {
            Expr::And(ops) => ops.iter().all(|e| e.evaluate(props, match_case)),
            Expr::Or(ops) => ops.iter().any(|e| e.evaluate(props, match_case)),
            Expr::Not(inner) => !inner.evaluate(props, match_case),
            Expr::Compare { op, attr, value } => {
                let found = if match_case {
                    props.get_exact(attr)
                } else {
                    props.get(attr)
                };
                let Some(found) = found else {
                    return false;
                };
                if *op == CompareOp::Eq && is_presence(value) {
                    return !found.is_null();
                }
                eval::compare(found, *op, value)
            }
        }
    }

    fn classify_into(&self, keywords: &[&str], match_case: bool, out: &mut [Vec<String>]) -> bool {
        match self {
            Expr::Compare {
                op: CompareOp::Eq,
                attr,
                value,
            } => {
                if value.contains(WILDCARD) {
                    return false;
                }
                let idx = keywords.iter().position(|kw| {
                    if match_case {
                        attr == kw
                    } else {
                        attr.eq_ignore_ascii_case(kw)
                    }
                });
                match idx {
                    Some(i) => {
                        out[i].push(value.clone());
                        true
                    }
                    None => false,
                }
            }
            Expr::Or(ops) => ops
                .iter()
                .all(|e| e.classify_into(keywords, match_case, out)),
            _ => false,
        }
    }

    fn object_classes(&self) -> BTreeSet<String> {
        match self {
            Expr::Compare {
                op: CompareOp::Eq,
                attr,
                value,
            } if attr.eq_ignore_ascii_case(OBJECTCLASS) && !value.contains(WILDCARD) => {
                BTreeSet::from([value.clone()])
            }
            Expr::And(ops) => {
                let mut acc: Option<BTreeSet<String>> = None;
                for set in ops.iter().map(Expr::object_classes) {
                    if set.is_empty() {
                        continue;
                    }
                    acc = Some(match acc {
                        None => set,
                        Some(prev) => prev.intersection(&set).cloned().collect(),
                    });
                }
                acc.unwrap_or_default()
            }
            Expr::Or(ops) => {
                let mut acc = BTreeSet::new();
                for set in ops.iter().map(Expr::object_classes) {
                    if set.is_empty() {
                        return BTreeSet::new();
                    }
                    acc.extend(set);
                }
                acc
            }
            _ => BTreeSet::new(),
        }
    }
}

fn is_presence(value: &str) -> bool {
    let mut chars = value.chars();
    chars.next() == Some(WILDCARD) && chars.next().is_none()
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (tag, ops) = match self {
            Expr::And(ops) => ('&', ops.as_slice()),
            Expr::Or(ops) => ('|', ops.as_slice()),
            Expr::Not(inner) => return write!(f, "(!{inner})"),
            Expr::Compare { op, attr, value } => {
                write!(f, "({attr}{}", op.as_str())?;
                for c in value.chars() {
                    match c {
                        WILDCARD => f.write_str("*")?,
                        '(' | ')' | '*' | '\\' => write!(f, "\\{c}")?,
                        other => write!(f, "{other}")?,
                    }
                }
                return f.write_str(")");
            }
        };
        write!(f, "({tag}")?;
        for op in ops {
            write!(f, "{op}")?;
        }
        f.write_str(")")
    }
}

/// Immutable, cheaply clonable compiled filter.
#[derive(Clone, PartialEq)]
pub struct Filter {
    expr: Arc<Expr>,
}

impl Filter {
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        parser::parse(text).map(Self::from_expr)
    }

    pub fn from_expr(expr: Expr) -> Self {
        Self {
            expr: Arc::new(expr),
        }
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates against `props` with case-insensitive attribute names.
    pub fn matches(&self, props: &PropertyMap) -> bool {
        self.expr.evaluate(props, false)
    }

    /// Evaluates against `props`, requiring attribute names to match exactly.
    pub fn matches_case_sensitive(&self, props: &PropertyMap) -> bool {
        self.expr.evaluate(props, true)
    }

    /// Recognizes filters usable for indexed lookup: a single equality or a
    /// disjunction of equalities, each over one of `keywords` and without
    /// wildcards. Returns the literal values collected per keyword index.
    pub fn classify_simple(&self, keywords: &[&str], match_case: bool) -> Option<Vec<Vec<String>>> {
        let mut out = vec![Vec::new(); keywords.len()];
        self.expr
            .classify_into(keywords, match_case, &mut out)
            .then_some(out)
    }

    /// Interface names every match must be published under, when the filter
    /// constrains them. Empty means "not constrained".
    pub fn object_classes(&self) -> BTreeSet<String> {
        self.expr.object_classes()
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&self.to_string()).finish()
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

impl From<Expr> for Filter {
    fn from(expr: Expr) -> Self {
        Filter::from_expr(expr)
    }
}

impl serde::Serialize for Filter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Filter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Filter::parse(&text).map_err(serde::de::Error::custom)
    }
}
