use std::ops::{BitAnd, BitOr, Not};

use super::{CompareOp, Expr, Filter, WILDCARD};

/// Programmatic filter construction without string escaping.
///
/// ```
/// use svckit::filter::Prop;
///
/// let f = (Prop::new("objectclass").eq("svc.Printer") & Prop::new("pages").ge(100)).build();
/// assert_eq!(f.to_string(), "(&(objectclass=svc.Printer)(pages>=100))");
/// ```
#[derive(Debug, Clone)]
pub struct Prop {
    name: String,
}

impl Prop {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn compare(self, op: CompareOp, value: String) -> Expr {
        Expr::Compare {
            op,
            attr: self.name,
            value,
        }
    }

    /// Literal equality; `*` in `value` is not a wildcard.
    pub fn eq(self, value: impl ToString) -> Expr {
        self.compare(CompareOp::Eq, value.to_string())
    }

    /// Equality where `*` in `pattern` matches any run of characters.
    pub fn like(self, pattern: &str) -> Expr {
        self.compare(CompareOp::Eq, pattern.replace('*', &WILDCARD.to_string()))
    }

    pub fn le(self, value: impl ToString) -> Expr {
        self.compare(CompareOp::Le, value.to_string())
    }

    pub fn ge(self, value: impl ToString) -> Expr {
        self.compare(CompareOp::Ge, value.to_string())
    }

    pub fn approx(self, value: impl ToString) -> Expr {
        self.compare(CompareOp::Approx, value.to_string())
    }

    pub fn present(self) -> Expr {
        self.compare(CompareOp::Eq, WILDCARD.to_string())
    }
}

impl Expr {
    pub fn build(self) -> Filter {
        Filter::from_expr(self)
    }
}

impl BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        match self {
            Expr::And(mut ops) => {
                ops.push(rhs);
                Expr::And(ops)
            }
            lhs => Expr::And(vec![lhs, rhs]),
        }
    }
}

impl BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        match self {
            Expr::Or(mut ops) => {
                ops.push(rhs);
                Expr::Or(ops)
            }
            lhs => Expr::Or(vec![lhs, rhs]),
        }
    }
}

impl Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyMap;

    #[test]
    fn builds_escaped_filters() {
        let f = (Prop::new("name").eq("a*(b)") | !Prop::new("x").present()).build();
        assert_eq!(f.to_string(), r"(|(name=a\*\(b\))(!(x=*)))");
        assert!(f.matches(&PropertyMap::new().with("name", "a*(b)")));
        assert!(f.matches(&PropertyMap::new()));
    }

    #[test]
    fn like_keeps_wildcards() {
        let f = (Prop::new("name").like("La*") & Prop::new("n").ge(2) & Prop::new("n").le(5)).build();
        assert_eq!(f.to_string(), "(&(name=La*)(n>=2)(n<=5))");
        assert!(f.matches(&PropertyMap::new().with("name", "Laser").with("n", 3)));
    }
}
