//! Recursive-descent parser for RFC 1960 style filter strings.
//!
//! Every production returns a `Result`; malformed input is reported as a
//! [`FilterError::Syntax`] carrying the unparsed remainder, never a panic.

use super::{CompareOp, Expr, FilterError, WILDCARD};

/// Deepest composite nesting accepted before the parse is rejected.
pub(crate) const MAX_DEPTH: usize = 128;

pub(crate) fn parse(text: &str) -> Result<Expr, FilterError> {
    let mut state = ParseState::new(text);
    state.skip_white();
    if state.at_end() {
        return Err(FilterError::Syntax {
            message: "Null query",
            rest: String::new(),
        });
    }
    let expr = state.parse_expr()?;
    state.skip_white();
    if !state.at_end() {
        let rest = state.rest();
        return Err(state.error_with("Trailing garbage", format!("'{rest}'")));
    }
    Ok(expr)
}

struct ParseState {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl ParseState {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn rest(&self) -> String {
        self.chars[self.pos.min(self.chars.len())..].iter().collect()
    }

    fn error(&self, message: &'static str) -> FilterError {
        FilterError::Syntax {
            message,
            rest: self.rest(),
        }
    }

    fn error_with(&self, message: &'static str, rest: String) -> FilterError {
        FilterError::Syntax { message, rest }
    }

    fn peek(&self) -> Result<char, FilterError> {
        self.chars
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("Unexpected end of query"))
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    fn skip_white(&mut self) {
        while self
            .chars
            .get(self.pos)
            .is_some_and(|c| c.is_whitespace())
        {
            self.pos += 1;
        }
    }

    fn prefix(&mut self, pre: &str) -> bool {
        let len = pre.chars().count();
        if self.pos + len > self.chars.len() {
            return false;
        }
        let matches = self.chars[self.pos..self.pos + len]
            .iter()
            .copied()
            .eq(pre.chars());
        if matches {
            self.pos += len;
        }
        matches
    }

    fn expect(&mut self, c: char) -> Result<(), FilterError> {
        if self.peek()? != c {
            return Err(self.error("Malformed query"));
        }
        self.skip(1);
        Ok(())
    }

    fn parse_expr(&mut self) -> Result<Expr, FilterError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("Nesting too deep"));
        }
        self.depth += 1;
        let expr = self.parse_term();
        self.depth -= 1;
        expr
    }

    fn parse_term(&mut self) -> Result<Expr, FilterError> {
        self.expect('(')?;
        self.skip_white();
        let expr = match self.peek()? {
            '&' => {
                self.skip(1);
                Expr::And(self.parse_operands()?)
            }
            '|' => {
                self.skip(1);
                Expr::Or(self.parse_operands()?)
            }
            '!' => {
                self.skip(1);
                let mut operands = self.parse_operands()?;
                if operands.len() != 1 {
                    return Err(self.error("Malformed query"));
                }
                Expr::Not(Box::new(operands.remove(0)))
            }
            _ => self.parse_simple()?,
        };
        self.skip_white();
        self.expect(')')?;
        Ok(expr)
    }

    fn parse_operands(&mut self) -> Result<Vec<Expr>, FilterError> {
        let mut operands = Vec::new();
        self.skip_white();
        while self.peek()? == '(' {
            operands.push(self.parse_expr()?);
            self.skip_white();
        }
        if operands.is_empty() {
            return Err(self.error("Malformed query"));
        }
        Ok(operands)
    }

    fn parse_simple(&mut self) -> Result<Expr, FilterError> {
        let attr = self.attribute_name()?;
        let op = if self.prefix("=") {
            CompareOp::Eq
        } else if self.prefix("<=") {
            CompareOp::Le
        } else if self.prefix(">=") {
            CompareOp::Ge
        } else if self.prefix("~=") {
            CompareOp::Approx
        } else {
            return Err(self.error("Undefined operator"));
        };
        let value = self.attribute_value()?;
        Ok(Expr::Compare { op, attr, value })
    }

    fn attribute_name(&mut self) -> Result<String, FilterError> {
        let start = self.pos;
        let mut end = start;
        loop {
            let c = self.peek()?;
            if matches!(c, '(' | ')' | '<' | '>' | '=' | '~') {
                break;
            }
            if !c.is_whitespace() {
                end = self.pos + 1;
            }
            self.skip(1);
        }
        if end == start {
            return Err(self.error("Malformed query"));
        }
        Ok(self.chars[start..end].iter().collect())
    }

    fn attribute_value(&mut self) -> Result<String, FilterError> {
        let mut value = String::new();
        let mut depth = 0usize;
        loop {
            let c = self.peek()?;
            match c {
                '(' => {
                    depth += 1;
                    value.push(c);
                }
                ')' if depth == 0 => return Ok(value),
                ')' => {
                    depth -= 1;
                    value.push(c);
                }
                '*' => value.push(WILDCARD),
                '\\' => {
                    self.skip(1);
                    value.push(self.peek()?);
                }
                other => value.push(other),
            }
            self.skip(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn syntax_message(text: &str) -> &'static str {
        match parse(text) {
            Err(FilterError::Syntax { message, .. }) => message,
            other => panic!("expected syntax error for {text:?}, got {other:?}"),
        }
    }

    #[test]
    fn parses_nested_composites() {
        let expr = parse("(&(a=1)(|(b=2)(!(c=3))))").unwrap();
        match expr {
            Expr::And(ops) => {
                assert_eq!(ops.len(), 2);
                assert!(matches!(&ops[1], Expr::Or(inner) if inner.len() == 2));
            }
            other => panic!("unexpected expression: {other:?}"),
        }
    }

    #[test]
    fn trims_attribute_names_and_keeps_value_whitespace() {
        let expr = parse("( name  = hello world )").unwrap();
        assert_eq!(
            expr,
            Expr::Compare {
                op: CompareOp::Eq,
                attr: "name".into(),
                value: " hello world ".into(),
            }
        );
    }

    #[test]
    fn escapes_and_wildcards() {
        let expr = parse(r"(v=a\*b*c\\)").unwrap();
        let expected = format!("a*b{WILDCARD}c\\");
        assert!(matches!(expr, Expr::Compare { value, .. } if value == expected));
    }

    #[test]
    fn balanced_parentheses_inside_values() {
        let expr = parse("(v=f(x))").unwrap();
        assert!(matches!(expr, Expr::Compare { value, .. } if value == "f(x)"));
    }

    #[test]
    fn reports_each_error_kind() {
        assert_eq!(syntax_message(""), "Null query");
        assert_eq!(syntax_message("   "), "Null query");
        assert_eq!(syntax_message("(a=1) x"), "Trailing garbage");
        assert_eq!(syntax_message("(a=1"), "Unexpected end of query");
        assert_eq!(syntax_message("a=1"), "Malformed query");
        assert_eq!(syntax_message("(=1)"), "Malformed query");
        assert_eq!(syntax_message("(&)"), "Malformed query");
        assert_eq!(syntax_message("(!(a=1)(b=2))"), "Malformed query");
        assert_eq!(syntax_message("(a<1)"), "Undefined operator");
        assert_eq!(syntax_message(r"(a=1\"), "Unexpected end of query");
    }

    #[test]
    fn rejects_hostile_nesting_without_overflow() {
        let nested = |levels: usize| format!("{}(a=1){}", "(!".repeat(levels), ")".repeat(levels));

        assert!(parse(&nested(MAX_DEPTH - 1)).is_ok());
        assert_eq!(syntax_message(&nested(MAX_DEPTH)), "Nesting too deep");
        assert_eq!(syntax_message(&nested(200_000)), "Nesting too deep");
        assert_eq!(syntax_message(&"(&".repeat(100_000)), "Nesting too deep");
    }

    #[test]
    fn error_carries_remainder() {
        match parse("(a=1)(b=2)") {
            Err(FilterError::Syntax { rest, .. }) => assert_eq!(rest, "'(b=2)'"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
