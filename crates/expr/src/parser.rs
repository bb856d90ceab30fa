//! Infix query language.
//!
//! Grammar, lowest binding first:
//!
//! ```text
//! or      := and (("or" | "|") and)*
//! and     := not (("and" | "&") not)*
//! not     := ("not" | "~" | "!") not | eq
//! eq      := ord (("==" | "!=" | "=" | "intersects" | "contains" | "within") ord
//!                 | "is" ["not"] ("null" | "None"))*
//! ord     := add (("<" | "<=" | ">" | ">=") add)*
//! add     := mul (("+" | "-") mul)*
//! mul     := pow (("*" | "/" | "%") pow)*
//! pow     := postfix ["**" pow]
//! postfix := primary ("." ident ["(" args ")"])*
//! primary := number | string | bool | null | ident ["(" args ")"] | "(" or ")"
//! ```

use ktable_common::{KtableError, Result};

use crate::ast::{BinaryOp, Field, Func, Op, Scalar, ScalarKind, UnaryOp};

/// Parses query text into an expression tree.
pub fn parse(text: &str) -> Result<Op> {
    let tokens = lex(text)?;
    let mut p = Parser {
        text,
        tokens,
        pos: 0,
    };
    let op = p.parse_or()?;
    match p.peek() {
        Tok::End => Ok(op),
        _ => Err(p.error("unexpected trailing input")),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Number(String),
    /// Source text of a quoted string, quotes included.
    Str(String),
    Ident(String),
    /// Backtick-quoted identifier, taken verbatim.
    Quoted(String),
    Sym(&'static str),
    End,
}

const SYMBOLS: [&str; 21] = [
    "**", "==", "!=", "<=", ">=", "<", ">", "=", "+", "-", "*", "/", "%", "(", ")", ",", ".",
    "&", "|", "~", "!",
];

fn lex(text: &str) -> Result<Vec<(Tok, usize)>> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    'outer: while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        if c.is_ascii_digit() {
            i = scan_number(bytes, i);
            out.push((Tok::Number(text[start..i].to_string()), start));
            continue;
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push((Tok::Ident(text[start..i].to_string()), start));
            continue;
        }
        match c {
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= bytes.len() {
                    return Err(syntax_error(text, start, "unterminated string"));
                }
                i += 1;
                let src = &text[start..i];
                if serde_json::from_str::<String>(src).is_err() {
                    return Err(syntax_error(text, start, "invalid string escape"));
                }
                out.push((Tok::Str(src.to_string()), start));
                continue;
            }
            b'\'' | b'`' => {
                let Some(len) = text[i + 1..].find(c as char) else {
                    return Err(syntax_error(text, start, "unterminated quote"));
                };
                let inner = &text[i + 1..i + 1 + len];
                i += len + 2;
                let tok = if c == b'`' {
                    Tok::Quoted(inner.to_string())
                } else {
                    Tok::Str(text[start..i].to_string())
                };
                out.push((tok, start));
                continue;
            }
            _ => {}
        }
        for sym in SYMBOLS {
            if text[i..].starts_with(sym) {
                out.push((Tok::Sym(sym), start));
                i += sym.len();
                continue 'outer;
            }
        }
        return Err(syntax_error(text, start, "unexpected character"));
    }
    out.push((Tok::End, text.len()));
    Ok(out)
}

fn scan_number(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
    }
    if i + 1 < bytes.len() && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            i = j;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    i
}

/// Builds a parse error pointing at byte offset `at` of `text`.
pub(crate) fn syntax_error(text: &str, at: usize, message: &str) -> KtableError {
    let line_start = text[..at].rfind('\n').map(|p| p + 1).unwrap_or(0);
    let line_end = text[at..].find('\n').map(|p| at + p).unwrap_or(text.len());
    let column = text[line_start..at].chars().count();
    KtableError::Parse {
        message: message.to_string(),
        at: format!(
            "{}\n{}^",
            &text[line_start..line_end],
            " ".repeat(column)
        ),
    }
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].0
    }

    fn peek_at(&self, ahead: usize) -> &Tok {
        &self.tokens[(self.pos + ahead).min(self.tokens.len() - 1)].0
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: &str) -> KtableError {
        let at = self.tokens[self.pos.min(self.tokens.len() - 1)].1;
        syntax_error(self.text, at, message)
    }

    fn eat_sym(&mut self, sym: &str) -> bool {
        if matches!(self.peek(), Tok::Sym(s) if *s == sym) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, words: &[&str]) -> bool {
        if let Tok::Ident(w) = self.peek() {
            if words.contains(&w.as_str()) {
                self.advance();
                return true;
            }
        }
        false
    }

    fn expect_sym(&mut self, sym: &str) -> Result<()> {
        if self.eat_sym(sym) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{sym}'")))
        }
    }

    fn parse_or(&mut self) -> Result<Op> {
        let mut left = self.parse_and()?;
        while self.eat_sym("|") || self.eat_keyword(&["or", "OR"]) {
            let right = self.parse_and()?;
            left = Op::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Op> {
        let mut left = self.parse_not()?;
        while self.eat_sym("&") || self.eat_keyword(&["and", "AND"]) {
            let right = self.parse_not()?;
            left = Op::and(left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Op> {
        let prefix = if self.eat_sym("~") {
            "~"
        } else if self.eat_sym("!") {
            "!"
        } else if self.eat_keyword(&["not", "NOT"]) {
            "not"
        } else {
            return self.parse_eq();
        };
        let inner = self.parse_not()?;
        Ok(Op::UnaryOp(UnaryOp {
            prefix: prefix.to_string(),
            expr: Box::new(inner),
            suffix: String::new(),
        }))
    }

    fn parse_eq(&mut self) -> Result<Op> {
        let mut left = self.parse_ord()?;
        loop {
            if self.eat_keyword(&["is", "IS"]) {
                let negated = self.eat_keyword(&["not", "NOT"]);
                if !self.eat_keyword(&["null", "NULL", "None"]) {
                    return Err(self.error("expected 'null' after 'is'"));
                }
                let test = Op::func("is_null", vec![left]);
                left = if negated { Op::negate(test) } else { test };
                continue;
            }
            let op = match self.peek() {
                Tok::Sym("==") | Tok::Sym("=") => BinaryOp::Eq,
                Tok::Sym("!=") => BinaryOp::NotEq,
                Tok::Ident(w) if w == "intersects" => BinaryOp::Intersects,
                Tok::Ident(w) if w == "contains" => BinaryOp::Contains,
                Tok::Ident(w) if w == "within" => BinaryOp::Within,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_ord()?;
            left = Op::binary(left, op, right);
        }
    }

    fn parse_ord(&mut self) -> Result<Op> {
        let mut left = self.parse_add()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("<") => BinaryOp::Lt,
                Tok::Sym("<=") => BinaryOp::LtEq,
                Tok::Sym(">") => BinaryOp::Gt,
                Tok::Sym(">=") => BinaryOp::GtEq,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_add()?;
            left = Op::binary(left, op, right);
        }
    }

    fn parse_add(&mut self) -> Result<Op> {
        let mut left = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("+") => BinaryOp::Plus,
                Tok::Sym("-") => BinaryOp::Minus,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_mul()?;
            left = Op::binary(left, op, right);
        }
    }

    fn parse_mul(&mut self) -> Result<Op> {
        let mut left = self.parse_pow()?;
        loop {
            let op = match self.peek() {
                Tok::Sym("*") => BinaryOp::Multiply,
                Tok::Sym("/") => BinaryOp::Divide,
                Tok::Sym("%") => BinaryOp::Modulo,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.parse_pow()?;
            left = Op::binary(left, op, right);
        }
    }

    fn parse_pow(&mut self) -> Result<Op> {
        let base = self.parse_postfix()?;
        if self.eat_sym("**") {
            let exp = self.parse_pow()?;
            return Ok(Op::binary(base, BinaryOp::Pow, exp));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Op> {
        let mut node = self.parse_primary()?;
        while self.eat_sym(".") {
            let name = match self.advance() {
                Tok::Ident(n) | Tok::Quoted(n) => n,
                _ => return Err(self.error("expected a name after '.'")),
            };
            if self.eat_sym("(") {
                let args = self.parse_args()?;
                node = Op::Func(Func {
                    name,
                    args,
                    invocant: Some(Box::new(node)),
                });
                continue;
            }
            node = match node {
                // a.b.c over plain columns is one dotted column name
                Op::Field(Field {
                    name: base,
                    invocant: None,
                }) => Op::field(format!("{base}.{name}")),
                other => Op::Field(Field {
                    name,
                    invocant: Some(Box::new(other)),
                }),
            };
        }
        Ok(node)
    }

    fn parse_args(&mut self) -> Result<Vec<Op>> {
        let mut args = Vec::new();
        if self.eat_sym(")") {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat_sym(")") {
                return Ok(args);
            }
            self.expect_sym(",")?;
        }
    }

    fn parse_primary(&mut self) -> Result<Op> {
        match self.peek().clone() {
            Tok::Number(n) => {
                self.advance();
                Ok(number(n))
            }
            Tok::Sym("-") if matches!(self.peek_at(1), Tok::Number(_)) => {
                self.advance();
                let Tok::Number(n) = self.advance() else {
                    return Err(self.error("expected a number"));
                };
                Ok(number(format!("-{n}")))
            }
            Tok::Str(src) => {
                self.advance();
                Ok(Op::Scalar(Scalar {
                    src,
                    kind: ScalarKind::String,
                }))
            }
            Tok::Sym("(") => {
                self.advance();
                let inner = self.parse_or()?;
                self.expect_sym(")")?;
                Ok(Op::parens(inner))
            }
            Tok::Quoted(name) => {
                self.advance();
                Ok(Op::field(name))
            }
            Tok::Ident(word) => {
                self.advance();
                match word.as_str() {
                    "true" | "True" | "TRUE" => return Ok(Op::bool(true)),
                    "false" | "False" | "FALSE" => return Ok(Op::bool(false)),
                    "null" | "NULL" | "None" => return Ok(Op::null()),
                    _ => {}
                }
                if self.eat_sym("(") {
                    let args = self.parse_args()?;
                    return Ok(call(word, args));
                }
                Ok(Op::field(word))
            }
            Tok::End => Err(self.error("unexpected end of input")),
            _ => Err(self.error("expected an operand")),
        }
    }
}

fn number(src: String) -> Op {
    Op::Scalar(Scalar {
        src,
        kind: ScalarKind::Number,
    })
}

/// Function calls with an operator spelling become operators.
fn call(name: String, mut args: Vec<Op>) -> Op {
    let op = match name.as_str() {
        "add" | "add_checked" => Some(BinaryOp::Plus),
        "subtract" | "subtract_checked" => Some(BinaryOp::Minus),
        _ => None,
    };
    match op {
        Some(op) if args.len() == 2 => {
            let right = args.pop().unwrap_or_else(Op::null);
            let left = args.pop().unwrap_or_else(Op::null);
            Op::parens(Op::binary(left, op, right))
        }
        _ => Op::func(name, args),
    }
}

#[cfg(test)]
mod tests {
    use super::parse;
    use crate::ast::{BinaryOp, Op};

    fn roundtrip(text: &str) -> Op {
        let op = parse(text).expect("parse");
        let again = parse(&op.to_string()).expect("reparse");
        assert_eq!(op.to_string(), again.to_string());
        op
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let op = roundtrip("a == 1 or b == 2 and c == 3");
        let Op::BinOp(top) = op else { panic!("binop") };
        assert_eq!(top.op, BinaryOp::Or);
        let Op::BinOp(right) = *top.right else {
            panic!("binop")
        };
        assert_eq!(right.op, BinaryOp::And);
    }

    #[test]
    fn aliases_normalise() {
        let a = parse("x = 1 & y = 2 | z = 3").expect("parse");
        let b = parse("x == 1 and y == 2 or z == 3").expect("parse");
        assert_eq!(a, b);
    }

    #[test]
    fn arithmetic_precedence_and_right_assoc_pow() {
        let op = roundtrip("a + b * c ** 2 ** 3 > 10 - -1.5e2");
        assert_eq!(op.to_string(), "a + b * c ** 2 ** 3 > 10 - -1.5e2");
        let Op::BinOp(gt) = op else { panic!("binop") };
        assert_eq!(gt.op, BinaryOp::Gt);
    }

    #[test]
    fn is_null_forms() {
        assert_eq!(parse("a is null").expect("parse").to_string(), "is_null(a)");
        assert_eq!(
            parse("a is not None").expect("parse").to_string(),
            "~is_null(a)"
        );
    }

    #[test]
    fn dotted_fields_and_method_calls() {
        let op = parse("loc.x >= 1 and name.is_valid()").expect("parse");
        assert_eq!(op.fields(), vec!["loc.x".to_string(), "name".to_string()]);
        assert_eq!(op.to_string(), "loc.x >= 1 and name.is_valid()");
    }

    #[test]
    fn add_checked_becomes_operator() {
        let op = parse("add_checked(a, 2) == 3").expect("parse");
        assert_eq!(op.to_string(), "(a + 2) == 3");
    }

    #[test]
    fn spatial_keywords_and_quoted_strings() {
        let op = roundtrip(r#"loc intersects "POLYGON((0 0, 1 0, 1 1, 0 0))" and s != 'raw "x"'"#);
        let Op::BinOp(and) = op else { panic!("binop") };
        let Op::BinOp(sp) = *and.left else {
            panic!("binop")
        };
        assert_eq!(sp.op, BinaryOp::Intersects);
    }

    #[test]
    fn negation_prefixes() {
        let op = roundtrip("not a == 1 and ~(b < 2)");
        assert_eq!(op.to_string(), "not (a == 1) and ~(b < 2)");
    }

    #[test]
    fn errors_carry_a_caret() {
        let err = parse("a == (1 + ").expect_err("incomplete");
        let msg = err.to_string();
        assert!(msg.contains("unexpected end of input"), "{msg}");
        assert!(msg.contains("a == (1 + \n          ^"), "{msg}");

        let err = parse("a == 1 )").expect_err("trailing");
        assert!(err.to_string().contains("trailing"));

        assert!(parse("a == \"open").is_err());
        assert!(parse("a # b").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn backtick_names_roundtrip() {
        let op = roundtrip("`my col` > 2");
        assert_eq!(op.fields(), vec!["my col".to_string()]);
        assert_eq!(op.to_string(), "`my col` > 2");
    }
}
