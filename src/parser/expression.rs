//! Logical expression grammar.
//!
//! A precedence-climbing parser over the same byte cursor the template
//! parser uses. It stops at the first byte that cannot continue an
//! expression, which lets `{{ … }}` find its closing delimiter without
//! pre-scanning for it.

use super::ast::{
    AssignOp, BinaryOp, ExprKind, Expression, LogicalOp, MemberProperty, Property, PropertyKey,
    Span, UnaryOp, UpdateOp,
};
use super::{ParseResult, Parser};
use crate::error::ErrorKind;
use crate::value::Value;

#[derive(Clone, Copy)]
enum Infix {
    Binary(BinaryOp),
    Logical(LogicalOp),
}

impl Infix {
    fn precedence(&self) -> u8 {
        match self {
            Infix::Logical(LogicalOp::Nullish) => 1,
            Infix::Logical(LogicalOp::Or) => 2,
            Infix::Logical(LogicalOp::And) => 3,
            Infix::Binary(op) => match op {
                BinaryOp::BitOr => 4,
                BinaryOp::BitXor => 5,
                BinaryOp::BitAnd => 6,
                BinaryOp::LooseEq | BinaryOp::LooseNe | BinaryOp::StrictEq | BinaryOp::StrictNe => {
                    7
                }
                BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::In => 8,
                BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => 9,
                BinaryOp::Add | BinaryOp::Sub => 10,
                BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => 11,
                BinaryOp::Pow => 12,
            },
        }
    }
}

// Longest operators first.
const INFIX_OPERATORS: &[(&str, Infix)] = &[
    (">>>", Infix::Binary(BinaryOp::UShr)),
    ("===", Infix::Binary(BinaryOp::StrictEq)),
    ("!==", Infix::Binary(BinaryOp::StrictNe)),
    ("**", Infix::Binary(BinaryOp::Pow)),
    ("==", Infix::Binary(BinaryOp::LooseEq)),
    ("!=", Infix::Binary(BinaryOp::LooseNe)),
    ("<=", Infix::Binary(BinaryOp::Le)),
    (">=", Infix::Binary(BinaryOp::Ge)),
    ("<<", Infix::Binary(BinaryOp::Shl)),
    (">>", Infix::Binary(BinaryOp::Shr)),
    ("&&", Infix::Logical(LogicalOp::And)),
    ("||", Infix::Logical(LogicalOp::Or)),
    ("??", Infix::Logical(LogicalOp::Nullish)),
    ("+", Infix::Binary(BinaryOp::Add)),
    ("-", Infix::Binary(BinaryOp::Sub)),
    ("*", Infix::Binary(BinaryOp::Mul)),
    ("/", Infix::Binary(BinaryOp::Div)),
    ("%", Infix::Binary(BinaryOp::Rem)),
    ("<", Infix::Binary(BinaryOp::Lt)),
    (">", Infix::Binary(BinaryOp::Gt)),
    ("&", Infix::Binary(BinaryOp::BitAnd)),
    ("|", Infix::Binary(BinaryOp::BitOr)),
    ("^", Infix::Binary(BinaryOp::BitXor)),
];

const ASSIGN_OPERATORS: &[(&str, AssignOp)] = &[
    (">>>=", AssignOp::Binary(BinaryOp::UShr)),
    ("**=", AssignOp::Binary(BinaryOp::Pow)),
    ("<<=", AssignOp::Binary(BinaryOp::Shl)),
    (">>=", AssignOp::Binary(BinaryOp::Shr)),
    ("&&=", AssignOp::Logical(LogicalOp::And)),
    ("||=", AssignOp::Logical(LogicalOp::Or)),
    ("??=", AssignOp::Logical(LogicalOp::Nullish)),
    ("+=", AssignOp::Binary(BinaryOp::Add)),
    ("-=", AssignOp::Binary(BinaryOp::Sub)),
    ("*=", AssignOp::Binary(BinaryOp::Mul)),
    ("/=", AssignOp::Binary(BinaryOp::Div)),
    ("%=", AssignOp::Binary(BinaryOp::Rem)),
    ("&=", AssignOp::Binary(BinaryOp::BitAnd)),
    ("|=", AssignOp::Binary(BinaryOp::BitOr)),
    ("^=", AssignOp::Binary(BinaryOp::BitXor)),
    ("=", AssignOp::Assign),
];

const RESERVED_WORDS: &[&str] = &["typeof", "void", "in"];

pub(super) fn is_ident_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_' || ch == b'$' || ch >= 0x80
}

pub(super) fn is_ident_char(ch: u8) -> bool {
    is_ident_start(ch) || ch.is_ascii_digit()
}

impl<'a> Parser<'a> {
    /// `a, b, c`
    pub(super) fn parse_expression(&mut self) -> ParseResult<Expression> {
        let first = self.parse_assignment()?;
        self.skip_spaces();
        if self.current() != Some(b',') {
            return Ok(first);
        }
        let start = first.span.start;
        let mut expressions = vec![first];
        while self.current() == Some(b',') {
            self.advance();
            expressions.push(self.parse_assignment()?);
            self.skip_spaces();
        }
        Ok(Expression::new(
            ExprKind::Sequence { expressions },
            Span::new(start, self.index),
        ))
    }

    fn parse_assignment(&mut self) -> ParseResult<Expression> {
        let target = self.parse_conditional()?;
        self.skip_spaces();

        let Some(operator) = self.match_assign_operator() else {
            return Ok(target);
        };

        match &target.kind {
            ExprKind::Identifier { .. } => {}
            ExprKind::Member {
                optional: false, ..
            } => {}
            ExprKind::Chain { .. } => {
                return Err(self.error_at(
                    "Invalid left-hand side in assignment: optional chains cannot be assigned",
                    target.span,
                ));
            }
            _ => {
                return Err(self.error_at("Invalid left-hand side in assignment", target.span));
            }
        }

        let value = self.parse_assignment()?;
        let span = target.span.to(value.span);
        Ok(Expression::new(
            ExprKind::Assignment {
                operator,
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        ))
    }

    fn match_assign_operator(&mut self) -> Option<AssignOp> {
        for (symbol, op) in ASSIGN_OPERATORS {
            if self.starts_with(symbol) {
                // `==` and `===` are comparisons, `=>` is not supported
                if *symbol == "=" && matches!(self.peek_at(1), Some(b'=') | Some(b'>')) {
                    return None;
                }
                self.index += symbol.len();
                return Some(*op);
            }
        }
        None
    }

    fn parse_conditional(&mut self) -> ParseResult<Expression> {
        let test = self.parse_binary(0)?;
        self.skip_spaces();
        if self.current() != Some(b'?') || matches!(self.peek_at(1), Some(b'?') | Some(b'.')) {
            return Ok(test);
        }
        self.advance();
        let consequent = self.parse_assignment()?;
        self.skip_spaces();
        self.expect_byte(b':')?;
        let alternate = self.parse_assignment()?;
        let span = test.span.to(alternate.span);
        Ok(Expression::new(
            ExprKind::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
            span,
        ))
    }

    fn parse_binary(&mut self, min_precedence: u8) -> ParseResult<Expression> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_spaces();
            let Some((symbol, infix)) = self.peek_infix() else {
                break;
            };
            let precedence = infix.precedence();
            if precedence <= min_precedence {
                break;
            }
            self.index += symbol.len();
            // `**` is right associative
            let next_min = if matches!(infix, Infix::Binary(BinaryOp::Pow)) {
                precedence - 1
            } else {
                precedence
            };
            let right = self.parse_binary(next_min)?;
            let span = left.span.to(right.span);
            let kind = match infix {
                Infix::Binary(operator) => ExprKind::Binary {
                    operator,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                Infix::Logical(operator) => ExprKind::Logical {
                    operator,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            };
            left = Expression::new(kind, span);
        }
        Ok(left)
    }

    fn peek_infix(&self) -> Option<(&'static str, Infix)> {
        if self.starts_with_word("in") {
            return Some(("in", Infix::Binary(BinaryOp::In)));
        }
        // An assignment operator is never an infix operator.
        if ASSIGN_OPERATORS
            .iter()
            .any(|(symbol, _)| *symbol != "=" && self.starts_with(symbol))
        {
            return None;
        }
        INFIX_OPERATORS
            .iter()
            .find(|(symbol, _)| self.starts_with(symbol))
            .map(|(symbol, infix)| (*symbol, *infix))
    }

    fn parse_unary(&mut self) -> ParseResult<Expression> {
        self.skip_spaces();
        let start = self.index;

        if self.starts_with("++") || self.starts_with("--") {
            let operator = if self.starts_with("++") {
                UpdateOp::Increment
            } else {
                UpdateOp::Decrement
            };
            self.index += 2;
            let argument = self.parse_unary()?;
            self.ensure_update_target(&argument)?;
            let span = Span::new(start, argument.span.end);
            return Ok(Expression::new(
                ExprKind::Update {
                    operator,
                    prefix: true,
                    argument: Box::new(argument),
                },
                span,
            ));
        }

        let operator = match self.current() {
            Some(b'!') => Some((UnaryOp::Not, 1)),
            Some(b'-') => Some((UnaryOp::Minus, 1)),
            Some(b'+') => Some((UnaryOp::Plus, 1)),
            Some(b'~') => Some((UnaryOp::BitNot, 1)),
            _ if self.starts_with_word("typeof") => Some((UnaryOp::TypeOf, 6)),
            _ if self.starts_with_word("void") => Some((UnaryOp::Void, 4)),
            _ => None,
        };

        if let Some((operator, len)) = operator {
            self.index += len;
            let argument = self.parse_unary()?;
            let span = Span::new(start, argument.span.end);
            return Ok(Expression::new(
                ExprKind::Unary {
                    operator,
                    argument: Box::new(argument),
                },
                span,
            ));
        }

        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expression> {
        let argument = self.parse_call_member()?;
        // No whitespace allowed between the operand and a postfix operator.
        if self.starts_with("++") || self.starts_with("--") {
            let operator = if self.starts_with("++") {
                UpdateOp::Increment
            } else {
                UpdateOp::Decrement
            };
            self.ensure_update_target(&argument)?;
            self.index += 2;
            let span = Span::new(argument.span.start, self.index);
            return Ok(Expression::new(
                ExprKind::Update {
                    operator,
                    prefix: false,
                    argument: Box::new(argument),
                },
                span,
            ));
        }
        Ok(argument)
    }

    fn ensure_update_target(&self, target: &Expression) -> ParseResult<()> {
        match &target.kind {
            ExprKind::Identifier { .. }
            | ExprKind::Member {
                optional: false, ..
            } => Ok(()),
            _ => Err(self.error_at(
                "Invalid left-hand side expression in update operation",
                target.span,
            )),
        }
    }

    fn parse_call_member(&mut self) -> ParseResult<Expression> {
        let mut expr = self.parse_primary()?;
        let start = expr.span.start;
        let mut in_chain = false;

        loop {
            self.skip_spaces();
            if self.starts_with("?.") && !matches!(self.peek_at(2), Some(b'0'..=b'9')) {
                self.index += 2;
                in_chain = true;
                self.skip_spaces();
                match self.current() {
                    Some(b'(') => {
                        let arguments = self.parse_arguments()?;
                        expr = Expression::new(
                            ExprKind::Call {
                                callee: Box::new(expr),
                                arguments,
                                optional: true,
                            },
                            Span::new(start, self.index),
                        );
                    }
                    Some(b'[') => {
                        let property = self.parse_computed_property()?;
                        expr = Expression::new(
                            ExprKind::Member {
                                object: Box::new(expr),
                                property,
                                optional: true,
                            },
                            Span::new(start, self.index),
                        );
                    }
                    _ => {
                        let name = self.parse_identifier_name()?;
                        expr = Expression::new(
                            ExprKind::Member {
                                object: Box::new(expr),
                                property: MemberProperty::Named(name),
                                optional: true,
                            },
                            Span::new(start, self.index),
                        );
                    }
                }
                continue;
            }

            match self.current() {
                Some(b'.') if !matches!(self.peek_at(1), Some(b'.')) => {
                    self.advance();
                    self.skip_spaces();
                    let name = self.parse_identifier_name()?;
                    expr = Expression::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            property: MemberProperty::Named(name),
                            optional: false,
                        },
                        Span::new(start, self.index),
                    );
                }
                Some(b'[') => {
                    let property = self.parse_computed_property()?;
                    expr = Expression::new(
                        ExprKind::Member {
                            object: Box::new(expr),
                            property,
                            optional: false,
                        },
                        Span::new(start, self.index),
                    );
                }
                Some(b'(') => {
                    let arguments = self.parse_arguments()?;
                    expr = Expression::new(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            arguments,
                            optional: false,
                        },
                        Span::new(start, self.index),
                    );
                }
                _ => break,
            }
        }

        if in_chain {
            let span = expr.span;
            expr = Expression::new(
                ExprKind::Chain {
                    expression: Box::new(expr),
                },
                span,
            );
        }
        Ok(expr)
    }

    fn parse_computed_property(&mut self) -> ParseResult<MemberProperty> {
        self.expect_byte(b'[')?;
        let property = self.parse_expression()?;
        self.skip_spaces();
        self.expect_byte(b']')?;
        Ok(MemberProperty::Computed(Box::new(property)))
    }

    fn parse_arguments(&mut self) -> ParseResult<Vec<Expression>> {
        self.expect_byte(b'(')?;
        let mut arguments = Vec::new();
        loop {
            self.skip_spaces();
            if self.current() == Some(b')') {
                self.advance();
                return Ok(arguments);
            }
            arguments.push(self.parse_assignment()?);
            self.skip_spaces();
            match self.current() {
                Some(b',') => self.advance(),
                Some(b')') => {}
                None => return Err(self.eof_error()),
                _ => return Err(self.error("Expected ',' or ')' in argument list")),
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult<Expression> {
        self.skip_spaces();
        let start = self.index;
        let Some(ch) = self.current() else {
            return Err(self.eof_error());
        };

        match ch {
            b'0'..=b'9' => self.parse_number_literal(),
            b'.' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => self.parse_number_literal(),
            b'"' | b'\'' => {
                let text = self.parse_string_literal(ch)?;
                Ok(Expression::new(
                    ExprKind::Literal {
                        value: Value::String(text),
                    },
                    Span::new(start, self.index),
                ))
            }
            b'(' => {
                self.advance();
                let inner = self.parse_expression()?;
                self.skip_spaces();
                self.expect_byte(b')')?;
                Ok(inner)
            }
            b'[' => self.parse_array_literal(),
            b'{' => self.parse_object_literal(),
            ch if is_ident_start(ch) => {
                let name = self.parse_identifier_name()?;
                let span = Span::new(start, self.index);
                let literal = match name.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" => Some(Value::Null),
                    "undefined" => Some(Value::Undefined),
                    _ => None,
                };
                if let Some(value) = literal {
                    return Ok(Expression::new(ExprKind::Literal { value }, span));
                }
                if RESERVED_WORDS.contains(&name.as_str()) {
                    return Err(self.error_at(&format!("Unexpected keyword '{}'", name), span));
                }
                Ok(Expression::new(ExprKind::Identifier { name }, span))
            }
            other => Err(self.error(&format!("Unexpected token '{}'", other as char))),
        }
    }

    fn parse_number_literal(&mut self) -> ParseResult<Expression> {
        let start = self.index;
        if self.starts_with("0x") || self.starts_with("0X") {
            self.index += 2;
            let digits_start = self.index;
            while matches!(self.current(), Some(ch) if ch.is_ascii_hexdigit()) {
                self.advance();
            }
            let value = i64::from_str_radix(&self.src[digits_start..self.index], 16)
                .map_err(|_| self.error("Invalid hexadecimal literal"))?;
            return Ok(Expression::new(
                ExprKind::Literal {
                    value: Value::Number(value as f64),
                },
                Span::new(start, self.index),
            ));
        }

        while matches!(self.current(), Some(ch) if ch.is_ascii_digit() || ch == b'_') {
            self.advance();
        }
        if self.current() == Some(b'.') && matches!(self.peek_at(1), Some(b'0'..=b'9')) {
            self.advance();
            while matches!(self.current(), Some(ch) if ch.is_ascii_digit()) {
                self.advance();
            }
        } else if self.current() == Some(b'.') && !matches!(self.peek_at(1), Some(ch) if is_ident_start(ch))
        {
            // `1.` is a valid number literal
            self.advance();
        }
        if matches!(self.current(), Some(b'e') | Some(b'E')) {
            let checkpoint = self.index;
            self.advance();
            if matches!(self.current(), Some(b'+') | Some(b'-')) {
                self.advance();
            }
            if matches!(self.current(), Some(ch) if ch.is_ascii_digit()) {
                while matches!(self.current(), Some(ch) if ch.is_ascii_digit()) {
                    self.advance();
                }
            } else {
                self.index = checkpoint;
            }
        }

        let text: String = self.src[start..self.index]
            .chars()
            .filter(|c| *c != '_')
            .collect();
        let value = text
            .parse::<f64>()
            .map_err(|_| self.error_at("Invalid number literal", Span::new(start, self.index)))?;
        Ok(Expression::new(
            ExprKind::Literal {
                value: Value::Number(value),
            },
            Span::new(start, self.index),
        ))
    }

    pub(super) fn parse_string_literal(&mut self, quote: u8) -> ParseResult<String> {
        // consume opening quote
        self.advance();
        let mut buf = String::new();
        loop {
            let Some(ch) = self.current_char() else {
                return Err(self.eof_error());
            };
            self.index += ch.len_utf8();
            match ch {
                c if c as u32 == quote as u32 => return Ok(buf),
                '\\' => {
                    let escaped = self.current_char().ok_or_else(|| self.eof_error())?;
                    self.index += escaped.len_utf8();
                    let value = match escaped {
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        'b' => '\u{8}',
                        'f' => '\u{c}',
                        'v' => '\u{b}',
                        '0' => '\0',
                        'u' => self.parse_unicode_escape()?,
                        other => other,
                    };
                    buf.push(value);
                }
                '\n' => return Err(self.error("Unterminated string literal")),
                other => buf.push(other),
            }
        }
    }

    fn parse_unicode_escape(&mut self) -> ParseResult<char> {
        let end = self.index + 4;
        let hex = self
            .src
            .get(self.index..end)
            .ok_or_else(|| self.error("Invalid unicode escape"))?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| self.error("Invalid unicode escape"))?;
        self.index = end;
        char::from_u32(code).ok_or_else(|| self.error("Invalid unicode escape"))
    }

    fn parse_array_literal(&mut self) -> ParseResult<Expression> {
        let start = self.index;
        self.expect_byte(b'[')?;
        let mut elements = Vec::new();
        loop {
            self.skip_spaces();
            if self.current() == Some(b']') {
                self.advance();
                break;
            }
            elements.push(self.parse_assignment()?);
            self.skip_spaces();
            match self.current() {
                Some(b',') => self.advance(),
                Some(b']') => {}
                None => return Err(self.eof_error()),
                _ => return Err(self.error("Expected ',' or ']' in array literal")),
            }
        }
        Ok(Expression::new(
            ExprKind::Array { elements },
            Span::new(start, self.index),
        ))
    }

    fn parse_object_literal(&mut self) -> ParseResult<Expression> {
        let start = self.index;
        self.expect_byte(b'{')?;
        let mut properties = Vec::new();
        loop {
            self.skip_spaces();
            let key_start = self.index;
            let key = match self.current() {
                Some(b'}') => {
                    self.advance();
                    break;
                }
                None => return Err(self.eof_error()),
                Some(b'[') => {
                    self.advance();
                    let key = self.parse_assignment()?;
                    self.skip_spaces();
                    self.expect_byte(b']')?;
                    PropertyKey::Computed(key)
                }
                Some(quote @ (b'"' | b'\'')) => PropertyKey::Named(self.parse_string_literal(quote)?),
                Some(b'0'..=b'9') => {
                    let number = self.parse_number_literal()?;
                    match number.kind {
                        ExprKind::Literal { value } => PropertyKey::Named(value.to_js_string()),
                        _ => return Err(self.error("Invalid property key")),
                    }
                }
                _ => PropertyKey::Named(self.parse_identifier_name()?),
            };
            let key_span = Span::new(key_start, self.index);

            self.skip_spaces();
            let value = if self.current() == Some(b':') {
                self.advance();
                self.parse_assignment()?
            } else {
                // shorthand `{ name }`
                match &key {
                    PropertyKey::Named(name) if self.src[key_span.start..key_span.end] == **name => {
                        Expression::new(ExprKind::Identifier { name: name.clone() }, key_span)
                    }
                    _ => return Err(self.error("Expected ':' after property key")),
                }
            };
            properties.push(Property { key, value });

            self.skip_spaces();
            match self.current() {
                Some(b',') => self.advance(),
                Some(b'}') => {}
                None => return Err(self.eof_error()),
                _ => return Err(self.error("Expected ',' or '}' in object literal")),
            }
        }
        Ok(Expression::new(
            ExprKind::Object { properties },
            Span::new(start, self.index),
        ))
    }

    pub(super) fn parse_identifier_name(&mut self) -> ParseResult<String> {
        let start = self.index;
        match self.current() {
            Some(ch) if is_ident_start(ch) => {}
            None => return Err(self.eof_error()),
            Some(_) => return Err(self.error("Expected identifier")),
        }
        while matches!(self.current(), Some(ch) if is_ident_char(ch)) {
            self.advance();
        }
        // Keep multi-byte identifiers on a char boundary.
        while !self.src.is_char_boundary(self.index) {
            self.index += 1;
        }
        Ok(self.src[start..self.index].to_string())
    }

    pub(super) fn starts_with_word(&self, word: &str) -> bool {
        self.starts_with(word)
            && !matches!(self.peek_at(word.len()), Some(ch) if is_ident_char(ch))
    }

    fn expect_byte(&mut self, expected: u8) -> ParseResult<()> {
        match self.current() {
            Some(ch) if ch == expected => {
                self.advance();
                Ok(())
            }
            None => Err(self.eof_error()),
            Some(other) => Err(self.error(&format!(
                "Expected '{}' but found '{}'",
                expected as char, other as char
            ))),
        }
    }

    fn eof_error(&self) -> super::SyntaxError {
        super::SyntaxError {
            kind: ErrorKind::UnexpectedEof,
            span: Span::new(self.index, self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::parse_standalone_expression;
    use super::*;

    fn parse(source: &str) -> Expression {
        parse_standalone_expression(source).expect("parse")
    }

    #[test]
    fn respects_precedence() {
        let expr = parse("1 + 2 * 3");
        match expr.kind {
            ExprKind::Binary {
                operator: BinaryOp::Add,
                right,
                ..
            } => match right.kind {
                ExprKind::Binary {
                    operator: BinaryOp::Mul,
                    ..
                } => {}
                other => panic!("expected multiplication, got {:?}", other),
            },
            other => panic!("expected addition, got {:?}", other),
        }
    }

    #[test]
    fn exponent_is_right_associative() {
        let expr = parse("2 ** 3 ** 2");
        match expr.kind {
            ExprKind::Binary {
                operator: BinaryOp::Pow,
                left,
                ..
            } => assert!(matches!(left.kind, ExprKind::Literal { .. })),
            other => panic!("expected power, got {:?}", other),
        }
    }

    #[test]
    fn parses_compound_assignment() {
        let expr = parse("foo += 2");
        match expr.kind {
            ExprKind::Assignment {
                operator: AssignOp::Binary(BinaryOp::Add),
                target,
                ..
            } => assert_eq!(target.identifier_name(), Some("foo")),
            other => panic!("expected assignment, got {:?}", other),
        }
    }

    #[test]
    fn optional_chains_are_wrapped() {
        let expr = parse("a?.b.c");
        match expr.kind {
            ExprKind::Chain { expression } => match expression.kind {
                ExprKind::Member {
                    property: MemberProperty::Named(name),
                    optional: false,
                    ..
                } => assert_eq!(name, "c"),
                other => panic!("expected member, got {:?}", other),
            },
            other => panic!("expected chain, got {:?}", other),
        }
    }

    #[test]
    fn rejects_assignment_to_optional_chain() {
        let err = parse_standalone_expression("a?.b = 1").unwrap_err();
        assert_eq!(err.code(), "parse-error");
    }

    #[test]
    fn parses_object_shorthand_and_strings() {
        let expr = parse("{ a, 'b c': \"x\\ny\", [k]: 1 }");
        match expr.kind {
            ExprKind::Object { properties } => {
                assert_eq!(properties.len(), 3);
                assert!(matches!(
                    properties[0].value.kind,
                    ExprKind::Identifier { .. }
                ));
                match &properties[1].value.kind {
                    ExprKind::Literal { value } => assert_eq!(value, &Value::from("x\ny")),
                    other => panic!("expected literal, got {:?}", other),
                }
                assert!(matches!(properties[2].key, PropertyKey::Computed(_)));
            }
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn parses_postfix_and_prefix_updates() {
        assert!(matches!(
            parse("i++").kind,
            ExprKind::Update { prefix: false, .. }
        ));
        assert!(matches!(
            parse("--i").kind,
            ExprKind::Update { prefix: true, .. }
        ));
    }

    #[test]
    fn ternary_and_nullish() {
        let expr = parse("a ?? b ? 1 : 2");
        assert!(matches!(expr.kind, ExprKind::Conditional { .. }));
    }
}
