//! Template parser.
//!
//! Turns document text into a [`Fragment`]. Literal text, comments, the
//! leading config block, `{{ … }}` interpolations and blocks, and the
//! reserved element tags are recognized here; any other `<tag>` stays text.

/// Document and expression syntax trees.
pub mod ast;
mod expression;

use ast::{
    Attribute, AttributeValue, Binding, ElementTag, Expression, ForBlock, Fragment, IfBlock,
    MustacheNode, RESERVED_TAGS, Span, TagKind, TemplateNode, TextNode,
};
use expression::{is_ident_char, is_ident_start};

use crate::error::{CompileError, CompileResult, ErrorKind};

/// Parse document text into a [`Fragment`].
pub fn parse(source: &str) -> CompileResult<Fragment> {
    let mut parser = Parser::new(source);
    parser
        .parse_fragment()
        .map_err(|err| err.into_compile_error(source))
}

/// Parse a standalone logical expression.
pub fn parse_standalone_expression(source: &str) -> CompileResult<Expression> {
    let mut parser = Parser::new(source);
    let result = parser.parse_expression().and_then(|expr| {
        parser.skip_spaces();
        if parser.eof() {
            Ok(expr)
        } else {
            Err(parser.error("Unexpected token after expression"))
        }
    });
    result.map_err(|err| err.into_compile_error(source))
}

/// Error raised while parsing, before it is rendered against the source.
#[derive(Debug)]
pub(crate) struct SyntaxError {
    kind: ErrorKind,
    span: Span,
}

impl SyntaxError {
    fn into_compile_error(self, source: &str) -> CompileError {
        CompileError::new(self.kind, source, self.span)
    }
}

type ParseResult<T> = std::result::Result<T, SyntaxError>;

/// Why a run of sibling nodes ended.
enum Terminator {
    Eof,
    Else(Span),
    EndIf(Span),
    EndFor(Span),
    Close(TagKind, Span),
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    index: usize,
    config_seen: bool,
    has_substantive_content: bool,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            index: 0,
            config_seen: false,
            has_substantive_content: false,
        }
    }

    fn eof(&self) -> bool {
        self.index >= self.bytes.len()
    }

    fn current(&self) -> Option<u8> {
        self.bytes.get(self.index).copied()
    }

    fn current_char(&self) -> Option<char> {
        self.src.get(self.index..).and_then(|rest| rest.chars().next())
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.index + offset).copied()
    }

    fn advance(&mut self) {
        if self.index < self.bytes.len() {
            self.index += 1;
        }
    }

    fn starts_with(&self, pattern: &str) -> bool {
        self.bytes[self.index.min(self.bytes.len())..].starts_with(pattern.as_bytes())
    }

    fn skip_spaces(&mut self) {
        while matches!(self.current(), Some(ch) if ch.is_ascii_whitespace()) {
            self.advance();
        }
    }

    fn error(&self, message: &str) -> SyntaxError {
        self.error_at(message, Span::new(self.index, self.index + 1))
    }

    fn error_at(&self, message: &str, span: Span) -> SyntaxError {
        SyntaxError {
            kind: ErrorKind::Parse(message.to_string()),
            span,
        }
    }

    fn fail(&self, kind: ErrorKind, span: Span) -> SyntaxError {
        SyntaxError { kind, span }
    }

    fn parse_fragment(&mut self) -> ParseResult<Fragment> {
        let (children, terminator) = self.parse_nodes(true)?;
        match terminator {
            Terminator::Eof => Ok(Fragment {
                span: Span::new(0, self.src.len()),
                children,
                status: None,
            }),
            Terminator::Close(kind, span) => {
                Err(self.fail(ErrorKind::UnexpectedTagClose(kind.name().to_string()), span))
            }
            Terminator::Else(span) => {
                Err(self.fail(ErrorKind::UnexpectedBlockClose("else".into()), span))
            }
            Terminator::EndIf(span) => {
                Err(self.fail(ErrorKind::UnexpectedBlockClose("endif".into()), span))
            }
            Terminator::EndFor(span) => {
                Err(self.fail(ErrorKind::UnexpectedBlockClose("endfor".into()), span))
            }
        }
    }

    fn parse_nodes(&mut self, is_root: bool) -> ParseResult<(Vec<TemplateNode>, Terminator)> {
        let mut nodes = Vec::new();
        loop {
            if self.eof() {
                return Ok((nodes, Terminator::Eof));
            }

            if self.starts_with("{{") {
                let start = self.index;
                self.index += 2;
                self.skip_spaces();
                if self.starts_with_word("else") {
                    self.index += 4;
                    self.expect_mustache_close()?;
                    return Ok((nodes, Terminator::Else(Span::new(start, self.index))));
                }
                if self.starts_with_word("endif") {
                    self.index += 5;
                    self.expect_mustache_close()?;
                    return Ok((nodes, Terminator::EndIf(Span::new(start, self.index))));
                }
                if self.starts_with_word("endfor") {
                    self.index += 6;
                    self.expect_mustache_close()?;
                    return Ok((nodes, Terminator::EndFor(Span::new(start, self.index))));
                }
                if self.starts_with_word("if") {
                    self.index += 2;
                    nodes.push(self.parse_if(start)?);
                    continue;
                }
                if self.starts_with_word("for") {
                    self.index += 3;
                    nodes.push(self.parse_for(start)?);
                    continue;
                }
                nodes.push(TemplateNode::Mustache(self.parse_mustache_body(start)?));
                continue;
            }

            if self.starts_with("/*") {
                nodes.push(self.parse_comment("/*", "*/")?);
                continue;
            }

            if self.starts_with("<!--") {
                nodes.push(self.parse_comment("<!--", "-->")?);
                continue;
            }

            if let Some((kind, closing)) = self.match_reserved_tag() {
                if closing {
                    let span = self.parse_closing_tag(kind)?;
                    return Ok((nodes, Terminator::Close(kind, span)));
                }
                nodes.push(self.parse_element(kind)?);
                continue;
            }

            if self.at_config_delimiter() {
                if self.config_seen && !self.has_substantive_content {
                    let start = self.index;
                    return Err(self.fail(
                        ErrorKind::ConfigAlreadyDeclared,
                        Span::new(start, start + 3),
                    ));
                }
                if is_root && !self.config_seen && !self.has_substantive_content {
                    nodes.push(self.parse_config()?);
                    continue;
                }
            }

            nodes.push(self.parse_text()?);
        }
    }

    fn at_config_delimiter(&self) -> bool {
        self.starts_with("---") && self.peek_at(3) != Some(b'-')
    }

    fn config_possible(&self) -> bool {
        !self.has_substantive_content
    }

    /// Reserved tag at the cursor, and whether it is a closing tag.
    fn match_reserved_tag(&self) -> Option<(TagKind, bool)> {
        if self.current() != Some(b'<') {
            return None;
        }
        let closing = self.peek_at(1) == Some(b'/');
        let name_start = self.index + if closing { 2 } else { 1 };
        let rest = &self.bytes[name_start.min(self.bytes.len())..];
        for name in RESERVED_TAGS {
            if !rest.starts_with(name.as_bytes()) {
                continue;
            }
            match rest.get(name.len()) {
                None => {}
                Some(ch) if ch.is_ascii_whitespace() || *ch == b'/' || *ch == b'>' => {}
                Some(_) => continue,
            }
            return TagKind::from_name(name).map(|kind| (kind, closing));
        }
        None
    }

    fn parse_text(&mut self) -> ParseResult<TemplateNode> {
        let start = self.index;
        let mut data = String::new();
        let mut escaped = false;

        while let Some(ch) = self.current_char() {
            if escaped {
                data.push(ch);
                self.index += ch.len_utf8();
                escaped = false;
                continue;
            }
            if ch == '\\' {
                escaped = true;
                self.advance();
                continue;
            }

            if self.index > start
                && (self.starts_with("{{")
                    || self.starts_with("/*")
                    || self.starts_with("<!--")
                    || self.match_reserved_tag().is_some())
            {
                break;
            }
            if self.index > start
                && self.at_config_delimiter()
                && self.config_possible()
                && data.trim().is_empty()
            {
                break;
            }

            if ch == '-' {
                while self.current() == Some(b'-') {
                    data.push('-');
                    self.advance();
                }
            } else {
                data.push(ch);
                self.index += ch.len_utf8();
            }
        }

        if escaped {
            data.push('\\');
        }
        if !data.trim().is_empty() {
            self.has_substantive_content = true;
        }

        Ok(TemplateNode::Text(TextNode {
            span: Span::new(start, self.index),
            data,
            status: None,
        }))
    }

    fn parse_comment(&mut self, open: &str, close: &str) -> ParseResult<TemplateNode> {
        let start = self.index;
        self.index += open.len();
        let body_start = self.index;
        let Some(offset) = self.src[body_start..].find(close) else {
            return Err(self.fail(ErrorKind::UnexpectedEof, Span::new(start, self.src.len())));
        };
        let data = self.src[body_start..body_start + offset].to_string();
        self.index = body_start + offset + close.len();
        Ok(TemplateNode::Comment(TextNode {
            span: Span::new(start, self.index),
            data,
            status: None,
        }))
    }

    fn parse_config(&mut self) -> ParseResult<TemplateNode> {
        let start = self.index;
        self.index += 3;
        let body_start = self.index;

        let mut search = body_start;
        let body_end = loop {
            let Some(offset) = self.src[search..].find("---") else {
                return Err(self.fail(ErrorKind::UnexpectedEof, Span::new(start, self.src.len())));
            };
            let candidate = search + offset;
            let at_line_start = candidate == 0 || self.bytes[candidate - 1] == b'\n';
            let exact = self.bytes.get(candidate + 3) != Some(&b'-');
            if at_line_start && exact {
                break candidate;
            }
            search = candidate + 3;
        };

        self.index = body_end + 3;
        self.config_seen = true;
        Ok(TemplateNode::Config(TextNode {
            span: Span::new(start, self.index),
            data: self.src[body_start..body_end].to_string(),
            status: None,
        }))
    }

    fn expect_mustache_close(&mut self) -> ParseResult<()> {
        self.skip_spaces();
        if self.eof() {
            return Err(self.fail(ErrorKind::UnexpectedEof, Span::new(self.index, self.index)));
        }
        if !self.starts_with("}}") {
            return Err(self.error("Expected '}}'"));
        }
        self.index += 2;
        Ok(())
    }

    fn parse_mustache_body(&mut self, start: usize) -> ParseResult<MustacheNode> {
        self.skip_spaces();
        let expression = self.parse_expression()?;
        self.expect_mustache_close()?;
        Ok(MustacheNode {
            span: Span::new(start, self.index),
            expression,
            status: None,
        })
    }

    fn parse_if(&mut self, start: usize) -> ParseResult<TemplateNode> {
        self.skip_spaces();
        let expression = self.parse_expression()?;
        self.expect_mustache_close()?;

        let (children, terminator) = self.parse_nodes(false)?;
        let else_children = match terminator {
            Terminator::EndIf(_) => None,
            Terminator::Else(_) => {
                let (else_children, terminator) = self.parse_nodes(false)?;
                self.expect_block_end(terminator, "if")?;
                Some(else_children)
            }
            other => return Err(self.unexpected_terminator(other, "if", start)),
        };

        Ok(TemplateNode::If(IfBlock {
            span: Span::new(start, self.index),
            expression,
            children,
            else_children,
            status: None,
        }))
    }

    fn parse_for(&mut self, start: usize) -> ParseResult<TemplateNode> {
        self.skip_spaces();
        let context = self.parse_binding()?;
        self.skip_spaces();
        let index = if self.current() == Some(b',') {
            self.advance();
            self.skip_spaces();
            Some(self.parse_binding()?)
        } else {
            None
        };
        self.skip_spaces();
        if !self.starts_with_word("in") {
            return Err(self.error("Expected 'in' in for block"));
        }
        self.index += 2;
        self.skip_spaces();
        let expression = self.parse_expression()?;
        self.expect_mustache_close()?;

        let (children, terminator) = self.parse_nodes(false)?;
        let else_children = match terminator {
            Terminator::EndFor(_) => None,
            Terminator::Else(_) => {
                let (else_children, terminator) = self.parse_nodes(false)?;
                self.expect_block_end(terminator, "for")?;
                Some(else_children)
            }
            other => return Err(self.unexpected_terminator(other, "for", start)),
        };

        Ok(TemplateNode::For(ForBlock {
            span: Span::new(start, self.index),
            expression,
            context,
            index,
            children,
            else_children,
            status: None,
        }))
    }

    fn parse_binding(&mut self) -> ParseResult<Binding> {
        let start = self.index;
        if !matches!(self.current(), Some(ch) if is_ident_start(ch)) {
            return Err(self.error("Expected identifier"));
        }
        let name = self.parse_identifier_name()?;
        Ok(Binding {
            name,
            span: Span::new(start, self.index),
        })
    }

    fn expect_block_end(&self, terminator: Terminator, block: &str) -> ParseResult<()> {
        match (block, terminator) {
            ("if", Terminator::EndIf(_)) | ("for", Terminator::EndFor(_)) => Ok(()),
            (_, other) => Err(self.unexpected_terminator(other, block, self.index)),
        }
    }

    fn unexpected_terminator(&self, terminator: Terminator, block: &str, start: usize) -> SyntaxError {
        match terminator {
            Terminator::Eof => self.fail(
                ErrorKind::UnclosedBlock(block.to_string()),
                Span::new(start, self.src.len()),
            ),
            Terminator::Close(kind, span) => {
                self.fail(ErrorKind::UnexpectedTagClose(kind.name().to_string()), span)
            }
            Terminator::Else(span) => {
                self.fail(ErrorKind::UnexpectedBlockClose("else".into()), span)
            }
            Terminator::EndIf(span) => {
                self.fail(ErrorKind::UnexpectedBlockClose("endif".into()), span)
            }
            Terminator::EndFor(span) => {
                self.fail(ErrorKind::UnexpectedBlockClose("endfor".into()), span)
            }
        }
    }

    fn parse_closing_tag(&mut self, kind: TagKind) -> ParseResult<Span> {
        let start = self.index;
        self.index += 2 + kind.name().len();
        self.skip_spaces();
        match self.current() {
            Some(b'>') => {
                self.advance();
                Ok(Span::new(start, self.index))
            }
            None => Err(self.fail(ErrorKind::UnexpectedEof, Span::new(start, self.index))),
            Some(_) => Err(self.error("Expected '>'")),
        }
    }

    fn parse_element(&mut self, kind: TagKind) -> ParseResult<TemplateNode> {
        let start = self.index;
        self.index += 1 + kind.name().len();

        let mut attributes: Vec<Attribute> = Vec::new();
        let self_closing = loop {
            self.skip_spaces();
            match self.current() {
                None => {
                    return Err(self.fail(ErrorKind::UnexpectedEof, Span::new(start, self.index)));
                }
                Some(b'>') => {
                    self.advance();
                    break false;
                }
                Some(b'/') if self.peek_at(1) == Some(b'>') => {
                    self.index += 2;
                    break true;
                }
                Some(_) => {
                    let attribute = self.parse_attribute()?;
                    if attributes.iter().any(|attr| attr.name == attribute.name) {
                        return Err(self.fail(
                            ErrorKind::DuplicateAttribute(attribute.name.clone()),
                            attribute.span,
                        ));
                    }
                    attributes.push(attribute);
                }
            }
        };

        let children = if self_closing {
            Vec::new()
        } else {
            let (children, terminator) = self.parse_nodes(false)?;
            match terminator {
                Terminator::Close(closed, _) if closed == kind => children,
                Terminator::Eof => {
                    return Err(self.fail(
                        ErrorKind::UnclosedBlock(kind.name().to_string()),
                        Span::new(start, self.src.len()),
                    ));
                }
                other => return Err(self.unexpected_terminator(other, kind.name(), start)),
            }
        };

        Ok(TemplateNode::Element(ElementTag {
            span: Span::new(start, self.index),
            name: kind,
            attributes,
            children,
            status: None,
        }))
    }

    fn parse_attribute(&mut self) -> ParseResult<Attribute> {
        let start = self.index;
        while matches!(
            self.current(),
            Some(ch) if is_ident_char(ch) || ch == b'-' || ch == b':' || ch == b'.'
        ) {
            self.advance();
        }
        if self.index == start {
            let found = self.current_char().unwrap_or(' ');
            return Err(self.error(&format!("Unexpected character '{}' in tag", found)));
        }
        let name = self.src[start..self.index].to_string();

        let checkpoint = self.index;
        self.skip_spaces();
        if self.current() != Some(b'=') {
            self.index = checkpoint;
            return Ok(Attribute {
                span: Span::new(start, self.index),
                name,
                value: AttributeValue::True,
            });
        }
        self.advance();
        self.skip_spaces();

        let nodes = match self.current() {
            Some(quote @ (b'"' | b'\'')) => self.parse_quoted_attribute(quote)?,
            Some(b'{') if self.starts_with("{{") => {
                let mustache_start = self.index;
                self.index += 2;
                vec![TemplateNode::Mustache(
                    self.parse_mustache_body(mustache_start)?,
                )]
            }
            None => return Err(self.fail(ErrorKind::UnexpectedEof, Span::new(start, self.index))),
            Some(_) => return Err(self.error("Expected attribute value")),
        };

        Ok(Attribute {
            span: Span::new(start, self.index),
            name,
            value: AttributeValue::Nodes(nodes),
        })
    }

    fn parse_quoted_attribute(&mut self, quote: u8) -> ParseResult<Vec<TemplateNode>> {
        let open = self.index;
        self.advance();
        let mut nodes = Vec::new();
        let mut text_start = self.index;
        let mut text = String::new();

        loop {
            let Some(ch) = self.current_char() else {
                return Err(self.fail(ErrorKind::UnexpectedEof, Span::new(open, self.index)));
            };
            if ch as u32 == quote as u32 {
                break;
            }
            if ch == '\\' {
                self.advance();
                if let Some(escaped) = self.current_char() {
                    text.push(escaped);
                    self.index += escaped.len_utf8();
                }
                continue;
            }
            if self.starts_with("{{") {
                if !text.is_empty() {
                    nodes.push(TemplateNode::Text(TextNode {
                        span: Span::new(text_start, self.index),
                        data: std::mem::take(&mut text),
                        status: None,
                    }));
                }
                let mustache_start = self.index;
                self.index += 2;
                nodes.push(TemplateNode::Mustache(
                    self.parse_mustache_body(mustache_start)?,
                ));
                text_start = self.index;
                continue;
            }
            text.push(ch);
            self.index += ch.len_utf8();
        }

        if !text.is_empty() || nodes.is_empty() {
            nodes.push(TemplateNode::Text(TextNode {
                span: Span::new(text_start, self.index),
                data: text,
                status: None,
            }));
        }
        // consume closing quote
        self.advance();
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn only_child(source: &str) -> TemplateNode {
        let mut fragment = parse(source).expect("parse");
        assert_eq!(fragment.children.len(), 1, "children: {:?}", fragment.children);
        fragment.children.remove(0)
    }

    fn error_code(source: &str) -> &'static str {
        parse(source).expect_err("should fail").code()
    }

    #[test]
    fn plain_text_keeps_line_breaks() {
        match only_child("Hello\nworld") {
            TemplateNode::Text(text) => assert_eq!(text.data, "Hello\nworld"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn escaped_brackets_are_text() {
        match only_child("\\{{ foo }} \\<user>") {
            TemplateNode::Text(text) => assert_eq!(text.data, "{{ foo }} <user>"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn comments_swallow_everything() {
        match only_child("/* hello {{ foo }}\n<user> */") {
            TemplateNode::Comment(comment) => assert_eq!(comment.data, " hello {{ foo }}\n<user> "),
            other => panic!("expected comment, got {:?}", other),
        }
        assert!(matches!(only_child("<!-- hello -->"), TemplateNode::Comment(_)));
    }

    #[test]
    fn unknown_tags_are_text() {
        match only_child("<custom-tag></custom-tag>") {
            TemplateNode::Text(text) => assert_eq!(text.data, "<custom-tag></custom-tag>"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[test]
    fn parses_attributes() {
        match only_child("<message attr1=\"value1\" attr2='a {{ b }}' flag other={{ c }} />") {
            TemplateNode::Element(tag) => {
                assert_eq!(tag.name, TagKind::from_name("message").unwrap());
                assert_eq!(tag.attributes.len(), 4);
                assert_eq!(
                    tag.attributes[0].value.as_static_text().as_deref(),
                    Some("value1")
                );
                match &tag.attributes[1].value {
                    AttributeValue::Nodes(nodes) => {
                        assert_eq!(nodes.len(), 2);
                        assert!(matches!(nodes[1], TemplateNode::Mustache(_)));
                    }
                    other => panic!("expected nodes, got {:?}", other),
                }
                assert_eq!(tag.attributes[2].value, AttributeValue::True);
                assert!(tag.children.is_empty());
            }
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn nested_tags() {
        match only_child("<user><content-text>hi</content-text></user>") {
            TemplateNode::Element(tag) => {
                assert_eq!(tag.children.len(), 1);
                assert!(matches!(tag.children[0], TemplateNode::Element(_)));
            }
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn parses_blocks() {
        match only_child("{{ if a }}yes{{ else }}no{{ endif }}") {
            TemplateNode::If(block) => {
                assert_eq!(block.children.len(), 1);
                assert_eq!(block.else_children.map(|c| c.len()), Some(1));
            }
            other => panic!("expected if, got {:?}", other),
        }
        match only_child("{{ for item, i in [1, 2] }}{{ item }}{{ endfor }}") {
            TemplateNode::For(block) => {
                assert_eq!(block.context.name, "item");
                assert_eq!(block.index.map(|b| b.name).as_deref(), Some("i"));
                assert!(block.else_children.is_none());
            }
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn parses_leading_config() {
        let fragment = parse("---\nmodel: gpt-4\n---\nHello").expect("parse");
        match &fragment.children[0] {
            TemplateNode::Config(config) => assert_eq!(config.data, "\nmodel: gpt-4\n"),
            other => panic!("expected config, got {:?}", other),
        }
        assert_eq!(fragment.children.len(), 2);
    }

    #[test]
    fn dashes_after_content_are_text() {
        let fragment = parse("Hello\n---\nworld").expect("parse");
        assert!(
            fragment
                .children
                .iter()
                .all(|node| matches!(node, TemplateNode::Text(_)))
        );
    }

    #[test]
    fn reports_structural_errors() {
        assert_eq!(error_code("<message>"), "unclosed-block");
        assert_eq!(error_code("</message>"), "unexpected-tag-close");
        assert_eq!(error_code("<message"), "unexpected-eof");
        assert_eq!(error_code("<message a=\"1\" a=\"2\" />"), "duplicate-attribute");
        assert_eq!(error_code("{{ if a }}x"), "unclosed-block");
        assert_eq!(error_code("{{ endif }}"), "unexpected-block-close");
        assert_eq!(error_code("{{ a?.b = 1 }}"), "parse-error");
        assert_eq!(
            error_code("---\na: 1\n---\n---\nb: 2\n---"),
            "config-already-declared"
        );
    }
}
