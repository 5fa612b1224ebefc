//! Document and expression syntax trees.
//!
//! Every template node carries an immutable [`Span`] and an engine-owned
//! [`NodeStatus`] slot. The compiler records progress in that slot so a
//! document can be walked once per conversational turn without repeating
//! work that already happened.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::message::{ContentType, MessageRole};
use crate::scope::Pointers;
use crate::value::Value;

/// Byte range inside the source text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Inclusive start offset
    pub start: usize,
    /// Exclusive end offset
    pub end: usize,
}

impl Span {
    /// Construct a span.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both.
    pub fn to(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }
}

/// Compiler progress recorded on a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// The node ran to completion in an earlier pass
    #[serde(default)]
    pub completed: bool,
    /// Memoized result: a block condition, iterable, or resolved attributes
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::value::persisted")]
    pub completed_as: Option<Value>,
    /// Body scope pointers saved when a step stopped inside the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_pointers: Option<Pointers>,
    /// Loop iteration to resume at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_iteration_index: Option<usize>,
    /// Isolated stash of a scope tag that stopped mid-body
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::value::persisted")]
    pub scope_stash: Option<Vec<Value>>,
}

/// Root of a parsed document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Source range
    pub span: Span,
    /// Top-level nodes
    pub children: Vec<TemplateNode>,
    /// Engine-owned progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// Leaf node holding raw text (literal text, comments, config).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    /// Source range
    pub span: Span,
    /// Unescaped content
    pub data: String,
    /// Engine-owned progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// `{{ expression }}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MustacheNode {
    /// Source range
    pub span: Span,
    /// Interpolated expression
    pub expression: Expression,
    /// Engine-owned progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// `{{ if cond }} … {{ else }} … {{ endif }}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IfBlock {
    /// Source range
    pub span: Span,
    /// Condition
    pub expression: Expression,
    /// Then branch
    pub children: Vec<TemplateNode>,
    /// Else branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_children: Option<Vec<TemplateNode>>,
    /// Engine-owned progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// Identifier bound by a loop header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    /// Variable name
    pub name: String,
    /// Source range
    pub span: Span,
}

/// `{{ for item, index in list }} … {{ else }} … {{ endfor }}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForBlock {
    /// Source range
    pub span: Span,
    /// Iterable
    pub expression: Expression,
    /// Loop variable
    pub context: Binding,
    /// Optional index variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<Binding>,
    /// Body, run once per element
    pub children: Vec<TemplateNode>,
    /// Run when the iterable is empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub else_children: Option<Vec<TemplateNode>>,
    /// Engine-owned progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

/// Which kind of message tag was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTagKind {
    /// `<system>`, `<user>`, …
    Role(MessageRole),
    /// `<message role="…">`
    Generic,
}

/// Which kind of content tag was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentTagKind {
    /// `<content-text>`, `<tool-call>`, …
    Typed(ContentType),
    /// `<content type="…">`
    Generic,
}

/// Closed classification of reserved element tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Message tag
    Message(MessageTagKind),
    /// Content tag
    Content(ContentTagKind),
    /// `<prompt path="…">` cross-document reference
    Reference,
    /// `<scope>` isolated sub-scope
    Scope,
    /// `<step>` conversation breakpoint
    Step,
}

/// Reserved tag names, longest first so prefixes never shadow.
pub const RESERVED_TAGS: &[&str] = &[
    "content-image",
    "content-text",
    "content-file",
    "tool-call",
    "developer",
    "assistant",
    "message",
    "content",
    "system",
    "prompt",
    "scope",
    "user",
    "tool",
    "step",
];

impl TagKind {
    /// Resolve a reserved tag name.
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "message" => TagKind::Message(MessageTagKind::Generic),
            "content" => TagKind::Content(ContentTagKind::Generic),
            "content-text" => TagKind::Content(ContentTagKind::Typed(ContentType::Text)),
            "content-image" => TagKind::Content(ContentTagKind::Typed(ContentType::Image)),
            "content-file" => TagKind::Content(ContentTagKind::Typed(ContentType::File)),
            "tool-call" => TagKind::Content(ContentTagKind::Typed(ContentType::ToolCall)),
            "prompt" => TagKind::Reference,
            "scope" => TagKind::Scope,
            "step" => TagKind::Step,
            other => TagKind::Message(MessageTagKind::Role(MessageRole::from_name(other)?)),
        };
        Some(kind)
    }

    /// Tag name as written in documents.
    pub fn name(&self) -> &'static str {
        match self {
            TagKind::Message(MessageTagKind::Generic) => "message",
            TagKind::Message(MessageTagKind::Role(role)) => role.as_str(),
            TagKind::Content(ContentTagKind::Generic) => "content",
            TagKind::Content(ContentTagKind::Typed(ContentType::Text)) => "content-text",
            TagKind::Content(ContentTagKind::Typed(ContentType::Image)) => "content-image",
            TagKind::Content(ContentTagKind::Typed(ContentType::File)) => "content-file",
            TagKind::Content(ContentTagKind::Typed(ContentType::ToolCall)) => "tool-call",
            TagKind::Content(ContentTagKind::Typed(ContentType::ToolResult)) => "tool-result",
            TagKind::Reference => "prompt",
            TagKind::Scope => "scope",
            TagKind::Step => "step",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for TagKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for TagKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        TagKind::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown tag '{}'", name)))
    }
}

/// Value of a tag attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// Bare attribute (`<step isolated>`)
    True,
    /// Quoted or interpolated value, concatenated at render time
    Nodes(Vec<TemplateNode>),
}

impl AttributeValue {
    /// Literal text of the value when it contains no interpolation.
    pub fn as_static_text(&self) -> Option<String> {
        match self {
            AttributeValue::True => None,
            AttributeValue::Nodes(nodes) => {
                let mut out = String::new();
                for node in nodes {
                    match node {
                        TemplateNode::Text(text) => out.push_str(&text.data),
                        _ => return None,
                    }
                }
                Some(out)
            }
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AttributeValue::True => serializer.serialize_bool(true),
            AttributeValue::Nodes(nodes) => nodes.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Flag(bool),
            Nodes(Vec<TemplateNode>),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Flag(true) => Ok(AttributeValue::True),
            Repr::Flag(false) => Err(serde::de::Error::custom("attribute flag must be true")),
            Repr::Nodes(nodes) => Ok(AttributeValue::Nodes(nodes)),
        }
    }
}

/// `name=value` on an element tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// Source range of the whole `name=value`
    pub span: Span,
    /// Attribute name
    pub name: String,
    /// Attribute value
    pub value: AttributeValue,
}

/// Reserved element tag with attributes and children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementTag {
    /// Source range
    pub span: Span,
    /// Tag classification
    pub name: TagKind,
    /// Attributes in source order
    pub attributes: Vec<Attribute>,
    /// Child nodes
    pub children: Vec<TemplateNode>,
    /// Engine-owned progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
}

impl ElementTag {
    /// Look up an attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|attr| attr.name == name)
    }
}

/// Node of the document tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TemplateNode {
    /// Nested fragment
    Fragment(Fragment),
    /// Leading `---` YAML block
    Config(TextNode),
    /// Literal text
    Text(TextNode),
    /// `/* … */` or `<!-- … -->`
    Comment(TextNode),
    /// Interpolation
    #[serde(rename = "MustacheTag")]
    Mustache(MustacheNode),
    /// Conditional
    #[serde(rename = "IfBlock")]
    If(IfBlock),
    /// Loop
    #[serde(rename = "ForBlock")]
    For(ForBlock),
    /// Reserved tag
    #[serde(rename = "ElementTag")]
    Element(ElementTag),
}

impl TemplateNode {
    /// Source range of the node.
    pub fn span(&self) -> Span {
        match self {
            TemplateNode::Fragment(node) => node.span,
            TemplateNode::Config(node) | TemplateNode::Text(node) | TemplateNode::Comment(node) => {
                node.span
            }
            TemplateNode::Mustache(node) => node.span,
            TemplateNode::If(node) => node.span,
            TemplateNode::For(node) => node.span,
            TemplateNode::Element(node) => node.span,
        }
    }

    /// Engine-owned status slot.
    pub fn status(&self) -> Option<&NodeStatus> {
        match self {
            TemplateNode::Fragment(node) => node.status.as_ref(),
            TemplateNode::Config(node) | TemplateNode::Text(node) | TemplateNode::Comment(node) => {
                node.status.as_ref()
            }
            TemplateNode::Mustache(node) => node.status.as_ref(),
            TemplateNode::If(node) => node.status.as_ref(),
            TemplateNode::For(node) => node.status.as_ref(),
            TemplateNode::Element(node) => node.status.as_ref(),
        }
    }

    /// Mutable status slot.
    pub fn status_mut(&mut self) -> &mut Option<NodeStatus> {
        match self {
            TemplateNode::Fragment(node) => &mut node.status,
            TemplateNode::Config(node) | TemplateNode::Text(node) | TemplateNode::Comment(node) => {
                &mut node.status
            }
            TemplateNode::Mustache(node) => &mut node.status,
            TemplateNode::If(node) => &mut node.status,
            TemplateNode::For(node) => &mut node.status,
            TemplateNode::Element(node) => &mut node.status,
        }
    }

    /// Whether an earlier pass finished this node.
    pub fn is_completed(&self) -> bool {
        self.status().is_some_and(|status| status.completed)
    }

    /// Clear progress on this node and every descendant.
    pub fn reset_status(&mut self) {
        *self.status_mut() = None;
        match self {
            TemplateNode::Fragment(node) => reset_all(&mut node.children),
            TemplateNode::If(node) => {
                reset_all(&mut node.children);
                if let Some(children) = node.else_children.as_mut() {
                    reset_all(children);
                }
            }
            TemplateNode::For(node) => {
                reset_all(&mut node.children);
                if let Some(children) = node.else_children.as_mut() {
                    reset_all(children);
                }
            }
            TemplateNode::Element(node) => reset_all(&mut node.children),
            TemplateNode::Config(_)
            | TemplateNode::Text(_)
            | TemplateNode::Comment(_)
            | TemplateNode::Mustache(_) => {}
        }
    }
}

/// Clear progress on a list of nodes.
pub fn reset_all(nodes: &mut [TemplateNode]) {
    for node in nodes {
        node.reset_status();
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    /// `!`
    #[serde(rename = "!")]
    Not,
    /// `-`
    #[serde(rename = "-")]
    Minus,
    /// `+`
    #[serde(rename = "+")]
    Plus,
    /// `~`
    #[serde(rename = "~")]
    BitNot,
    /// `typeof`
    #[serde(rename = "typeof")]
    TypeOf,
    /// `void`
    #[serde(rename = "void")]
    Void,
}

/// Binary (non short-circuit) operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    #[serde(rename = "+")]
    Add,
    /// `-`
    #[serde(rename = "-")]
    Sub,
    /// `*`
    #[serde(rename = "*")]
    Mul,
    /// `/`
    #[serde(rename = "/")]
    Div,
    /// `%`
    #[serde(rename = "%")]
    Rem,
    /// `**`
    #[serde(rename = "**")]
    Pow,
    /// `==`
    #[serde(rename = "==")]
    LooseEq,
    /// `!=`
    #[serde(rename = "!=")]
    LooseNe,
    /// `===`
    #[serde(rename = "===")]
    StrictEq,
    /// `!==`
    #[serde(rename = "!==")]
    StrictNe,
    /// `<`
    #[serde(rename = "<")]
    Lt,
    /// `<=`
    #[serde(rename = "<=")]
    Le,
    /// `>`
    #[serde(rename = ">")]
    Gt,
    /// `>=`
    #[serde(rename = ">=")]
    Ge,
    /// `&`
    #[serde(rename = "&")]
    BitAnd,
    /// `|`
    #[serde(rename = "|")]
    BitOr,
    /// `^`
    #[serde(rename = "^")]
    BitXor,
    /// `<<`
    #[serde(rename = "<<")]
    Shl,
    /// `>>`
    #[serde(rename = ">>")]
    Shr,
    /// `>>>`
    #[serde(rename = ">>>")]
    UShr,
    /// `in`
    #[serde(rename = "in")]
    In,
}

/// Short-circuit operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    /// `&&`
    #[serde(rename = "&&")]
    And,
    /// `||`
    #[serde(rename = "||")]
    Or,
    /// `??`
    #[serde(rename = "??")]
    Nullish,
}

/// Assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    /// `=`
    #[serde(rename = "=")]
    Assign,
    /// Compound binary assignment such as `+=`
    #[serde(rename = "binary")]
    Binary(BinaryOp),
    /// Compound logical assignment such as `??=`
    #[serde(rename = "logical")]
    Logical(LogicalOp),
}

/// `++` or `--`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    /// `++`
    #[serde(rename = "++")]
    Increment,
    /// `--`
    #[serde(rename = "--")]
    Decrement,
}

/// Property part of a member expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberProperty {
    /// `obj.name`
    Named(String),
    /// `obj[expr]`
    Computed(Box<Expression>),
}

/// Key of an object literal property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyKey {
    /// Identifier or string key
    Named(String),
    /// `[expr]` key
    Computed(Expression),
}

/// Object literal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Key
    pub key: PropertyKey,
    /// Value (for shorthand, an identifier expression)
    pub value: Expression,
}

/// Expression node kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExprKind {
    /// Literal value
    Literal {
        /// Value
        value: Value,
    },
    /// Variable reference
    Identifier {
        /// Name
        name: String,
    },
    /// `[a, b]`
    Array {
        /// Elements
        elements: Vec<Expression>,
    },
    /// `{ a: 1, b }`
    Object {
        /// Entries
        properties: Vec<Property>,
    },
    /// `a, b`
    Sequence {
        /// Expressions, evaluated left to right
        expressions: Vec<Expression>,
    },
    /// `op arg`
    Unary {
        /// Operator
        operator: UnaryOp,
        /// Operand
        argument: Box<Expression>,
    },
    /// `left op right`
    Binary {
        /// Operator
        operator: BinaryOp,
        /// Left operand
        left: Box<Expression>,
        /// Right operand
        right: Box<Expression>,
    },
    /// `left && right`
    Logical {
        /// Operator
        operator: LogicalOp,
        /// Left operand
        left: Box<Expression>,
        /// Right operand, only evaluated when needed
        right: Box<Expression>,
    },
    /// `target op= value`
    Assignment {
        /// Operator
        operator: AssignOp,
        /// Identifier or member target
        target: Box<Expression>,
        /// Assigned value
        value: Box<Expression>,
    },
    /// `++x` / `x--`
    Update {
        /// Operator
        operator: UpdateOp,
        /// Whether the operator precedes the operand
        prefix: bool,
        /// Identifier or member target
        argument: Box<Expression>,
    },
    /// `obj.prop`, `obj[expr]`, `obj?.prop`
    Member {
        /// Target object
        object: Box<Expression>,
        /// Accessed property
        property: MemberProperty,
        /// `?.` access
        optional: bool,
    },
    /// `test ? a : b`
    Conditional {
        /// Condition
        test: Box<Expression>,
        /// Value when truthy
        consequent: Box<Expression>,
        /// Value when falsy
        alternate: Box<Expression>,
    },
    /// `callee(args)`
    Call {
        /// Called value
        callee: Box<Expression>,
        /// Arguments
        arguments: Vec<Expression>,
        /// `?.()` call
        optional: bool,
    },
    /// Boundary of an optional chain; short-circuits to `undefined`
    Chain {
        /// Inner member or call expression
        expression: Box<Expression>,
    },
}

/// Expression with its source range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expression {
    /// Source range
    pub span: Span,
    /// Node kind
    pub kind: ExprKind,
}

impl Expression {
    /// Construct an expression.
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { span, kind }
    }

    /// Name when the expression is a bare identifier.
    pub fn identifier_name(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Identifier { name } => Some(name),
            _ => None,
        }
    }

    /// Whether the expression is an assignment (renders nothing).
    pub fn is_assignment(&self) -> bool {
        matches!(self.kind, ExprKind::Assignment { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_names_roundtrip() {
        for name in RESERVED_TAGS {
            let kind = TagKind::from_name(name).expect("reserved tag");
            assert_eq!(kind.name(), *name);
        }
        assert!(TagKind::from_name("custom-tag").is_none());
    }

    #[test]
    fn attribute_values_serialize_as_flag_or_nodes() {
        let flag = serde_json::to_value(AttributeValue::True).unwrap();
        assert_eq!(flag, serde_json::json!(true));
        let back: AttributeValue = serde_json::from_value(flag).unwrap();
        assert_eq!(back, AttributeValue::True);

        let nodes = AttributeValue::Nodes(vec![TemplateNode::Text(TextNode {
            span: Span::new(0, 3),
            data: "abc".into(),
            status: None,
        })]);
        let json = serde_json::to_value(&nodes).unwrap();
        assert_eq!(json[0]["type"], "Text");
        let back: AttributeValue = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_static_text().as_deref(), Some("abc"));
    }

    #[test]
    fn reset_clears_nested_statuses() {
        let mut node = TemplateNode::Element(ElementTag {
            span: Span::default(),
            name: TagKind::Step,
            attributes: Vec::new(),
            children: vec![TemplateNode::Text(TextNode {
                span: Span::default(),
                data: "x".into(),
                status: Some(NodeStatus {
                    completed: true,
                    ..NodeStatus::default()
                }),
            })],
            status: Some(NodeStatus::default()),
        });
        node.reset_status();
        assert!(node.status().is_none());
        if let TemplateNode::Element(tag) = &node {
            assert!(!tag.children[0].is_completed());
        }
    }
}
