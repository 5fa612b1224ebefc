//! Error types for the PromptL engine
//!
//! Document defects surface as a single structured [`CompileError`] that
//! carries a stable code, a source span, and a rendered code frame. Caller
//! misuse of the step protocol is reported separately as [`ChainError`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::parser::ast::Span;
use crate::providers::AdapterError;

/// Result alias for compilation.
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Result alias for chain operations.
pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Every defect a document can exhibit, keyed by a stable short code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    /// Template syntax could not be parsed
    #[error("{0}")]
    Parse(String),

    /// A block or tag was opened and never closed
    #[error("Unclosed block: '{0}'")]
    UnclosedBlock(String),

    /// A closing tag does not match the open one
    #[error("Unexpected closing tag for '{0}'")]
    UnexpectedTagClose(String),

    /// Block close without an opened block
    #[error("Unexpected block close: '{0}'")]
    UnexpectedBlockClose(String),

    /// Input ended in the middle of a construct
    #[error("Unexpected end of input")]
    UnexpectedEof,

    /// Attribute appears twice on the same tag
    #[error("Attributes need to be unique: '{0}'")]
    DuplicateAttribute(String),

    /// More than one config section
    #[error("Config section already declared")]
    ConfigAlreadyDeclared,

    /// Config section not at the document root
    #[error("Config must be defined at the root level")]
    ConfigOutsideRoot,

    /// Config section after content
    #[error("Config must be defined before any other content")]
    InvalidConfigPlacement,

    /// YAML or validation failure in the config section
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A config section was required and missing
    #[error("Missing config section")]
    MissingConfig,

    /// Message tag nested in a message or content tag
    #[error("Message tags must be at the root level of the document")]
    MessageTagInsideMessage,

    /// Content tag nested in another content tag
    #[error("Content tags must be placed directly inside a message")]
    ContentTagInsideContent,

    /// Generic `<message>` without a role
    #[error("Message tags must have a 'role' attribute")]
    MessageTagWithoutRole,

    /// Role attribute with an unknown value
    #[error("Invalid message role: '{0}'")]
    InvalidMessageRole(String),

    /// Generic `<content>` without a type
    #[error("Content tags must have a 'type' attribute")]
    ContentTagWithoutType,

    /// Type attribute with an unknown value
    #[error("Invalid content type: '{0}'")]
    InvalidContentType(String),

    /// `<tool>` message without `id`
    #[error("Tool messages must have an 'id' attribute")]
    ToolMessageWithoutId,

    /// `<tool>` message without `name`
    #[error("Tool messages must have a 'name' attribute")]
    ToolMessageWithoutName,

    /// `<tool-call>` without `id`
    #[error("Tool call tags must have an 'id' attribute")]
    ToolCallTagWithoutId,

    /// `<tool-call>` without `name`
    #[error("Tool call tags must have a 'name' attribute")]
    ToolCallWithoutName,

    /// Tool call arguments are not valid JSON
    #[error("Invalid tool call arguments: {0}")]
    InvalidToolCallArguments(String),

    /// Tool call outside an assistant message
    #[error("Tool call requests can only appear inside assistant messages")]
    InvalidToolCallPlacement,

    /// Image or file tag rendered to nothing
    #[error("Content tags cannot be empty")]
    EmptyContentTag,

    /// `<content-file>` without `mime`
    #[error("File tags must have a 'mime' attribute")]
    FileTagWithoutMimeType,

    /// More than one file interpolated inside a single content tag
    #[error("A content tag can only contain a single file")]
    MultipleFilesInContentTag,

    /// `<step>` nested in `<step>`
    #[error("Step tags cannot be nested")]
    StepTagInsideStep,

    /// Attribute must be a literal string
    #[error("The '{0}' attribute must be a static value")]
    InvalidStaticAttribute(String),

    /// Step response did not parse against its schema
    #[error("Invalid step response format: {0}")]
    InvalidStepResponseFormat(String),

    /// Read of an undeclared name in restricted mode, or update of one
    #[error("Variable '{0}' is not declared")]
    VariableNotDeclared(String),

    /// Loop variable shadows an existing declaration
    #[error("Variable '{0}' is already declared")]
    VariableAlreadyDeclared(String),

    /// Member path missing on its target
    #[error("Property '{property}' does not exist on object '{object}'")]
    PropertyNotExists {
        /// Rendered target object
        object: String,
        /// Missing member name
        property: String,
    },

    /// Increment or decrement of a non-number
    #[error("Cannot update a non-numeric value: {0}")]
    InvalidUpdate(String),

    /// Call of a value that is not callable
    #[error("'{0}' is not a function")]
    NotAFunction(String),

    /// A caller-supplied callable failed
    #[error("Error calling function: {0}")]
    FunctionCallError(String),

    /// Loop over a value that is not iterable
    #[error("Invalid iterable: '{0}' is not an array")]
    InvalidIterable(String),

    /// Reference tag reached the compiler without being rewritten
    #[error("Reference tags must be resolved before compiling")]
    UnresolvedReference,

    /// `<prompt>` with children
    #[error("Reference tags cannot have content")]
    ReferenceTagHasContent,

    /// `<prompt>` without `path`
    #[error("Reference tags must have a 'path' attribute")]
    ReferenceTagWithoutPath,

    /// References used without a loader
    #[error("A reference function is required to resolve prompt references")]
    MissingReferenceFunction,

    /// Reference nesting exceeded the limit
    #[error("Reference depth limit exceeded")]
    ReferenceDepthLimit,

    /// Reference cycle
    #[error("Circular reference detected")]
    CircularReference,

    /// Loader returned nothing
    #[error("Reference not found")]
    ReferenceNotFound,

    /// Referenced prompt needs a parameter that was not passed
    #[error("Missing parameter '{0}' in reference")]
    ReferenceMissingParameter(String),

    /// Error propagated from a referenced prompt or its loader
    #[error("Error in reference: {0}")]
    ReferenceError(String),
}

impl ErrorKind {
    /// Stable short code identifying the error category.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Parse(_) => "parse-error",
            ErrorKind::UnclosedBlock(_) => "unclosed-block",
            ErrorKind::UnexpectedTagClose(_) => "unexpected-tag-close",
            ErrorKind::UnexpectedBlockClose(_) => "unexpected-block-close",
            ErrorKind::UnexpectedEof => "unexpected-eof",
            ErrorKind::DuplicateAttribute(_) => "duplicate-attribute",
            ErrorKind::ConfigAlreadyDeclared => "config-already-declared",
            ErrorKind::ConfigOutsideRoot => "config-outside-root",
            ErrorKind::InvalidConfigPlacement => "invalid-config-placement",
            ErrorKind::InvalidConfig(_) => "invalid-config",
            ErrorKind::MissingConfig => "missing-config",
            ErrorKind::MessageTagInsideMessage => "message-tag-inside-message",
            ErrorKind::ContentTagInsideContent => "content-tag-inside-content",
            ErrorKind::MessageTagWithoutRole => "message-tag-without-role",
            ErrorKind::InvalidMessageRole(_) => "invalid-message-role",
            ErrorKind::ContentTagWithoutType => "content-tag-without-type",
            ErrorKind::InvalidContentType(_) => "invalid-content-type",
            ErrorKind::ToolMessageWithoutId => "tool-message-without-id",
            ErrorKind::ToolMessageWithoutName => "tool-message-without-name",
            ErrorKind::ToolCallTagWithoutId => "tool-call-tag-without-id",
            ErrorKind::ToolCallWithoutName => "tool-call-without-name",
            ErrorKind::InvalidToolCallArguments(_) => "invalid-tool-call-arguments",
            ErrorKind::InvalidToolCallPlacement => "invalid-tool-call-placement",
            ErrorKind::EmptyContentTag => "empty-content-tag",
            ErrorKind::FileTagWithoutMimeType => "file-tag-without-mime-type",
            ErrorKind::MultipleFilesInContentTag => "multiple-files-in-content-tag",
            ErrorKind::StepTagInsideStep => "step-tag-inside-step",
            ErrorKind::InvalidStaticAttribute(_) => "invalid-static-attribute",
            ErrorKind::InvalidStepResponseFormat(_) => "invalid-step-response-format",
            ErrorKind::VariableNotDeclared(_) => "variable-not-declared",
            ErrorKind::VariableAlreadyDeclared(_) => "variable-already-declared",
            ErrorKind::PropertyNotExists { .. } => "property-not-exists",
            ErrorKind::InvalidUpdate(_) => "invalid-update",
            ErrorKind::NotAFunction(_) => "not-a-function",
            ErrorKind::FunctionCallError(_) => "function-call-error",
            ErrorKind::InvalidIterable(_) => "invalid-iterable",
            ErrorKind::UnresolvedReference => "unresolved-reference",
            ErrorKind::ReferenceTagHasContent => "reference-tag-has-content",
            ErrorKind::ReferenceTagWithoutPath => "reference-tag-without-path",
            ErrorKind::MissingReferenceFunction => "missing-reference-function",
            ErrorKind::ReferenceDepthLimit => "reference-depth-limit",
            ErrorKind::CircularReference => "circular-reference",
            ErrorKind::ReferenceNotFound => "reference-not-found",
            ErrorKind::ReferenceMissingParameter(_) => "reference-missing-parameter",
            ErrorKind::ReferenceError(_) => "reference-error",
        }
    }
}

/// Line/column location inside the source (both 1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Line number
    pub line: usize,
    /// Column number
    pub column: usize,
}

/// Structured error raised while parsing, analyzing, or compiling a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// What went wrong
    pub kind: ErrorKind,
    /// Byte offset where the offending node starts
    pub start: usize,
    /// Byte offset where the offending node ends
    pub end: usize,
    /// Location of `start`
    pub start_position: Position,
    /// Location of `end`
    pub end_position: Position,
    /// Rendered source excerpt with a caret underline
    pub frame: String,
}

impl CompileError {
    /// Build an error for `span` inside `source`, rendering its code frame.
    pub fn new(kind: ErrorKind, source: &str, span: Span) -> Self {
        let start = clamp_to_boundary(source, span.start);
        let end = clamp_to_boundary(source, span.end.max(span.start));
        let start_position = position_of(source, start);
        let end_position = position_of(source, end);
        let frame = code_frame(source, start_position, end_position);
        Self {
            kind,
            start,
            end,
            start_position,
            end_position,
            frame,
        }
    }

    /// Stable short code for this error.
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Human readable message.
    pub fn message(&self) -> String {
        self.kind.to_string()
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for CompileError {}

/// Caller misuse of the step protocol or of serialized chain state.
#[derive(Debug, Error)]
pub enum ChainError {
    /// `step` was called after completion
    #[error("The chain has already completed")]
    AlreadyCompleted,

    /// A response was supplied on the first call
    #[error("A response is not allowed before the chain has started")]
    ResponseBeforeStart,

    /// No response was supplied after the first call
    #[error("A response is required to continue the chain")]
    ResponseRequired,

    /// The step response could not be converted
    #[error("Invalid step response: {0}")]
    InvalidResponse(String),

    /// Serialized state is missing or has mistyped fields
    #[error("Invalid serialized chain data: {0}")]
    InvalidSerializedData(String),

    /// Serialized state names an unknown adapter
    #[error("Adapter not found: {0}")]
    AdapterNotFound(String),

    /// Messages could not be translated by the provider adapter
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// The document itself is defective
    #[error(transparent)]
    Compile(#[from] CompileError),
}

fn clamp_to_boundary(source: &str, index: usize) -> usize {
    let mut index = index.min(source.len());
    while !source.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn position_of(source: &str, offset: usize) -> Position {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
    Position {
        line,
        column: before[line_start..].chars().count() + 1,
    }
}

const FRAME_CONTEXT_LINES: usize = 2;

fn code_frame(source: &str, start: Position, end: Position) -> String {
    let lines: Vec<&str> = source.split('\n').collect();
    let first = start.line.saturating_sub(FRAME_CONTEXT_LINES).max(1);
    let last = (end.line + FRAME_CONTEXT_LINES).min(lines.len());
    let gutter = last.to_string().len();

    let mut out = Vec::new();
    for number in first..=last {
        let text = lines.get(number - 1).copied().unwrap_or_default();
        out.push(format!("{:>gutter$}: {}", number, text));
        if number == start.line {
            let width = if end.line == start.line {
                end.column.saturating_sub(start.column).max(1)
            } else {
                text.chars().count().saturating_sub(start.column - 1).max(1)
            };
            out.push(format!(
                "{:>gutter$}  {}^{}",
                "",
                " ".repeat(start.column - 1),
                "~".repeat(width - 1)
            ));
        }
    }
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let source = "first\nsecond line\nthird";
        let err = CompileError::new(ErrorKind::UnexpectedEof, source, Span::new(13, 17));
        assert_eq!(err.start_position, Position { line: 2, column: 8 });
        assert_eq!(err.end_position, Position { line: 2, column: 12 });
        assert_eq!(err.code(), "unexpected-eof");
    }

    #[test]
    fn frame_underlines_the_span() {
        let source = "a\nb\n{{ foo }}\nc";
        let err = CompileError::new(
            ErrorKind::VariableNotDeclared("foo".into()),
            source,
            Span::new(4, 13),
        );
        assert!(err.frame.contains("3: {{ foo }}"));
        assert!(err.frame.contains("^~~~~~~~"));
        assert_eq!(err.to_string(), "Variable 'foo' is not declared");
    }

    #[test]
    fn chain_errors_render_protocol_messages() {
        assert_eq!(
            ChainError::ResponseRequired.to_string(),
            "A response is required to continue the chain"
        );
    }
}
