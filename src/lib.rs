//! PromptL – a resumable prompt-templating engine
//!
//! Documents mix text, `{{ expressions }}`, control blocks and XML-like
//! tags. This crate compiles them into role-tagged chat messages:
//! - A JS-like expression evaluator over a two-tier scope
//! - A template compiler that can stop at `<step>` tags and resume later
//! - A chain that drives multi-turn conversations and survives serialization
//! - Static analysis that finds parameters and inlines `<prompt>` references
//! - Adapters that translate messages into provider formats

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Template compilation, chains and static analysis
pub mod compiler;
/// Structured errors
pub mod error;
/// File values
pub mod file;
/// Expression evaluation
pub mod logic;
/// Canonical message types
pub mod message;
/// Template and expression parser
pub mod parser;
/// Provider message adapters
pub mod providers;
/// Variable bindings
pub mod scope;
/// Dynamic values
pub mod value;

// Re-export key types for convenience
pub use compiler::chain::ChainOptions;
pub use compiler::{
    Chain, ChainStep, CompileOptions, ConversationMetadata, Document, ReferenceFn, Scan,
    SerializedChain, StepResponse, render, scan,
};
pub use error::{ChainError, ChainResult, CompileError, CompileResult};
pub use message::{Conversation, Message, MessageContent, MessageRole};
pub use providers::{AdapterKind, ProviderAdapter};
pub use value::{Callable, ObjectMap, Value};

/// Current version of the PromptL engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
