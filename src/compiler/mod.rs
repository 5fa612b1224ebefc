//! Resumable template compiler.
//!
//! [`Compile::run`] walks a parsed document once per conversational turn.
//! Progress is written into each node's [`NodeStatus`] so the next walk can
//! skip work that already happened: completed nodes are never revisited,
//! block conditions and iterables are memoized, loops resume at the
//! iteration they stopped in, and bodies that were interrupted by a step
//! are re-entered with the scope pointers they had at that moment.

/// Multi-turn step protocol.
pub mod chain;
/// Static analysis and reference resolution.
pub mod scan;
mod tags;
/// Stray text grouping.
pub mod text;

use async_recursion::async_recursion;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{CompileError, CompileResult, ErrorKind};
use crate::file::promptl_files;
use crate::logic::{EvalError, resolve_logic_node};
use crate::message::{Config, Message, MessageContent, MessageRole, TextContent};
use crate::parser::ast::{
    ForBlock, Fragment, IfBlock, MustacheNode, NodeStatus, Span, TemplateNode, reset_all,
};
use crate::scope::Scope;
use crate::value::Value;

use text::StrayText;

pub use chain::{Chain, ChainStep, SerializedChain, StepResponse, render};
pub use scan::{ConversationMetadata, Document, ReferenceFn, Scan, scan};

/// Options shared by every compilation of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompileOptions {
    /// Role of messages built from content outside any message tag
    pub default_role: MessageRole,
    /// Attach `_promptlSourceMap` to text content
    pub include_source_map: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            default_role: MessageRole::System,
            include_source_map: false,
        }
    }
}

/// Outcome of one walk over the document.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Messages emitted during this walk
    pub messages: Vec<Message>,
    /// The walk reached the end of the document
    pub completed: bool,
    /// Config parsed from the document header during this walk
    pub global_config: Option<Config>,
    /// Attributes of the step the walk stopped at, minus `as` and `raw`
    pub step_config: Option<Config>,
    /// Document with updated statuses
    pub ast: Fragment,
    /// Stash after the walk
    pub scope_stash: Vec<Value>,
}

/// Whether the walk should keep going after a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, Clone, Copy, Default)]
struct NodeContext {
    in_step: bool,
    in_message: bool,
    in_content: bool,
}

#[derive(Debug, Clone)]
struct PendingContent {
    content: MessageContent,
    span: Span,
}

/// One compilation pass.
pub struct Compile<'a> {
    raw_text: &'a str,
    options: &'a CompileOptions,
    step_response: Option<Vec<MessageContent>>,
    messages: Vec<Message>,
    stray: StrayText,
    content: Vec<PendingContent>,
    global_config: Option<Config>,
    step_config: Option<Config>,
}

impl<'a> Compile<'a> {
    /// Prepare a pass over `raw_text`'s document.
    pub fn new(raw_text: &'a str, options: &'a CompileOptions) -> Self {
        Self {
            raw_text,
            options,
            step_response: None,
            messages: Vec::new(),
            stray: StrayText::default(),
            content: Vec::new(),
            global_config: None,
            step_config: None,
        }
    }

    /// Response consumed by the first step that has not completed yet.
    pub fn with_step_response(mut self, response: Option<Vec<MessageContent>>) -> Self {
        self.step_response = response;
        self
    }

    /// Walk `ast` from the root.
    pub async fn run(mut self, mut ast: Fragment, scope: Scope) -> CompileResult<CompileOutput> {
        let saved = ast
            .status
            .as_mut()
            .and_then(|status| status.scope_pointers.take());
        let mut root = scope.copy(saved);

        let flow = self
            .resolve_children(&mut ast.children, &mut root, NodeContext::default())
            .await?;
        let status = ast.status.get_or_insert_with(NodeStatus::default);
        match flow {
            Flow::Stop => status.scope_pointers = Some(root.pointers().clone()),
            Flow::Continue => status.completed = true,
        }
        self.group_content()?;

        let completed = flow == Flow::Continue;
        debug!(messages = self.messages.len(), completed, "compilation pass finished");
        Ok(CompileOutput {
            messages: self.messages,
            completed,
            global_config: self.global_config,
            step_config: self.step_config,
            ast,
            scope_stash: root.stash(),
        })
    }

    fn error(&self, kind: ErrorKind, span: Span) -> CompileError {
        CompileError::new(kind, self.raw_text, span)
    }

    fn eval_error(&self, error: EvalError) -> CompileError {
        error.into_compile_error(self.raw_text)
    }

    async fn resolve_children(
        &mut self,
        children: &mut [TemplateNode],
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        for child in children.iter_mut() {
            if child.is_completed() {
                continue;
            }
            if self.resolve_node(child, scope, ctx).await? == Flow::Stop {
                return Ok(Flow::Stop);
            }
            child.status_mut().get_or_insert_with(NodeStatus::default).completed = true;
        }
        Ok(Flow::Continue)
    }

    #[async_recursion]
    async fn resolve_node(
        &mut self,
        node: &mut TemplateNode,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        match node {
            TemplateNode::Fragment(fragment) => {
                self.resolve_children(&mut fragment.children, scope, ctx).await
            }
            TemplateNode::Comment(_) => Ok(Flow::Continue),
            TemplateNode::Config(config) => {
                let parsed = parse_config(&config.data)
                    .map_err(|message| self.error(ErrorKind::InvalidConfig(message), config.span))?;
                self.global_config = Some(parsed);
                Ok(Flow::Continue)
            }
            TemplateNode::Text(text) => {
                self.stray.push_literal(&text.data);
                Ok(Flow::Continue)
            }
            TemplateNode::Mustache(mustache) => self.resolve_mustache(mustache, scope, ctx).await,
            TemplateNode::If(block) => self.resolve_if(block, scope, ctx).await,
            TemplateNode::For(block) => self.resolve_for(block, scope, ctx).await,
            TemplateNode::Element(tag) => self.resolve_tag(tag, scope, ctx).await,
        }
    }

    async fn resolve_mustache(
        &mut self,
        node: &MustacheNode,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        let value = resolve_logic_node(&node.expression, scope)
            .await
            .map_err(|e| self.eval_error(e))?;
        if node.expression.is_assignment() || value.is_undefined() {
            return Ok(Flow::Continue);
        }
        let identifier = node.expression.identifier_name().map(str::to_string);

        if let Some(files) = promptl_files(&value) {
            if ctx.in_content {
                let [file] = files.as_slice() else {
                    return Err(self.error(ErrorKind::MultipleFilesInContentTag, node.span));
                };
                self.stray.push_value(file.url.clone(), identifier);
                return Ok(Flow::Continue);
            }
            self.group_stray_text();
            for file in files {
                self.add_content(file.to_content(), node.span);
            }
            return Ok(Flow::Continue);
        }

        self.stray.push_value(value.to_template_string(), identifier);
        Ok(Flow::Continue)
    }

    async fn resolve_if(
        &mut self,
        block: &mut IfBlock,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        let memoized = block
            .status
            .as_ref()
            .and_then(|status| status.completed_as.clone());
        let condition = match memoized {
            Some(condition) => condition,
            None => {
                let condition = resolve_logic_node(&block.expression, scope)
                    .await
                    .map_err(|e| self.eval_error(e))?;
                block.status.get_or_insert_with(NodeStatus::default).completed_as =
                    Some(condition.clone());
                condition
            }
        };

        let status = block.status.get_or_insert_with(NodeStatus::default);
        let mut body_scope = scope.copy(status.scope_pointers.take());
        let branch = if condition.is_truthy() {
            &mut block.children
        } else {
            match block.else_children.as_mut() {
                Some(children) => children,
                None => return Ok(Flow::Continue),
            }
        };

        let flow = self.resolve_children(branch, &mut body_scope, ctx).await?;
        if flow == Flow::Stop {
            let status = block.status.get_or_insert_with(NodeStatus::default);
            status.scope_pointers = Some(body_scope.pointers().clone());
        }
        Ok(flow)
    }

    async fn resolve_for(
        &mut self,
        block: &mut ForBlock,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        let memoized = block
            .status
            .as_ref()
            .and_then(|status| status.completed_as.clone());
        let iterable = match memoized {
            Some(iterable) => iterable,
            None => {
                let iterable = resolve_logic_node(&block.expression, scope)
                    .await
                    .map_err(|e| self.eval_error(e))?;
                block.status.get_or_insert_with(NodeStatus::default).completed_as =
                    Some(iterable.clone());
                iterable
            }
        };
        let Value::Array(items) = iterable else {
            return Err(self.error(
                ErrorKind::InvalidIterable(iterable.type_of().to_string()),
                block.expression.span,
            ));
        };

        let status = block.status.get_or_insert_with(NodeStatus::default);
        let mut resuming = status.scope_pointers.take();
        let start = status.loop_iteration_index.unwrap_or(0);

        if items.is_empty() {
            let Some(children) = block.else_children.as_mut() else {
                return Ok(Flow::Continue);
            };
            let mut body_scope = scope.copy(resuming);
            let flow = self.resolve_children(children, &mut body_scope, ctx).await?;
            if flow == Flow::Stop {
                block.status.get_or_insert_with(NodeStatus::default).scope_pointers =
                    Some(body_scope.pointers().clone());
            }
            return Ok(flow);
        }

        for (index, item) in items.into_iter().enumerate().skip(start) {
            let mut iteration_scope = match resuming.take() {
                Some(pointers) => scope.copy(Some(pointers)),
                None => {
                    reset_all(&mut block.children);
                    let mut fresh = scope.copy(None);
                    fresh.declare(block.context.name.clone(), item);
                    if let Some(binding) = &block.index {
                        fresh.declare(binding.name.clone(), Value::Number(index as f64));
                    }
                    fresh
                }
            };
            block.status.get_or_insert_with(NodeStatus::default).loop_iteration_index = Some(index);

            trace!(iteration = index, "entering loop iteration");
            let flow = self
                .resolve_children(&mut block.children, &mut iteration_scope, ctx)
                .await?;
            if flow == Flow::Stop {
                block.status.get_or_insert_with(NodeStatus::default).scope_pointers =
                    Some(iteration_scope.pointers().clone());
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    fn add_content(&mut self, content: MessageContent, span: Span) {
        self.content.push(PendingContent { content, span });
    }

    /// Turn stray text into a text content item.
    fn group_stray_text(&mut self) {
        let Some(grouped) = self.stray.take() else {
            return;
        };
        let source_map = self.options.include_source_map.then_some(grouped.source_map);
        self.add_content(
            MessageContent::Text(TextContent {
                text: grouped.text,
                source_map,
                attributes: Default::default(),
            }),
            Span::default(),
        );
    }

    fn take_content(&mut self) -> Vec<PendingContent> {
        self.group_stray_text();
        std::mem::take(&mut self.content)
    }

    /// Turn pending content into a message with the default role.
    fn group_content(&mut self) -> CompileResult<()> {
        let content = self.take_content();
        if content.is_empty() {
            return Ok(());
        }
        let message = self.build_message(self.options.default_role, content, Span::default())?;
        self.messages.push(message);
        Ok(())
    }

    fn build_message(
        &self,
        role: MessageRole,
        content: Vec<PendingContent>,
        span: Span,
    ) -> CompileResult<Message> {
        if role != MessageRole::Assistant {
            if let Some(misplaced) = content
                .iter()
                .find(|item| matches!(item.content, MessageContent::ToolCall(_)))
            {
                let at = if misplaced.span == Span::default() { span } else { misplaced.span };
                return Err(self.error(ErrorKind::InvalidToolCallPlacement, at));
            }
        }
        Ok(Message::new(
            role,
            content.into_iter().map(|item| item.content).collect(),
        ))
    }
}

/// Parse the YAML header into a config map.
pub(crate) fn parse_config(data: &str) -> Result<Config, String> {
    let parsed: serde_json::Value = serde_yaml::from_str(data).map_err(|e| e.to_string())?;
    match parsed {
        serde_json::Value::Null => Ok(Config::new()),
        serde_json::Value::Object(map) => Ok(map),
        other => Err(format!("Expected a mapping, found {}", other)),
    }
}
