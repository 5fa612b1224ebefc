//! Element tag semantics.

use tracing::debug;

use super::{Compile, Flow, NodeContext, PendingContent};
use crate::error::{CompileResult, ErrorKind};
use crate::logic::{EvalError, resolve_logic_node, update_scope_context};
use crate::message::{
    Attributes, Config, ContentType, FileContent, ImageContent, Message, MessageContent,
    MessageRole, TextContent, ToolCallContent, ToolResultContent,
};
use crate::parser::ast::{
    Attribute, AttributeValue, ContentTagKind, ElementTag, MessageTagKind, NodeStatus, TagKind,
    TemplateNode,
};
use crate::scope::{Scope, ScopeContext};
use crate::value::Value;

const ROLE_ATTR: &str = "role";
const TYPE_ATTR: &str = "type";
const RESPONSE_ATTR: &str = "as";
const RAW_RESPONSE_ATTR: &str = "raw";
const SCHEMA_ATTR: &str = "schema";

impl Compile<'_> {
    pub(super) async fn resolve_tag(
        &mut self,
        tag: &mut ElementTag,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        self.group_stray_text();

        let memoized = tag.status.as_ref().and_then(|status| status.completed_as.clone());
        let attributes = match memoized {
            Some(Value::Object(attributes)) => attributes,
            _ => {
                let attributes = self.resolve_attributes(&tag.attributes, scope).await?;
                tag.status.get_or_insert_with(NodeStatus::default).completed_as =
                    Some(Value::Object(attributes.clone()));
                attributes
            }
        };

        match tag.name {
            TagKind::Content(kind) => self.resolve_content(tag, kind, attributes, scope, ctx).await,
            TagKind::Message(kind) => self.resolve_message(tag, kind, attributes, scope, ctx).await,
            TagKind::Scope => self.resolve_scope(tag, attributes, ctx).await,
            TagKind::Step => self.resolve_step(tag, attributes, scope, ctx).await,
            TagKind::Reference => Err(self.error(ErrorKind::UnresolvedReference, tag.span)),
        }
    }

    /// Concatenate attribute parts. A single interpolated value keeps its type.
    async fn resolve_attributes(
        &self,
        attributes: &[Attribute],
        scope: &mut Scope,
    ) -> CompileResult<Attributes> {
        let mut resolved = Attributes::new();
        for attribute in attributes {
            let nodes = match &attribute.value {
                AttributeValue::True => {
                    resolved.insert(attribute.name.clone(), Value::Bool(true));
                    continue;
                }
                AttributeValue::Nodes(nodes) => nodes,
            };

            let mut parts = Vec::new();
            for node in nodes {
                match node {
                    TemplateNode::Text(text) if !text.data.is_empty() => {
                        parts.push(Value::String(text.data.clone()));
                    }
                    TemplateNode::Mustache(mustache) => {
                        let value = resolve_logic_node(&mustache.expression, scope)
                            .await
                            .map_err(|e| self.eval_error(e))?;
                        if !value.is_undefined() {
                            parts.push(value);
                        }
                    }
                    _ => {}
                }
            }

            let value = match parts.len() {
                0 => continue,
                1 => parts.remove(0),
                _ => Value::String(parts.iter().map(Value::to_js_string).collect()),
            };
            resolved.insert(attribute.name.clone(), value);
        }
        Ok(resolved)
    }

    async fn resolve_message(
        &mut self,
        tag: &mut ElementTag,
        kind: MessageTagKind,
        mut attributes: Attributes,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        if ctx.in_message || ctx.in_content {
            return Err(self.error(ErrorKind::MessageTagInsideMessage, tag.span));
        }
        self.group_content()?;

        let role = match kind {
            MessageTagKind::Role(role) => role,
            MessageTagKind::Generic => {
                let name = attributes
                    .shift_remove(ROLE_ATTR)
                    .ok_or_else(|| self.error(ErrorKind::MessageTagWithoutRole, tag.span))?
                    .to_js_string();
                MessageRole::from_name(&name)
                    .ok_or_else(|| self.error(ErrorKind::InvalidMessageRole(name), tag.span))?
            }
        };

        let child_ctx = NodeContext {
            in_message: true,
            ..ctx
        };
        if self.resolve_children(&mut tag.children, scope, child_ctx).await? == Flow::Stop {
            return Ok(Flow::Stop);
        }

        let content = self.take_content();
        let mut message = self.build_message(role, content, tag.span)?;
        if role == MessageRole::Tool {
            let id = attributes
                .shift_remove("id")
                .ok_or_else(|| self.error(ErrorKind::ToolMessageWithoutId, tag.span))?;
            let name = attributes
                .shift_remove("name")
                .ok_or_else(|| self.error(ErrorKind::ToolMessageWithoutName, tag.span))?;
            let result = serde_json::to_value(&message.content).unwrap_or_default();
            message.content = vec![MessageContent::ToolResult(ToolResultContent {
                tool_call_id: id.to_js_string(),
                tool_name: name.to_js_string(),
                result: Value::from(result),
                is_error: None,
                attributes: Attributes::new(),
            })];
        }
        message.attributes = attributes;
        self.messages.push(message);
        Ok(Flow::Continue)
    }

    async fn resolve_content(
        &mut self,
        tag: &mut ElementTag,
        kind: ContentTagKind,
        mut attributes: Attributes,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        if ctx.in_content {
            return Err(self.error(ErrorKind::ContentTagInsideContent, tag.span));
        }

        let content_type = match kind {
            ContentTagKind::Typed(content_type) => content_type,
            ContentTagKind::Generic => {
                let name = attributes
                    .shift_remove(TYPE_ATTR)
                    .ok_or_else(|| self.error(ErrorKind::ContentTagWithoutType, tag.span))?
                    .to_js_string();
                ContentType::from_name(&name)
                    .ok_or_else(|| self.error(ErrorKind::InvalidContentType(name), tag.span))?
            }
        };

        let child_ctx = NodeContext {
            in_content: true,
            ..ctx
        };
        if self.resolve_children(&mut tag.children, scope, child_ctx).await? == Flow::Stop {
            return Ok(Flow::Stop);
        }

        let stray = self.stray.take();
        let content = match content_type {
            ContentType::Text => {
                let Some(grouped) = stray else {
                    return Ok(Flow::Continue);
                };
                MessageContent::Text(TextContent {
                    text: grouped.text,
                    source_map: self.options.include_source_map.then_some(grouped.source_map),
                    attributes,
                })
            }
            ContentType::Image => {
                let grouped = stray.ok_or_else(|| self.error(ErrorKind::EmptyContentTag, tag.span))?;
                MessageContent::Image(ImageContent {
                    image: grouped.text,
                    attributes,
                })
            }
            ContentType::File => {
                let grouped = stray.ok_or_else(|| self.error(ErrorKind::EmptyContentTag, tag.span))?;
                let mime_type = attributes
                    .shift_remove("mime")
                    .filter(Value::is_truthy)
                    .ok_or_else(|| self.error(ErrorKind::FileTagWithoutMimeType, tag.span))?;
                MessageContent::File(FileContent {
                    file: grouped.text,
                    mime_type: mime_type.to_js_string(),
                    attributes,
                })
            }
            ContentType::ToolCall => {
                let id = attributes
                    .shift_remove("id")
                    .filter(Value::is_truthy)
                    .ok_or_else(|| self.error(ErrorKind::ToolCallTagWithoutId, tag.span))?;
                let name = attributes
                    .shift_remove("name")
                    .filter(Value::is_truthy)
                    .ok_or_else(|| self.error(ErrorKind::ToolCallWithoutName, tag.span))?;
                let tool_arguments = match attributes.shift_remove("arguments") {
                    None => Value::Object(Default::default()),
                    Some(Value::String(raw)) => serde_json::from_str::<serde_json::Value>(&raw)
                        .map(Value::from)
                        .map_err(|e| {
                            self.error(ErrorKind::InvalidToolCallArguments(e.to_string()), tag.span)
                        })?,
                    Some(other) => other,
                };
                MessageContent::ToolCall(ToolCallContent {
                    tool_call_id: id.to_js_string(),
                    tool_name: name.to_js_string(),
                    tool_arguments,
                    attributes,
                })
            }
            ContentType::ToolResult => {
                return Err(self.error(
                    ErrorKind::InvalidContentType("tool-result".to_string()),
                    tag.span,
                ));
            }
        };

        self.content.push(PendingContent {
            content,
            span: tag.span,
        });
        Ok(Flow::Continue)
    }

    async fn resolve_scope(
        &mut self,
        tag: &mut ElementTag,
        attributes: Attributes,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        let status = tag.status.get_or_insert_with(NodeStatus::default);
        let mut child_scope = match status.scope_stash.take() {
            Some(stash) => Scope::with_stash(stash, status.scope_pointers.take().unwrap_or_default()),
            None => {
                let mut context = ScopeContext::restricted(attributes.keys().cloned());
                let mut errors = Vec::new();
                closure_errors(&tag.children, &mut context, &mut errors);
                if let Some(error) = errors.into_iter().next() {
                    return Err(self.eval_error(error));
                }
                Scope::new(attributes)
            }
        };

        let flow = self
            .resolve_children(&mut tag.children, &mut child_scope, ctx)
            .await?;
        if flow == Flow::Stop {
            let status = tag.status.get_or_insert_with(NodeStatus::default);
            status.scope_stash = Some(child_scope.stash());
            status.scope_pointers = Some(child_scope.pointers().clone());
        }
        Ok(flow)
    }

    async fn resolve_step(
        &mut self,
        tag: &mut ElementTag,
        mut attributes: Attributes,
        scope: &mut Scope,
        ctx: NodeContext,
    ) -> CompileResult<Flow> {
        if ctx.in_step {
            return Err(self.error(ErrorKind::StepTagInsideStep, tag.span));
        }

        let response_name = self.static_attribute(tag, RESPONSE_ATTR)?;
        let raw_name = self.static_attribute(tag, RAW_RESPONSE_ATTR)?;
        attributes.shift_remove(RESPONSE_ATTR);
        attributes.shift_remove(RAW_RESPONSE_ATTR);
        let config: Config = attributes
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect();

        let Some(response) = self.step_response.take() else {
            let child_ctx = NodeContext {
                in_step: true,
                ..ctx
            };
            self.resolve_children(&mut tag.children, scope, child_ctx).await?;
            debug!(span = ?tag.span, "stopping at step");
            self.step_config = Some(config);
            return Ok(Flow::Stop);
        };

        if let Some(name) = raw_name {
            let message = Message::new(MessageRole::Assistant, response.clone());
            let raw = serde_json::to_value(&message).unwrap_or_default();
            scope.set(name, Value::from(raw));
        }

        if let Some(name) = response_name {
            let text: String = response.iter().filter_map(MessageContent::as_text).collect();
            let value = if config.contains_key(SCHEMA_ATTR) {
                serde_json::from_str::<serde_json::Value>(text.trim())
                    .map(Value::from)
                    .map_err(|e| {
                        self.error(ErrorKind::InvalidStepResponseFormat(e.to_string()), tag.span)
                    })?
            } else {
                Value::String(text)
            };
            scope.set(name, value);
        }

        self.group_content()?;
        Ok(Flow::Continue)
    }

    /// Literal text of `name`, which must not interpolate anything.
    fn static_attribute(&self, tag: &ElementTag, name: &str) -> CompileResult<Option<String>> {
        let Some(attribute) = tag.attribute(name) else {
            return Ok(None);
        };
        attribute
            .value
            .as_static_text()
            .map(Some)
            .ok_or_else(|| {
                self.error(
                    ErrorKind::InvalidStaticAttribute(name.to_string()),
                    attribute.span,
                )
            })
    }
}

/// Static closure check of a scope tag's body: every read must be either an
/// attribute of the tag or declared inside the body first.
fn closure_errors(nodes: &[TemplateNode], context: &mut ScopeContext, errors: &mut Vec<EvalError>) {
    for node in nodes {
        match node {
            TemplateNode::Fragment(fragment) => closure_errors(&fragment.children, context, errors),
            TemplateNode::Mustache(mustache) => {
                update_scope_context(&mustache.expression, context, errors)
            }
            TemplateNode::If(block) => {
                update_scope_context(&block.expression, context, errors);
                for branch in std::iter::once(&block.children).chain(block.else_children.as_ref()) {
                    let mut inner = context.branch();
                    closure_errors(branch, &mut inner, errors);
                    context.absorb_usage(inner);
                }
            }
            TemplateNode::For(block) => {
                update_scope_context(&block.expression, context, errors);
                let mut body = context.branch();
                body.defined_variables.insert(block.context.name.clone());
                if let Some(index) = &block.index {
                    body.defined_variables.insert(index.name.clone());
                }
                closure_errors(&block.children, &mut body, errors);
                context.absorb_usage(body);
                if let Some(children) = &block.else_children {
                    let mut inner = context.branch();
                    closure_errors(children, &mut inner, errors);
                    context.absorb_usage(inner);
                }
            }
            TemplateNode::Element(tag) => {
                for attribute in &tag.attributes {
                    if let AttributeValue::Nodes(parts) = &attribute.value {
                        closure_errors(parts, context, errors);
                    }
                }
                match tag.name {
                    // Nested scopes check their own bodies when they run.
                    TagKind::Scope => {}
                    TagKind::Step => {
                        closure_errors(&tag.children, context, errors);
                        for name in [RESPONSE_ATTR, RAW_RESPONSE_ATTR] {
                            if let Some(text) = tag.attribute(name).and_then(|a| a.value.as_static_text()) {
                                context.defined_variables.insert(text);
                            }
                        }
                    }
                    _ => closure_errors(&tag.children, context, errors),
                }
            }
            TemplateNode::Config(_) | TemplateNode::Text(_) | TemplateNode::Comment(_) => {}
        }
    }
}
