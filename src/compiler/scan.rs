//! Static analysis.
//!
//! [`Scan`] walks a document without evaluating anything. It mirrors the
//! compiler's scoping rules to find the parameters a document reads, checks
//! tag placement, extracts the config header and inlines `<prompt>`
//! references into a single resolved document. Problems are collected
//! rather than raised so callers see every defect in one pass.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_recursion::async_recursion;
use async_trait::async_trait;
use tracing::{debug, warn};

use super::parse_config;
use crate::error::{CompileError, ErrorKind};
use crate::logic::{EvalError, update_scope_context};
use crate::message::{Config, ContentType, MessageRole};
use crate::parser::ast::{
    AttributeValue, ContentTagKind, ElementTag, Expression, Fragment, MessageTagKind, Span, TagKind,
    TemplateNode,
};
use crate::parser::parse;
use crate::scope::ScopeContext;

/// Nesting limit for `<prompt>` references.
pub const REFERENCE_DEPTH_LIMIT: usize = 50;

const PATH_ATTR: &str = "path";
const ROLE_ATTR: &str = "role";
const SCOPE_TAG: &str = "scope";

/// A document and where it lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    /// Identifier used for cycle detection and relative lookups
    pub path: String,
    /// Raw text
    pub content: String,
}

impl Document {
    /// Construct a document.
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// Loads referenced documents.
#[async_trait]
pub trait ReferenceFn: Send + Sync {
    /// Load `path` as seen from `current_path`. `Ok(None)` means not found.
    async fn resolve(&self, path: &str, current_path: Option<&str>) -> anyhow::Result<Option<Document>>;
}

/// Loads references from disk, relative to the referencing document.
#[derive(Debug, Clone)]
pub struct FileReferences {
    root: PathBuf,
}

impl FileReferences {
    /// Resolve absolute reference paths against `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn locate(&self, path: &str, current_path: Option<&str>) -> PathBuf {
        if let Some(stripped) = path.strip_prefix('/') {
            return self.root.join(stripped);
        }
        let base = current_path
            .and_then(|current| Path::new(current).parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        base.join(path)
    }
}

#[async_trait]
impl ReferenceFn for FileReferences {
    async fn resolve(&self, path: &str, current_path: Option<&str>) -> anyhow::Result<Option<Document>> {
        let location = self.locate(path, current_path);
        match tokio::fs::read_to_string(&location).await {
            Ok(content) => Ok(Some(Document::new(location.to_string_lossy(), content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validates a parsed config header.
pub type ConfigValidator = Arc<dyn Fn(&Config) -> Result<(), String> + Send + Sync>;

/// What static analysis learned about a document.
#[derive(Debug, Clone)]
pub struct ConversationMetadata {
    /// Names the document reads without declaring
    pub parameters: BTreeSet<String>,
    /// Hex digest over the text and every referenced document
    pub hash: String,
    /// Parsed document
    pub ast: Fragment,
    /// Document with references inlined and the config normalized
    pub resolved_prompt: String,
    /// Config header, empty when absent
    pub config: Config,
    /// Everything that went wrong
    pub errors: Vec<CompileError>,
    /// More than one step tag
    pub is_chain: bool,
    /// This document and every document it pulled in
    pub included_prompt_paths: BTreeSet<String>,
    raw_text: String,
    config_span: Option<Span>,
}

impl ConversationMetadata {
    /// Raw text with its config header replaced by `config`.
    pub fn set_config(&self, config: &Config) -> serde_yaml::Result<String> {
        let span = self.config_span.unwrap_or_default();
        let head = &self.raw_text[..span.start];
        let tail = &self.raw_text[span.end..];
        if config.is_empty() {
            return Ok(format!("{head}{tail}"));
        }
        Ok(format!("{head}{}{tail}", yaml_header(config)?))
    }
}

fn yaml_header(config: &Config) -> serde_yaml::Result<String> {
    Ok(format!("---\n{}---\n", serde_yaml::to_string(config)?))
}

#[derive(Debug, Clone, Copy, Default)]
struct Placement {
    in_step: bool,
    in_message: bool,
    in_content: bool,
    root: bool,
}

/// Static analyzer for one document.
pub struct Scan {
    document: Document,
    reference_fn: Option<Arc<dyn ReferenceFn>>,
    parameters: Option<Vec<String>>,
    config_validator: Option<ConfigValidator>,
    require_config: bool,
    serialized: Option<Fragment>,

    config: Option<Config>,
    config_span: Option<Span>,
    resolved_prompt: String,
    resolved_offset: isize,
    has_content: bool,
    step_tags: usize,
    pending_tool_calls: Vec<Span>,
    errors: Vec<CompileError>,
    references: BTreeMap<String, Vec<String>>,
    referenced_hashes: Vec<String>,
    reference_depth: usize,
    included_prompt_paths: BTreeSet<String>,
}

impl Scan {
    /// Analyzer for `document`.
    pub fn new(document: Document) -> Self {
        Self {
            resolved_prompt: document.content.clone(),
            included_prompt_paths: BTreeSet::from([document.path.clone()]),
            document,
            reference_fn: None,
            parameters: None,
            config_validator: None,
            require_config: false,
            serialized: None,
            config: None,
            config_span: None,
            resolved_offset: 0,
            has_content: false,
            step_tags: 0,
            pending_tool_calls: Vec::new(),
            errors: Vec::new(),
            references: BTreeMap::new(),
            referenced_hashes: Vec::new(),
            reference_depth: 0,
        }
    }

    /// Load `<prompt>` references through `reference_fn`.
    pub fn with_reference_fn(mut self, reference_fn: Arc<dyn ReferenceFn>) -> Self {
        self.reference_fn = Some(reference_fn);
        self
    }

    /// Only these names may be read without being declared.
    pub fn with_parameters<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parameters = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Check the config header with `validator`.
    pub fn with_config_validator(mut self, validator: ConfigValidator) -> Self {
        self.config_validator = Some(validator);
        self
    }

    /// Report a missing config header.
    pub fn require_config(mut self, required: bool) -> Self {
        self.require_config = required;
        self
    }

    /// Analyze an already parsed document instead of parsing the text.
    pub fn with_ast(mut self, ast: Fragment) -> Self {
        self.serialized = Some(ast);
        self
    }

    fn child(&self, document: Document) -> Self {
        let mut child = Scan::new(document);
        child.reference_fn = self.reference_fn.clone();
        child.reference_depth = self.reference_depth + 1;
        child
    }

    /// Run the analysis.
    pub async fn run(mut self) -> ConversationMetadata {
        let mut context = match &self.parameters {
            Some(names) => ScopeContext::restricted(names.iter().cloned()),
            None => ScopeContext::default(),
        };
        let fragment = self.analyze(&mut context).await;

        if self.require_config && self.config.is_none() {
            self.error(ErrorKind::MissingConfig, Span::new(0, 0));
        }

        let config = self.config.clone().unwrap_or_default();
        let resolved_prompt = if config.is_empty() {
            self.resolved_prompt.clone()
        } else {
            match yaml_header(&config) {
                Ok(header) => format!("{header}{}", self.resolved_prompt),
                Err(e) => {
                    let span = self.config_span.unwrap_or_default();
                    self.error(ErrorKind::InvalidConfig(e.to_string()), span);
                    self.resolved_prompt.clone()
                }
            }
        };

        let mut parameters = context.used_undefined_variables;
        parameters.extend(context.only_predefined_variables.unwrap_or_default());

        debug!(
            path = %self.document.path,
            errors = self.errors.len(),
            parameters = parameters.len(),
            "scanned document"
        );
        ConversationMetadata {
            parameters,
            hash: self.digest(),
            ast: fragment,
            resolved_prompt,
            config,
            errors: self.errors,
            is_chain: self.step_tags > 1,
            included_prompt_paths: self.included_prompt_paths,
            raw_text: self.document.content,
            config_span: self.config_span,
        }
    }

    async fn analyze(&mut self, context: &mut ScopeContext) -> Fragment {
        let fragment = match self.serialized.take() {
            Some(fragment) => fragment,
            None => match parse(&self.document.content) {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.errors.push(e);
                    Fragment::default()
                }
            },
        };
        let root = Placement {
            root: true,
            ..Placement::default()
        };
        self.read_nodes(&fragment.children, context, root).await;
        fragment
    }

    fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.document.content.as_bytes());
        for hash in &self.referenced_hashes {
            hasher.update(hash.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }

    fn error(&mut self, kind: ErrorKind, span: Span) {
        self.errors
            .push(CompileError::new(kind, &self.document.content, span));
    }

    fn expression_errors(&mut self, errors: Vec<EvalError>) {
        for error in errors {
            let error = error.into_compile_error(&self.document.content);
            self.errors.push(error);
        }
    }

    fn track(&mut self, expression: &Expression, context: &mut ScopeContext) {
        let mut errors = Vec::new();
        update_scope_context(expression, context, &mut errors);
        self.expression_errors(errors);
    }

    fn shifted(&self, span: Span) -> (usize, usize) {
        let shift = |at: usize| (at as isize + self.resolved_offset).max(0) as usize;
        (shift(span.start), shift(span.end))
    }

    fn splice_resolved(&mut self, span: Span, replacement: &str) {
        let (start, end) = self.shifted(span);
        self.resolved_prompt.replace_range(start..end, replacement);
        self.resolved_offset += replacement.len() as isize - (end - start) as isize;
    }

    #[async_recursion]
    async fn read_nodes(&mut self, nodes: &[TemplateNode], context: &mut ScopeContext, at: Placement) {
        for node in nodes {
            self.read_node(node, context, at).await;
        }
    }

    #[async_recursion]
    async fn read_node(&mut self, node: &TemplateNode, context: &mut ScopeContext, at: Placement) {
        let inner = Placement { root: false, ..at };
        match node {
            TemplateNode::Fragment(fragment) => self.read_nodes(&fragment.children, context, at).await,
            TemplateNode::Comment(comment) => self.splice_resolved(comment.span, ""),
            TemplateNode::Config(config) => {
                self.splice_resolved(config.span, "");
                if self.config.is_some() {
                    self.error(ErrorKind::ConfigAlreadyDeclared, config.span);
                }
                if !at.root {
                    self.error(ErrorKind::ConfigOutsideRoot, config.span);
                }
                if self.has_content {
                    self.error(ErrorKind::InvalidConfigPlacement, config.span);
                }
                self.config_span = Some(config.span);

                let parsed = match parse_config(&config.data) {
                    Ok(parsed) => parsed,
                    Err(message) => {
                        self.error(ErrorKind::InvalidConfig(message), config.span);
                        Config::new()
                    }
                };
                let verdict = self.config_validator.as_ref().map(|validate| validate(&parsed));
                if let Some(Err(message)) = verdict {
                    self.error(ErrorKind::InvalidConfig(message), config.span);
                }
                self.config = Some(parsed);
            }
            TemplateNode::Text(text) => {
                if !text.data.trim().is_empty() {
                    self.has_content = true;
                }
            }
            TemplateNode::Mustache(mustache) => {
                self.has_content = true;
                self.track(&mustache.expression, context);
            }
            TemplateNode::If(block) => {
                self.track(&block.expression, context);
                let mut then_context = context.branch();
                self.read_nodes(&block.children, &mut then_context, inner).await;
                context.absorb_usage(then_context);
                if let Some(children) = &block.else_children {
                    let mut else_context = context.branch();
                    self.read_nodes(children, &mut else_context, inner).await;
                    context.absorb_usage(else_context);
                }
            }
            TemplateNode::For(block) => {
                self.track(&block.expression, context);
                if let Some(children) = &block.else_children {
                    let mut else_context = context.branch();
                    self.read_nodes(children, &mut else_context, inner).await;
                    context.absorb_usage(else_context);
                }

                for binding in std::iter::once(&block.context).chain(block.index.as_ref()) {
                    if context.defined_variables.contains(&binding.name) {
                        self.error(ErrorKind::VariableAlreadyDeclared(binding.name.clone()), binding.span);
                        return;
                    }
                }
                let mut body = context.branch();
                body.defined_variables.insert(block.context.name.clone());
                if let Some(index) = &block.index {
                    body.defined_variables.insert(index.name.clone());
                }
                self.read_nodes(&block.children, &mut body, inner).await;
                context.absorb_usage(body);
            }
            TemplateNode::Element(tag) => {
                self.has_content = true;
                self.read_tag(tag, context, inner).await;
            }
        }
    }

    /// Names of the tag's attributes, tracking reads inside their values.
    fn list_attributes(
        &mut self,
        tag: &ElementTag,
        context: &mut ScopeContext,
        literal: &[&str],
    ) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for attribute in &tag.attributes {
            if let AttributeValue::Nodes(parts) = &attribute.value {
                let interpolated = parts.iter().find_map(|part| match part {
                    TemplateNode::Mustache(mustache) => Some(mustache),
                    _ => None,
                });
                if literal.contains(&attribute.name.as_str()) {
                    if let Some(mustache) = interpolated {
                        self.error(
                            ErrorKind::InvalidStaticAttribute(attribute.name.clone()),
                            mustache.span,
                        );
                        continue;
                    }
                }
                for part in parts {
                    if let TemplateNode::Mustache(mustache) = part {
                        self.track(&mustache.expression, context);
                    }
                }
            }
            names.insert(attribute.name.clone());
        }
        names
    }

    fn flag_pending_tool_calls(&mut self) {
        for span in std::mem::take(&mut self.pending_tool_calls) {
            self.error(ErrorKind::InvalidToolCallPlacement, span);
        }
    }

    #[async_recursion]
    async fn read_tag(&mut self, tag: &ElementTag, context: &mut ScopeContext, at: Placement) {
        match &tag.name {
            TagKind::Content(kind) => {
                if at.in_content {
                    self.error(ErrorKind::ContentTagInsideContent, tag.span);
                }
                if *kind == ContentTagKind::Typed(ContentType::ToolCall) {
                    self.pending_tool_calls.push(tag.span);
                    let attributes = self.list_attributes(tag, context, &[]);
                    if !attributes.contains("id") {
                        self.error(ErrorKind::ToolCallTagWithoutId, tag.span);
                    }
                    if !attributes.contains("name") {
                        self.error(ErrorKind::ToolCallWithoutName, tag.span);
                    }
                }
                let inner = Placement { in_content: true, ..at };
                self.read_nodes(&tag.children, context, inner).await;
            }
            TagKind::Message(kind) => {
                if at.in_content || at.in_message {
                    self.error(ErrorKind::MessageTagInsideMessage, tag.span);
                }
                let attributes = self.list_attributes(tag, context, &[]);
                let role = match kind {
                    MessageTagKind::Role(role) => Some(*role),
                    MessageTagKind::Generic => {
                        if !attributes.contains(ROLE_ATTR) {
                            self.error(ErrorKind::MessageTagWithoutRole, tag.span);
                            return;
                        }
                        tag.attribute(ROLE_ATTR)
                            .and_then(|attribute| attribute.value.as_static_text())
                            .and_then(|name| MessageRole::from_name(&name))
                    }
                };
                if role == Some(MessageRole::Tool) {
                    if !attributes.contains("id") {
                        self.error(ErrorKind::ToolMessageWithoutId, tag.span);
                        return;
                    }
                    if !attributes.contains("name") {
                        self.error(ErrorKind::ToolMessageWithoutName, tag.span);
                        return;
                    }
                }

                self.flag_pending_tool_calls();
                let inner = Placement { in_message: true, ..at };
                self.read_nodes(&tag.children, context, inner).await;
                // A role only known at runtime is checked when compiling.
                if role.is_some_and(|role| role != MessageRole::Assistant) {
                    self.flag_pending_tool_calls();
                }
                self.pending_tool_calls.clear();
            }
            TagKind::Reference => self.read_reference(tag, context).await,
            TagKind::Scope => {
                let attributes = self.list_attributes(tag, context, &[]);
                let mut inner_context = ScopeContext {
                    only_predefined_variables: context.only_predefined_variables.clone(),
                    used_undefined_variables: BTreeSet::new(),
                    defined_variables: attributes.clone(),
                };
                self.read_nodes(&tag.children, &mut inner_context, at).await;
                for name in inner_context.used_undefined_variables {
                    if !attributes.contains(&name) {
                        self.error(ErrorKind::ReferenceMissingParameter(name), tag.span);
                    }
                }
            }
            TagKind::Step => {
                self.step_tags += 1;
                if at.in_step {
                    self.error(ErrorKind::StepTagInsideStep, tag.span);
                }
                self.list_attributes(tag, context, &["as", "raw"]);
                let inner = Placement { in_step: true, ..at };
                self.read_nodes(&tag.children, context, inner).await;
                for name in ["as", "raw"] {
                    if let Some(text) = tag.attribute(name).and_then(|a| a.value.as_static_text()) {
                        context.defined_variables.insert(text);
                    }
                }
            }
        }
    }

    async fn read_reference(&mut self, tag: &ElementTag, context: &mut ScopeContext) {
        if !tag.children.is_empty() {
            self.error(ErrorKind::ReferenceTagHasContent, tag.span);
            return;
        }
        let attributes = self.list_attributes(tag, context, &[PATH_ATTR]);
        if !attributes.contains(PATH_ATTR) {
            self.error(ErrorKind::ReferenceTagWithoutPath, tag.span);
            return;
        }
        if self.reference_fn.is_none() {
            self.error(ErrorKind::MissingReferenceFunction, tag.span);
            return;
        }
        if self.reference_depth > REFERENCE_DEPTH_LIMIT {
            self.error(ErrorKind::ReferenceDepthLimit, tag.span);
            return;
        }
        let Some(path) = tag
            .attribute(PATH_ATTR)
            .and_then(|attribute| attribute.value.as_static_text())
        else {
            return;
        };

        let (start, end) = self.shifted(tag.span);
        let mut inlined = self.resolved_prompt[start..end].to_string();
        if let Err(e) = self.resolve_reference(tag, &path, &attributes, &mut inlined).await {
            warn!(path = %path, error = %e, "reference failed to load");
            self.error(ErrorKind::ReferenceError(e.to_string()), tag.span);
        }

        let passed: Vec<String> = tag
            .attributes
            .iter()
            .filter(|attribute| attribute.name != PATH_ATTR)
            .map(|attribute| {
                let (start, end) = self.shifted(attribute.span);
                format!(" {}", &self.resolved_prompt[start..end])
            })
            .collect();
        let replacement = format!("<{SCOPE_TAG}{}>{inlined}</{SCOPE_TAG}>", passed.concat());
        self.splice_resolved(tag.span, &replacement);
    }

    async fn resolve_reference(
        &mut self,
        tag: &ElementTag,
        path: &str,
        attributes: &BTreeSet<String>,
        inlined: &mut String,
    ) -> anyhow::Result<()> {
        let Some(reference_fn) = self.reference_fn.clone() else {
            self.error(ErrorKind::MissingReferenceFunction, tag.span);
            return Ok(());
        };
        let current = self
            .references
            .get(&self.document.path)
            .cloned()
            .unwrap_or_default();
        if current.iter().any(|seen| seen == path) {
            self.error(ErrorKind::CircularReference, tag.span);
            return Ok(());
        }

        let Some(document) = reference_fn
            .resolve(path, Some(&self.document.path))
            .await?
        else {
            self.error(ErrorKind::ReferenceNotFound, tag.span);
            return Ok(());
        };
        debug!(from = %self.document.path, to = %document.path, "resolving reference");

        let mut child = self.child(document);
        child.pending_tool_calls = std::mem::take(&mut self.pending_tool_calls);
        child.references = self.references.clone();
        child
            .references
            .insert(self.document.path.clone(), [current, vec![path.to_string()]].concat());
        self.included_prompt_paths
            .insert(child.document.path.clone());

        let mut context = ScopeContext::default();
        child.analyze(&mut context).await;

        self.included_prompt_paths
            .extend(std::mem::take(&mut child.included_prompt_paths));
        for name in &context.used_undefined_variables {
            if !attributes.contains(name) {
                self.error(ErrorKind::ReferenceMissingParameter(name.clone()), tag.span);
            }
        }
        for error in std::mem::take(&mut child.errors) {
            let kind = match error.kind {
                kind @ (ErrorKind::ReferenceError(_) | ErrorKind::CircularReference) => kind,
                other => ErrorKind::ReferenceError(other.to_string()),
            };
            self.error(kind, tag.span);
        }
        self.pending_tool_calls = std::mem::take(&mut child.pending_tool_calls);
        self.referenced_hashes.push(child.digest());
        *inlined = child.resolved_prompt;
        Ok(())
    }
}

/// Scan `document`, loading references through `reference_fn` when given.
pub async fn scan(document: Document, reference_fn: Option<Arc<dyn ReferenceFn>>) -> ConversationMetadata {
    let mut scan = Scan::new(document);
    scan.reference_fn = reference_fn;
    scan.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Library(HashMap<String, String>);

    impl Library {
        fn with(mut self, path: &str, content: &str) -> Arc<dyn ReferenceFn> {
            self.0.insert(path.to_string(), content.to_string());
            Arc::new(self)
        }
    }

    #[async_trait]
    impl ReferenceFn for Library {
        async fn resolve(&self, path: &str, _current_path: Option<&str>) -> anyhow::Result<Option<Document>> {
            Ok(self.0.get(path).map(|content| Document::new(path, content.clone())))
        }
    }

    fn library(entries: &[(&str, &str)]) -> Arc<dyn ReferenceFn> {
        Arc::new(Library(
            entries
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
        ))
    }

    async fn scan_text(text: &str) -> ConversationMetadata {
        scan(Document::new("main", text), None).await
    }

    fn codes(metadata: &ConversationMetadata) -> Vec<&'static str> {
        metadata.errors.iter().map(CompileError::code).collect()
    }

    #[tokio::test]
    async fn collects_parameters_but_not_declarations() {
        let metadata = scan_text(
            "{{ greeting }} {{ total = 0 }}{{ for item in items }}{{ item }}{{ total }}{{ endfor }}\
             <step as=\"answer\">ask</step>{{ answer }}",
        )
        .await;
        assert!(metadata.errors.is_empty(), "{:?}", metadata.errors);
        assert_eq!(
            metadata.parameters,
            BTreeSet::from(["greeting".to_string(), "items".to_string()])
        );
        assert!(!metadata.is_chain);
    }

    #[tokio::test]
    async fn counts_steps_and_extracts_config() {
        let metadata = scan_text("---\nmodel: gpt-4\n---\n<step>a</step><step>b</step>").await;
        assert!(metadata.is_chain);
        assert_eq!(metadata.config.get("model"), Some(&serde_json::json!("gpt-4")));
        assert!(metadata.resolved_prompt.starts_with("---\nmodel: gpt-4\n---\n"));
    }

    #[tokio::test]
    async fn reports_config_problems() {
        let metadata = scan_text("---\n: [\n---\nhi").await;
        assert_eq!(codes(&metadata), vec!["invalid-config"]);

        let required = Scan::new(Document::new("main", "hi")).require_config(true).run().await;
        assert_eq!(codes(&required), vec!["missing-config"]);

        let validator: ConfigValidator = Arc::new(|config: &Config| {
            if config.contains_key("model") {
                Ok(())
            } else {
                Err("model is required".into())
            }
        });
        let validated = Scan::new(Document::new("main", "---\ntemperature: 1\n---\nhi"))
            .with_config_validator(validator)
            .run()
            .await;
        assert_eq!(codes(&validated), vec!["invalid-config"]);
    }

    #[tokio::test]
    async fn accumulates_placement_errors() {
        let metadata = scan_text(
            "<user><assistant>x</assistant></user><step><step>y</step></step><message>z</message>",
        )
        .await;
        assert_eq!(
            codes(&metadata),
            vec!["message-tag-inside-message", "step-tag-inside-step", "message-tag-without-role"]
        );
    }

    #[tokio::test]
    async fn tool_calls_outside_assistant_messages_are_flagged() {
        let ok = scan_text("<assistant><tool-call id=\"1\" name=\"f\" /></assistant>").await;
        assert!(ok.errors.is_empty(), "{:?}", ok.errors);

        let bad = scan_text("<user><tool-call id=\"1\" name=\"f\" /></user>").await;
        assert_eq!(codes(&bad), vec!["invalid-tool-call-placement"]);
    }

    #[tokio::test]
    async fn restricted_parameters_reject_unknown_reads() {
        let metadata = Scan::new(Document::new("main", "{{ a }} {{ b }}"))
            .with_parameters(["a"])
            .run()
            .await;
        assert_eq!(codes(&metadata), vec!["variable-not-declared"]);
        assert!(metadata.parameters.contains("a"));
    }

    #[tokio::test]
    async fn loops_cannot_redeclare_names() {
        let metadata = scan_text("{{ item = 1 }}{{ for item in list }}{{ item }}{{ endfor }}").await;
        assert_eq!(codes(&metadata), vec!["variable-already-declared"]);
    }

    #[tokio::test]
    async fn references_are_inlined_into_scopes() {
        let refs = Library::default().with("child", "/* note */Hello {{ name }}");
        let metadata = scan(
            Document::new("main", "<prompt path=\"child\" name={{ user }} />!"),
            Some(refs),
        )
        .await;
        assert!(metadata.errors.is_empty(), "{:?}", metadata.errors);
        assert_eq!(metadata.resolved_prompt, "<scope name={{ user }}>Hello {{ name }}</scope>!");
        assert_eq!(metadata.parameters, BTreeSet::from(["user".to_string()]));
        assert!(metadata.included_prompt_paths.contains("child"));

        let alone = scan_text("<prompt path=\"child\" name={{ user }} />!").await;
        assert_ne!(metadata.hash, alone.hash);
    }

    #[tokio::test]
    async fn reference_failures_are_reported() {
        let missing = scan(Document::new("main", "<prompt path=\"nope\" />"), Some(library(&[]))).await;
        assert_eq!(codes(&missing), vec!["reference-not-found"]);

        let unbound = scan(
            Document::new("main", "<prompt path=\"child\" />"),
            Some(library(&[("child", "{{ name }}")])),
        )
        .await;
        assert_eq!(codes(&unbound), vec!["reference-missing-parameter"]);

        let no_fn = scan_text("<prompt path=\"child\" />").await;
        assert_eq!(codes(&no_fn), vec!["missing-reference-function"]);

        let no_path = scan_text("<prompt />").await;
        assert_eq!(codes(&no_path), vec!["reference-tag-without-path"]);

        let broken = scan(
            Document::new("main", "<prompt path=\"child\" />"),
            Some(library(&[("child", "<user><user>x</user></user>")])),
        )
        .await;
        assert_eq!(codes(&broken), vec!["reference-error"]);
    }

    #[tokio::test]
    async fn circular_references_stop() {
        let refs = library(&[("a", "<prompt path=\"b\" />"), ("b", "<prompt path=\"a\" />")]);
        let metadata = scan(Document::new("a", "<prompt path=\"b\" />"), Some(refs)).await;
        assert_eq!(codes(&metadata), vec!["circular-reference"]);
    }

    #[tokio::test]
    async fn deep_references_hit_the_depth_limit() {
        let mut nested = Scan::new(Document::new("main", "<prompt path=\"x\" />"))
            .with_reference_fn(library(&[("x", "leaf")]));
        nested.reference_depth = REFERENCE_DEPTH_LIMIT + 1;
        let metadata = nested.run().await;
        assert_eq!(codes(&metadata), vec!["reference-depth-limit"]);

        let documents: Vec<(String, String)> = (0..60)
            .map(|i| (format!("p{i}"), format!("<prompt path=\"p{}\" />", i + 1)))
            .chain(std::iter::once(("p60".to_string(), "end".to_string())))
            .collect();
        let entries: Vec<(&str, &str)> = documents
            .iter()
            .map(|(path, content)| (path.as_str(), content.as_str()))
            .collect();
        let metadata = scan(Document::new("main", "<prompt path=\"p0\" />"), Some(library(&entries))).await;
        assert_eq!(codes(&metadata), vec!["reference-error"]);
        assert!(metadata.errors[0].message().contains("depth limit"), "{}", metadata.errors[0].message());
    }

    #[tokio::test]
    async fn set_config_rewrites_the_header() {
        let metadata = scan_text("---\nmodel: a\n---\nbody").await;
        let mut config = Config::new();
        config.insert("model".into(), "b".into());
        assert_eq!(metadata.set_config(&config).unwrap(), "---\nmodel: b\n---\n\nbody");
        assert_eq!(metadata.set_config(&Config::new()).unwrap(), "\nbody");
    }

    #[tokio::test]
    async fn file_references_resolve_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("shared")).unwrap();
        std::fs::write(dir.path().join("shared/inner.promptl"), "inner").unwrap();
        std::fs::write(dir.path().join("shared/outer.promptl"), "<prompt path=\"inner.promptl\" />").unwrap();

        let refs: Arc<dyn ReferenceFn> = Arc::new(FileReferences::new(dir.path()));
        let metadata = scan(Document::new("main", "<prompt path=\"/shared/outer.promptl\" />"), Some(refs)).await;
        assert!(metadata.errors.is_empty(), "{:?}", metadata.errors);
        assert_eq!(metadata.resolved_prompt, "<scope><scope>inner</scope></scope>");
        assert_eq!(metadata.included_prompt_paths.len(), 3);
    }
}
