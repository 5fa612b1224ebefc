//! Multi-turn step protocol.
//!
//! A [`Chain`] runs one compilation pass per call to [`Chain::step`]. The
//! first call takes no response; every later call must carry the model's
//! answer to the step the previous pass stopped at. History accumulates
//! across calls unless a step is marked `isolated`.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Compile, CompileOptions};
use crate::error::{ChainError, ChainResult};
use crate::message::{Config, Conversation, Message, MessageContent, MessageRole};
use crate::parser::ast::Fragment;
use crate::parser::parse;
use crate::providers::{AdapterKind, ProviderConversation};
use crate::scope::{Scope, ScopeSnapshot};
use crate::value::{ObjectMap, Value};

const ISOLATED_ATTR: &str = "isolated";

/// Answer supplied to [`Chain::step`].
#[derive(Debug, Clone, PartialEq)]
pub enum StepResponse {
    /// Plain assistant text
    Text(String),
    /// One provider-format message; the role defaults to `assistant`
    Message(serde_json::Value),
    /// Several provider-format messages
    Messages(Vec<serde_json::Value>),
}

impl From<&str> for StepResponse {
    fn from(text: &str) -> Self {
        StepResponse::Text(text.to_string())
    }
}

impl From<String> for StepResponse {
    fn from(text: String) -> Self {
        StepResponse::Text(text)
    }
}

impl From<serde_json::Value> for StepResponse {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(text) => StepResponse::Text(text),
            serde_json::Value::Array(messages) => StepResponse::Messages(messages),
            message => StepResponse::Message(message),
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainStep {
    /// Messages to send, in the adapter's format
    pub messages: Vec<serde_json::Value>,
    /// Document config merged with the step's own attributes
    pub config: Config,
    /// No further step is needed
    pub completed: bool,
}

/// How a chain compiles and which adapter it speaks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainOptions {
    /// Provider message format
    pub adapter: AdapterKind,
    /// Compiler options
    pub compile: CompileOptions,
}

impl ChainOptions {
    /// Use `adapter` for responses and output.
    pub fn with_adapter(mut self, adapter: AdapterKind) -> Self {
        self.adapter = adapter;
        self
    }

    /// Replace the compiler options.
    pub fn with_compile_options(mut self, compile: CompileOptions) -> Self {
        self.compile = compile;
        self
    }
}

/// Persisted chain state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedChain {
    /// Document source
    pub raw_text: String,
    /// Document with statuses
    pub ast: Fragment,
    /// Stash and pointers
    pub scope: ScopeSnapshot,
    /// The first step already ran
    #[serde(default = "started")]
    pub did_start: bool,
    /// No further step is needed
    #[serde(default)]
    pub completed: bool,
    /// Adapter identifier
    pub adapter_type: String,
    /// Compiler options
    #[serde(default)]
    pub compiler_options: CompileOptions,
    /// Config from the document header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_config: Option<Config>,
    /// Accumulated history
    #[serde(default)]
    pub global_messages: Vec<Message>,
    /// The last step ran isolated
    #[serde(default)]
    pub was_last_step_isolated: bool,
}

fn started() -> bool {
    true
}

/// Stateful multi-turn conversation over one document.
#[derive(Debug, Clone)]
pub struct Chain {
    raw_text: String,
    ast: Fragment,
    scope: Scope,
    options: CompileOptions,
    adapter: AdapterKind,
    did_start: bool,
    completed: bool,
    global_config: Option<Config>,
    global_messages: Vec<Message>,
    was_last_step_isolated: bool,
}

impl Chain {
    /// Parse `prompt` and bind `parameters` in a fresh scope.
    pub fn new(prompt: impl Into<String>, parameters: ObjectMap, options: ChainOptions) -> ChainResult<Self> {
        let raw_text = prompt.into();
        let ast = parse(&raw_text)?;
        let mut compile = options.compile;
        if options.adapter != AdapterKind::Default {
            compile.include_source_map = false;
        }
        Ok(Self {
            raw_text,
            ast,
            scope: Scope::new(parameters),
            options: compile,
            adapter: options.adapter,
            did_start: false,
            completed: false,
            global_config: None,
            global_messages: Vec::new(),
            was_last_step_isolated: false,
        })
    }

    /// Restore a chain from [`Chain::serialize`] output.
    pub fn deserialize(data: serde_json::Value) -> ChainResult<Self> {
        let serialized: SerializedChain = serde_json::from_value(data)
            .map_err(|e| ChainError::InvalidSerializedData(e.to_string()))?;
        Self::from_serialized(serialized)
    }

    /// Restore a chain from typed state.
    pub fn from_serialized(serialized: SerializedChain) -> ChainResult<Self> {
        let adapter: AdapterKind = serialized
            .adapter_type
            .parse()
            .map_err(|_| ChainError::AdapterNotFound(serialized.adapter_type.clone()))?;
        Ok(Self {
            raw_text: serialized.raw_text,
            ast: serialized.ast,
            scope: Scope::from_snapshot(serialized.scope),
            options: serialized.compiler_options,
            adapter,
            did_start: serialized.did_start,
            completed: serialized.completed,
            global_config: serialized.global_config,
            global_messages: serialized.global_messages,
            was_last_step_isolated: serialized.was_last_step_isolated,
        })
    }

    /// Snapshot everything needed to continue in another process.
    pub fn serialize(&self) -> SerializedChain {
        SerializedChain {
            raw_text: self.raw_text.clone(),
            ast: self.ast.clone(),
            scope: self.scope.serialize(),
            did_start: self.did_start,
            completed: self.completed,
            adapter_type: self.adapter.as_str().to_string(),
            compiler_options: self.options.clone(),
            global_config: self.global_config.clone(),
            global_messages: self.global_messages.clone(),
            was_last_step_isolated: self.was_last_step_isolated,
        }
    }

    /// Document source.
    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// Whether the conversation is over.
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Accumulated history.
    pub fn global_messages(&self) -> &[Message] {
        &self.global_messages
    }

    /// Number of messages in the accumulated history.
    pub fn global_messages_count(&self) -> usize {
        self.global_messages.len()
    }

    /// Run the next pass. State only changes when the pass succeeds.
    pub async fn step(&mut self, response: Option<StepResponse>) -> ChainResult<ChainStep> {
        if self.completed {
            return Err(ChainError::AlreadyCompleted);
        }
        match (self.did_start, response.is_some()) {
            (false, true) => return Err(ChainError::ResponseBeforeStart),
            (true, false) => return Err(ChainError::ResponseRequired),
            _ => {}
        }

        let (response_messages, contents) = self.response_content(response)?;
        let answered = match (&contents, response_messages) {
            _ if self.was_last_step_isolated => Vec::new(),
            (None, _) => Vec::new(),
            (Some(_), Some(messages)) => messages,
            (Some(contents), None) => vec![Message::new(MessageRole::Assistant, contents.clone())],
        };

        let output = Compile::new(&self.raw_text, &self.options)
            .with_step_response(contents)
            .run(self.ast.clone(), self.scope.deep_copy())
            .await?;

        let global_config = output.global_config.or_else(|| self.global_config.clone());
        let completed = output.completed && output.messages.is_empty();
        let mut config = global_config.clone().unwrap_or_default();
        config.extend(output.step_config.unwrap_or_default());
        let isolated = config
            .get(ISOLATED_ATTR)
            .is_some_and(|value| Value::from(value.clone()).is_truthy());

        let mut history = self.global_messages.clone();
        history.extend(answered);
        let mut step_messages = if isolated { Vec::new() } else { history.clone() };
        step_messages.extend(output.messages.iter().cloned());
        if !isolated {
            history.extend(output.messages);
        }

        let provider = self.adapter.adapter().from_promptl(Conversation {
            config: config.clone(),
            messages: step_messages,
        })?;

        self.did_start = true;
        self.ast = output.ast;
        self.scope = Scope::with_stash(output.scope_stash, self.scope.pointers().clone());
        self.global_config = global_config;
        self.global_messages = history;
        self.completed = completed;
        self.was_last_step_isolated = isolated;

        debug!(
            messages = provider.messages.len(),
            completed, isolated, "chain step finished"
        );
        Ok(ChainStep {
            messages: provider.messages,
            config: provider.config,
            completed,
        })
    }

    fn response_content(
        &self,
        response: Option<StepResponse>,
    ) -> ChainResult<(Option<Vec<Message>>, Option<Vec<MessageContent>>)> {
        let Some(response) = response else {
            return Ok((None, None));
        };
        let adapter = self.adapter.adapter();
        let config = self.global_config.clone().unwrap_or_default();

        match response {
            StepResponse::Text(text) => Ok((None, Some(vec![MessageContent::text(text)]))),
            StepResponse::Messages(messages) => {
                let converted = adapter.to_promptl(ProviderConversation { config, messages })?;
                let contents = converted
                    .messages
                    .iter()
                    .flat_map(|message| message.content.iter().cloned())
                    .collect();
                Ok((Some(converted.messages), Some(contents)))
            }
            StepResponse::Message(mut message) => {
                let object = message.as_object_mut().ok_or_else(|| {
                    ChainError::InvalidResponse("expected a string, a message or a list of messages".into())
                })?;
                object
                    .entry("role")
                    .or_insert_with(|| serde_json::Value::from(MessageRole::Assistant.as_str()));
                let converted = adapter.to_promptl(ProviderConversation {
                    config,
                    messages: vec![message],
                })?;
                let contents = converted
                    .messages
                    .into_iter()
                    .next()
                    .map(|message| message.content)
                    .unwrap_or_default();
                Ok((None, Some(contents)))
            }
        }
    }
}

/// Compile a document's first step.
pub async fn render(
    prompt: &str,
    parameters: ObjectMap,
    options: ChainOptions,
) -> ChainResult<ProviderConversation> {
    let mut chain = Chain::new(prompt, parameters, options)?;
    let step = chain.step(None).await?;
    info!(messages = step.messages.len(), "rendered prompt");
    Ok(ProviderConversation {
        config: step.config,
        messages: step.messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain(source: &str) -> Chain {
        Chain::new(source, ObjectMap::new(), ChainOptions::default()).expect("chain")
    }

    #[tokio::test]
    async fn protocol_misuse_is_reported() {
        let mut c = chain("<step>one</step>two");
        assert!(matches!(
            c.step(Some("early".into())).await,
            Err(ChainError::ResponseBeforeStart)
        ));
        c.step(None).await.unwrap();
        assert!(matches!(c.step(None).await, Err(ChainError::ResponseRequired)));
        c.step(Some("r1".into())).await.unwrap();
        let last = c.step(Some("r2".into())).await.unwrap();
        assert!(last.completed);
        assert!(matches!(
            c.step(Some("again".into())).await,
            Err(ChainError::AlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn failed_steps_leave_state_untouched() {
        let mut c = chain("{{ n = 1 }}<step as=\"answer\" schema=\"x\">ask</step>{{ n += 1 }}{{ n }}");
        c.step(None).await.unwrap();
        let before = c.serialize();
        let err = c.step(Some("not json".into())).await.unwrap_err();
        match err {
            ChainError::Compile(e) => assert_eq!(e.code(), "invalid-step-response-format"),
            other => panic!("expected compile error, got {:?}", other),
        }
        assert_eq!(c.serialize(), before);

        let ok = c.step(Some("{\"a\": 1}".into())).await.unwrap();
        assert_eq!(ok.messages.last().unwrap()["content"][0]["text"], "2");
    }

    #[tokio::test]
    async fn isolated_steps_skip_history() {
        let mut c = chain("<step isolated>first</step><step>second</step>");
        let first = c.step(None).await.unwrap();
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.config.get("isolated"), Some(&json!(true)));

        let second = c.step(Some("r1".into())).await.unwrap();
        assert_eq!(second.messages.len(), 1);
        assert_eq!(c.global_messages_count(), 1);
    }

    #[tokio::test]
    async fn falsy_isolated_values_keep_history() {
        for attribute in ["isolated={{ 0 }}", "isolated=\"\"", "isolated={{ false }}"] {
            let mut c = chain(&format!("<step {attribute}>first</step><step>second</step>"));
            c.step(None).await.unwrap();
            let second = c.step(Some("r1".into())).await.unwrap();
            assert_eq!(second.messages.len(), 3, "{attribute}");
        }
    }

    #[tokio::test]
    async fn message_responses_default_to_assistant() {
        let mut c = chain("<step raw=\"reply\">ask</step>{{ reply.role }}");
        c.step(None).await.unwrap();
        let step = c
            .step(Some(StepResponse::from(json!({"content": [{"type": "text", "text": "hi"}]}))))
            .await
            .unwrap();
        assert_eq!(step.messages[1]["role"], "assistant");
        assert_eq!(step.messages[2]["content"][0]["text"], "assistant");
    }

    #[test]
    fn deserialize_validates_input() {
        assert!(matches!(
            Chain::deserialize(json!({"rawText": "hi"})),
            Err(ChainError::InvalidSerializedData(_))
        ));

        let mut serialized = serde_json::to_value(chain("hi").serialize()).unwrap();
        serialized["adapterType"] = json!("anthropic");
        assert!(matches!(
            Chain::deserialize(serialized),
            Err(ChainError::AdapterNotFound(name)) if name == "anthropic"
        ));
    }

    #[tokio::test]
    async fn render_runs_the_first_step() {
        let conversation = render("Hello {{ name }}", ObjectMap::from_iter([("name".to_string(), "Ada".into())]), ChainOptions::default())
            .await
            .unwrap();
        assert_eq!(conversation.messages[0]["content"][0]["text"], "Hello Ada");
    }
}
