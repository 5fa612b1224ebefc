//! Provider message formats.
//!
//! An adapter translates between canonical [`Conversation`]s and the
//! message shape a model provider expects. Adapters exchange messages as
//! plain JSON so callers can pass provider payloads through untouched.

/// OpenAI chat completions format.
pub mod openai;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::message::{Config, Conversation, Message};

pub use openai::OpenAiAdapter;

/// Result alias for adapter conversions.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Conversion failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    /// No adapter is registered under this name
    #[error("Adapter not found: {0}")]
    NotFound(String),

    /// The target format cannot carry this content on this role
    #[error("Unsupported content type for {role} message: {content_type}")]
    UnsupportedContent {
        /// Message role
        role: String,
        /// Offending content type
        content_type: String,
    },

    /// A tool message carried no tool result
    #[error("Tool messages must include tool-result content")]
    MissingToolResult,

    /// A provider message did not have the expected shape
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Conversation in a provider's message format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConversation {
    /// Merged config
    pub config: Config,
    /// Provider-format messages
    pub messages: Vec<serde_json::Value>,
}

/// Registered adapters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterKind {
    /// Canonical messages, unchanged
    #[default]
    #[serde(rename = "default")]
    Default,
    /// OpenAI chat completions
    #[serde(rename = "openai")]
    OpenAi,
}

impl AdapterKind {
    /// Stable identifier used in serialized chains.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdapterKind::Default => "default",
            AdapterKind::OpenAi => "openai",
        }
    }

    /// The adapter implementation.
    pub fn adapter(self) -> &'static dyn ProviderAdapter {
        match self {
            AdapterKind::Default => &DefaultAdapter,
            AdapterKind::OpenAi => &OpenAiAdapter,
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = AdapterError;

    fn from_str(name: &str) -> AdapterResult<Self> {
        match name {
            "default" => Ok(AdapterKind::Default),
            "openai" => Ok(AdapterKind::OpenAi),
            other => Err(AdapterError::NotFound(other.to_string())),
        }
    }
}

/// Translation between canonical and provider messages.
pub trait ProviderAdapter: Send + Sync + fmt::Debug {
    /// Identifier of this adapter.
    fn kind(&self) -> AdapterKind;

    /// Canonical to provider format.
    fn from_promptl(&self, conversation: Conversation) -> AdapterResult<ProviderConversation>;

    /// Provider format to canonical.
    fn to_promptl(&self, conversation: ProviderConversation) -> AdapterResult<Conversation>;
}

/// Passes canonical messages through as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAdapter;

impl ProviderAdapter for DefaultAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Default
    }

    fn from_promptl(&self, conversation: Conversation) -> AdapterResult<ProviderConversation> {
        let messages = conversation
            .messages
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()
            .map_err(|e| AdapterError::InvalidMessage(e.to_string()))?;
        Ok(ProviderConversation {
            config: conversation.config,
            messages,
        })
    }

    fn to_promptl(&self, conversation: ProviderConversation) -> AdapterResult<Conversation> {
        let messages = conversation
            .messages
            .into_iter()
            .map(serde_json::from_value::<Message>)
            .collect::<Result<_, _>>()
            .map_err(|e| AdapterError::InvalidMessage(e.to_string()))?;
        Ok(Conversation {
            config: conversation.config,
            messages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRole;
    use serde_json::json;

    #[test]
    fn adapter_names_roundtrip() {
        for kind in [AdapterKind::Default, AdapterKind::OpenAi] {
            assert_eq!(kind.as_str().parse::<AdapterKind>().unwrap(), kind);
            assert_eq!(kind.adapter().kind(), kind);
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
        assert_eq!(
            "anthropic".parse::<AdapterKind>(),
            Err(AdapterError::NotFound("anthropic".into()))
        );
    }

    #[test]
    fn default_adapter_is_lossless() {
        let conversation = Conversation {
            config: Config::new(),
            messages: vec![Message::text(MessageRole::User, "hello")],
        };
        let provider = DefaultAdapter.from_promptl(conversation.clone()).unwrap();
        assert_eq!(provider.messages[0]["role"], "user");
        assert_eq!(DefaultAdapter.to_promptl(provider).unwrap(), conversation);
    }

    #[test]
    fn default_adapter_rejects_malformed_messages() {
        let provider = ProviderConversation {
            config: Config::new(),
            messages: vec![json!({"role": "robot", "content": []})],
        };
        assert!(matches!(
            DefaultAdapter.to_promptl(provider),
            Err(AdapterError::InvalidMessage(_))
        ));
    }
}
