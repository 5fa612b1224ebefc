//! Canonical conversation types produced by the compiler.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::Value;

/// Extra attributes spread onto messages and content items.
pub type Attributes = IndexMap<String, Value>;

/// Document or step configuration. The schema is caller-defined.
pub type Config = serde_json::Map<String, serde_json::Value>;

/// Conversational role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions
    System,
    /// Developer instructions
    Developer,
    /// End user
    User,
    /// Model
    Assistant,
    /// Tool output
    Tool,
}

impl MessageRole {
    /// Parse a role name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "system" => Some(MessageRole::System),
            "developer" => Some(MessageRole::Developer),
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            "tool" => Some(MessageRole::Tool),
            _ => None,
        }
    }

    /// Role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::Developer => "developer",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// Plain text
    Text,
    /// Image reference or data
    Image,
    /// Arbitrary file
    File,
    /// Tool invocation requested by the model
    ToolCall,
    /// Result of a tool invocation
    ToolResult,
}

impl ContentType {
    /// Parse a `type` attribute value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "text" => Some(ContentType::Text),
            "image" => Some(ContentType::Image),
            "file" => Some(ContentType::File),
            "tool-call" => Some(ContentType::ToolCall),
            _ => None,
        }
    }
}

/// Maps an interpolated value back to its position in rendered text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptlSourceRef {
    /// Character offset where the value starts
    pub start: usize,
    /// Character offset where the value ends
    pub end: usize,
    /// Variable name when the interpolation was a bare identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

/// Text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    /// Rendered text
    pub text: String,
    /// Interpolation positions, when source maps are enabled
    #[serde(
        rename = "_promptlSourceMap",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_map: Option<Vec<PromptlSourceRef>>,
    /// Extra attributes
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// Image content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    /// URL or encoded data
    pub image: String,
    /// Extra attributes
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// File content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// URL or encoded data
    pub file: String,
    /// MIME type
    pub mime_type: String,
    /// Extra attributes
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// Tool call request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallContent {
    /// Call identifier
    pub tool_call_id: String,
    /// Tool name
    pub tool_name: String,
    /// Parsed arguments
    #[serde(default = "empty_object")]
    pub tool_arguments: Value,
    /// Extra attributes
    #[serde(flatten)]
    pub attributes: Attributes,
}

/// Tool call result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultContent {
    /// Identifier of the answered call
    pub tool_call_id: String,
    /// Tool name
    pub tool_name: String,
    /// Result payload
    pub result: Value,
    /// Whether the tool failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Extra attributes
    #[serde(flatten)]
    pub attributes: Attributes,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

/// Content item of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessageContent {
    /// Text
    Text(TextContent),
    /// Image
    Image(ImageContent),
    /// File
    File(FileContent),
    /// Tool call request
    ToolCall(ToolCallContent),
    /// Tool call result
    ToolResult(ToolResultContent),
}

impl MessageContent {
    /// Plain text item.
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text(TextContent {
            text: text.into(),
            source_map: None,
            attributes: Attributes::new(),
        })
    }

    /// Kind of this item.
    pub fn content_type(&self) -> ContentType {
        match self {
            MessageContent::Text(_) => ContentType::Text,
            MessageContent::Image(_) => ContentType::Image,
            MessageContent::File(_) => ContentType::File,
            MessageContent::ToolCall(_) => ContentType::ToolCall,
            MessageContent::ToolResult(_) => ContentType::ToolResult,
        }
    }

    /// Text payload of a text item.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(content) => Some(&content.text),
            _ => None,
        }
    }
}

/// Role-tagged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role
    pub role: MessageRole,
    /// Ordered content items
    pub content: Vec<MessageContent>,
    /// Extra attributes from the message tag
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl Message {
    /// Message with the given content and no extra attributes.
    pub fn new(role: MessageRole, content: Vec<MessageContent>) -> Self {
        Self {
            role,
            content,
            attributes: Attributes::new(),
        }
    }

    /// Message with a single text item.
    pub fn text(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(role, vec![MessageContent::text(text)])
    }

    /// Concatenation of every text item.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(MessageContent::as_text)
            .collect()
    }
}

/// Messages plus the config that applies to them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// Config merged from the document header and the current step
    pub config: Config,
    /// Messages in order
    pub messages: Vec<Message>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_serializes_with_type_tag() {
        let content = MessageContent::ToolCall(ToolCallContent {
            tool_call_id: "123".into(),
            tool_name: "get_weather".into(),
            tool_arguments: Value::from(json!({"location": "Paris"})),
            attributes: Attributes::new(),
        });
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({
                "type": "tool-call",
                "toolCallId": "123",
                "toolName": "get_weather",
                "toolArguments": {"location": "Paris"}
            })
        );
    }

    #[test]
    fn message_attributes_are_flattened() {
        let mut message = Message::text(MessageRole::User, "hi");
        message
            .attributes
            .insert("name".into(), Value::from("alice"));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["name"], "alice");
        assert_eq!(json["content"][0]["text"], "hi");

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn text_content_joins_text_items() {
        let message = Message::new(
            MessageRole::Assistant,
            vec![MessageContent::text("a"), MessageContent::text("b")],
        );
        assert_eq!(message.text_content(), "ab");
    }
}
