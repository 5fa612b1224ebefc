use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{AdapterError, AdapterKind, AdapterResult, ProviderAdapter, ProviderConversation};
use crate::message::{
    Attributes, Conversation, FileContent, ImageContent, Message, MessageContent,
    MessageRole, TextContent, ToolCallContent, ToolResultContent,
};
use crate::value::Value;

/// Message content: a bare string or a list of parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAiContent {
    /// Plain string
    Text(String),
    /// Typed parts
    Parts(Vec<OpenAiPart>),
}

/// One content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OpenAiPart {
    /// Text
    Text {
        /// Text
        text: String,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
    /// Image url or data
    Image {
        /// Image
        image: String,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
    /// Audio input
    InputAudio {
        /// Encoded audio
        data: String,
        /// `mpeg` or `wav`
        format: String,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
}

/// Function invocation requested by the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiToolCall {
    /// Call identifier
    pub id: String,
    /// Always `function`
    #[serde(rename = "type")]
    pub kind: String,
    /// Function name and JSON-encoded arguments
    pub function: OpenAiFunction,
}

/// Called function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAiFunction {
    /// Function name
    pub name: String,
    /// JSON-encoded arguments
    pub arguments: String,
}

/// Chat completions message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum OpenAiMessage {
    /// System instructions
    System {
        /// Content
        content: OpenAiContent,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
    /// Developer instructions
    Developer {
        /// Content
        content: OpenAiContent,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
    /// End user
    User {
        /// Content
        content: OpenAiContent,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
    /// Model output
    Assistant {
        /// Content
        #[serde(default)]
        content: Option<OpenAiContent>,
        /// Requested tool calls
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<OpenAiToolCall>,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
    /// Tool output
    Tool {
        /// Answered call
        tool_call_id: String,
        /// Output
        content: OpenAiContent,
        /// Extra keys
        #[serde(flatten)]
        extra: Attributes,
    },
}

/// Adapter for the OpenAI chat completions API.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::OpenAi
    }

    fn from_promptl(&self, conversation: Conversation) -> AdapterResult<ProviderConversation> {
        let messages = conversation
            .messages
            .into_iter()
            .map(|message| {
                let converted = to_openai(message)?;
                serde_json::to_value(converted).map_err(|e| AdapterError::InvalidMessage(e.to_string()))
            })
            .collect::<AdapterResult<_>>()?;
        Ok(ProviderConversation {
            config: conversation.config,
            messages,
        })
    }

    fn to_promptl(&self, conversation: ProviderConversation) -> AdapterResult<Conversation> {
        let mut tool_names = HashMap::new();
        let messages = conversation
            .messages
            .into_iter()
            .map(|message| {
                let message: OpenAiMessage = serde_json::from_value(message)
                    .map_err(|e| AdapterError::InvalidMessage(e.to_string()))?;
                from_openai(message, &mut tool_names)
            })
            .collect::<AdapterResult<_>>()?;
        Ok(Conversation {
            config: conversation.config,
            messages,
        })
    }
}

fn unsupported(role: MessageRole, content: &MessageContent) -> AdapterError {
    let content_type = serde_json::to_value(content.content_type())
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    AdapterError::UnsupportedContent {
        role: role.to_string(),
        content_type,
    }
}

fn text_part(content: TextContent) -> OpenAiPart {
    OpenAiPart::Text {
        text: content.text,
        extra: content.attributes,
    }
}

fn file_part(content: FileContent) -> OpenAiPart {
    match content.mime_type.as_str() {
        "audio/mpeg" | "audio/wav" => OpenAiPart::InputAudio {
            format: content.mime_type.rsplit('/').next().unwrap_or_default().to_string(),
            data: content.file,
            extra: content.attributes,
        },
        _ => OpenAiPart::Text {
            text: content.file,
            extra: content.attributes,
        },
    }
}

fn to_openai(message: Message) -> AdapterResult<OpenAiMessage> {
    let role = message.role;
    let extra = message.attributes;
    match role {
        MessageRole::System | MessageRole::Developer => {
            let mut texts = Vec::with_capacity(message.content.len());
            for item in message.content {
                match item {
                    MessageContent::Text(text) => texts.push(text),
                    other => return Err(unsupported(role, &other)),
                }
            }
            let content = match texts.as_slice() {
                [single] => OpenAiContent::Text(single.text.clone()),
                _ => OpenAiContent::Parts(texts.into_iter().map(text_part).collect()),
            };
            Ok(if role == MessageRole::System {
                OpenAiMessage::System { content, extra }
            } else {
                OpenAiMessage::Developer { content, extra }
            })
        }
        MessageRole::User => {
            let mut parts = Vec::with_capacity(message.content.len());
            for item in message.content {
                parts.push(match item {
                    MessageContent::Text(text) => text_part(text),
                    MessageContent::Image(image) => OpenAiPart::Image {
                        image: image.image,
                        extra: image.attributes,
                    },
                    MessageContent::File(file) => file_part(file),
                    other => return Err(unsupported(role, &other)),
                });
            }
            Ok(OpenAiMessage::User {
                content: OpenAiContent::Parts(parts),
                extra,
            })
        }
        MessageRole::Assistant => {
            let mut texts = Vec::new();
            let mut tool_calls = Vec::new();
            for item in message.content {
                match item {
                    MessageContent::Text(text) => texts.push(text_part(text)),
                    MessageContent::ToolCall(call) => tool_calls.push(OpenAiToolCall {
                        id: call.tool_call_id,
                        kind: "function".to_string(),
                        function: OpenAiFunction {
                            name: call.tool_name,
                            arguments: call.tool_arguments.to_json().to_string(),
                        },
                    }),
                    other => return Err(unsupported(role, &other)),
                }
            }
            Ok(OpenAiMessage::Assistant {
                content: Some(OpenAiContent::Parts(texts)),
                tool_calls,
                extra,
            })
        }
        MessageRole::Tool => {
            let result = message
                .content
                .into_iter()
                .find_map(|item| match item {
                    MessageContent::ToolResult(result) => Some(result),
                    _ => None,
                })
                .ok_or(AdapterError::MissingToolResult)?;
            Ok(OpenAiMessage::Tool {
                tool_call_id: result.tool_call_id,
                content: OpenAiContent::Text(tool_output(&result.result)),
                extra,
            })
        }
    }
}

/// Tool results travel as strings: text parts are joined, anything else is
/// JSON encoded.
fn tool_output(result: &Value) -> String {
    match result {
        Value::String(text) => text.clone(),
        Value::Array(items) => {
            let texts: Vec<String> = items
                .iter()
                .filter_map(|item| {
                    let object = item.as_object()?;
                    (object.get("type")?.as_str()? == "text")
                        .then(|| object.get("text").map(Value::to_js_string).unwrap_or_default())
                })
                .collect();
            if texts.is_empty() {
                result.to_json().to_string()
            } else {
                texts.concat()
            }
        }
        other => other.to_json().to_string(),
    }
}

fn content_items(content: OpenAiContent) -> Vec<MessageContent> {
    match content {
        OpenAiContent::Text(text) => vec![MessageContent::text(text)],
        OpenAiContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                OpenAiPart::Text { text, extra } => MessageContent::Text(TextContent {
                    text,
                    source_map: None,
                    attributes: extra,
                }),
                OpenAiPart::Image { image, extra } => MessageContent::Image(ImageContent {
                    image,
                    attributes: extra,
                }),
                OpenAiPart::InputAudio { data, format, extra } => MessageContent::File(FileContent {
                    file: data,
                    mime_type: format!("audio/{}", format),
                    attributes: extra,
                }),
            })
            .collect(),
    }
}

fn from_openai(
    message: OpenAiMessage,
    tool_names: &mut HashMap<String, String>,
) -> AdapterResult<Message> {
    let (role, content, attributes) = match message {
        OpenAiMessage::System { content, extra } => (MessageRole::System, content_items(content), extra),
        OpenAiMessage::Developer { content, extra } => {
            (MessageRole::Developer, content_items(content), extra)
        }
        OpenAiMessage::User { content, extra } => (MessageRole::User, content_items(content), extra),
        OpenAiMessage::Assistant {
            content,
            tool_calls,
            extra,
        } => {
            let mut items = content.map(content_items).unwrap_or_default();
            for call in tool_calls {
                let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
                    .map_err(|e| AdapterError::InvalidMessage(e.to_string()))?;
                tool_names.insert(call.id.clone(), call.function.name.clone());
                items.push(MessageContent::ToolCall(ToolCallContent {
                    tool_call_id: call.id,
                    tool_name: call.function.name,
                    tool_arguments: Value::from(arguments),
                    attributes: Attributes::new(),
                }));
            }
            (MessageRole::Assistant, items, extra)
        }
        OpenAiMessage::Tool {
            tool_call_id,
            content,
            extra,
        } => {
            let result = match content {
                OpenAiContent::Text(text) => Value::String(text),
                parts => {
                    let items = content_items(parts);
                    Value::from(serde_json::to_value(items).unwrap_or_default())
                }
            };
            let tool_name = tool_names.get(&tool_call_id).cloned().unwrap_or_default();
            let content = vec![MessageContent::ToolResult(ToolResultContent {
                tool_call_id,
                tool_name,
                result,
                is_error: None,
                attributes: Attributes::new(),
            })];
            (MessageRole::Tool, content, extra)
        }
    };
    Ok(Message {
        role,
        content,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Config;
    use serde_json::json;

    fn convert(messages: Vec<Message>) -> Vec<serde_json::Value> {
        OpenAiAdapter
            .from_promptl(Conversation {
                config: Config::new(),
                messages,
            })
            .expect("convert")
            .messages
    }

    #[test]
    fn system_text_becomes_a_string() {
        let out = convert(vec![Message::text(MessageRole::System, "be brief")]);
        assert_eq!(out[0], json!({"role": "system", "content": "be brief"}));
    }

    #[test]
    fn assistant_tool_calls_are_lifted() {
        let message = Message::new(
            MessageRole::Assistant,
            vec![
                MessageContent::text("checking"),
                MessageContent::ToolCall(ToolCallContent {
                    tool_call_id: "call_1".into(),
                    tool_name: "weather".into(),
                    tool_arguments: Value::from(json!({"city": "Paris"})),
                    attributes: Attributes::new(),
                }),
            ],
        );
        let out = convert(vec![message]);
        assert_eq!(out[0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(out[0]["tool_calls"][0]["type"], "function");
        assert_eq!(out[0]["tool_calls"][0]["function"]["arguments"], "{\"city\":\"Paris\"}");
        assert_eq!(out[0]["content"][0]["text"], "checking");
    }

    #[test]
    fn tool_results_use_tool_call_id() {
        let message = Message::new(
            MessageRole::Tool,
            vec![MessageContent::ToolResult(ToolResultContent {
                tool_call_id: "call_1".into(),
                tool_name: "weather".into(),
                result: Value::from(json!([{"type": "text", "text": "sunny"}])),
                is_error: None,
                attributes: Attributes::new(),
            })],
        );
        let out = convert(vec![message]);
        assert_eq!(out[0], json!({"role": "tool", "tool_call_id": "call_1", "content": "sunny"}));
    }

    #[test]
    fn system_messages_reject_images() {
        let message = Message::new(
            MessageRole::System,
            vec![MessageContent::Image(ImageContent {
                image: "u".into(),
                attributes: Attributes::new(),
            })],
        );
        let err = OpenAiAdapter
            .from_promptl(Conversation {
                config: Config::new(),
                messages: vec![message],
            })
            .unwrap_err();
        assert_eq!(
            err,
            AdapterError::UnsupportedContent {
                role: "system".into(),
                content_type: "image".into(),
            }
        );
    }

    #[test]
    fn responses_convert_back_with_tool_names() {
        let conversation = ProviderConversation {
            config: Config::new(),
            messages: vec![
                json!({
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "weather", "arguments": "{\"city\":\"Paris\"}"}
                    }]
                }),
                json!({"role": "tool", "tool_call_id": "call_1", "content": "sunny"}),
            ],
        };
        let back = OpenAiAdapter.to_promptl(conversation).unwrap();
        match &back.messages[0].content[0] {
            MessageContent::ToolCall(call) => assert_eq!(call.tool_name, "weather"),
            other => panic!("expected tool call, got {:?}", other),
        }
        match &back.messages[1].content[0] {
            MessageContent::ToolResult(result) => {
                assert_eq!(result.tool_name, "weather");
                assert_eq!(result.result, Value::from("sunny"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
    }
}
