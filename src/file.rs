//! File values.
//!
//! Callers pass files into documents as plain objects tagged with
//! `__promptlType: "file"`. Interpolating one outside of a content tag
//! produces an image or file content item instead of text.

use serde::{Deserialize, Serialize};

use crate::message::{Attributes, FileContent, ImageContent, MessageContent};
use crate::value::Value;

const FILE_MARKER_KEY: &str = "__promptlType";
const FILE_MARKER: &str = "file";

/// File passed to a document as a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptlFile {
    /// File name
    pub name: String,
    /// Where the file can be fetched
    pub url: String,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
    /// Whether the MIME type is an image type
    pub is_image: bool,
}

impl PromptlFile {
    /// Describe a file by name, url and MIME type.
    pub fn new(name: impl Into<String>, url: impl Into<String>, mime_type: impl Into<String>, size: u64) -> Self {
        let mime_type = mime_type.into();
        Self {
            name: name.into(),
            url: url.into(),
            is_image: mime_type.starts_with("image/"),
            mime_type,
            size,
        }
    }

    /// Template value for this file, with the redundant aliases documents
    /// may read (`type`, `mime`, `bytes`).
    pub fn to_value(&self) -> Value {
        let size = self.size as f64;
        Value::object([
            (FILE_MARKER_KEY, Value::from(FILE_MARKER)),
            ("name", Value::from(self.name.as_str())),
            ("url", Value::from(self.url.as_str())),
            ("isImage", Value::Bool(self.is_image)),
            ("type", Value::from(self.mime_type.as_str())),
            ("mime", Value::from(self.mime_type.as_str())),
            ("mimeType", Value::from(self.mime_type.as_str())),
            ("size", Value::Number(size)),
            ("bytes", Value::Number(size)),
        ])
    }

    /// Recover a file from a template value.
    pub fn from_value(value: &Value) -> Option<Self> {
        if !is_promptl_file(value) {
            return None;
        }
        let object = value.as_object()?;
        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_default()
        };
        let mime_type = match text("mimeType") {
            mime if mime.is_empty() => text("mime"),
            mime => mime,
        };
        let size = object.get("size").map(Value::to_number).unwrap_or(0.0);
        Some(Self {
            name: text("name"),
            url: text("url"),
            is_image: object
                .get("isImage")
                .map(Value::is_truthy)
                .unwrap_or_else(|| mime_type.starts_with("image/")),
            mime_type,
            size: if size.is_finite() && size > 0.0 { size as u64 } else { 0 },
        })
    }

    /// Content item produced when the file is interpolated.
    pub fn to_content(&self) -> MessageContent {
        if self.is_image {
            MessageContent::Image(ImageContent {
                image: self.url.clone(),
                attributes: Attributes::new(),
            })
        } else {
            MessageContent::File(FileContent {
                file: self.url.clone(),
                mime_type: self.mime_type.clone(),
                attributes: Attributes::new(),
            })
        }
    }
}

impl From<PromptlFile> for Value {
    fn from(file: PromptlFile) -> Self {
        file.to_value()
    }
}

/// Whether `value` is a tagged file object.
pub fn is_promptl_file(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|object| object.get(FILE_MARKER_KEY))
        .and_then(Value::as_str)
        == Some(FILE_MARKER)
}

/// Files held by `value`: a single file, or a non-empty array of files.
pub fn promptl_files(value: &Value) -> Option<Vec<PromptlFile>> {
    match value {
        Value::Array(items) if !items.is_empty() && items.iter().all(is_promptl_file) => {
            items.iter().map(PromptlFile::from_value).collect()
        }
        single => PromptlFile::from_value(single).map(|file| vec![file]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_roundtrip_through_values() {
        let file = PromptlFile::new("cat.png", "https://example.com/cat.png", "image/png", 42);
        let value = file.to_value();
        assert!(is_promptl_file(&value));
        assert_eq!(PromptlFile::from_value(&value), Some(file));
    }

    #[test]
    fn images_become_image_content() {
        let image = PromptlFile::new("cat.png", "https://x/cat.png", "image/png", 1);
        let pdf = PromptlFile::new("doc.pdf", "https://x/doc.pdf", "application/pdf", 1);
        assert_eq!(image.to_content().content_type(), crate::message::ContentType::Image);
        match pdf.to_content() {
            MessageContent::File(content) => assert_eq!(content.mime_type, "application/pdf"),
            other => panic!("expected file content, got {:?}", other),
        }
    }

    #[test]
    fn arrays_of_files_are_flattened() {
        let a = PromptlFile::new("a.txt", "u1", "text/plain", 1).to_value();
        let b = PromptlFile::new("b.txt", "u2", "text/plain", 1).to_value();
        let files = promptl_files(&Value::Array(vec![a.clone(), b])).expect("files");
        assert_eq!(files.len(), 2);
        assert!(promptl_files(&Value::Array(vec![a, Value::from(1i64)])).is_none());
        assert!(promptl_files(&Value::Array(vec![])).is_none());
    }
}
