//! Vision payload detection and multimodal prompt assembly
//!
//! Image-typed items are recognized by an explicit `isImage` flag, an
//! image MIME type, a filename with an image extension, or raw base64
//! content. Detected images become low-detail image blocks behind a text
//! block carrying their metadata; callers fall back to plain text when
//! the LLM runtime cannot accept multimodal input.

use base64::Engine;
use flowpilot_core::types::ContentBlock;
use serde_json::{Map, Value};

const CONTENT_KEYS: [&str; 5] = ["data", "content", "base64", "body", "attachment"];
const MIME_KEYS: [&str; 4] = ["mimeType", "mime_type", "contentType", "content_type"];
const NAME_KEYS: [&str; 3] = ["filename", "file_name", "name"];

/// One detected image with its provenance
#[derive(Debug, Clone)]
pub struct DetectedImage {
    pub media_type: String,
    pub data: String,
    pub label: Option<String>,
}

fn mime_of(object: &Map<String, Value>) -> Option<String> {
    for key in MIME_KEYS {
        if let Some(mime) = object.get(key).and_then(Value::as_str) {
            return Some(mime.to_string());
        }
    }
    for key in NAME_KEYS {
        if let Some(name) = object.get(key).and_then(Value::as_str) {
            if let Some(guessed) = mime_guess::from_path(name).first_raw() {
                return Some(guessed.to_string());
            }
        }
    }
    None
}

fn base64_content(object: &Map<String, Value>) -> Option<String> {
    for key in CONTENT_KEYS {
        if let Some(text) = object.get(key).and_then(Value::as_str) {
            if looks_like_base64(text) {
                return Some(text.to_string());
            }
        }
    }
    None
}

/// Long, padded, alphabet-clean strings are treated as base64 payloads
fn looks_like_base64(text: &str) -> bool {
    if text.len() < 256 || text.len() % 4 != 0 {
        return false;
    }
    let sample: &str = &text[..256.min(text.len())];
    if !sample
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=')
    {
        return false;
    }
    base64::engine::general_purpose::STANDARD
        .decode(&text[..64])
        .is_ok()
}

fn detect_in_object(object: &Map<String, Value>) -> Option<DetectedImage> {
    let flagged = object
        .get("isImage")
        .or_else(|| object.get("is_image"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let mime = mime_of(object);
    let image_mime = mime
        .as_deref()
        .map(|m| m.starts_with("image/") || m == "application/pdf")
        .unwrap_or(false);

    if !flagged && !image_mime {
        return None;
    }

    let data = base64_content(object)?;
    let media_type = mime
        .filter(|m| m.starts_with("image/"))
        .unwrap_or_else(|| "image/png".to_string());
    let label = NAME_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(|s| s.to_string());
    Some(DetectedImage {
        media_type,
        data,
        label,
    })
}

/// Walk a payload and collect every detectable image
pub fn detect_images(payload: &Value) -> Vec<DetectedImage> {
    let mut found = Vec::new();
    walk(payload, &mut found, 0);
    found
}

fn walk(value: &Value, found: &mut Vec<DetectedImage>, depth: usize) {
    if depth > 6 {
        return;
    }
    match value {
        Value::Object(object) => {
            if let Some(image) = detect_in_object(object) {
                found.push(image);
                return;
            }
            for nested in object.values() {
                walk(nested, found, depth + 1);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, found, depth + 1);
            }
        }
        _ => {}
    }
}

/// Assemble the multimodal prompt: one text block with the prompt and
/// image metadata, then low-detail image blocks
pub fn build_multimodal(prompt: &str, images: &[DetectedImage]) -> Vec<ContentBlock> {
    let mut text = String::from(prompt);
    text.push_str(&format!("\n\n[{} attached image(s)", images.len()));
    let labels: Vec<&str> = images
        .iter()
        .filter_map(|image| image.label.as_deref())
        .collect();
    if !labels.is_empty() {
        text.push_str(": ");
        text.push_str(&labels.join(", "));
    }
    text.push(']');

    let mut blocks = vec![ContentBlock::Text { text }];
    for image in images {
        blocks.push(ContentBlock::Image {
            media_type: image.media_type.clone(),
            data: image.data.clone(),
            detail: "low".to_string(),
        });
    }
    blocks
}
