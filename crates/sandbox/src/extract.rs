use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{Result, SandboxError};

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[^\n]*\n(?s:(.*?))```").expect("regex"));

/// Returns the body of the first fenced block in `text`, or the whole trimmed
/// text when there is none. Permissive on purpose: model output that drops
/// the JSON envelope still runs.
pub fn extract_code(text: &str) -> String {
    match FENCED_BLOCK.captures(text).and_then(|cap| cap.get(1)) {
        Some(body) => body.as_str().trim().to_owned(),
        None => text.trim().to_owned(),
    }
}

/// Reads the string `code` field of a structured tool payload.
pub fn code_field(value: &Value) -> Result<String> {
    match value.get("code") {
        Some(Value::String(code)) => Ok(code.clone()),
        Some(other) => Err(SandboxError::MalformedParams(format!(
            "`code` must be a string, got {other}"
        ))),
        None => Err(SandboxError::MalformedParams(
            "missing `code` field".to_owned(),
        )),
    }
}
