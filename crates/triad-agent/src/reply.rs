//! Extraction of JSON payloads from model replies
//!
//! Models wrap structured answers in markdown fences or surround them with
//! prose. These helpers recover the JSON object either way.

use triad_core::{Result, TriadError};

/// Strip a surrounding ```json (or bare ```) fence, if present
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Parse the first JSON object found in a model reply
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let body = strip_code_fence(text);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        return Ok(value);
    }

    // Fenced block somewhere inside the prose
    if let Some(start) = text.find("```") {
        let inner = &text[start..];
        if let Some(end) = inner[3..].find("```") {
            let block = strip_code_fence(&inner[..end + 6]);
            if let Ok(value) = serde_json::from_str(block) {
                return Ok(value);
            }
        }
    }

    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str(&body[start..=end])
            .map_err(|e| TriadError::MalformedPayload(format!("invalid JSON in reply: {}", e))),
        _ => Err(TriadError::MalformedPayload(
            "reply contains no JSON object".to_string(),
        )),
    }
}
