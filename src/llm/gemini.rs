use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{CONFIG, OCR_SYSTEM_PROMPT};
use crate::llm::media::InlineImage;
use crate::session::Turn;
use crate::utils::http::get_http_client;
use crate::utils::text::truncate_chars;
use crate::utils::timing::log_external_timing;

const GEMINI_MAX_RETRY_ATTEMPTS: usize = 2;
const GEMINI_RETRY_BASE_DELAY_MS: u64 = 900;
const GEMINI_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);
const GEMINI_ERROR_BODY_LIMIT: usize = 2000;
const OCR_TEMPERATURE: f32 = 0.0;

#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("GEMINI_API_KEY is not configured")]
    MissingApiKey,
    #[error("Gemini request failed: {0}")]
    Request(String),
    #[error("Gemini request failed with status {status}: {detail}")]
    Status { status: StatusCode, detail: String },
    #[error("Failed to parse Gemini response: {0}")]
    Decode(String),
    #[error("Gemini returned no text (block reason: {})", .block_reason.as_deref().unwrap_or("none"))]
    Empty { block_reason: Option<String> },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Clone)]
struct GenerationSettings {
    temperature: f32,
    top_k: i32,
    top_p: f32,
    max_output_tokens: i32,
    safety_profile: String,
}

impl GenerationSettings {
    fn from_config() -> Self {
        Self {
            temperature: CONFIG.gemini_temperature,
            top_k: CONFIG.gemini_top_k,
            top_p: CONFIG.gemini_top_p,
            max_output_tokens: CONFIG.gemini_max_output_tokens,
            safety_profile: CONFIG.gemini_safety_settings.clone(),
        }
    }
}

fn redact_gemini_api_key(text: &str) -> String {
    let key = CONFIG.gemini_api_key.trim();
    if key.is_empty() {
        return text.to_string();
    }
    text.replace(key, "[redacted]")
}

fn gemini_should_retry_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn gemini_retry_delay(attempt: usize) -> Duration {
    let attempt = attempt.max(1) as u64;
    Duration::from_millis(GEMINI_RETRY_BASE_DELAY_MS.saturating_mul(attempt))
}

fn safety_threshold(profile: &str) -> &'static str {
    match profile {
        "standard" => "BLOCK_MEDIUM_AND_ABOVE",
        _ => "OFF",
    }
}

fn build_safety_settings(profile: &str) -> Vec<Value> {
    let threshold = safety_threshold(profile);
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| json!({ "category": category, "threshold": threshold }))
    .collect()
}

fn image_part(image: &InlineImage) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.to_base64()
        }
    })
}

fn user_parts(prompt: &str, image: Option<&InlineImage>) -> Vec<Value> {
    let mut parts = Vec::new();
    if let Some(image) = image {
        parts.push(image_part(image));
    }
    if !prompt.trim().is_empty() || parts.is_empty() {
        parts.push(json!({ "text": prompt }));
    }
    parts
}

fn build_chat_payload(
    settings: &GenerationSettings,
    system_prompt: &str,
    history: &[Turn],
    prompt: &str,
    image: Option<&InlineImage>,
) -> Value {
    let mut contents = history
        .iter()
        .map(|turn| {
            json!({
                "role": turn.role.as_gemini_role(),
                "parts": [{ "text": turn.text }]
            })
        })
        .collect::<Vec<_>>();
    contents.push(json!({ "role": "user", "parts": user_parts(prompt, image) }));

    json!({
        "systemInstruction": { "parts": [{ "text": system_prompt }] },
        "contents": contents,
        "generationConfig": {
            "temperature": settings.temperature,
            "topK": settings.top_k,
            "topP": settings.top_p,
            "maxOutputTokens": settings.max_output_tokens,
        },
        "safetySettings": build_safety_settings(&settings.safety_profile),
    })
}

fn build_ocr_payload(
    settings: &GenerationSettings,
    image: &InlineImage,
    instruction: Option<&str>,
) -> Value {
    let prompt = match instruction {
        Some(instruction) => format!(
            "Extract the text from this image, then apply this instruction to it: {instruction}"
        ),
        None => "Extract the text from this image.".to_string(),
    };

    json!({
        "systemInstruction": { "parts": [{ "text": OCR_SYSTEM_PROMPT }] },
        "contents": [{ "role": "user", "parts": user_parts(&prompt, Some(image)) }],
        "generationConfig": {
            "temperature": OCR_TEMPERATURE,
            "maxOutputTokens": settings.max_output_tokens,
        },
        "safetySettings": build_safety_settings(&settings.safety_profile),
    })
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(message) = value.pointer("/error/message").and_then(Value::as_str) {
            return message.to_string();
        }
        return truncate_chars(&value.to_string(), GEMINI_ERROR_BODY_LIMIT);
    }

    truncate_chars(trimmed, GEMINI_ERROR_BODY_LIMIT)
}

fn extract_text(response: GeminiResponse) -> Result<String, GeminiError> {
    let mut finish_reason = None;
    let mut text_parts = Vec::new();
    for candidate in response.candidates {
        if finish_reason.is_none() {
            finish_reason = candidate.finish_reason;
        }
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(text) = part.text.filter(|text| !text.trim().is_empty()) {
                text_parts.push(text);
            }
        }
    }

    if text_parts.is_empty() {
        let block_reason = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .or(finish_reason);
        return Err(GeminiError::Empty { block_reason });
    }
    Ok(text_parts.join("\n"))
}

async fn call_gemini_api(payload: &Value) -> Result<GeminiResponse, GeminiError> {
    if CONFIG.gemini_api_key.trim().is_empty() {
        return Err(GeminiError::MissingApiKey);
    }

    let client = get_http_client();
    let model = CONFIG.gemini_model.as_str();
    let url = format!(
        "{}/models/{}:generateContent",
        CONFIG.gemini_base_url, model
    );

    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let response = match client
            .post(&url)
            .timeout(GEMINI_REQUEST_TIMEOUT)
            .header("x-goog-api-key", &CONFIG.gemini_api_key)
            .json(payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                let err_text = redact_gemini_api_key(&err.to_string());
                let should_retry =
                    (err.is_timeout() || err.is_connect()) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
                warn!(
                    "Gemini request failed to send: {} (timeout={}, connect={}, retrying={})",
                    err_text,
                    err.is_timeout(),
                    err.is_connect(),
                    should_retry
                );
                if should_retry {
                    tokio::time::sleep(gemini_retry_delay(attempt)).await;
                    continue;
                }
                return Err(GeminiError::Request(err_text));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = redact_gemini_api_key(&summarize_error_body(&body));
            let should_retry =
                gemini_should_retry_status(status) && attempt < GEMINI_MAX_RETRY_ATTEMPTS;
            warn!(
                "Gemini API error: status={}, detail={}, retrying={}",
                status, detail, should_retry
            );
            if should_retry {
                tokio::time::sleep(gemini_retry_delay(attempt)).await;
                continue;
            }
            return Err(GeminiError::Status { status, detail });
        }

        let parsed = response
            .json::<GeminiResponse>()
            .await
            .map_err(|err| GeminiError::Decode(redact_gemini_api_key(&err.to_string())))?;
        debug!(
            target: "llm.gemini",
            model = model,
            candidates = parsed.candidates.len(),
            "Gemini response received"
        );
        return Ok(parsed);
    }
}

/// Sends the prompt (and optional image) with the user's prior turns and
/// returns the model's reply text.
pub async fn generate_chat_reply(
    history: &[Turn],
    prompt: &str,
    image: Option<&InlineImage>,
) -> Result<String, GeminiError> {
    let payload = build_chat_payload(
        &GenerationSettings::from_config(),
        &CONFIG.chat_system_prompt,
        history,
        prompt,
        image,
    );
    let detail = format!(
        "model={} history_turns={} image={}",
        CONFIG.gemini_model,
        history.len(),
        image.is_some()
    );
    log_external_timing("gemini", "chat", &detail, || async {
        extract_text(call_gemini_api(&payload).await?)
    })
    .await
}

pub async fn extract_text_from_image(
    image: &InlineImage,
    instruction: Option<&str>,
) -> Result<String, GeminiError> {
    let payload = build_ocr_payload(&GenerationSettings::from_config(), image, instruction);
    let detail = format!(
        "model={} mime={} bytes={}",
        CONFIG.gemini_model,
        image.mime_type,
        image.bytes.len()
    );
    log_external_timing("gemini", "ocr", &detail, || async {
        extract_text(call_gemini_api(&payload).await?)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> GenerationSettings {
        GenerationSettings {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            max_output_tokens: 1024,
            safety_profile: "permissive".to_string(),
        }
    }

    fn sample_image() -> InlineImage {
        InlineImage {
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0],
            mime_type: "image/jpeg".to_string(),
        }
    }

    #[test]
    fn user_parts_put_image_before_text() {
        let image = sample_image();
        let parts = user_parts("what is this?", Some(&image));
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[1]["text"], "what is this?");
    }

    #[test]
    fn user_parts_skip_blank_caption_for_images() {
        let image = sample_image();
        assert_eq!(user_parts("  ", Some(&image)).len(), 1);
        assert_eq!(user_parts("", None).len(), 1);
    }

    #[test]
    fn chat_payload_replays_history_with_roles() {
        let history = vec![Turn::user("hi"), Turn::model("hello")];
        let payload = build_chat_payload(&settings(), "be nice", &history, "next question", None);

        let contents = payload["contents"].as_array().expect("contents array");
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "hello");
        assert_eq!(contents[2]["parts"][0]["text"], "next question");
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be nice");
    }

    #[test]
    fn ocr_payload_carries_instruction() {
        let image = sample_image();
        let payload = build_ocr_payload(&settings(), &image, Some("translate to French"));
        let parts = payload["contents"][0]["parts"].as_array().expect("parts");
        let text = parts[1]["text"].as_str().expect("text part");
        assert!(text.contains("translate to French"));
        assert_eq!(payload["generationConfig"]["temperature"], 0.0);
        assert_eq!(payload["generationConfig"]["maxOutputTokens"], 1024);
    }

    #[test]
    fn extracts_joined_text_from_candidates() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "parts": [{ "text": "line one" }, { "text": "  " }, { "text": "line two" }] },
                "finishReason": "STOP"
            }]
        }))
        .expect("valid response");
        assert_eq!(extract_text(response).expect("text"), "line one\nline two");
    }

    #[test]
    fn blocked_prompt_reports_reason() {
        let response: GeminiResponse = serde_json::from_value(json!({
            "promptFeedback": { "blockReason": "SAFETY" }
        }))
        .expect("valid response");
        match extract_text(response) {
            Err(GeminiError::Empty { block_reason }) => {
                assert_eq!(block_reason.as_deref(), Some("SAFETY"))
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn error_body_prefers_api_message() {
        let body = r#"{"error":{"code":400,"message":"API key not valid"}}"#;
        assert_eq!(summarize_error_body(body), "API key not valid");
        assert_eq!(summarize_error_body("   "), "empty response body");
        assert_eq!(summarize_error_body("plain failure"), "plain failure");
    }

    #[test]
    fn safety_profile_maps_to_threshold() {
        assert_eq!(safety_threshold("standard"), "BLOCK_MEDIUM_AND_ABOVE");
        assert_eq!(safety_threshold("permissive"), "OFF");
        assert_eq!(build_safety_settings("standard").len(), 4);
    }
}
