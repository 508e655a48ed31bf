use std::env;

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use tracing::warn;
use url::Url;

use crate::session::tracker::DEFAULT_SHARD_COUNT;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Url,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub log_level: String,
    pub logs_dir: String,
    pub gemini_api_key: String,
    pub gemini_base_url: String,
    pub gemini_model: String,
    pub gemini_temperature: f32,
    pub gemini_top_k: i32,
    pub gemini_top_p: f32,
    pub gemini_max_output_tokens: i32,
    pub gemini_safety_settings: String,
    pub chat_system_prompt: String,
    pub chat_history_turns: usize,
    pub untracked_text_as_chat: bool,
    pub reset_endpoint: Option<Url>,
    pub reset_user_agent: String,
    pub rate_limit_seconds: u64,
    pub telegram_max_length: usize,
    pub whitelist_file_path: String,
    pub access_controlled_commands: Vec<String>,
    pub session_shards: usize,
    pub webhook: Option<WebhookConfig>,
}

pub static CONFIG: Lazy<Config> =
    Lazy::new(|| Config::load().expect("Failed to load configuration"));

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|value| parse_bool(&value))
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f32(name: &str, default: f32) -> f32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn parse_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().trim_start_matches('/').to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn normalize_gemini_safety_settings(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "permissive".to_string();
    }

    match trimmed.to_lowercase().as_str() {
        "permissive" | "off" | "none" => "permissive".to_string(),
        "standard" => "standard".to_string(),
        _ => {
            warn!(
                "Unknown GEMINI_SAFETY_SETTINGS value '{}'; defaulting to permissive.",
                value
            );
            "permissive".to_string()
        }
    }
}

fn parse_reset_endpoint(value: &str) -> Option<Url> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
        Ok(url) => {
            warn!(
                "RESET_ENDPOINT uses unsupported scheme '{}'; reset flow disabled.",
                url.scheme()
            );
            None
        }
        Err(err) => {
            warn!("Invalid RESET_ENDPOINT '{}': {}; reset flow disabled.", trimmed, err);
            None
        }
    }
}

fn parse_webhook(url: Option<&str>, port: Option<&str>) -> Result<Option<WebhookConfig>> {
    let Some(url) = url.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    let url = Url::parse(url).map_err(|err| anyhow!("Invalid WEBHOOK_URL '{url}': {err}"))?;
    if url.scheme() != "https" {
        return Err(anyhow!("WEBHOOK_URL must use https, got '{}'", url.scheme()));
    }
    let port = match port.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => value
            .parse::<u16>()
            .map_err(|_| anyhow!("Invalid WEBHOOK_PORT value: {value}"))?,
        None => DEFAULT_WEBHOOK_PORT,
    };
    Ok(Some(WebhookConfig { url, port }))
}

const DEFAULT_WEBHOOK_PORT: u16 = 8443;

const DEFAULT_RESET_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

impl Config {
    pub fn load() -> Result<Self> {
        let bot_token = env::var("BOT_TOKEN").unwrap_or_default();
        let webhook = parse_webhook(
            env::var("WEBHOOK_URL").ok().as_deref(),
            env::var("WEBHOOK_PORT").ok().as_deref(),
        )?;

        let mut chat_system_prompt = env_string("CHAT_SYSTEM_PROMPT", "");
        if chat_system_prompt.trim().is_empty() {
            chat_system_prompt = CHAT_SYSTEM_PROMPT.to_string();
        }

        Ok(Config {
            bot_token,
            log_level: env_string("LOG_LEVEL", "info").to_lowercase(),
            logs_dir: env_string("LOGS_DIR", "logs"),
            gemini_api_key: env_string("GEMINI_API_KEY", ""),
            gemini_base_url: env_string(
                "GEMINI_BASE_URL",
                "https://generativelanguage.googleapis.com/v1beta",
            )
            .trim_end_matches('/')
            .to_string(),
            gemini_model: env_string("GEMINI_MODEL", "gemini-2.0-flash"),
            gemini_temperature: env_f32("GEMINI_TEMPERATURE", 0.7),
            gemini_top_k: env_i32("GEMINI_TOP_K", 40),
            gemini_top_p: env_f32("GEMINI_TOP_P", 0.95),
            gemini_max_output_tokens: env_i32("GEMINI_MAX_OUTPUT_TOKENS", 2048),
            gemini_safety_settings: normalize_gemini_safety_settings(&env_string(
                "GEMINI_SAFETY_SETTINGS",
                "permissive",
            )),
            chat_system_prompt,
            chat_history_turns: env_usize("CHAT_HISTORY_TURNS", 20),
            untracked_text_as_chat: env_bool("UNTRACKED_TEXT_AS_CHAT", true),
            reset_endpoint: parse_reset_endpoint(&env_string("RESET_ENDPOINT", "")),
            reset_user_agent: env_string("RESET_USER_AGENT", DEFAULT_RESET_USER_AGENT),
            rate_limit_seconds: env_u64("RATE_LIMIT_SECONDS", 10),
            telegram_max_length: env_usize("TELEGRAM_MAX_LENGTH", 4000).max(100),
            whitelist_file_path: env_string("WHITELIST_FILE_PATH", "allowed_chat.txt"),
            access_controlled_commands: parse_csv(&env_string("ACCESS_CONTROLLED_COMMANDS", "")),
            session_shards: env_usize("SESSION_SHARDS", DEFAULT_SHARD_COUNT).max(1),
            webhook,
        })
    }

    pub fn reset_enabled(&self) -> bool {
        self.reset_endpoint.is_some()
    }
}

pub const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant chatting with a user on Telegram.\n\nGuidelines for your responses:\n1. Answer directly and concisely.\n2. When the user sends an image, describe or analyse it as the user asks.\n3. Use plain text or light Markdown; avoid tables.\n4. If you are unsure, say so instead of guessing.\n5. Reply in the same language the user writes in.\n";

pub const OCR_SYSTEM_PROMPT: &str = "You are an OCR engine. Extract all readable text from the image exactly as it appears, preserving line breaks and reading order. Do not describe the image, do not translate, and do not add commentary. If the image contains no readable text, reply with an empty message.";
