use std::time::Duration;

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, MessageId, ReplyParameters};
use teloxide::RequestError;
use tracing::warn;

use crate::config::CONFIG;
use crate::utils::text::split_message;

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;

fn telegram_retryable_error(err: &RequestError) -> bool {
    matches!(
        err,
        RequestError::Network(_) | RequestError::RetryAfter(_) | RequestError::Io(_)
    )
}

async fn send_message_with_retry(
    bot: &Bot,
    chat_id: ChatId,
    text: &str,
    reply_to: Option<MessageId>,
    keyboard: Option<&InlineKeyboardMarkup>,
) -> Result<Message> {
    let mut delay = Duration::from_secs_f32(1.5);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let mut request = bot.send_message(chat_id, text.to_string());
        if let Some(reply_to) = reply_to {
            request = request.reply_parameters(ReplyParameters::new(reply_to));
        }
        if let Some(keyboard) = keyboard {
            request = request.reply_markup(keyboard.clone());
        }
        match request.await {
            Ok(message) => return Ok(message),
            Err(err) => {
                if !telegram_retryable_error(&err) || attempt == TELEGRAM_RETRY_ATTEMPTS {
                    return Err(err.into());
                }
                warn!("send_message attempt {attempt} failed: {err}");
                if let RequestError::RetryAfter(wait) = err {
                    tokio::time::sleep(wait.duration()).await;
                } else {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
}

/// Sends `text` as a reply, split over several messages when it exceeds the
/// configured Telegram length.
pub async fn send_reply(bot: &Bot, message: &Message, text: &str) -> Result<()> {
    let chunks = split_message(text, CONFIG.telegram_max_length);
    if chunks.is_empty() {
        return Ok(());
    }
    let mut reply_to = Some(message.id);
    for chunk in chunks {
        send_message_with_retry(bot, message.chat.id, &chunk, reply_to, None).await?;
        reply_to = None;
    }
    Ok(())
}

pub async fn send_prompt(
    bot: &Bot,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    text: &str,
    keyboard: &InlineKeyboardMarkup,
) -> Result<Message> {
    send_message_with_retry(bot, chat_id, text, reply_to, Some(keyboard)).await
}

pub async fn send_notice(bot: &Bot, chat_id: ChatId, text: &str) -> Result<()> {
    send_message_with_retry(bot, chat_id, text, None, None).await?;
    Ok(())
}
