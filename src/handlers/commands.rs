use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{ParseMode, ReplyParameters};

use crate::config::CONFIG;
use crate::handlers::access::check_access_control;
use crate::handlers::actions::{start_action, FlowAction};
use crate::handlers::flows::{cancel_flow, main_menu_keyboard, start_flow, start_new_chat};
use crate::handlers::responses::send_prompt;
use crate::session::{FlowContext, Mode};
use crate::state::AppState;
use crate::utils::telegram::{display_name, message_user};

pub fn optional_arg(arg: String) -> Option<String> {
    let trimmed = arg.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn help_text(reset_enabled: bool) -> String {
    let mut text = String::from(
        "*Commands*

/chat - Ask the assistant
Usage: `/chat [question]`, or `/chat` and send your question or a photo next

/ocr - Read the text in a photo
Usage: `/ocr [what to do with the text]`, then send the photo

",
    );
    if reset_enabled {
        text.push_str(
            "/reset - Request an account recovery link
Usage: `/reset`, then send the username or email address

",
        );
    }
    text.push_str(
        "/newchat - Forget the conversation so far

/cancel - Stop whatever I'm waiting for

/help - Show this help message
",
    );
    text
}

pub async fn start_handler(bot: Bot, message: Message) -> Result<()> {
    let greeting = format!(
        "Hello, {}! I can chat, read text from photos and more. Pick an action or see /help.",
        display_name(message.from.as_ref())
    );
    send_prompt(
        &bot,
        message.chat.id,
        Some(message.id),
        &greeting,
        &main_menu_keyboard(CONFIG.reset_enabled()),
    )
    .await?;
    Ok(())
}

#[allow(deprecated)]
pub async fn help_handler(bot: Bot, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "help").await {
        return Ok(());
    }

    bot.send_message(message.chat.id, help_text(CONFIG.reset_enabled()))
        .reply_parameters(ReplyParameters::new(message.id))
        .parse_mode(ParseMode::Markdown)
        .await?;
    Ok(())
}

pub async fn ocr_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    instruction: Option<String>,
) -> Result<()> {
    if !check_access_control(&bot, &message, "ocr").await {
        return Ok(());
    }
    let Some(user) = message_user(&message) else {
        return Ok(());
    };
    let context = FlowContext::for_chat(message.chat.id.0).with_instruction(instruction);
    start_flow(
        &bot,
        &state,
        user,
        message.chat.id,
        Some(message.id),
        Mode::AwaitingOcrImage,
        context,
    )
    .await
}

pub async fn reset_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    if !check_access_control(&bot, &message, "reset").await {
        return Ok(());
    }
    let Some(user) = message_user(&message) else {
        return Ok(());
    };
    start_flow(
        &bot,
        &state,
        user,
        message.chat.id,
        Some(message.id),
        Mode::AwaitingResetTarget,
        FlowContext::for_chat(message.chat.id.0),
    )
    .await
}

/// `/chat text` answers right away; a bare `/chat` waits for the next
/// message or photo.
pub async fn chat_handler(
    bot: Bot,
    state: AppState,
    message: Message,
    prompt: Option<String>,
) -> Result<()> {
    if !check_access_control(&bot, &message, "chat").await {
        return Ok(());
    }
    let Some(user) = message_user(&message) else {
        return Ok(());
    };

    match prompt {
        Some(prompt) => {
            state.tracker.cancel(user);
            let action = FlowAction::Chat {
                prompt,
                image: None,
            };
            start_action(bot, state, message, user, action, None).await
        }
        None => {
            start_flow(
                &bot,
                &state,
                user,
                message.chat.id,
                Some(message.id),
                Mode::AwaitingChatReply,
                FlowContext::for_chat(message.chat.id.0),
            )
            .await
        }
    }
}

pub async fn newchat_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user) = message_user(&message) else {
        return Ok(());
    };
    start_new_chat(&bot, &state, user, message.chat.id).await
}

pub async fn cancel_handler(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user) = message_user(&message) else {
        return Ok(());
    };
    cancel_flow(&bot, &state, user, message.chat.id).await
}
