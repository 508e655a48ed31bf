//! Plain text and photo messages. Everything goes through the tracker first;
//! only messages nobody is waiting for fall through to the untracked path.
//!
//! Tracker work happens inline in the dispatcher endpoint so a user's
//! updates resolve in the order they arrived. Only external calls detach.

use anyhow::Result;
use teloxide::prelude::*;

use crate::config::CONFIG;
use crate::handlers::access::command_allowed;
use crate::handlers::actions::{start_action, FlowAction};
use crate::handlers::flows::{main_menu_keyboard, mismatch_prompt, rejection_prompt};
use crate::handlers::media::{image_handle, message_image_file};
use crate::handlers::responses::{send_prompt, send_reply};
use crate::session::{Event, FlowContext, ImageHandle, Mode, Outcome, RejectReason};
use crate::state::AppState;
use crate::utils::telegram::message_user;

const GUIDANCE_TEXT: &str =
    "I'm not waiting for anything from you. Pick an action below or see /help.";

/// What to do with a message once the tracker has seen it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// A pending flow got its input. `mode` and `context` are kept so the
    /// flow can be put back if the user is rate limited.
    Flow {
        mode: Mode,
        context: FlowContext,
        action: FlowAction,
    },
    /// Nothing was pending; the message is a fresh chat prompt.
    Chat(FlowAction),
    Reprompt(Mode),
    Reject(RejectReason),
    Guidance,
    Ignore,
}

/// How untracked messages are treated in the chat they arrived in.
#[derive(Debug, Clone, Copy)]
pub struct UntrackedPolicy {
    pub is_private: bool,
    pub as_chat: bool,
    pub chat_allowed: bool,
}

/// Image first, then text. Captions ride along with the image and are read
/// back from the message.
fn event_from_parts(image: Option<ImageHandle>, text: Option<&str>) -> Option<Event> {
    if let Some(image) = image {
        return Some(Event::Image(image));
    }
    let text = text?;
    // Unknown commands never feed a pending flow.
    if text.trim_start().starts_with('/') {
        return None;
    }
    Some(Event::Text(text.to_string()))
}

pub fn message_event(message: &Message) -> Option<Event> {
    let image = message_image_file(message).map(|file| image_handle(&file));
    event_from_parts(image, message.text())
}

fn chat_action(event: Event, caption: Option<&str>) -> Option<FlowAction> {
    match event {
        Event::Text(prompt) => Some(FlowAction::Chat {
            prompt,
            image: None,
        }),
        Event::Image(image) => Some(FlowAction::Chat {
            prompt: caption.unwrap_or_default().to_string(),
            image: Some(image),
        }),
        Event::Button(_) => None,
    }
}

fn flow_action(
    mode: Mode,
    context: &FlowContext,
    event: Event,
    caption: Option<&str>,
) -> Option<FlowAction> {
    match (mode, event) {
        (Mode::AwaitingResetTarget, Event::Text(target)) => {
            Some(FlowAction::Reset(target.trim().to_string()))
        }
        (Mode::AwaitingOcrImage, Event::Image(image)) => Some(FlowAction::Ocr {
            context: context.clone(),
            image,
        }),
        (Mode::AwaitingChatReply, event) => chat_action(event, caption),
        _ => None,
    }
}

/// `outcome` is `None` when the user's pending flow belongs to another chat;
/// the message is then treated as untracked.
pub fn route(
    outcome: Option<Outcome>,
    event: Event,
    caption: Option<&str>,
    policy: UntrackedPolicy,
) -> Route {
    match outcome {
        Some(Outcome::Consumed(mode, context)) => {
            match flow_action(mode, &context, event, caption) {
                Some(action) => Route::Flow {
                    mode,
                    context,
                    action,
                },
                None => Route::Ignore,
            }
        }
        Some(Outcome::Mismatch(mode)) => Route::Reprompt(mode),
        Some(Outcome::Rejected(reason)) => Route::Reject(reason),
        Some(Outcome::NotPending) | None => {
            // Group chatter is not addressed to the bot.
            if !policy.is_private {
                return Route::Ignore;
            }
            if !policy.as_chat || !policy.chat_allowed {
                return Route::Guidance;
            }
            chat_action(event, caption)
                .map(Route::Chat)
                .unwrap_or(Route::Ignore)
        }
    }
}

pub async fn handle_message(bot: Bot, state: AppState, message: Message) -> Result<()> {
    let Some(user) = message_user(&message) else {
        return Ok(());
    };
    let Some(event) = message_event(&message) else {
        return Ok(());
    };

    let outcome = state
        .tracker
        .resolve_in_chat(user, message.chat.id.0, &event);
    let policy = UntrackedPolicy {
        is_private: message.chat.is_private(),
        as_chat: CONFIG.untracked_text_as_chat,
        chat_allowed: command_allowed("chat", Some(user), message.chat.id),
    };

    match route(outcome, event, message.caption(), policy) {
        Route::Flow {
            mode,
            context,
            action,
        } => start_action(bot, state, message, user, action, Some((mode, context))).await,
        Route::Chat(action) => start_action(bot, state, message, user, action, None).await,
        Route::Reprompt(mode) => send_reply(&bot, &message, &mismatch_prompt(mode)).await,
        Route::Reject(reason) => send_reply(&bot, &message, &rejection_prompt(reason)).await,
        Route::Guidance => {
            send_prompt(
                &bot,
                message.chat.id,
                Some(message.id),
                GUIDANCE_TEXT,
                &main_menu_keyboard(CONFIG.reset_enabled()),
            )
            .await?;
            Ok(())
        }
        Route::Ignore => Ok(()),
    }
}
