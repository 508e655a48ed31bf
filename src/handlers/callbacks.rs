use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::MessageId;
use tracing::debug;

use crate::handlers::access::{command_allowed, ACCESS_DENIED_TEXT};
use crate::handlers::flows::{cancel_flow, mismatch_prompt, start_flow, start_new_chat, MenuAction};
use crate::handlers::responses::send_notice;
use crate::session::{Event, FlowContext, Mode, Outcome};
use crate::state::AppState;
use crate::utils::telegram::session_user;

pub async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> Result<()> {
    let _ = bot.answer_callback_query(query.id.clone()).await;

    let Some(data) = query.data.as_deref() else {
        return Ok(());
    };
    let Some(user) = session_user(&query.from) else {
        return Ok(());
    };
    // Inaccessible or missing source messages fall back to the private chat.
    let (chat_id, reply_to): (ChatId, Option<MessageId>) = match &query.message {
        Some(message) => (message.chat().id, Some(message.id())),
        None => (ChatId(user.0), None),
    };

    let Some(action) = MenuAction::from_callback_data(data) else {
        let event = Event::Button(data.to_string());
        let outcome = match &query.message {
            Some(_) => state.tracker.resolve_in_chat(user, chat_id.0, &event),
            None => Some(state.tracker.resolve(user, &event)),
        };
        match outcome {
            Some(Outcome::Mismatch(mode)) => {
                send_notice(&bot, chat_id, &mismatch_prompt(mode)).await?;
            }
            outcome => debug!(
                "Ignoring button {:?} for user {}: {}",
                data,
                user,
                outcome.as_ref().map(Outcome::label).unwrap_or("other_chat")
            ),
        }
        return Ok(());
    };

    if !command_allowed(action.tag(), Some(user), chat_id) {
        send_notice(&bot, chat_id, ACCESS_DENIED_TEXT).await?;
        return Ok(());
    }

    let mode = match action {
        MenuAction::Cancel => return cancel_flow(&bot, &state, user, chat_id).await,
        MenuAction::NewChat => return start_new_chat(&bot, &state, user, chat_id).await,
        MenuAction::Reset => Mode::AwaitingResetTarget,
        MenuAction::Ocr => Mode::AwaitingOcrImage,
        MenuAction::Chat => Mode::AwaitingChatReply,
    };
    start_flow(
        &bot,
        &state,
        user,
        chat_id,
        reply_to,
        mode,
        FlowContext::for_chat(chat_id.0),
    )
    .await
}
