//! Starting, prompting for and cancelling flows. Commands and menu buttons
//! both land here so each flow has a single entry point.

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup, MessageId};
use tracing::info;

use crate::config::CONFIG;
use crate::handlers::responses::{send_notice, send_prompt};
use crate::session::{FlowContext, Mode, RejectReason, UserId};
use crate::state::AppState;

pub const FLOW_CALLBACK_PREFIX: &str = "flow:";

/// Inline menu actions, carried as `flow:<tag>` callback data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Reset,
    Ocr,
    Chat,
    NewChat,
    Cancel,
}

impl MenuAction {
    pub fn tag(self) -> &'static str {
        match self {
            MenuAction::Reset => "reset",
            MenuAction::Ocr => "ocr",
            MenuAction::Chat => "chat",
            MenuAction::NewChat => "newchat",
            MenuAction::Cancel => "cancel",
        }
    }

    pub fn callback_data(self) -> String {
        format!("{FLOW_CALLBACK_PREFIX}{}", self.tag())
    }

    pub fn from_callback_data(data: &str) -> Option<Self> {
        match data.strip_prefix(FLOW_CALLBACK_PREFIX)? {
            "reset" => Some(MenuAction::Reset),
            "ocr" => Some(MenuAction::Ocr),
            "chat" => Some(MenuAction::Chat),
            "newchat" => Some(MenuAction::NewChat),
            "cancel" => Some(MenuAction::Cancel),
            _ => None,
        }
    }
}

fn button(label: &str, action: MenuAction) -> InlineKeyboardButton {
    InlineKeyboardButton::callback(label.to_string(), action.callback_data())
}

pub fn main_menu_keyboard(reset_enabled: bool) -> InlineKeyboardMarkup {
    let mut first_row = vec![button("💬 Ask", MenuAction::Chat), button("🖼 OCR", MenuAction::Ocr)];
    if reset_enabled {
        first_row.push(button("🔐 Reset", MenuAction::Reset));
    }
    InlineKeyboardMarkup::new(vec![first_row, vec![button("🆕 New chat", MenuAction::NewChat)]])
}

pub fn cancel_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(vec![vec![button("✖ Cancel", MenuAction::Cancel)]])
}

pub fn flow_prompt(mode: Mode, context: &FlowContext) -> String {
    match mode {
        Mode::Idle => "Nothing is pending.".to_string(),
        Mode::AwaitingResetTarget => {
            "Send the username or email address of the account to reset.".to_string()
        }
        Mode::AwaitingOcrImage => match context.instruction.as_deref() {
            Some(instruction) => format!(
                "Send the photo to read. I will extract its text and then: {instruction}"
            ),
            None => "Send the photo you want me to read the text from.".to_string(),
        },
        Mode::AwaitingChatReply => "What would you like to ask? You can also send a photo.".to_string(),
    }
}

/// Re-prompt used when the user sent the wrong kind of input.
pub fn mismatch_prompt(mode: Mode) -> String {
    format!(
        "I'm waiting for {}. Send it now, or /cancel to stop.",
        mode.expected_input()
    )
}

pub fn rejection_prompt(reason: RejectReason) -> String {
    format!("Please send a valid username or email address ({reason}). Or /cancel to stop.")
}

pub async fn start_flow(
    bot: &Bot,
    state: &AppState,
    user: UserId,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
    mode: Mode,
    context: FlowContext,
) -> Result<()> {
    if mode == Mode::AwaitingResetTarget && !CONFIG.reset_enabled() {
        send_notice(bot, chat_id, "Account reset is not available on this bot.").await?;
        return Ok(());
    }

    let prompt = flow_prompt(mode, &context);
    if state.tracker.is_pending(user) {
        info!("User {} replaced a pending flow", user);
    }
    state.tracker.begin(user, mode, context);
    info!("User {} started flow {}", user, mode.label());
    send_prompt(bot, chat_id, reply_to, &prompt, &cancel_keyboard()).await?;
    Ok(())
}

pub async fn cancel_flow(bot: &Bot, state: &AppState, user: UserId, chat_id: ChatId) -> Result<()> {
    let cancelled = state.tracker.pending_mode(user);
    state.tracker.cancel(user);
    let text = if cancelled == Mode::Idle {
        "There is nothing to cancel."
    } else {
        info!("User {} cancelled flow {}", user, cancelled.label());
        "Cancelled."
    };
    send_notice(bot, chat_id, text).await
}

pub async fn start_new_chat(bot: &Bot, state: &AppState, user: UserId, chat_id: ChatId) -> Result<()> {
    state.tracker.cancel(user);
    let removed = state.history.clear(user);
    info!("User {} started a new chat, dropped {} turns", user, removed);
    send_notice(
        bot,
        chat_id,
        "Started a new conversation. Previous messages are forgotten.",
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_data_round_trips_for_every_action() {
        for action in [
            MenuAction::Reset,
            MenuAction::Ocr,
            MenuAction::Chat,
            MenuAction::NewChat,
            MenuAction::Cancel,
        ] {
            assert_eq!(
                MenuAction::from_callback_data(&action.callback_data()),
                Some(action)
            );
        }
    }

    #[test]
    fn unknown_callback_data_is_not_a_menu_action() {
        assert_eq!(MenuAction::from_callback_data("flow:dance"), None);
        assert_eq!(MenuAction::from_callback_data("reset"), None);
        assert_eq!(MenuAction::from_callback_data(""), None);
    }

    #[test]
    fn menu_hides_reset_when_disabled() {
        let with_reset = main_menu_keyboard(true);
        let without_reset = main_menu_keyboard(false);
        assert_eq!(with_reset.inline_keyboard[0].len(), 3);
        assert_eq!(without_reset.inline_keyboard[0].len(), 2);
        assert_eq!(without_reset.inline_keyboard.len(), 2);
    }

    #[test]
    fn ocr_prompt_mentions_instruction() {
        let context = FlowContext::for_chat(1).with_instruction(Some("sum the prices".into()));
        let prompt = flow_prompt(Mode::AwaitingOcrImage, &context);
        assert!(prompt.contains("sum the prices"));
    }

    #[test]
    fn reprompts_name_the_expected_input() {
        assert!(mismatch_prompt(Mode::AwaitingOcrImage).contains("a photo"));
        assert!(rejection_prompt(RejectReason::TooShort).contains("too short"));
    }
}
