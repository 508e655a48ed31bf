use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::session::UserId;

const CHAT_ACTION_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Repeats a chat action ("typing", "upload_photo") until dropped.
pub struct ChatActionHeartbeat {
    task_handle: Option<JoinHandle<()>>,
}

impl Drop for ChatActionHeartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

pub fn start_chat_action_heartbeat(
    bot: Bot,
    chat_id: ChatId,
    action: ChatAction,
) -> ChatActionHeartbeat {
    let task_handle = tokio::spawn(async move {
        loop {
            if let Err(err) = bot.send_chat_action(chat_id, action.clone()).await {
                warn!("send_chat_action failed: {err}");
            }
            tokio::time::sleep(CHAT_ACTION_HEARTBEAT_INTERVAL).await;
        }
    });

    ChatActionHeartbeat {
        task_handle: Some(task_handle),
    }
}

pub fn session_user(user: &teloxide::types::User) -> Option<UserId> {
    i64::try_from(user.id.0).ok().map(UserId)
}

/// Sender of a message. Channel posts and anonymous admins have none.
pub fn message_user(message: &Message) -> Option<UserId> {
    message.from.as_ref().and_then(session_user)
}

pub fn display_name(user: Option<&teloxide::types::User>) -> String {
    let Some(user) = user else {
        return "Anonymous".to_string();
    };
    let full_name = user.full_name();
    if !full_name.trim().is_empty() {
        full_name
    } else if let Some(username) = &user.username {
        username.clone()
    } else {
        "Anonymous".to_string()
    }
}
