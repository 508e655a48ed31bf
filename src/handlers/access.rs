use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use teloxide::prelude::*;
use teloxide::types::ReplyParameters;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::session::UserId;
use crate::utils::telegram::message_user;

pub const ACCESS_DENIED_TEXT: &str =
    "You are not authorized to use this command. Please contact the administrator.";

static RATE_LIMITER: Lazy<RateLimiter> =
    Lazy::new(|| RateLimiter::new(Duration::from_secs(CONFIG.rate_limit_seconds)));
static WHITELIST: Lazy<Option<Vec<String>>> = Lazy::new(load_whitelist);

/// Minimum spacing between external actions of one user.
pub struct RateLimiter {
    interval: Duration,
    last_seen: Mutex<HashMap<UserId, Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records the action at `now` unless the user is still cooling down, in
    /// which case the remaining wait is returned.
    pub fn check_at(&self, user: UserId, now: Instant) -> Result<(), Duration> {
        if self.interval.is_zero() {
            return Ok(());
        }
        let mut last_seen = self.last_seen.lock();
        if let Some(last) = last_seen.get(&user) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.interval {
                return Err(self.interval - elapsed);
            }
        }
        last_seen.insert(user, now);
        Ok(())
    }
}

pub fn rate_limiter() -> &'static RateLimiter {
    &RATE_LIMITER
}

fn parse_whitelist(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn load_whitelist() -> Option<Vec<String>> {
    let path = &CONFIG.whitelist_file_path;
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let ids = parse_whitelist(&content);
            info!("Loaded {} whitelist entries from {}", ids.len(), path);
            Some(ids)
        }
        Err(err) => {
            warn!("Whitelist file {} not available ({}); access is open", path, err);
            None
        }
    }
}

fn is_allowed(whitelist: Option<&[String]>, user_id: Option<i64>, chat_id: i64) -> bool {
    let Some(list) = whitelist else {
        return true;
    };
    let chat_id = chat_id.to_string();
    let user_id = user_id.map(|id| id.to_string());
    list.iter()
        .any(|entry| *entry == chat_id || Some(entry) == user_id.as_ref())
}

pub fn requires_access_control(command: &str) -> bool {
    CONFIG
        .access_controlled_commands
        .iter()
        .any(|entry| entry == command)
}

/// Whitelist check without a message, for menu buttons.
pub fn command_allowed(command: &str, user: Option<UserId>, chat_id: ChatId) -> bool {
    !requires_access_control(command)
        || is_allowed(WHITELIST.as_deref(), user.map(|user| user.0), chat_id.0)
}

pub async fn check_access_control(bot: &Bot, message: &Message, command: &str) -> bool {
    if command_allowed(command, message_user(message), message.chat.id) {
        return true;
    }

    let _ = bot
        .send_message(message.chat.id, ACCESS_DENIED_TEXT)
        .reply_parameters(ReplyParameters::new(message.id))
        .await;
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_action_inside_interval_is_limited() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let user = UserId(1);
        let start = Instant::now();

        assert!(limiter.check_at(user, start).is_ok());
        let wait = limiter
            .check_at(user, start + Duration::from_secs(4))
            .expect_err("still cooling down");
        assert_eq!(wait, Duration::from_secs(6));
        assert!(limiter.check_at(UserId(2), start).is_ok());
        assert!(limiter.check_at(user, start + Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn zero_interval_never_limits() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let now = Instant::now();
        assert!(limiter.check_at(UserId(1), now).is_ok());
        assert!(limiter.check_at(UserId(1), now).is_ok());
    }

    #[test]
    fn whitelist_skips_comments_and_blanks() {
        let ids = parse_whitelist("# admins\n12345\n\n  -100777  \n");
        assert_eq!(ids, vec!["12345".to_string(), "-100777".to_string()]);
    }

    #[test]
    fn whitelist_matches_user_or_chat() {
        let list = vec!["12345".to_string(), "-100777".to_string()];
        assert!(is_allowed(None, None, 1));
        assert!(is_allowed(Some(&list), Some(12345), 1));
        assert!(is_allowed(Some(&list), Some(9), -100777));
        assert!(!is_allowed(Some(&list), Some(9), 1));
        assert!(!is_allowed(Some(&list), None, 1));
    }
}
