use std::time::{Duration, Instant};

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::ChatAction;
use tracing::{error, info, warn};

use crate::config::CONFIG;
use crate::handlers::access::{rate_limiter, RateLimiter};
use crate::handlers::media::fetch_image;
use crate::handlers::responses::send_reply;
use crate::llm::{extract_text_from_image, generate_chat_reply, GeminiError, InlineImage};
use crate::reset::{request_account_reset, ResetError, ResetReceipt};
use crate::session::{ConversationTracker, FlowContext, ImageHandle, Mode, UserId};
use crate::state::AppState;
use crate::utils::telegram::start_chat_action_heartbeat;
use crate::utils::text::normalize_ocr_text;
use crate::utils::timing::start_command_timer;

const DEFAULT_IMAGE_PROMPT: &str = "Describe this image.";

/// External work a message or command leads to once it has been routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    Reset(String),
    Ocr {
        context: FlowContext,
        image: ImageHandle,
    },
    Chat {
        prompt: String,
        image: Option<ImageHandle>,
    },
}

/// Gate in front of every external call. A consumed flow that hits the
/// limit is put back so the user only has to resend.
pub fn admit_action(
    limiter: &RateLimiter,
    tracker: &ConversationTracker,
    user: UserId,
    now: Instant,
    restore: Option<(Mode, FlowContext)>,
) -> Result<(), Duration> {
    let Err(wait) = limiter.check_at(user, now) else {
        return Ok(());
    };
    if let Some((mode, context)) = restore {
        tracker.begin(user, mode, context);
    }
    info!("User {} rate limited for {:?}", user, wait);
    Err(wait)
}

pub fn rate_limited_text(wait: Duration) -> String {
    format!(
        "You're going too fast. Please wait {} seconds and send it again.",
        wait.as_secs().max(1)
    )
}

/// Applies the rate limit and, when admitted, detaches the action. A
/// limited user gets told how long to wait.
pub async fn start_action(
    bot: Bot,
    state: AppState,
    message: Message,
    user: UserId,
    action: FlowAction,
    restore: Option<(Mode, FlowContext)>,
) -> Result<()> {
    if let Err(wait) = admit_action(rate_limiter(), &state.tracker, user, Instant::now(), restore) {
        return send_reply(&bot, &message, &rate_limited_text(wait)).await;
    }
    spawn_action(bot, state, message, user, action);
    Ok(())
}

/// Detaches the external call. Tracker state must already be settled, so
/// the dispatcher keeps resolving the user's updates in arrival order.
fn spawn_action(bot: Bot, state: AppState, message: Message, user: UserId, action: FlowAction) {
    tokio::spawn(async move {
        if let Err(err) = run_action(&bot, &state, &message, user, action).await {
            error!("flow action failed for user {}: {err}", user);
        }
    });
}

async fn run_action(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    user: UserId,
    action: FlowAction,
) -> Result<()> {
    match action {
        FlowAction::Reset(target) => run_reset(bot, message, &target).await,
        FlowAction::Ocr { context, image } => run_ocr(bot, message, &context, &image).await,
        FlowAction::Chat { prompt, image } => {
            run_chat(bot, state, message, user, &prompt, image.as_ref()).await
        }
    }
}

fn gemini_failure_text(err: &GeminiError) -> &'static str {
    match err {
        GeminiError::MissingApiKey => "The assistant is not configured on this bot.",
        GeminiError::Empty { .. } => "The assistant returned no answer. Try rephrasing.",
        _ => "The assistant is unavailable right now. Please try again later.",
    }
}

fn reset_reply(result: &Result<ResetReceipt, ResetError>) -> String {
    match result {
        Ok(receipt) => match &receipt.message {
            Some(message) => format!("Reset requested for that {}. {message}", receipt.kind.label()),
            None => format!(
                "Reset requested. If that {} exists, a recovery link is on its way.",
                receipt.kind.label()
            ),
        },
        Err(ResetError::Disabled) => "Account reset is not available on this bot.".to_string(),
        Err(ResetError::Refused {
            message: Some(message),
            ..
        }) => format!("The reset was refused: {message}"),
        Err(ResetError::Refused { .. }) => {
            "The reset was refused. Check the username or email and try again.".to_string()
        }
        Err(ResetError::Request(_)) => {
            "Could not reach the recovery service. Please try again later.".to_string()
        }
    }
}

fn ocr_reply(extracted: &str) -> String {
    let normalized = normalize_ocr_text(extracted);
    if normalized.is_empty() {
        "No text found in that image.".to_string()
    } else {
        normalized
    }
}

async fn load_image(bot: &Bot, message: &Message, handle: &ImageHandle) -> Result<Option<InlineImage>> {
    match fetch_image(bot, handle).await {
        Ok(image) => Ok(Some(image)),
        Err(err) => {
            warn!("Image download failed: {err}");
            send_reply(bot, message, "I couldn't download that image. Please send it again.")
                .await?;
            Ok(None)
        }
    }
}

/// One chat exchange. `prompt` may be empty when the user only sent a photo.
async fn run_chat(
    bot: &Bot,
    state: &AppState,
    message: &Message,
    user: UserId,
    prompt: &str,
    image: Option<&ImageHandle>,
) -> Result<()> {
    let mut timer = start_command_timer("chat", message);
    let _typing = start_chat_action_heartbeat(bot.clone(), message.chat.id, ChatAction::Typing);

    let image = match image {
        Some(handle) => match load_image(bot, message, handle).await? {
            Some(image) => Some(image),
            None => {
                timer.complete("error", Some("image_download".to_string()));
                return Ok(());
            }
        },
        None => None,
    };

    let prompt = match prompt.trim() {
        "" if image.is_some() => DEFAULT_IMAGE_PROMPT,
        "" => {
            timer.complete("skipped", Some("empty_prompt".to_string()));
            return Ok(());
        }
        trimmed => trimmed,
    };

    let history = state.history.recent(user, CONFIG.chat_history_turns);
    match generate_chat_reply(&history, prompt, image.as_ref()).await {
        Ok(reply) => {
            state.history.record_exchange(user, prompt, &reply);
            send_reply(bot, message, &reply).await?;
            timer.complete("success", Some(format!("history_turns={}", history.len())));
        }
        Err(err) => {
            error!("Chat reply failed for user {}: {err}", user);
            send_reply(bot, message, gemini_failure_text(&err)).await?;
            timer.complete("error", Some(err.to_string()));
        }
    }
    Ok(())
}

async fn run_ocr(
    bot: &Bot,
    message: &Message,
    context: &FlowContext,
    image: &ImageHandle,
) -> Result<()> {
    let mut timer = start_command_timer("ocr", message);
    let _typing = start_chat_action_heartbeat(bot.clone(), message.chat.id, ChatAction::Typing);

    let Some(image) = load_image(bot, message, image).await? else {
        timer.complete("error", Some("image_download".to_string()));
        return Ok(());
    };

    match extract_text_from_image(&image, context.instruction.as_deref()).await {
        Ok(extracted) => {
            send_reply(bot, message, &ocr_reply(&extracted)).await?;
            timer.complete("success", None);
        }
        Err(GeminiError::Empty { .. }) => {
            send_reply(bot, message, &ocr_reply("")).await?;
            timer.complete("success", Some("empty".to_string()));
        }
        Err(err) => {
            error!("OCR failed: {err}");
            send_reply(bot, message, gemini_failure_text(&err)).await?;
            timer.complete("error", Some(err.to_string()));
        }
    }
    Ok(())
}

/// `target` has already passed `validate_reset_target`.
async fn run_reset(bot: &Bot, message: &Message, target: &str) -> Result<()> {
    let mut timer = start_command_timer("reset", message);
    let _typing = start_chat_action_heartbeat(bot.clone(), message.chat.id, ChatAction::Typing);

    let result = request_account_reset(target.trim()).await;
    send_reply(bot, message, &reset_reply(&result)).await?;
    match result {
        Ok(receipt) => timer.complete("success", Some(format!("kind={}", receipt.kind.label()))),
        Err(err) => timer.complete("error", Some(err.to_string())),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;
    use crate::reset::ResetTargetKind;

    #[test]
    fn rate_limited_flow_is_put_back() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let tracker = ConversationTracker::new();
        let user = UserId(4);
        let now = Instant::now();
        let context = FlowContext::for_chat(4).with_instruction(Some("translate".into()));

        assert!(admit_action(&limiter, &tracker, user, now, None).is_ok());
        assert!(!tracker.is_pending(user));

        let wait = admit_action(
            &limiter,
            &tracker,
            user,
            now + Duration::from_secs(3),
            Some((Mode::AwaitingOcrImage, context.clone())),
        )
        .expect_err("cooling down");
        assert_eq!(wait, Duration::from_secs(7));
        assert_eq!(
            tracker.resolve(user, &crate::session::Event::Image(ImageHandle("f".into()))),
            crate::session::Outcome::Consumed(Mode::AwaitingOcrImage, context)
        );
    }

    #[test]
    fn untracked_action_is_not_restored_when_limited() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let tracker = ConversationTracker::new();
        let user = UserId(5);
        let now = Instant::now();

        assert!(admit_action(&limiter, &tracker, user, now, None).is_ok());
        assert!(admit_action(&limiter, &tracker, user, now, None).is_err());
        assert!(!tracker.is_pending(user));
        assert!(rate_limited_text(Duration::from_millis(200)).contains("wait 1 seconds"));
    }

    #[test]
    fn reset_reply_relays_endpoint_message() {
        let ok = Ok(ResetReceipt {
            kind: ResetTargetKind::Email,
            message: Some("Check your inbox.".to_string()),
        });
        assert!(reset_reply(&ok).ends_with("Check your inbox."));

        let refused = Err(ResetError::Refused {
            status: StatusCode::NOT_FOUND,
            message: Some("Unknown account".to_string()),
        });
        assert_eq!(reset_reply(&refused), "The reset was refused: Unknown account");
    }

    #[test]
    fn reset_reply_without_message_names_target_kind() {
        let ok = Ok(ResetReceipt {
            kind: ResetTargetKind::Username,
            message: None,
        });
        assert!(reset_reply(&ok).contains(ResetTargetKind::Username.label()));
        assert!(reset_reply(&Err(ResetError::Disabled)).contains("not available"));
    }

    #[test]
    fn empty_ocr_result_says_no_text() {
        assert_eq!(ocr_reply("  \n\n "), "No text found in that image.");
        assert_eq!(ocr_reply("Total: 12"), "Total: 12");
    }

    #[test]
    fn missing_api_key_has_its_own_message() {
        assert!(gemini_failure_text(&GeminiError::MissingApiKey).contains("not configured"));
        assert!(gemini_failure_text(&GeminiError::Decode("x".into())).contains("unavailable"));
    }
}
