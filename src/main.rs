use std::error::Error;
use std::net::SocketAddr;

use dotenvy::dotenv;
use teloxide::dispatching::UpdateFilterExt;
use teloxide::prelude::*;
use teloxide::update_listeners::webhooks;
use teloxide::utils::command::BotCommands;
use tracing::{error, info};

mod config;
mod handlers;
mod llm;
mod reset;
mod session;
mod state;
mod utils;

use config::CONFIG;
use handlers::commands::{self, optional_arg};
use handlers::{callbacks, messages};
use state::AppState;
use utils::logging::init_logging;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    Start,
    Help,
    Ocr(String),
    Reset,
    Chat(String),
    Newchat,
    Cancel,
}

type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> HandlerResult {
    dotenv().ok();
    let _guards = init_logging();

    if CONFIG.bot_token.trim().is_empty() {
        return Err("BOT_TOKEN is required".into());
    }

    let bot = Bot::new(CONFIG.bot_token.clone());
    info!(
        "Starting {} v{} (model {}, reset {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        CONFIG.gemini_model,
        if CONFIG.reset_enabled() { "enabled" } else { "disabled" }
    );

    let state = AppState::new(CONFIG.session_shards);

    let command_handler = dptree::entry()
        .filter_command::<Command>()
        .endpoint(handle_command);

    let message_handler = Update::filter_message()
        .branch(command_handler)
        .branch(
            dptree::filter(|msg: Message| {
                msg.text().is_some() || msg.photo().is_some() || msg.document().is_some()
            })
            .endpoint(handle_message),
        )
        .endpoint(ignore_message);

    let callback_handler = Update::filter_callback_query().endpoint(handle_callback_query);

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build();

    match CONFIG.webhook.as_ref() {
        Some(webhook) => {
            let address = SocketAddr::from(([0, 0, 0, 0], webhook.port));
            info!("Listening for webhook updates on {} ({})", address, webhook.url);
            let options = webhooks::Options::new(address, webhook.url.clone());
            let listener = webhooks::axum(bot, options).await?;
            dispatcher
                .dispatch_with_listener(
                    listener,
                    LoggingErrorHandler::with_custom_text("An error from the update listener"),
                )
                .await;
        }
        None => {
            info!("Polling for updates");
            dispatcher.dispatch().await;
        }
    }

    Ok(())
}

/// Handlers settle tracker state inline so one user's updates resolve in
/// arrival order; Gemini and reset calls are detached inside them.
async fn handle_command(
    bot: Bot,
    state: AppState,
    message: Message,
    command: Command,
) -> HandlerResult {
    match command {
        Command::Start => commands::start_handler(bot, message).await?,
        Command::Help => commands::help_handler(bot, message).await?,
        Command::Ocr(arg) => {
            commands::ocr_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::Reset => commands::reset_handler(bot, state, message).await?,
        Command::Chat(arg) => {
            commands::chat_handler(bot, state, message, optional_arg(arg)).await?
        }
        Command::Newchat => commands::newchat_handler(bot, state, message).await?,
        Command::Cancel => commands::cancel_handler(bot, state, message).await?,
    }
    Ok(())
}

async fn handle_message(bot: Bot, state: AppState, message: Message) -> HandlerResult {
    if let Err(err) = messages::handle_message(bot, state, message).await {
        error!("message handler failed: {err}");
    }
    Ok(())
}

async fn handle_callback_query(bot: Bot, state: AppState, query: CallbackQuery) -> HandlerResult {
    if let Err(err) = callbacks::handle_callback_query(bot, state, query).await {
        error!("callback handler failed: {err}");
    }
    Ok(())
}

async fn ignore_message(_message: Message) -> HandlerResult {
    Ok(())
}
