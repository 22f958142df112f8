use anyhow::Result;
use ferry_db::models::user::User;
use ferry_db::repositories::user_repo::UserRepository;
use teloxide::{
    dptree,
    prelude::*,
    types::{ChatKind, ParseMode},
};
use tracing::{error, info};

use crate::AppState;
use crate::services::notification_service::escape_html;
use crate::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Bind(Option<String>),
    Unbind,
    Traffic,
}

/// Parses `/command@botname argument` messages.
pub fn parse_command(text: &str) -> Option<BotCommand> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let head = parts.next()?;
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let name = head.strip_prefix('/')?.split('@').next()?;
    match name.to_ascii_lowercase().as_str() {
        "bind" => Some(BotCommand::Bind(arg.map(str::to_string))),
        "unbind" => Some(BotCommand::Unbind),
        "traffic" => Some(BotCommand::Traffic),
        _ => None,
    }
}

/// Accepts a subscription link or a bare token.
pub fn extract_token(arg: &str) -> Option<String> {
    let arg = arg.trim();
    if arg.contains("://") {
        let url = url::Url::parse(arg).ok()?;
        return url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .filter(|t| !t.is_empty());
    }
    (!arg.is_empty()).then(|| arg.to_string())
}

pub fn traffic_report(user: &User) -> String {
    format!(
        "🚥 <b>Traffic</b>\n———————————————\nPlan traffic: <code>{}</code>\nUploaded: <code>{}</code>\nDownloaded: <code>{}</code>\nRemaining: <code>{}</code>",
        utils::format_bytes_str(user.transfer_enable.max(0) as u64),
        utils::format_bytes_str(user.u.max(0) as u64),
        utils::format_bytes_str(user.d.max(0) as u64),
        utils::format_bytes_str(user.remaining_traffic() as u64),
    )
}

async fn reply(users: &UserRepository, chat_id: i64, private: bool, command: BotCommand) -> Result<String> {
    match command {
        BotCommand::Bind(arg) => {
            if !private {
                return Ok("Please bind your account in a private chat with the bot.".to_string());
            }
            let Some(token) = arg.as_deref().and_then(extract_token) else {
                return Ok("Usage: /bind &lt;subscription link&gt;".to_string());
            };
            let Some(user) = users.get_by_token(&token).await? else {
                return Ok("The subscription link is invalid.".to_string());
            };
            if user.telegram_id.is_some() {
                return Ok("This account is already bound to a Telegram account.".to_string());
            }
            if users.get_by_telegram_id(chat_id).await?.is_some() {
                return Ok("This Telegram account is already bound. Use /unbind first.".to_string());
            }
            users.bind_telegram(user.id, chat_id).await?;
            info!("User {} bound Telegram chat {}", user.id, chat_id);
            Ok(format!("Bound to <b>{}</b>.", escape_html(&user.email)))
        }
        BotCommand::Unbind => {
            if users.unbind_telegram(chat_id).await? {
                Ok("Unbound successfully.".to_string())
            } else {
                Ok("No account is bound, please bind first with /bind.".to_string())
            }
        }
        BotCommand::Traffic => match users.get_by_telegram_id(chat_id).await? {
            Some(user) => Ok(traffic_report(&user)),
            None => Ok("No account is bound, please bind first with /bind.".to_string()),
        },
    }
}

pub async fn run_bot(bot: Bot, state: AppState) {
    info!("Starting Telegram bot dispatcher...");

    let handler = Update::filter_message().endpoint(|bot: Bot, msg: Message, state: AppState| async move {
        let Some(command) = msg.text().and_then(parse_command) else {
            return Ok::<_, teloxide::RequestError>(());
        };
        let private = matches!(msg.chat.kind, ChatKind::Private(_));
        let users = UserRepository::new(state.pool.clone());
        let text = match reply(&users, msg.chat.id.0, private, command).await {
            Ok(text) => text,
            Err(e) => {
                error!("Bot command failed in chat {}: {:#}", msg.chat.id, e);
                "Something went wrong, please try again later.".to_string()
            }
        };
        if let Err(e) = bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html).await {
            error!("Failed to send bot reply: {}", e);
        }
        Ok(())
    });

    Dispatcher::builder(bot, dptree::entry().branch(handler))
        .dependencies(dptree::deps![state])
        .default_handler(|_upd: std::sync::Arc<Update>| async {})
        .build()
        .dispatch()
        .await;

    info!("Telegram bot dispatcher exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_bot_suffix() {
        assert_eq!(parse_command("/traffic"), Some(BotCommand::Traffic));
        assert_eq!(parse_command("/unbind@FerryBot"), Some(BotCommand::Unbind));
        assert_eq!(
            parse_command("/bind  https://x.example/s?token=abc "),
            Some(BotCommand::Bind(Some("https://x.example/s?token=abc".into())))
        );
        assert_eq!(parse_command("/bind"), Some(BotCommand::Bind(None)));
        assert_eq!(parse_command("hello"), None);
        assert_eq!(parse_command("/start"), None);
    }

    #[test]
    fn token_from_link_or_bare() {
        assert_eq!(
            extract_token("https://panel.example/api/v1/client/subscribe?token=abc123&flag=clash"),
            Some("abc123".into())
        );
        assert_eq!(extract_token("abc123"), Some("abc123".into()));
        assert_eq!(extract_token("https://panel.example/api/v1/client/subscribe"), None);
        assert_eq!(extract_token("  "), None);
    }
}
