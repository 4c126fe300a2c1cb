//! Telegram update handlers.
//!
//! Group and channel traffic feeds the engine; private chats carry the admin
//! commands.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use fwd_core::domain::UserId;

use crate::router::AppState;

mod commands;

pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    state.observe(&msg).await;
    Ok(())
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if !msg.chat.is_private() {
        state.observe(&msg).await;
        return Ok(());
    }

    let sender = msg.from().map(|u| UserId(u.id.0 as i64));
    if !state.cfg.is_admin(sender) {
        let _ = bot
            .send_message(
                msg.chat.id,
                "Unauthorized. Contact the bot owner for access.",
            )
            .await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
    }

    let _ = bot
        .send_message(msg.chat.id, "Send /help for the list of commands.")
        .await;
    Ok(())
}
