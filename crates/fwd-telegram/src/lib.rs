//! Telegram adapter (teloxide).
//!
//! This crate implements the `fwd-core` Transport port over the Telegram Bot API
//! and turns bot updates into inbound message events.

use std::sync::Arc;

use async_trait::async_trait;

use teloxide::{prelude::*, ApiError, RequestError};

pub mod activity;
pub mod handlers;
pub mod router;
pub mod seen;

use fwd_core::{
    domain::{ChatId, HistoryMessage, MessageId, OutboundMessage, TopicId},
    errors::TransportError,
    ports::{MessageIter, Transport, TransportResult, VecMessageIter},
};

use crate::seen::SeenIndex;

/// Delivers through the Bot API.
///
/// Flood waits are reported back as `TransportError::FloodWait`; retrying is the
/// engine's job.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
    seen: Arc<SeenIndex>,
}

impl TelegramTransport {
    pub fn new(bot: Bot, seen: Arc<SeenIndex>) -> Self {
        Self { bot, seen }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: RequestError) -> TransportError {
        match e {
            RequestError::RetryAfter(d) => TransportError::FloodWait(d),
            RequestError::Network(e) => TransportError::Network(e.to_string()),
            RequestError::Api(api) => match api {
                ApiError::BotBlocked | ApiError::BotKicked => {
                    TransportError::Forbidden(api.to_string())
                }
                ApiError::ChatNotFound | ApiError::MessageToDeleteNotFound => {
                    TransportError::NotFound(api.to_string())
                }
                other => TransportError::Other(other.to_string()),
            },
            other => TransportError::Other(format!("telegram error: {other}")),
        }
    }

    fn remember_sent(&self, target: ChatId, sent: &Message) {
        self.seen.record(
            target,
            HistoryMessage {
                message_id: MessageId(sent.id.0),
                is_forward: true,
            },
        );
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn forward(&self, target: ChatId, msg: &OutboundMessage) -> TransportResult<()> {
        let to = Self::tg_chat(target);
        let sent = match &msg.text {
            None => {
                self.bot
                    .forward_message(
                        to,
                        Self::tg_chat(msg.origin.chat_id),
                        Self::tg_msg_id(msg.origin.message_id),
                    )
                    .await
            }
            Some(text) => self.bot.send_message(to, text.clone()).await,
        }
        .map_err(Self::map_err)?;

        self.remember_sent(target, &sent);
        Ok(())
    }

    async fn send_topic(
        &self,
        target: ChatId,
        topic: TopicId,
        msg: &OutboundMessage,
    ) -> TransportResult<()> {
        let to = Self::tg_chat(target);
        let sent = match &msg.text {
            None => {
                self.bot
                    .forward_message(
                        to,
                        Self::tg_chat(msg.origin.chat_id),
                        Self::tg_msg_id(msg.origin.message_id),
                    )
                    .message_thread_id(topic.0)
                    .await
            }
            Some(text) => {
                self.bot
                    .send_message(to, text.clone())
                    .message_thread_id(topic.0)
                    .await
            }
        }
        .map_err(Self::map_err)?;

        self.remember_sent(target, &sent);
        Ok(())
    }

    async fn delete_message(&self, group: ChatId, message_id: MessageId) -> TransportResult<()> {
        self.bot
            .delete_message(Self::tg_chat(group), Self::tg_msg_id(message_id))
            .await
            .map_err(Self::map_err)?;
        self.seen.forget(group, message_id);
        Ok(())
    }

    async fn iter_messages(&self, group: ChatId) -> TransportResult<Box<dyn MessageIter>> {
        Ok(Box::new(VecMessageIter::new(self.seen.snapshot(group))))
    }
}
