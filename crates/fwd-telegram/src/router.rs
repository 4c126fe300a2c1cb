use std::{sync::Arc, time::Duration};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tokio::sync::mpsc;
use tracing::{info, warn};

use fwd_core::{
    config::Config,
    domain::{ChatId, HistoryMessage, InboundMessage, MediaKind, MessageId, UserId},
    engine::ForwardingEngine,
};

use crate::{activity::ActivityFeed, handlers, seen::SeenIndex};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub engine: ForwardingEngine,
    pub seen: Arc<SeenIndex>,
    pub activity: Arc<ActivityFeed>,
    pub events: mpsc::Sender<InboundMessage>,
}

impl AppState {
    /// Index a chat message and hand it to the engine.
    pub async fn observe(&self, msg: &Message) {
        let inbound = inbound_from(msg);
        self.seen.record(
            inbound.source,
            HistoryMessage {
                message_id: inbound.message_id,
                is_forward: msg.forward().is_some(),
            },
        );
        if self.events.send(inbound).await.is_err() {
            warn!("engine feed closed; dropping inbound message");
        }
    }
}

pub fn inbound_from(msg: &Message) -> InboundMessage {
    InboundMessage {
        source: ChatId(msg.chat.id.0),
        sender: msg.from().map(|u| UserId(u.id.0 as i64)),
        message_id: MessageId(msg.id.0),
        text: msg
            .text()
            .or_else(|| msg.caption())
            .unwrap_or_default()
            .to_string(),
        media: media_kind(msg),
    }
}

fn media_kind(msg: &Message) -> Option<MediaKind> {
    if msg.photo().is_some() {
        Some(MediaKind::Photo)
    } else if msg.video().is_some() {
        Some(MediaKind::Video)
    } else if msg.document().is_some() {
        Some(MediaKind::Document)
    } else if msg.audio().is_some() {
        Some(MediaKind::Audio)
    } else if msg.voice().is_some() {
        Some(MediaKind::Voice)
    } else if msg.sticker().is_some() {
        Some(MediaKind::Sticker)
    } else if msg.text().is_none() {
        Some(MediaKind::Other)
    } else {
        None
    }
}

/// Poll Telegram until the engine shuts down.
pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => info!("forwarder started: @{}", me.username()),
        Err(e) => warn!("get_me failed: {e}"),
    }
    info!(
        admins = state.cfg.telegram_allowed_users.len(),
        rules = state.engine.routes().rules().await.len(),
        "state dir: {}",
        state.cfg.state_dir.display()
    );

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handlers::handle_message))
        .branch(Update::filter_channel_post().endpoint(handlers::handle_channel_post));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state.clone()])
        .build();

    let token = dispatcher.shutdown_token();
    let engine = state.engine.clone();
    tokio::spawn(async move {
        engine.closed().await;
        // Errors while the dispatcher is still starting up; try again.
        loop {
            match token.shutdown() {
                Ok(done) => {
                    done.await;
                    break;
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    });

    dispatcher.dispatch().await;
    info!("telegram polling stopped");
    Ok(())
}
