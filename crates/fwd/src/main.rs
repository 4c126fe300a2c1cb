use std::sync::Arc;

use teloxide::Bot;
use tokio::sync::mpsc;
use tracing::info;

use fwd_core::{
    config::Config, engine::ForwardingEngine, ports::ChannelSink, store::StateDir, Error,
};
use fwd_telegram::{
    activity::ActivityFeed, router::AppState, seen::SeenIndex, TelegramTransport,
};

const EVENT_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Error> {
    fwd_core::logging::init("fwd")?;

    let cfg = Arc::new(Config::load()?);
    let state_dir = Arc::new(StateDir::open(&cfg.state_dir)?);

    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let seen = Arc::new(SeenIndex::new(cfg.seen_per_chat));
    let transport = Arc::new(TelegramTransport::new(bot.clone(), seen.clone()));
    let (sink, sink_rx) = ChannelSink::new(cfg.sink_buffer);

    let engine = ForwardingEngine::restore(
        state_dir,
        cfg.history_view_limit,
        transport,
        Arc::new(sink),
        Vec::new(),
    )
    .await?;

    let activity = Arc::new(ActivityFeed::default());
    tokio::spawn({
        let activity = activity.clone();
        async move { activity.run(sink_rx).await }
    });

    let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
    let feed = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(events_rx).await }
    });

    tokio::spawn({
        let engine = engine.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
                engine.shutdown();
            }
        }
    });

    let app = Arc::new(AppState {
        cfg,
        engine: engine.clone(),
        seen,
        activity,
        events: events_tx,
    });

    fwd_telegram::router::run_polling(bot, app)
        .await
        .map_err(|e| Error::External(format!("telegram bot failed: {e}")))?;

    engine.shutdown();
    feed.await
        .map_err(|e| Error::External(format!("engine task failed: {e}")))??;

    info!("state saved; bye");
    Ok(())
}
