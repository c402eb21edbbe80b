use crate::{ScorePayload, SignalFeed};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};

const BACKOFF_START_SECS: f64 = 2.0;
const BACKOFF_CAP_SECS: f64 = 60.0;
const BACKOFF_FACTOR: f64 = 1.8;

/// Push path: a Centrifugo-style WebSocket subscription. Connects, sends a
/// connect frame, replies to pings with pongs, and upserts publication
/// deltas. Reconnects with exponential backoff (2s, capped at 60s, factor
/// 1.8) that resets to the floor on every successful (re)connection.
pub async fn run(feed: Arc<SignalFeed>) {
    let mut backoff = BACKOFF_START_SECS;
    loop {
        match connect_and_stream(&feed).await {
            Ok(()) => {
                tracing::info!("signal push connection closed gracefully");
            }
            Err(e) => {
                tracing::warn!("signal push error: {}, reconnecting in {:.1}s", e, backoff);
                feed.set_push_ok(false);
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                backoff = (backoff * BACKOFF_FACTOR).min(BACKOFF_CAP_SECS);
                continue;
            }
        }
        backoff = BACKOFF_START_SECS;
    }
}

async fn connect_and_stream(feed: &Arc<SignalFeed>) -> anyhow::Result<()> {
    let url = feed
        .ws_url
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("no push url configured"))?;
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    let connect_frame = serde_json::json!({
        "id": 1,
        "connect": {
            "token": feed.ws_token.clone().unwrap_or_default(),
            "name": "decision-engine",
        }
    });
    write.send(Message::Text(connect_frame.to_string())).await?;
    feed.set_push_ok(true);
    tracing::info!("signal push connected");

    loop {
        let msg = read.next().await;
        match msg {
            Some(Ok(Message::Text(text))) => handle_frame(feed, &mut write, &text).await?,
            Some(Ok(Message::Ping(data))) => {
                write.send(Message::Pong(data)).await?;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Ok(());
            }
            Some(Err(e)) => return Err(e.into()),
            _ => {}
        }
    }
}

async fn handle_frame(
    feed: &Arc<SignalFeed>,
    write: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
              + Unpin),
    text: &str,
) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    if let Some(id) = value.get("ping").map(|_| value.get("id")).flatten() {
        let pong = serde_json::json!({"id": id, "pong": {}});
        write.send(Message::Text(pong.to_string())).await?;
        return Ok(());
    }

    let push = value.get("push");
    let publication = push.and_then(|p| p.get("pub").or_else(|| p.get("publication")));
    if let Some(data) = publication.and_then(|p| p.get("data")) {
        if let Ok(payload) = serde_json::from_value::<ScorePayload>(data.clone()) {
            feed.upsert(&payload);
        }
    }
    Ok(())
}
