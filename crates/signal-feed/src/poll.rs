use crate::{ScorePayload, SignalFeed};
use std::sync::Arc;
use std::time::Duration;

/// Periodic fallback path: fetch a full snapshot every `poll_seconds` and
/// upsert it into the shared score map. Never fatal — a failed fetch is
/// logged and retried on the next tick, leaving the map and
/// `last_update_ms` untouched so staleness surfaces naturally.
pub async fn run(feed: Arc<SignalFeed>) {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .expect("failed to build snapshot http client");

    loop {
        match fetch_snapshot(&client, &feed.snapshot_url).await {
            Ok(payload) => feed.upsert(&payload),
            Err(e) => tracing::warn!("signal snapshot fetch failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(feed.poll_seconds)).await;
    }
}

async fn fetch_snapshot(client: &reqwest::Client, url: &str) -> anyhow::Result<ScorePayload> {
    let url = format!("{}/snapshot", url.trim_end_matches('/'));
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        anyhow::bail!("snapshot endpoint returned {}", resp.status());
    }
    Ok(resp.json::<ScorePayload>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_payload_parses_m_key() {
        let raw = serde_json::json!({"e": 7, "t": 123, "m": [["AAA", 80], ["bbb", 40]]});
        let parsed: ScorePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.e, Some(7));
        assert_eq!(parsed.m.len(), 2);
    }

    #[test]
    fn score_payload_parses_d_alias_for_push_deltas() {
        let raw = serde_json::json!({"e": 7, "t": 123, "d": [["CCC", 55]]});
        let parsed: ScorePayload = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.m, vec![("CCC".to_string(), 55)]);
    }
}
