//! Live Match Watcher
//!
//! Subscribes to one or more matches and logs every change until Ctrl-C.
//! Configuration comes from `LIVE_SYNC_*` variables; log filtering from
//! `RUST_LOG`.
//!
//! ```text
//! live-match-watch <match-id> [<match-id> ...]
//! ```

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use live_match_sync::{
    ClientConfig, LiveMatchClient, MatchCallbacks, MatchId, VERSION,
};

fn watch_callbacks(match_id: MatchId) -> MatchCallbacks {
    MatchCallbacks::new()
        .on_score_update(move |_, state| {
            let map = state.current_map();
            info!(
                match_id,
                series = %format!("{}-{}", state.team1_score, state.team2_score),
                map = map.map(|m| m.map_number),
                map_score = %map.map(|m| format!("{}-{}", m.team1_score, m.team2_score)).unwrap_or_default(),
                "score"
            );
        })
        .on_hero_update(move |delta, _| {
            for change in &delta.changes {
                info!(match_id, ?change, "hero");
            }
        })
        .on_stats_update(move |delta, _| {
            info!(match_id, players = delta.changes.len(), ts = delta.server_timestamp, "stats");
        })
        .on_map_update(move |delta, state| {
            info!(match_id, current = state.current_map_number(), changes = delta.changes.len(), "maps");
        })
        .on_status_update(move |_, state| {
            info!(match_id, status = ?state.status, "status");
        })
        .on_connect(move |status| {
            info!(
                match_id,
                state = ?status.state,
                attempts = status.reconnect_attempts,
                polling = status.polling,
                latency_ms = status.latency.map(|l| l.as_millis() as u64),
                "connection"
            );
        })
        .on_error(move |e| {
            if e.is_connection_error() {
                warn!(match_id, "{}", e);
            } else {
                error!(match_id, "{}", e);
            }
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let ids = std::env::args()
        .skip(1)
        .map(|arg| arg.parse::<MatchId>().with_context(|| format!("invalid match id {:?}", arg)))
        .collect::<Result<Vec<_>>>()?;
    if ids.is_empty() {
        bail!("usage: live-match-watch <match-id> [<match-id> ...]");
    }

    let config = ClientConfig::from_env().context("loading LIVE_SYNC_* configuration")?;
    info!("Live Match Watch v{}", VERSION);
    info!(transport = %config.transport, api = %config.api_base, "configured");

    let client = LiveMatchClient::new(config)?;
    for &match_id in &ids {
        client.subscribe(match_id, watch_callbacks(match_id))?;
    }

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    for &match_id in &ids {
        client.unsubscribe(match_id);
    }
    client.shutdown();
    Ok(())
}
