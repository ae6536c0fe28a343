// =============================================================================
// Feed ingest: JSON lines into the live buffers
// =============================================================================
//
// Bars and signal vectors are produced by upstream collaborators and arrive
// as one JSON object per line:
//
//   {"type":"bar","symbol":"BTCUSDT","timeframe":"5m","bar":{...}}
//   {"type":"signals","symbol":"BTCUSDT","timeframe":"5m","timestamp":..,"vector":{...}}

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::market_data::{Bar, BarBuffer, BarKey, SignalBoard, SignalSnapshot, SignalVector};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Bar {
        symbol: String,
        timeframe: String,
        bar: Bar,
    },
    Signals {
        symbol: String,
        timeframe: String,
        timestamp: i64,
        vector: SignalVector,
    },
}

impl FeedEvent {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).context("failed to parse feed event")
    }

    /// Route the event into the matching live store.
    pub fn apply(self, bars: &BarBuffer, signals: &SignalBoard) {
        match self {
            Self::Bar {
                symbol,
                timeframe,
                bar,
            } => {
                let key = BarKey::new(symbol.to_uppercase(), timeframe);
                debug!(key = %key, ts = bar.timestamp, close = bar.close, "bar ingested");
                bars.push(key, bar);
            }
            Self::Signals {
                symbol,
                timeframe,
                timestamp,
                vector,
            } => {
                let key = BarKey::new(symbol.to_uppercase(), timeframe);
                debug!(key = %key, ts = timestamp, signals = vector.names.len(), "signals ingested");
                signals.publish(key, SignalSnapshot { timestamp, vector });
            }
        }
    }
}

/// Read feed events until EOF. Malformed lines are logged and skipped.
/// Returns the number of events applied.
pub async fn run_ingest<R>(
    reader: R,
    bars: Arc<BarBuffer>,
    signals: Arc<SignalBoard>,
) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut applied = 0u64;

    while let Some(line) = lines.next_line().await.context("feed read failed")? {
        if line.trim().is_empty() {
            continue;
        }
        match FeedEvent::parse(&line) {
            Ok(event) => {
                event.apply(&bars, &signals);
                applied += 1;
            }
            Err(e) => warn!(error = %e, "skipping malformed feed line"),
        }
    }

    info!(applied, "feed ingest reached end of input");
    Ok(applied)
}
