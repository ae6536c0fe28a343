// =============================================================================
// Position Engine: the per-symbol position slot
// =============================================================================
//
// Life-cycle:
//   FLAT  --open-->  OPEN  --close-->  FLAT
//
// A slot holds at most one position. Opening an occupied slot or closing an
// empty one is an invariant violation: the action is rejected, logged at
// `error`, and the slot is left untouched.
//
// `bars_open` is 0 on the opening bar and is incremented by `tick` at the
// start of every later step.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{EngineError, EngineResult};
use crate::regime::Regime;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// `<symbol>-<entry bar timestamp>`; identical in live and replay.
    pub trade_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Entry bar timestamp (epoch ms).
    pub entry_timestamp: i64,
    pub bars_open: u32,
    pub notional: f64,
    pub entry_regime: Regime,
    pub entry_confidence: f64,
}

impl Position {
    pub fn trade_id_for(symbol: &str, entry_timestamp: i64) -> String {
        format!("{symbol}-{entry_timestamp}")
    }

    /// Signed percentage move from entry to `price` in the position's favour.
    pub fn pct_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 || !price.is_finite() {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * 100.0 * self.direction.as_f64()
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionSlot {
    current: Option<Position>,
}

impl PositionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Position> {
        self.current.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn open(&mut self, position: Position) -> EngineResult<&Position> {
        if let Some(existing) = &self.current {
            error!(
                symbol = %position.symbol,
                existing = %existing.trade_id,
                attempted = %position.trade_id,
                "INVARIANT: open attempted while a position exists; rejected"
            );
            return Err(EngineError::InvariantViolation(format!(
                "{} already has open trade {}",
                position.symbol, existing.trade_id
            )));
        }

        info!(
            trade_id = %position.trade_id,
            symbol = %position.symbol,
            direction = %position.direction,
            entry_price = position.entry_price,
            notional = position.notional,
            "position opened"
        );
        Ok(self.current.insert(position))
    }

    pub fn close(&mut self) -> EngineResult<Position> {
        let position = self.current.take().ok_or_else(|| {
            error!("INVARIANT: close attempted with no open position; rejected");
            EngineError::InvariantViolation("close without an open position".to_string())
        })?;
        debug!(trade_id = %position.trade_id, bars_open = position.bars_open, "position slot cleared");
        Ok(position)
    }

    /// Advance the open position by one bar. Returns the new count.
    pub fn tick(&mut self) -> Option<u32> {
        let position = self.current.as_mut()?;
        position.bars_open = position.bars_open.saturating_add(1);
        Some(position.bars_open)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn long(symbol: &str, ts: i64) -> Position {
        Position {
            trade_id: Position::trade_id_for(symbol, ts),
            symbol: symbol.to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            entry_timestamp: ts,
            bars_open: 0,
            notional: 1_000.0,
            entry_regime: Regime::TrendUp,
            entry_confidence: 0.6,
        }
    }

    #[test]
    fn open_tick_close() {
        let mut slot = PositionSlot::new();
        assert!(slot.tick().is_none());
        slot.open(long("BTCUSDT", 1)).unwrap();
        assert_eq!(slot.tick(), Some(1));
        assert_eq!(slot.tick(), Some(2));
        let closed = slot.close().unwrap();
        assert_eq!(closed.bars_open, 2);
        assert!(!slot.is_open());
    }

    #[test]
    fn second_open_is_rejected_and_keeps_original() {
        let mut slot = PositionSlot::new();
        slot.open(long("BTCUSDT", 1)).unwrap();
        let err = slot.open(long("BTCUSDT", 2)).unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(slot.current().unwrap().entry_timestamp, 1);
    }

    #[test]
    fn close_on_empty_slot_is_rejected() {
        assert!(matches!(
            PositionSlot::new().close(),
            Err(EngineError::InvariantViolation(_))
        ));
    }

    #[test]
    fn pct_is_signed_by_direction() {
        let mut p = long("ETHUSDT", 0);
        assert!((p.pct_at(102.0) - 2.0).abs() < 1e-12);
        p.direction = Direction::Short;
        assert!((p.pct_at(102.0) + 2.0).abs() < 1e-12);
        assert_eq!(p.pct_at(f64::NAN), 0.0);
    }
}
