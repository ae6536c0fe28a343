// =============================================================================
// Exit Evaluator: signal-driven exit state machine
// =============================================================================
//
// While a position is OPEN, conditions are checked in fixed priority order and
// the first match wins:
//
//   1. SL       opposite direction, confidence >= stop_loss       (no hold gate)
//   2. TP       same direction, confidence >= take_profit         (hold gate,
//               bypassed when confidence >= take_profit_fast)
//   3. DROP     confidence < exit_min                             (hold gate)
//   4. REVERSE  opposite direction, confidence >= reverse         (hold gate)
//   5. DECAY    bars_open >= decay_bars                           (no hold gate)
//
// Settlement uses the current bar close. A close is a scratch when its |pct|
// is below the materiality threshold and the reason is sl, drop or decay.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::position_engine::Position;
use crate::runtime_config::ExitParams;
use crate::types::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitReason {
    Tp,
    Sl,
    Drop,
    Decay,
    Reverse,
}

impl ExitReason {
    /// Reasons whose small moves are treated as noise.
    pub fn scratch_eligible(self) -> bool {
        matches!(self, Self::Sl | Self::Drop | Self::Decay)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tp => write!(f, "tp"),
            Self::Sl => write!(f, "sl"),
            Self::Drop => write!(f, "drop"),
            Self::Decay => write!(f, "decay"),
            Self::Reverse => write!(f, "reverse"),
        }
    }
}

/// A fired exit, settled at `exit_price`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitSignal {
    pub reason: ExitReason,
    pub exit_price: f64,
    pub pct: f64,
    pub is_scratch: bool,
}

pub fn is_scratch(pct: f64, reason: ExitReason, materiality_pct: f64) -> bool {
    pct.abs() < materiality_pct && reason.scratch_eligible()
}

/// Which exit, if any, fires for `position` given this step's decision.
pub fn exit_reason(
    position: &Position,
    direction: Direction,
    confidence: f64,
    params: &ExitParams,
) -> Option<ExitReason> {
    let held = position.bars_open >= params.min_hold_bars;
    let flipped = direction.opposes(position.direction);
    let same = !direction.is_flat() && direction == position.direction;

    if flipped && confidence >= params.stop_loss_confidence {
        return Some(ExitReason::Sl);
    }
    if same
        && confidence >= params.take_profit_confidence
        && (held || confidence >= params.take_profit_fast_confidence)
    {
        return Some(ExitReason::Tp);
    }
    if held && confidence < params.exit_min_confidence {
        return Some(ExitReason::Drop);
    }
    if held && flipped && confidence >= params.reverse_confidence {
        return Some(ExitReason::Reverse);
    }
    if position.bars_open >= params.decay_bars {
        return Some(ExitReason::Decay);
    }
    None
}

/// Evaluate and, when an exit fires, settle it at `bar_close`.
pub fn evaluate(
    position: &Position,
    direction: Direction,
    confidence: f64,
    bar_close: f64,
    params: &ExitParams,
    materiality_pct: f64,
) -> Option<ExitSignal> {
    let reason = exit_reason(position, direction, confidence, params)?;
    let pct = position.pct_at(bar_close);
    let signal = ExitSignal {
        reason,
        exit_price: bar_close,
        pct,
        is_scratch: is_scratch(pct, reason, materiality_pct),
    };
    debug!(
        trade_id = %position.trade_id,
        reason = %reason,
        bars_open = position.bars_open,
        confidence,
        pct,
        "exit condition fired"
    );
    Some(signal)
}
