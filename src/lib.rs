// =============================================================================
// Regime Desk: regime-aware entry/exit decision core
// =============================================================================
//
// One step function (`engine::DecisionEngine::step`) turns a trailing bar
// window plus a signal vector into a regime, a bucketed decision, and at most
// one entry or exit per symbol per bar. The live runner and the backtest
// harness both drive that same function.
// =============================================================================

pub mod backtest;
pub mod decision_envelope;
pub mod engine;
pub mod entry_gate;
pub mod error;
pub mod exit;
pub mod indicators;
pub mod ledger;
pub mod live;
pub mod market_data;
pub mod position_engine;
pub mod regime;
pub mod risk;
pub mod runtime_config;
pub mod signals;
pub mod types;

pub use engine::{run_step, DecisionEngine, StepOutcome, StepReport, SymbolState};
pub use error::{EngineError, EngineResult};
pub use runtime_config::{ConfigHandle, EngineConfig};
pub use types::{Direction, ReplayMode};
