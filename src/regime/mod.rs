// =============================================================================
// Regime Module
// =============================================================================
//
// Coarse price-action classification (trend up / trend down / high volatility
// / chop) from a trailing bar window.

pub mod classifier;

pub use classifier::{classify, Regime, RegimeMetrics, RegimeResult};
