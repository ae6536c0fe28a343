// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free helpers used by the regime classifier. Every public
// function returns `Option<T>` so callers handle short or non-finite input.

pub mod atr;
pub mod slope;
