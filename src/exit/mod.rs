// =============================================================================
// Exit Management Module
// =============================================================================
//
// Priority-ordered exit state machine evaluated once per step for an open
// position.

pub mod evaluator;

pub use evaluator::{evaluate, exit_reason, is_scratch, ExitReason, ExitSignal};
