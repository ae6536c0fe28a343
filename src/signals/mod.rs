// =============================================================================
// Signals Module
// =============================================================================
//
// Turns a normalised signal vector into one directional confidence:
// - Bucket map (validated signal → bucket table)
// - Regime-aware bucket aggregation with a single neutral zone

pub mod aggregator;
pub mod bucket_map;

pub use aggregator::{Aggregator, BucketScore, Decision};
pub use bucket_map::{Bucket, BucketMap};
