pub mod bar_buffer;
pub mod feed;
pub mod ingest;
pub mod signal_board;

pub use bar_buffer::{Bar, BarBuffer, BarKey};
pub use feed::{fetch_step_data, HistoricalFeed, LiveFeed, MarketDataSource, StepData};
pub use ingest::FeedEvent;
pub use signal_board::{SignalBoard, SignalSnapshot, SignalVector};
