//! Utilities for standing up mock trading infrastructure in tests.

mod exchange;
mod ticker_server;

pub use exchange::{MockExchange, PlacedOrder, RecordingFeed, StaticCredentials};
pub use ticker_server::MockTickerServer;
