//! End-to-end watcher tests against an in-memory exchange.

mod mock_exchange;
mod watcher_flow;
