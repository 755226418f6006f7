//! Core engine: the scan → reconcile → release → transfer loop.

pub mod scanner;
pub mod watchlist;
pub mod gate;
pub mod executor;
pub mod watcher;
