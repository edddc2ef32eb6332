//! Multi-exchange order book aggregation engine.
//!
//! Per-venue connectors translate heterogeneous exchange streams into
//! one canonical update type, the engine maintains a book per venue, and
//! the broadcast server fans periodic top-N views and statistics out to
//! WebSocket subscribers.

pub mod book;
pub mod connectors;
pub mod engine;
pub mod middleware;
pub mod models;
pub mod server;
pub mod stats;
