// ===============================
// src/lib.rs
// ===============================
/*
=============================================================================
Project : venue_sync — exchange state synchronization engine in Rust
Module  : lib.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Keeps an in-memory mirror of a venue's market data and account
          state in sync via REST polling, paginated backfill and WebSocket
          streams, and tracks the lifecycle of locally submitted orders.
=============================================================================
*/
pub mod adapter;
pub mod backoff;
pub mod binance; // Binance spot adapter (REST + combined stream + WS API)
pub mod config;
pub mod domain;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod reconcile;
pub mod rest;
pub mod state;
pub mod tasks;
pub mod transport;
pub mod ws;

pub use adapter::VenueAdapter;
pub use config::EngineConfig;
pub use domain::{ApiMethod, Order, OrderStatus, Side};
pub use engine::Engine;
pub use envelope::ConnectionRole;
pub use error::{AdapterError, EngineError, TransportError};
pub use state::StateStore;
pub use ws::ConnectionState;
