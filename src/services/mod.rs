//! Chat services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `hub` owns the connection registry and all fan-out. `connection` is the
//! per-client handle the hub indexes. `store` defines the persistence and
//! identity collaborators the hub calls, plus their Postgres implementation.
//! `bridge` relays fan-out between instances over Redis pub/sub.

pub mod bridge;
pub mod connection;
pub mod hub;
pub mod store;
