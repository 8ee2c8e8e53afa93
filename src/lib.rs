//! RelayMQ – a single-node, AMQP-style message broker.
//!
//! This crate exports
//!  * `core`    – routing, topology managers, message store, consumers
//!  * `broker`  – broker engine, delivery pool, sessions and TCP server
//!  * `client`  – async client for the TCP protocol
//!  * `config`  – TOML + environment configuration
//!  * `logging` – tracing subscriber setup
//!
//! Applications can embed the engine ([`Broker`] over a [`core::VirtualHost`])
//! without the network layer, or run the `relaymq` daemon.

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use broker::{Broker, Server};
pub use client::{Client, ClientChannel, Delivery};
pub use config::{load_config, Config};
