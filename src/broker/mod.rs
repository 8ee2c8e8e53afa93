//! # Broker Module
//!
//! Everything between the socket and the core:
//!
//! - `engine`: the [`Broker`] itself, driving the virtual host and scheduling
//!   deliveries on the worker pool.
//! - `pool`: bounded delivery worker pool.
//! - `channel` / `connection`: client sessions and their registries.
//! - `protocol`: request/response frames.
//! - `server`: tokio TCP accept loop.

pub mod channel;
pub mod connection;
pub mod engine;
pub mod pool;
pub mod protocol;
pub mod server;

pub use self::engine::Broker;
pub use self::server::Server;
