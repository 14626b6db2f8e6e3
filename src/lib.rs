//! Tiered covered call strategy and execution engine.
//!
//! Plans covered calls across up to three expirations with increasing strikes, rolls expiring
//! in-the-money calls for a net credit, and keeps an append-only ledger of the premium's effect
//! on cost basis.

pub mod allocator;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expirations;
pub mod ledger;
pub mod memory_broker;
pub mod planner;
pub mod positions;
pub mod retry;
pub mod roller;
pub mod types;
pub mod utils;
pub mod webull_client;

pub use engine::TieredCallEngine;
pub use error::{BrokerError, StrategyError};
