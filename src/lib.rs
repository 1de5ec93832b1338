//! Binlog Player: a streaming replication consumer that subscribes to an
//! upstream binary-log server, filters its event stream by a key range and
//! table set, and applies the resulting logical changes to a downstream
//! relational database in batched, checkpointed transactions.
//!
//! Data flow: [`driver`] -> [`state_machine`] -> ([`filter`]) ->
//! [`batcher`] -> [`client`] -> [`checkpoint`].

pub mod batcher;
pub mod checkpoint;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod pb;
pub mod state_machine;
pub mod stats;
pub mod upstream;

pub mod driver;

pub use config::{Config, KeyRange, RecoveryState};
pub use error::{PlayerError, PlayerResult};
pub use stats::Stats;
