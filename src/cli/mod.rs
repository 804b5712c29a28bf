//! CLI command handlers
//!
//! Each subcommand is implemented in its own module.

pub mod helpers;
pub mod learn;
pub mod rebalance;
pub mod record_event;
pub mod serve;
pub mod stats;
