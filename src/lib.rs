//! Multi-group blockchain node bootstrap with a synthetic transaction load
//! generator.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod ledger;
pub mod loadgen;
pub mod network;
pub mod node;
pub mod transaction;
pub mod types;

pub use bootstrap::{identity, logger};
