// node/src/lib.rs

//! Sharder node: configuration and runtime around the tiered block store.

pub mod config;
pub mod runtime;

pub use config::NodeConfig;
pub use runtime::Node;
