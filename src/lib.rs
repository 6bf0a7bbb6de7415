//! Ricart-Agrawala mutual exclusion over an in-process cluster.
//!
//! - [`ra`]: the protocol engine, codec, messenger and mock transport
//! - [`chaos`]: fault-injecting network, threaded node runner and checker
//! - [`config`]: cluster table and tunables loaded with figment

pub mod chaos;
pub mod config;
pub mod error;
pub mod ra;
