//! Domain types and pure logic for the violation relay.
//!
//! Nothing in this crate touches the network: it defines the event wire
//! format, the canonical record, correlation, upload keys and the
//! startup configuration shared by the other crates.

pub mod archive;
pub mod config;
pub mod correlation;
pub mod error;
pub mod hashing;
pub mod record;
pub mod types;
pub mod violation;
