//! A federated directory of geographically located network nodes

#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod dump;
pub mod error;
pub mod http;
pub mod mail;
pub mod metrics;
pub mod node;
pub mod registry;
pub mod server;
pub mod state;
mod store;
pub mod sync;
pub mod verify;

// Re-export to be able to embed the directory
pub use store::{ConfirmOutcome, NodeCounts, Store};
