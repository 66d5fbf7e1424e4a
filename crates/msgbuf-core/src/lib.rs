//! Core domain + application logic for the message buffering pipeline.
//!
//! This crate is framework-agnostic. HTTP downloads, the content store,
//! transcription and the acknowledgment channel live behind ports (traits)
//! implemented in adapter crates.

pub mod attachment_retry;
pub mod backoff;
pub mod classify;
pub mod config;
pub mod context;
pub mod domain;
pub mod download;
pub mod errors;
pub mod handlers;
pub mod identity;
pub mod inbound;
pub mod logging;
pub mod manager;
pub mod messaging;
pub mod pipeline;
pub mod poller;
pub mod ports;
pub mod processor;
pub mod store;
pub mod transcription;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
