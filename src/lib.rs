//! # Kraken Proxy Library
//!
//! Companion service for a KrakenSDR direction-finding receiver.
//!
//! This library tails the receiver's bearing output into a short-lived
//! cache, sequences power to the receiver hardware and exposes both over a
//! small HTTP API.

pub mod config;
pub mod error;
pub mod ingest;
pub mod keepalive;
pub mod power;
pub mod server;
pub mod settings;
pub mod validation;
