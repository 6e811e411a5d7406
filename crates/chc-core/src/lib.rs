//! Core domain + application logic for the channel-clearing bot.
//!
//! This crate is intentionally framework-agnostic. Telegram lives behind ports
//! (traits) implemented in the adapter crate.

pub mod audit;
pub mod auth;
pub mod channel;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod messaging;
pub mod orchestrator;
pub mod session_store;

pub use errors::{Error, Result};
