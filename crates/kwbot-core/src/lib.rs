//! Core domain + application logic for the keyword watch bot.
//!
//! This crate is intentionally framework-agnostic. HTTP fetching and Telegram live
//! behind ports (traits) implemented in adapter crates.

pub mod commands;
pub mod config;
pub mod domain;
pub mod errors;
pub mod extract;
pub mod fetch;
pub mod filter;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod monitor;
pub mod notify;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
