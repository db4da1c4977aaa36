//! Shared domain types for Slipway: configuration, errors, agent stream
//! events and structured trace events.

pub mod config;
pub mod error;
pub mod stream;
pub mod trace;

pub use error::{Error, Result};
