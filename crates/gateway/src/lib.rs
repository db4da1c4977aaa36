//! Slipway runtime: session lifecycle, context-window management and quota
//! allocation on top of an external agent CLI.

pub mod bootstrap;
pub mod cli;
pub mod promote;
pub mod quota_source;
pub mod runtime;
pub mod settings;
pub mod state;
