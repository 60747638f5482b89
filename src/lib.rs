//! Mirror a terminal coding-agent session to a paired remote viewer.
//!
//! PTY output is stripped of escape sequences, classified line by line into
//! semantic messages and shipped through a relay that pairs exactly one
//! agent side with one viewer side per session.

pub mod aggregator;
pub mod ansi;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod hook_config;
pub mod hooks;
pub mod pairing;
pub mod protocol;
pub mod pty;
pub mod relay_client;
pub mod relay_server;
pub mod runtime;
pub mod session;

pub use error::{BridgeError, Result};
