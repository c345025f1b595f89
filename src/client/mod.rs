//! Tunnel client implementation.
//!
//! This module provides the local proxy half of the tunnel:
//! - [`TunnelClient`] - accepts local connections and hands each request to the relay
//! - relay mode, which turns a tunneled connection into push/poll calls

mod connection;
mod transfer;

pub use connection::{ClientSettings, TunnelClient};
