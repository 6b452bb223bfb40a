//! The core of outgoing TCP analysis.
//! Normalize tcpdump records, follow each connection through its handshake and
//! exchanges, and aggregate the results per remote.
pub mod containers;
pub mod core;
pub mod metrics;
pub mod remote;
pub mod resolver;
pub mod session;
pub mod utils;
pub mod whitelist;
