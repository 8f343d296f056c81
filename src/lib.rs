//! tweety: a JSON-RPC bridge between a browser extension, its UI surfaces
//! and a native messaging host.
//!
//! The [`bridge`] module holds the protocol, the shared native connection,
//! the capability router and the relay UI surfaces talk to.

pub mod bridge;
pub mod cli;
pub mod logging;
