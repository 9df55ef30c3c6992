//! Port Forwarding Module
//!
//! Local listener bridged through a tunnel chain to the final target.

mod local;

pub use local::LocalBridge;
