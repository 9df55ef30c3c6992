//! ssh-compose connectivity layer
//!
//! Direct and multi-hop SSH connections, a local port forward bridge,
//! named sessions over one connection, command runners for regular hosts
//! and line-oriented network devices, and recursive SFTP file sync.

pub mod config;
pub mod emitter;
pub mod executor;
pub mod forwarding;
pub mod logging;
pub mod sftp;
pub mod ssh;

pub use config::Remote;
pub use emitter::{Emitter, EventLevel, ExecutorEvent, MemoryEmitter, SharedEmitter, TracingEmitter};
pub use executor::{Executor, SessionStrategy};
