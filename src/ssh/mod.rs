//! SSH module - connections, tunnel chains and logical sessions
//!
//! This module provides the connectivity layer on top of russh.
//!
//! # Features
//! - Direct connections over tcp, tcp4, tcp6 or a unix socket
//! - Multi-hop tunnel chains (`direct-tcpip` + handshake over the channel)
//! - Password, keyboard-interactive and public key authentication
//! - Host key verification via ~/.ssh/known_hosts
//! - Named sessions multiplexed over one connection

pub mod auth;
pub mod chain;
pub mod client;
mod error;
pub mod known_hosts;
pub mod session;

pub use auth::{ConnectionConfig, Credentials};
pub use chain::{HopConnector, HopTransport, SshHopConnector, TunnelChain};
pub use client::{ClientHandler, SshHandle};
pub use error::SshError;
pub use known_hosts::{get_known_hosts, HostKeyVerification, KnownHostsStore};
pub use session::{LogicalSession, Session, SessionIo, SessionRegistry};
