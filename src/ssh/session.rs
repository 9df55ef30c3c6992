//! Logical sessions and the per-executor session registry
//!
//! A session is a named channel multiplexed over the executor's single
//! physical connection. Device sessions carry a boxed extension holding the
//! PTY shell stream and the learned prompts.

use std::collections::HashMap;

use async_trait::async_trait;
use russh::client::Msg;
use russh::Channel;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::error::SshError;
use crate::executor::device::BoxedDevice;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Standard streams attached to a session
#[derive(Default)]
pub struct SessionIo {
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

impl SessionIo {
    pub fn is_empty(&self) -> bool {
        self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none()
    }
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// What the registry needs from a session
#[async_trait]
pub trait LogicalSession: Send {
    fn name(&self) -> &str;

    /// Detach the stdio so it can move to a replacement session
    fn take_io(&mut self) -> SessionIo;

    fn attach_io(&mut self, io: SessionIo);

    async fn close(&mut self);
}

enum SessionState {
    Open(Channel<Msg>),
    Device(Box<BoxedDevice>),
    Closed,
}

/// Session backed by an SSH channel
pub struct Session {
    name: String,
    state: SessionState,
    io: SessionIo,
}

impl Session {
    pub fn new(name: impl Into<String>, channel: Channel<Msg>) -> Self {
        Self {
            name: name.into(),
            state: SessionState::Open(channel),
            io: SessionIo::default(),
        }
    }

    pub fn device(name: impl Into<String>, device: BoxedDevice) -> Self {
        Self {
            name: name.into(),
            state: SessionState::Device(Box::new(device)),
            io: SessionIo::default(),
        }
    }

    /// Plain channel, or `None` for device and closed sessions
    pub fn channel_mut(&mut self) -> Option<&mut Channel<Msg>> {
        match &mut self.state {
            SessionState::Open(channel) => Some(channel),
            _ => None,
        }
    }

    /// Take the channel out, leaving the session closed
    pub fn take_channel(&mut self) -> Option<Channel<Msg>> {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Open(channel) => Some(channel),
            other => {
                self.state = other;
                None
            }
        }
    }

    pub fn device_mut(&mut self) -> Option<&mut BoxedDevice> {
        match &mut self.state {
            SessionState::Device(device) => Some(device),
            _ => None,
        }
    }

    pub fn is_device(&self) -> bool {
        matches!(self.state, SessionState::Device(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed)
    }

    pub fn io_mut(&mut self) -> &mut SessionIo {
        &mut self.io
    }
}

#[async_trait]
impl LogicalSession for Session {
    fn name(&self) -> &str {
        &self.name
    }

    fn take_io(&mut self) -> SessionIo {
        std::mem::take(&mut self.io)
    }

    fn attach_io(&mut self, io: SessionIo) {
        self.io = io;
    }

    async fn close(&mut self) {
        match std::mem::replace(&mut self.state, SessionState::Closed) {
            SessionState::Open(channel) => {
                if let Err(e) = channel.close().await {
                    debug!("Closing session {} failed: {}", self.name, e);
                }
            }
            SessionState::Device(mut device) => device.shutdown().await,
            SessionState::Closed => {}
        }
    }
}

/// Named sessions of one executor.
///
/// A single-session registry (line-oriented devices) holds at most one
/// entry; asking for a second distinct name fails.
pub struct SessionRegistry<S> {
    sessions: HashMap<String, S>,
    single_session: bool,
}

impl<S: LogicalSession> SessionRegistry<S> {
    pub fn new(single_session: bool) -> Self {
        Self {
            sessions: HashMap::new(),
            single_session,
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut S> {
        self.sessions.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Fail if opening `name` would exceed the session limit
    pub fn ensure_capacity(&self, name: &str) -> Result<(), SshError> {
        if !self.single_session || self.sessions.contains_key(name) {
            return Ok(());
        }
        match self.sessions.keys().next() {
            Some(existing) => Err(SshError::SessionLimitExceeded {
                existing: existing.clone(),
                requested: name.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Register a freshly opened session and return it
    pub fn insert(&mut self, session: S) -> Result<&mut S, SshError> {
        let name = session.name().to_string();
        self.ensure_capacity(&name)?;
        debug!("Registering session {}", name);
        Ok(match self.sessions.entry(name) {
            std::collections::hash_map::Entry::Occupied(mut slot) => {
                slot.insert(session);
                slot.into_mut()
            }
            std::collections::hash_map::Entry::Vacant(slot) => slot.insert(session),
        })
    }

    /// Unregister without closing
    pub fn take(&mut self, name: &str) -> Option<S> {
        self.sessions.remove(name)
    }

    /// Close and drop a session. Returns false if it was not registered.
    pub async fn remove(&mut self, name: &str) -> bool {
        match self.sessions.remove(name) {
            Some(mut session) => {
                session.close().await;
                debug!("Removed session {}", name);
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        for (name, mut session) in self.sessions.drain() {
            debug!("Closing session {}", name);
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DummySession {
        name: String,
        io: SessionIo,
        closed: Arc<AtomicUsize>,
    }

    impl DummySession {
        fn new(name: &str, closed: &Arc<AtomicUsize>) -> Self {
            Self {
                name: name.to_string(),
                io: SessionIo::default(),
                closed: closed.clone(),
            }
        }
    }

    #[async_trait]
    impl LogicalSession for DummySession {
        fn name(&self) -> &str {
            &self.name
        }

        fn take_io(&mut self) -> SessionIo {
            std::mem::take(&mut self.io)
        }

        fn attach_io(&mut self, io: SessionIo) {
            self.io = io;
        }

        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_single_session_limit() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut registry = SessionRegistry::new(true);

        registry.insert(DummySession::new("main", &closed)).unwrap();
        assert!(registry.ensure_capacity("main").is_ok());

        match registry.insert(DummySession::new("other", &closed)) {
            Err(SshError::SessionLimitExceeded { existing, requested }) => {
                assert_eq!(existing, "main");
                assert_eq!(requested, "other");
            }
            _ => panic!("Expected SessionLimitExceeded"),
        }
        assert_eq!(registry.len(), 1);

        // The slot frees up once the session is removed
        assert!(registry.remove("main").await);
        assert!(registry.insert(DummySession::new("other", &closed)).is_ok());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_multi_session_registry() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut registry = SessionRegistry::new(false);

        for name in ["a", "b", "c"] {
            registry.insert(DummySession::new(name, &closed)).unwrap();
        }
        assert_eq!(registry.len(), 3);
        assert!(!registry.remove("missing").await);

        registry.close_all().await;
        assert!(registry.is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_io_moves_between_sessions() {
        let closed = Arc::new(AtomicUsize::new(0));
        let mut first = DummySession::new("main", &closed);
        first.attach_io(SessionIo {
            stdout: Some(Box::new(tokio::io::sink())),
            ..Default::default()
        });

        let io = first.take_io();
        assert!(first.io.is_empty());

        let mut second = DummySession::new("main", &closed);
        second.attach_io(io);
        assert!(second.io.stdout.is_some());
    }
}
