// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sessions and the I/O runtime they share.
//!
//! An [`IoCore`] bundles the reactor thread, the callback worker pool, and
//! the configuration; every session and channel created from it shares
//! those resources.
//!
//! A [`Session`] is one endpoint of a logical peering: a client session
//! dials a remote address, a server session listens and accepts. Channels
//! are created by name inside a session, and the handshake pairs a client
//! channel `("A", "B")` with the server channel `("B", "A")` of the
//! same-named session.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::acceptor::Acceptor;
use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::connector::ConnectorMode;
use crate::frame;
use crate::reactor::Reactor;
use crate::strand::Executor;

// ============================================================================
// IoCore
// ============================================================================

/// The shared I/O runtime: one reactor thread plus a callback worker pool.
///
/// Keep the `IoCore` alive for as long as its sessions and channels are in
/// use; the underlying threads are reference-counted and shut down when the
/// last user is gone.
pub struct IoCore {
    reactor: Arc<Reactor>,
    exec: Arc<Executor>,
    config: ChannelConfig,
}

impl IoCore {
    /// Spawn the reactor and worker threads.
    pub fn new(config: ChannelConfig) -> io::Result<IoCore> {
        let reactor = Reactor::spawn(config.nodelay)?;
        let exec = Executor::new(config.worker_threads);
        Ok(IoCore {
            reactor,
            exec,
            config,
        })
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.exec
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

// ============================================================================
// Session
// ============================================================================

enum CoreMode {
    Client {
        remote_addr: SocketAddr,
        session_id: u64,
    },
    Server {
        acceptor: Arc<Acceptor>,
        /// Peer session id, bound by the first accepted handshake.
        peer_id: Mutex<Option<u64>>,
    },
}

/// Shared state of one session endpoint.
pub(crate) struct SessionCore {
    name: String,
    mode: CoreMode,
    reactor: Arc<Reactor>,
    exec: Arc<Executor>,
    config: ChannelConfig,
}

impl SessionCore {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub(crate) fn executor(&self) -> &Arc<Executor> {
        &self.exec
    }

    pub(crate) fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The session id sent in client handshakes. Server sessions report the
    /// bound peer id, or zero before the first handshake.
    pub(crate) fn session_id(&self) -> u64 {
        match &self.mode {
            CoreMode::Client { session_id, .. } => *session_id,
            CoreMode::Server { peer_id, .. } => peer_id.lock().unwrap_or(0),
        }
    }

    pub(crate) fn acceptor(&self) -> Option<&Arc<Acceptor>> {
        match &self.mode {
            CoreMode::Server { acceptor, .. } => Some(acceptor),
            CoreMode::Client { .. } => None,
        }
    }

    /// Bind the peer session id on first contact; afterwards, require every
    /// handshake to carry the same id.
    pub(crate) fn bind_peer_id(&self, id: u64) -> bool {
        match &self.mode {
            CoreMode::Client { session_id, .. } => *session_id == id,
            CoreMode::Server { peer_id, .. } => {
                let mut bound = peer_id.lock();
                match *bound {
                    None => {
                        *bound = Some(id);
                        true
                    }
                    Some(existing) => existing == id,
                }
            }
        }
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        if let CoreMode::Server { acceptor, .. } = &self.mode {
            acceptor.shutdown();
        }
    }
}

/// One endpoint of a logical session; a factory for named channels.
///
/// Cloning a `Session` is cheap and shares the endpoint.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Create a client session that dials `remote_addr`.
    ///
    /// # Panics
    ///
    /// Panics when `name` is empty or contains a back-tick; names travel in
    /// the handshake and that is a caller bug.
    pub fn client(io: &IoCore, remote_addr: SocketAddr, name: &str) -> Session {
        assert!(
            frame::valid_name(name),
            "session name must be non-empty and must not contain '`'"
        );
        Session {
            core: Arc::new(SessionCore {
                name: name.to_string(),
                mode: CoreMode::Client {
                    remote_addr,
                    session_id: next_session_id(),
                },
                reactor: io.reactor.clone(),
                exec: io.exec.clone(),
                config: io.config.clone(),
            }),
        }
    }

    /// Create a server session listening on `listen_addr`. Binds eagerly so
    /// address errors surface here.
    ///
    /// # Panics
    ///
    /// Panics when `name` is empty or contains a back-tick.
    pub fn server(io: &IoCore, listen_addr: SocketAddr, name: &str) -> io::Result<Session> {
        assert!(
            frame::valid_name(name),
            "session name must be non-empty and must not contain '`'"
        );

        let (listener, local_addr) = io.reactor.listen(listen_addr, io.config.listen_backlog)?;

        let core = Arc::new_cyclic(|weak: &Weak<SessionCore>| SessionCore {
            name: name.to_string(),
            mode: CoreMode::Server {
                acceptor: Acceptor::new(io.reactor.clone(), listener, local_addr, weak.clone()),
                peer_id: Mutex::new(None),
            },
            reactor: io.reactor.clone(),
            exec: io.exec.clone(),
            config: io.config.clone(),
        });

        core.acceptor()
            .expect("server session has an acceptor")
            .start();

        log::debug!("session {:?} listening on {}", name, local_addr);
        Ok(Session { core })
    }

    /// Create the channel `(local, remote)` inside this session.
    ///
    /// Returns immediately; the channel connects in the background and ops
    /// may be enqueued right away.
    ///
    /// # Panics
    ///
    /// Panics when a name is empty or contains a back-tick.
    pub fn channel(&self, local: &str, remote: &str) -> Arc<Channel> {
        assert!(
            frame::valid_name(local) && frame::valid_name(remote),
            "channel names must be non-empty and must not contain '`'"
        );

        match &self.core.mode {
            CoreMode::Client { remote_addr, .. } => Channel::with_connector(
                &self.core,
                local.to_string(),
                remote.to_string(),
                ConnectorMode::Client {
                    remote_addr: *remote_addr,
                },
            ),
            CoreMode::Server { acceptor, .. } => {
                let chan = Channel::with_connector(
                    &self.core,
                    local.to_string(),
                    remote.to_string(),
                    ConnectorMode::Server,
                );
                acceptor.async_get_socket(&chan);
                chan
            }
        }
    }

    /// The session name.
    pub fn name(&self) -> &str {
        self.core.name()
    }

    /// True for server sessions.
    pub fn is_server(&self) -> bool {
        matches!(self.core.mode, CoreMode::Server { .. })
    }

    /// The bound listen address of a server session.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.acceptor().map(|a| a.local_addr())
    }
}

/// Session ids need to be unique per client session within a process
/// lifetime; a clock-seeded counter is enough.
fn next_session_id() -> u64 {
    static SEED: OnceLock<u64> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let seed = *SEED.get_or_init(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e37_79b9_7f4a_7c15)
    });
    seed.wrapping_add(COUNTER.fetch_add(1, Ordering::Relaxed))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = next_session_id();
        let b = next_session_id();
        let c = next_session_id();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_client_session_basics() {
        let io = IoCore::new(ChannelConfig::default()).unwrap();
        let session = Session::client(&io, "127.0.0.1:9999".parse().unwrap(), "unit");

        assert_eq!(session.name(), "unit");
        assert!(!session.is_server());
        assert!(session.local_addr().is_none());
        assert_ne!(session.core.session_id(), 0);
    }

    #[test]
    fn test_server_session_binds_ephemeral_port() {
        let io = IoCore::new(ChannelConfig::default()).unwrap();
        let session = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "unit").unwrap();

        assert!(session.is_server());
        let addr = session.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    #[should_panic(expected = "session name")]
    fn test_invalid_session_name_panics() {
        let io = IoCore::new(ChannelConfig::default()).unwrap();
        let _ = Session::client(&io, "127.0.0.1:9999".parse().unwrap(), "bad`name");
    }

    #[test]
    fn test_bind_peer_id() {
        let io = IoCore::new(ChannelConfig::default()).unwrap();
        let session = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "unit").unwrap();

        assert!(session.core.bind_peer_id(41));
        assert!(session.core.bind_peer_id(41));
        assert!(!session.core.bind_peer_id(42));
    }
}
