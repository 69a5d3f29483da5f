// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server-side channel pairing.
//!
//! The acceptor owns a server session's listener and performs the mirror
//! half of the client handshake: send the greeting byte, read the
//! length-prefixed identity string, and pair the socket with the server
//! channel whose names are the swap of the client's.
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                         Acceptor                             |
//! |  +-------------------------------------------------------+  |
//! |  |              Pending channels                          |  |
//! |  |   HashMap<(session, local, remote), Arc<Channel>>     |  |
//! |  +-------------------------------------------------------+  |
//! |  +-------------------------------------------------------+  |
//! |  |              Unclaimed sockets                         |  |
//! |  |   HashMap<(session, local, remote), StreamId>         |  |
//! |  +-------------------------------------------------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! Either side can arrive first: a channel created before its peer parks
//! in `pending`, and a handshake that lands before its channel exists
//! parks the socket in `unclaimed`. Both tables sit behind one mutex so
//! check-then-park is atomic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::frame::{self, Identity};
use crate::reactor::{ListenerId, Reactor, StreamId};
use crate::session::SessionCore;

/// Identity tuple a socket and a channel are paired on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct PairKey {
    /// Session name.
    pub session: String,

    /// Server-side channel name (the client's remote name).
    pub local: String,

    /// Client-side channel name (the client's local name).
    pub remote: String,
}

impl PairKey {
    /// Key under which a client identity pairs with a server channel.
    pub(crate) fn from_identity(identity: &Identity) -> PairKey {
        PairKey {
            session: identity.session_name.clone(),
            local: identity.remote_name.clone(),
            remote: identity.local_name.clone(),
        }
    }
}

#[derive(Default)]
struct Tables {
    pending: HashMap<PairKey, Arc<Channel>>,
    unclaimed: HashMap<PairKey, StreamId>,
}

/// Accepts connections for one server session and pairs them with its
/// channels.
pub(crate) struct Acceptor {
    self_ref: Weak<Acceptor>,
    reactor: Arc<Reactor>,
    listener: ListenerId,
    local_addr: SocketAddr,
    session: Weak<SessionCore>,
    tables: Mutex<Tables>,
    closed: AtomicBool,
}

enum Routed {
    Paired(Arc<Channel>),
    Parked,
    Duplicate,
    ShuttingDown,
}

impl Acceptor {
    pub(crate) fn new(
        reactor: Arc<Reactor>,
        listener: ListenerId,
        local_addr: SocketAddr,
        session: Weak<SessionCore>,
    ) -> Arc<Acceptor> {
        Arc::new_cyclic(|weak| Acceptor {
            self_ref: weak.clone(),
            reactor,
            listener,
            local_addr,
            session,
            tables: Mutex::new(Tables::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// The bound listen address.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn arc(&self) -> Arc<Acceptor> {
        self.self_ref.upgrade().expect("acceptor is alive")
    }

    // ========================================================================
    // Accept loop
    // ========================================================================

    /// Arm the first accept. Further accepts are re-armed per connection.
    pub(crate) fn start(&self) {
        self.submit_accept();
    }

    fn submit_accept(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let this = self.arc();
        self.reactor.accept(
            self.listener,
            Box::new(move |res| this.on_accept(res)),
        );
    }

    fn on_accept(&self, res: std::io::Result<(StreamId, SocketAddr)>) {
        match res {
            Ok((stream, remote_addr)) => {
                log::debug!("accepted connection from {}", remote_addr);
                self.submit_accept();
                self.greet(stream, remote_addr);
            }
            Err(e) => {
                if self.closed.load(Ordering::Acquire)
                    || e.kind() == std::io::ErrorKind::ConnectionAborted
                {
                    return;
                }
                log::warn!("accept error on {}: {}", self.local_addr, e);
                self.submit_accept();
            }
        }
    }

    /// Send the greeting byte, then read the identity frame.
    fn greet(&self, stream: StreamId, remote_addr: SocketAddr) {
        let this = self.arc();
        self.reactor.send_all(
            stream,
            vec![frame::GREETING],
            Box::new(move |out| {
                if let Some(e) = out.err {
                    log::debug!("greeting send to {} failed: {}", remote_addr, e);
                    this.reactor.close_stream(stream);
                    return;
                }
                this.read_identity_header(stream, remote_addr);
            }),
        );
    }

    fn read_identity_header(&self, stream: StreamId, remote_addr: SocketAddr) {
        let this = self.arc();
        self.reactor.recv_exact(
            stream,
            frame::HEADER_SIZE,
            Box::new(move |out| {
                if let Some(e) = out.err {
                    log::debug!("identity header from {} failed: {}", remote_addr, e);
                    this.reactor.close_stream(stream);
                    return;
                }
                let len = frame::decode_len(&out.data);
                if len == 0 || len > frame::MAX_IDENTITY_LEN {
                    log::warn!(
                        "rejecting handshake from {}: identity length {}",
                        remote_addr,
                        len
                    );
                    this.reactor.close_stream(stream);
                    return;
                }
                this.read_identity_body(stream, remote_addr, len);
            }),
        );
    }

    fn read_identity_body(&self, stream: StreamId, remote_addr: SocketAddr, len: usize) {
        let this = self.arc();
        self.reactor.recv_exact(
            stream,
            len,
            Box::new(move |out| {
                if let Some(e) = out.err {
                    log::debug!("identity body from {} failed: {}", remote_addr, e);
                    this.reactor.close_stream(stream);
                    return;
                }

                let text = match std::str::from_utf8(&out.data) {
                    Ok(t) => t,
                    Err(_) => {
                        log::warn!("rejecting handshake from {}: identity is not UTF-8", remote_addr);
                        this.reactor.close_stream(stream);
                        return;
                    }
                };

                match Identity::parse(text) {
                    Ok(identity) => this.route(stream, remote_addr, identity),
                    Err(e) => {
                        log::warn!("rejecting handshake from {}: {}", remote_addr, e);
                        this.reactor.close_stream(stream);
                    }
                }
            }),
        );
    }

    /// Pair a handshake-complete socket with its server channel, or park
    /// it until that channel is created.
    fn route(&self, stream: StreamId, remote_addr: SocketAddr, identity: Identity) {
        let core = match self.session.upgrade() {
            Some(core) => core,
            None => {
                self.reactor.close_stream(stream);
                return;
            }
        };

        if identity.session_name != core.name() {
            log::warn!(
                "rejecting handshake from {}: unknown session {:?}",
                remote_addr,
                identity.session_name
            );
            self.reactor.close_stream(stream);
            return;
        }

        if !core.bind_peer_id(identity.session_id) {
            log::warn!(
                "rejecting handshake from {}: session id {} does not match the bound peer",
                remote_addr,
                identity.session_id
            );
            self.reactor.close_stream(stream);
            return;
        }

        let key = PairKey::from_identity(&identity);
        let routed = {
            let mut tables = self.tables.lock();
            if self.closed.load(Ordering::Acquire) {
                Routed::ShuttingDown
            } else if let Some(chan) = tables.pending.remove(&key) {
                Routed::Paired(chan)
            } else if tables.unclaimed.contains_key(&key) {
                Routed::Duplicate
            } else {
                tables.unclaimed.insert(key.clone(), stream);
                Routed::Parked
            }
        };

        match routed {
            Routed::Paired(chan) => {
                log::debug!(
                    "paired {} -> {} with client at {}",
                    key.local,
                    key.remote,
                    remote_addr
                );
                if let Some(connector) = chan.connector() {
                    connector.deliver(Some(stream), None);
                } else {
                    self.reactor.close_stream(stream);
                }
            }
            Routed::Parked => {
                log::debug!("parked socket for {:?} until its channel appears", key);
            }
            Routed::Duplicate => {
                log::warn!("duplicate handshake for {:?}; keeping the first socket", key);
                self.reactor.close_stream(stream);
            }
            Routed::ShuttingDown => self.reactor.close_stream(stream),
        }
    }

    // ========================================================================
    // Channel registration
    // ========================================================================

    /// Called when a server channel is created: claim a parked socket, or
    /// register the channel as pending.
    pub(crate) fn async_get_socket(&self, chan: &Arc<Channel>) {
        let core = self.session.upgrade();
        let session_name = core.as_ref().map(|c| c.name().to_string()).unwrap_or_default();
        let key = PairKey {
            session: session_name,
            local: chan.local_name().to_string(),
            remote: chan.remote_name().to_string(),
        };

        let claimed = {
            let mut tables = self.tables.lock();
            if self.closed.load(Ordering::Acquire) {
                Some(Err(ChannelError::Cancelled))
            } else if let Some(stream) = tables.unclaimed.remove(&key) {
                Some(Ok(stream))
            } else if tables.pending.contains_key(&key) {
                Some(Err(ChannelError::HandshakeRejected(format!(
                    "a channel named {:?} is already pending",
                    key.local
                ))))
            } else {
                tables.pending.insert(key, chan.clone());
                None
            }
        };

        let connector = match chan.connector() {
            Some(c) => c.clone(),
            None => return,
        };
        match claimed {
            Some(Ok(stream)) => connector.deliver(Some(stream), None),
            Some(Err(e)) => {
                log::warn!("cannot register channel {}: {}", chan.local_name(), e);
                connector.deliver(None, Some(e));
            }
            None => {}
        }
    }

    /// Remove a pending channel and perform the explicit cancel-delivery.
    ///
    /// The delivery is made even when the entry was already consumed by a
    /// racing socket delivery; the connector ignores duplicates, and this
    /// guarantees a cancelled connector always completes.
    pub(crate) fn cancel_pending_channel(&self, chan: &Arc<Channel>) {
        let core = self.session.upgrade();
        let session_name = core.as_ref().map(|c| c.name().to_string()).unwrap_or_default();
        let key = PairKey {
            session: session_name,
            local: chan.local_name().to_string(),
            remote: chan.remote_name().to_string(),
        };

        self.tables.lock().pending.remove(&key);

        if let Some(connector) = chan.connector() {
            connector.deliver(None, Some(ChannelError::Cancelled));
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close the listener, drop parked sockets, and cancel-deliver every
    /// pending channel.
    pub(crate) fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.reactor.close_listener(self.listener);

        let (pending, unclaimed) = {
            let mut tables = self.tables.lock();
            (
                tables.pending.drain().collect::<Vec<_>>(),
                tables.unclaimed.drain().collect::<Vec<_>>(),
            )
        };

        for (_, stream) in unclaimed {
            self.reactor.close_stream(stream);
        }
        for (_, chan) in pending {
            if let Some(connector) = chan.connector() {
                connector.deliver(None, Some(ChannelError::Cancelled));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_swaps_names() {
        let identity = Identity {
            session_name: "sess".into(),
            session_id: 9,
            local_name: "A".into(),
            remote_name: "B".into(),
        };
        let key = PairKey::from_identity(&identity);

        // The client's remote name is the server channel's local name.
        assert_eq!(key.session, "sess");
        assert_eq!(key.local, "B");
        assert_eq!(key.remote, "A");
    }

    #[test]
    fn test_pair_key_equality() {
        let a = PairKey {
            session: "s".into(),
            local: "x".into(),
            remote: "y".into(),
        };
        let b = a.clone();
        assert_eq!(a, b);

        let c = PairKey {
            session: "s".into(),
            local: "y".into(),
            remote: "x".into(),
        };
        assert_ne!(a, c);
    }
}
