// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One-shot connection establishment.
//!
//! Each channel built inside a session owns a [`Connector`]: a state
//! machine that produces a handshake-complete socket exactly once, or
//! fails. Client mode walks
//!
//! ```text
//! Connecting -> RecvGreeting -> SendIdentity -> Complete(ok | err)
//!      ^             |               |
//!      +---- retry with backoff ----+
//! ```
//!
//! with unbounded retries on transport errors (initial delay 10 ms,
//! multiplied by 1.2 per failure, capped at 1000 ms). Only user cancel
//! terminates the retry loop. Server mode registers with the session's
//! acceptor and waits for a socket delivery.
//!
//! The first op of each pipeline parks its completion here; when the
//! connector completes, both pipelines resume (success) or fail fast
//! (error). All connector state is confined to its own strand.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::channel::{Channel, Direction};
use crate::error::ChannelError;
use crate::frame::{self, Identity};
use crate::op::{OpDone, OpResult};
use crate::reactor::{IoOutcome, Reactor, StreamId, TimerId};
use crate::session::SessionCore;
use crate::strand::{Executor, Strand};

/// Callback registered by `wait_for_connection` / `on_connect`.
pub(crate) type ConnectWaiter = Box<dyn FnOnce(Result<(), ChannelError>) + Send>;

/// Which side of the handshake this connector drives.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ConnectorMode {
    /// Dial the remote address and initiate the handshake.
    Client { remote_addr: SocketAddr },

    /// Wait for the session's acceptor to deliver a paired socket.
    Server,
}

struct ConnectorState {
    /// Transitions false -> true exactly once.
    complete: bool,

    /// Set by user cancel; observed by every in-flight continuation.
    cancelled: bool,

    /// Terminal error (set iff complete with no socket).
    error: Option<ChannelError>,

    /// Parked completion of the first send op.
    pending_send: Option<OpDone>,

    /// Parked completion of the first recv op.
    pending_recv: Option<OpDone>,

    /// User callbacks awaiting the connection result.
    waiters: Vec<ConnectWaiter>,

    /// Current retry delay in milliseconds.
    backoff_ms: f64,

    /// Socket of the in-flight connect attempt (client mode).
    attempt: Option<StreamId>,

    /// Retry timer, when one is scheduled.
    timer: Option<TimerId>,
}

/// One-shot state machine producing a connected, handshake-complete socket.
pub(crate) struct Connector {
    self_ref: Weak<Connector>,
    mode: ConnectorMode,
    identity: Identity,
    chan: Weak<Channel>,
    reactor: Arc<Reactor>,
    exec: Arc<Executor>,
    strand: Strand,
    backoff_factor: f64,
    max_backoff_ms: f64,
    state: Mutex<ConnectorState>,
}

impl Connector {
    pub(crate) fn new(
        chan: Weak<Channel>,
        core: &Arc<SessionCore>,
        local_name: String,
        remote_name: String,
        mode: ConnectorMode,
    ) -> Arc<Connector> {
        let config = core.config();
        Arc::new_cyclic(|weak| Connector {
            self_ref: weak.clone(),
            mode,
            identity: Identity {
                session_name: core.name().to_string(),
                session_id: core.session_id(),
                local_name,
                remote_name,
            },
            chan,
            reactor: core.reactor().clone(),
            exec: core.executor().clone(),
            strand: Strand::new(core.executor().clone()),
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff.as_millis() as f64,
            state: Mutex::new(ConnectorState {
                complete: false,
                cancelled: false,
                error: None,
                pending_send: None,
                pending_recv: None,
                waiters: Vec::new(),
                backoff_ms: config.initial_backoff.as_millis() as f64,
                attempt: None,
                timer: None,
            }),
        })
    }

    fn arc(&self) -> Arc<Connector> {
        self.self_ref.upgrade().expect("connector is alive")
    }

    /// Kick off connection establishment (client mode dials; server mode
    /// waits for the acceptor).
    pub(crate) fn start(&self) {
        if let ConnectorMode::Client { .. } = self.mode {
            let this = self.arc();
            self.strand.dispatch(move || this.connect_once());
        }
    }

    /// Completion state: `(complete, error)`.
    pub(crate) fn completion(&self) -> (bool, Option<ChannelError>) {
        let st = self.state.lock();
        (st.complete, st.error.clone())
    }

    // ========================================================================
    // Client path (all continuations run on the connector strand)
    // ========================================================================

    fn connect_once(&self) {
        let addr = match self.mode {
            ConnectorMode::Client { remote_addr } => remote_addr,
            ConnectorMode::Server => return,
        };

        let mut st = self.state.lock();
        if st.cancelled {
            self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
            return;
        }

        log::debug!("connecting to {}", addr);
        let this = self.arc();
        let id = self.reactor.connect(
            addr,
            Box::new(move |res| {
                let strand = this.strand.clone();
                strand.dispatch(move || this.on_connect_result(res));
            }),
        );
        st.attempt = Some(id);
    }

    fn on_connect_result(&self, res: io::Result<StreamId>) {
        let mut st = self.state.lock();

        if st.cancelled {
            if let Ok(id) = &res {
                self.reactor.close_stream(*id);
            }
            st.attempt = None;
            self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
            return;
        }

        match res {
            Err(e) => {
                st.attempt = None;
                self.retry_locked(&mut st, e);
            }
            Ok(id) => {
                st.attempt = Some(id);
                drop(st);
                self.await_greeting(id);
            }
        }
    }

    fn await_greeting(&self, id: StreamId) {
        let this = self.arc();
        self.reactor.recv_exact(
            id,
            1,
            Box::new(move |out| {
                let strand = this.strand.clone();
                strand.dispatch(move || this.on_greeting(id, out));
            }),
        );
    }

    fn on_greeting(&self, id: StreamId, out: IoOutcome) {
        let mut st = self.state.lock();

        if st.cancelled {
            self.reactor.close_stream(id);
            st.attempt = None;
            self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
            return;
        }

        if let Some(e) = out.err {
            self.retry_locked(&mut st, e);
            return;
        }

        if out.data[0] != frame::GREETING {
            // A peer that is not speaking this protocol. Give up quietly
            // instead of hammering it with retries.
            log::debug!("unexpected greeting byte 0x{:02x} from server", out.data[0]);
            self.reactor.close_stream(id);
            st.attempt = None;
            self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
            return;
        }

        drop(st);
        self.send_identity(id);
    }

    fn send_identity(&self, id: StreamId) {
        let buf = frame::encode(self.identity.to_wire().as_bytes());
        let this = self.arc();
        self.reactor.send_all(
            id,
            buf,
            Box::new(move |out| {
                let strand = this.strand.clone();
                strand.dispatch(move || this.on_identity_sent(id, out));
            }),
        );
    }

    fn on_identity_sent(&self, id: StreamId, out: IoOutcome) {
        let mut st = self.state.lock();

        if st.cancelled {
            self.reactor.close_stream(id);
            st.attempt = None;
            self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
            return;
        }

        if let Some(e) = out.err {
            // Connects occasionally succeed and then break on the first
            // write; retrying the whole attempt recovers.
            log::debug!("failed to send identity, retrying: {}", e);
            self.retry_locked(&mut st, e);
            return;
        }

        log::debug!(
            "connected: {} ({} -> {})",
            self.identity.session_name,
            self.identity.local_name,
            self.identity.remote_name
        );
        st.attempt = None;
        self.set_socket_locked(&mut st, Some(id), None);
    }

    /// Close the failed attempt and schedule the next one.
    fn retry_locked(&self, st: &mut ConnectorState, err: io::Error) {
        if let Some(id) = st.attempt.take() {
            self.reactor.close_stream(id);
        }

        let delay_ms = st.backoff_ms as u64;
        st.backoff_ms = (st.backoff_ms * self.backoff_factor).min(self.max_backoff_ms);

        if st.backoff_ms >= self.max_backoff_ms {
            match err.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionAborted => {}
                _ => log::error!("client socket connect error: {}", err),
            }
        }
        log::debug!("retrying connect in {} ms ({})", delay_ms, err);

        let this = self.arc();
        st.timer = Some(
            self.reactor
                .schedule(Duration::from_millis(delay_ms), move || {
                    let strand = this.strand.clone();
                    strand.dispatch(move || this.on_retry_timer());
                }),
        );
    }

    fn on_retry_timer(&self) {
        {
            let mut st = self.state.lock();
            st.timer = None;
            if st.cancelled {
                self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
                return;
            }
        }
        self.connect_once();
    }

    // ========================================================================
    // Completion discipline
    // ========================================================================

    /// Deliver the final socket (or failure) from either path. Runs on the
    /// connector strand.
    fn set_socket_locked(
        &self,
        st: &mut ConnectorState,
        socket: Option<StreamId>,
        err: Option<ChannelError>,
    ) {
        let mut socket = socket;
        let mut err = err;

        if st.cancelled {
            if let Some(id) = socket.take() {
                match self.mode {
                    ConnectorMode::Client { .. } => {
                        // The cancel raced a successful connect; the socket
                        // is of no use now.
                        self.reactor.close_stream(id);
                        err = Some(ChannelError::Cancelled);
                    }
                    ConnectorMode::Server => {
                        // The acceptor delivered concurrently with cancel.
                        // Drop this socket and wait for the acceptor's
                        // explicit cancel-delivery.
                        self.reactor.close_stream(id);
                        return;
                    }
                }
            }
            if err.is_none() {
                err = Some(ChannelError::Cancelled);
            }
        }

        if st.complete {
            if let Some(id) = socket {
                self.reactor.close_stream(id);
            }
            log::debug!("connector already complete; ignoring duplicate delivery");
            return;
        }

        st.complete = true;
        st.error = err;

        match self.chan.upgrade() {
            Some(chan) => {
                if let Some(id) = socket {
                    chan.install_socket(id);
                }
            }
            None => {
                if let Some(id) = socket {
                    self.reactor.close_stream(id);
                }
            }
        }

        let result: Result<(), ChannelError> = match &st.error {
            None => Ok(()),
            Some(e) => Err(e.clone()),
        };
        for waiter in st.waiters.drain(..) {
            let r = result.clone();
            self.exec.post(Box::new(move || waiter(r)));
        }

        if let Some(done) = st.pending_send.take() {
            done(Self::pipeline_result(&st.error));
        }
        if let Some(done) = st.pending_recv.take() {
            done(Self::pipeline_result(&st.error));
        }
    }

    fn pipeline_result(error: &Option<ChannelError>) -> OpResult {
        match error {
            None => OpResult::ok(0),
            Some(e) => OpResult::failed(e.clone(), 0),
        }
    }

    /// Acceptor-side delivery (server success, or explicit cancel-delivery).
    pub(crate) fn deliver(&self, socket: Option<StreamId>, err: Option<ChannelError>) {
        let this = self.arc();
        self.strand.dispatch(move || {
            let mut st = this.state.lock();
            this.set_socket_locked(&mut st, socket, err);
        });
    }

    /// Park the completion of a pipeline's start sentinel. Fires
    /// immediately when the connector is already complete.
    pub(crate) fn park(&self, dir: Direction, done: OpDone) {
        let this = self.arc();
        self.strand.dispatch(move || {
            let mut st = this.state.lock();
            if st.complete {
                let res = Self::pipeline_result(&st.error);
                drop(st);
                done(res);
                return;
            }
            match dir {
                Direction::Send => st.pending_send = Some(done),
                Direction::Recv => st.pending_recv = Some(done),
            }
        });
    }

    /// Register a callback for the connection result.
    pub(crate) fn add_waiter(&self, waiter: ConnectWaiter) {
        let this = self.arc();
        self.strand.dispatch(move || {
            let mut st = this.state.lock();
            if st.complete {
                let result = match &st.error {
                    None => Ok(()),
                    Some(e) => Err(e.clone()),
                };
                drop(st);
                this.exec.post(Box::new(move || waiter(result)));
            } else {
                st.waiters.push(waiter);
            }
        });
    }

    /// User cancel. Terminates retries; the in-flight continuation (or the
    /// acceptor's cancel-delivery) completes the connector with
    /// `Cancelled`.
    pub(crate) fn cancel(&self) {
        let this = self.arc();
        self.strand.dispatch(move || this.cancel_on_strand());
    }

    fn cancel_on_strand(&self) {
        let mut st = self.state.lock();
        if st.complete || st.cancelled {
            return;
        }
        st.cancelled = true;
        log::debug!(
            "cancelling connector ({} -> {})",
            self.identity.local_name,
            self.identity.remote_name
        );

        match self.mode {
            ConnectorMode::Server => {
                drop(st);
                let chan = self.chan.upgrade();
                let acceptor = chan
                    .as_ref()
                    .and_then(|c| c.session_core())
                    .and_then(|core| core.acceptor().cloned());
                match (chan, acceptor) {
                    (Some(chan), Some(acceptor)) => acceptor.cancel_pending_channel(&chan),
                    _ => {
                        // No acceptor to deliver the cancel; complete here.
                        let mut st = self.state.lock();
                        self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
                    }
                }
            }
            ConnectorMode::Client { .. } => {
                if let Some(id) = st.attempt.take() {
                    // Aborting the in-flight attempt makes its continuation
                    // observe the cancel and finish the connector.
                    self.reactor.close_stream(id);
                } else if let Some(timer) = st.timer.take() {
                    if self.reactor.cancel_timer(timer) {
                        self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
                    }
                    // Lost the race: the timer callback is already queued
                    // and will observe `cancelled`.
                } else {
                    self.set_socket_locked(&mut st, None, Some(ChannelError::Cancelled));
                }
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
    fn test_backoff_progression() {
        // Mirrors retry_locked: the delay used is the value before the
        // multiplication, capped at the maximum.
        let mut backoff: f64 = 10.0;
        let mut delays = Vec::new();
        for _ in 0..40 {
            delays.push(backoff as u64);
            backoff = (backoff * 1.2).min(1000.0);
        }

        // Non-decreasing and bounded.
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert!(delays.iter().all(|&d| d <= 1000));
        // The cap is reached within the attempts above.
        assert_eq!(*delays.last().unwrap(), 1000);
    }

    #[test]
    fn test_pipeline_result_mapping() {
        let ok = Connector::pipeline_result(&None);
        assert!(matches!(ok.status, crate::op::OpStatus::Ok));

        let err = Connector::pipeline_result(&Some(ChannelError::Cancelled));
        assert!(matches!(
            err.status,
            crate::op::OpStatus::Failed(ChannelError::Cancelled)
        ));
    }
}
