// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The channel: two serial pipelines over one socket.
//!
//! A [`Channel`] is a bidirectional, reliable, ordered message pipe between
//! two named endpoints of a session. Send and recv each own a FIFO queue of
//! operations and a strand; at most one op per direction runs against the
//! socket at a time, and completions fire in enqueue order. The two
//! directions progress independently and meet only at the close rendezvous.
//!
//! ```text
//! user thread            send strand               reactor
//!    |  send(op)             |                        |
//!    +---------------------> | push, drive            |
//!    |                       +----------------------> | write frame
//!    |                       | <----------------------+ completion
//!    |   op callback  <------+ pop, drive next        |
//! ```
//!
//! Close pushes a terminal sentinel onto both queues and lets them drain;
//! cancel closes the socket first so in-flight transfers abort, then drops
//! the queued ops with a cancellation error. Whichever pipeline reaches its
//! sentinel second fires the close callback, exactly once.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::channel::bounded;
use parking_lot::Mutex;

use crate::config::ChannelConfig;
use crate::connector::{Connector, ConnectorMode};
use crate::error::ChannelError;
use crate::op::{
    CloseOp, OpResult, OpStatus, RecvOp, SendOp, StartRecvOp, StartSendOp, TransferOp,
};
use crate::reactor::{Reactor, StreamId};
use crate::session::{IoCore, SessionCore};
use crate::stats::ChannelStats;
use crate::strand::Strand;

// ============================================================================
// Status and direction
// ============================================================================

/// Coarse channel lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// Operating normally.
    Normal,

    /// Graceful close in progress.
    Closing,

    /// Abrupt cancel in progress.
    Cancelling,

    /// Closed after draining.
    Closed,

    /// Terminated by cancel.
    Cancelled,
}

impl Status {
    /// True once close or cancel has begun.
    pub fn is_stopped(&self) -> bool {
        *self != Status::Normal
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Normal => "Normal",
            Status::Closing => "Closing",
            Status::Cancelling => "Cancelling",
            Status::Closed => "Closed",
            Status::Cancelled => "Cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Pipeline direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    Send,
    Recv,
}

// ============================================================================
// Pipeline
// ============================================================================

struct PipeState {
    queue: std::collections::VecDeque<Box<dyn TransferOp>>,

    /// True when no op currently owns the socket in this direction.
    idle: bool,

    /// Once set, dequeued ops are cancelled rather than executed.
    cancelling: bool,
}

struct Pipeline {
    strand: Strand,
    state: Mutex<PipeState>,
}

impl Pipeline {
    fn new(strand: Strand) -> Pipeline {
        Pipeline {
            strand,
            state: Mutex::new(PipeState {
                queue: std::collections::VecDeque::new(),
                idle: true,
                cancelling: false,
            }),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// A bidirectional, reliable, ordered message pipe.
///
/// Channels are created through [`Session::channel`] or
/// [`Channel::from_stream`] and shared as `Arc<Channel>`; internal
/// callbacks hold strong references, so a channel lives until its work has
/// drained. Call [`Channel::close`] (or `cancel`) when done with it.
///
/// [`Session::channel`]: crate::Session::channel
pub struct Channel {
    self_ref: Weak<Channel>,
    local_name: String,
    remote_name: String,
    session_name: String,
    session: Weak<SessionCore>,
    reactor: Arc<Reactor>,
    config: ChannelConfig,
    stats: ChannelStats,
    socket: Mutex<Option<StreamId>>,
    connector: Option<Arc<Connector>>,
    send: Pipeline,
    recv: Pipeline,
    status: Mutex<Status>,
    close_count: AtomicUsize,
    close_done: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Channel {
    // ========================================================================
    // Construction
    // ========================================================================

    /// Build a channel that establishes its socket through a connector.
    pub(crate) fn with_connector(
        core: &Arc<SessionCore>,
        local_name: String,
        remote_name: String,
        mode: ConnectorMode,
    ) -> Arc<Channel> {
        let chan = Arc::new_cyclic(|weak: &Weak<Channel>| {
            let connector = Connector::new(
                weak.clone(),
                core,
                local_name.clone(),
                remote_name.clone(),
                mode,
            );
            Channel {
                self_ref: weak.clone(),
                local_name,
                remote_name,
                session_name: core.name().to_string(),
                session: Arc::downgrade(core),
                reactor: core.reactor().clone(),
                config: core.config().clone(),
                stats: ChannelStats::new(),
                socket: Mutex::new(None),
                connector: Some(connector),
                send: Pipeline::new(Strand::new(core.executor().clone())),
                recv: Pipeline::new(Strand::new(core.executor().clone())),
                status: Mutex::new(Status::Normal),
                close_count: AtomicUsize::new(0),
                close_done: Mutex::new(None),
            }
        });

        let connector = chan
            .connector
            .as_ref()
            .expect("connector installed at construction")
            .clone();
        connector.start();

        // The start sentinels hold both queues until the handshake is done.
        chan.enqueue_send(Box::new(StartSendOp::new(connector.clone())));
        chan.enqueue_recv(Box::new(StartRecvOp::new(connector)));

        chan
    }

    /// Wrap an already-connected stream. No connector is installed; the
    /// pipelines start immediately and [`Channel::is_connected`] is true.
    pub fn from_stream(io: &IoCore, stream: std::net::TcpStream) -> io::Result<Arc<Channel>> {
        let id = io.reactor().adopt_stream(stream)?;
        Ok(Arc::new_cyclic(|weak: &Weak<Channel>| Channel {
            self_ref: weak.clone(),
            local_name: String::new(),
            remote_name: String::new(),
            session_name: String::new(),
            session: Weak::new(),
            reactor: io.reactor().clone(),
            config: io.config().clone(),
            stats: ChannelStats::new(),
            socket: Mutex::new(Some(id)),
            connector: None,
            send: Pipeline::new(Strand::new(io.executor().clone())),
            recv: Pipeline::new(Strand::new(io.executor().clone())),
            status: Mutex::new(Status::Normal),
            close_count: AtomicUsize::new(0),
            close_done: Mutex::new(None),
        }))
    }

    fn handle(&self) -> Arc<Channel> {
        self.self_ref.upgrade().expect("channel is alive")
    }

    fn pipeline(&self, dir: Direction) -> &Pipeline {
        match dir {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    // ========================================================================
    // Names and state
    // ========================================================================

    /// This endpoint's channel name.
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// The peer endpoint's channel name.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Current lifecycle state.
    pub fn status(&self) -> Status {
        *self.status.lock()
    }

    /// True iff there is no connector, or it completed without error.
    pub fn is_connected(&self) -> bool {
        match &self.connector {
            None => true,
            Some(c) => {
                let (complete, error) = c.completion();
                complete && error.is_none()
            }
        }
    }

    // ========================================================================
    // Data transfer
    // ========================================================================

    /// Queue a send of one sized buffer. Returns immediately; `on_done`
    /// fires with the payload length on success.
    pub fn send(
        &self,
        payload: Vec<u8>,
        on_done: impl FnOnce(Result<u64, ChannelError>) + Send + 'static,
    ) {
        self.enqueue_send(Box::new(SendOp::new(payload, on_done)));
    }

    /// Queue a recv of one sized buffer. Returns immediately; `on_done`
    /// fires with the received payload.
    pub fn recv(&self, on_done: impl FnOnce(Result<Vec<u8>, ChannelError>) + Send + 'static) {
        self.enqueue_recv(Box::new(RecvOp::new(on_done)));
    }

    /// Queue an arbitrary send-side operation.
    pub fn enqueue_send(&self, op: Box<dyn TransferOp>) {
        self.enqueue(Direction::Send, op);
    }

    /// Queue an arbitrary recv-side operation.
    pub fn enqueue_recv(&self, op: Box<dyn TransferOp>) {
        self.enqueue(Direction::Recv, op);
    }

    fn enqueue(&self, dir: Direction, op: Box<dyn TransferOp>) {
        self.pipeline(dir).state.lock().queue.push_back(op);

        let chan = self.handle();
        self.pipeline(dir).strand.dispatch(move || {
            let start = {
                let mut st = chan.pipeline(dir).state.lock();
                if !st.queue.is_empty() && st.idle {
                    st.idle = false;
                    true
                } else {
                    false
                }
            };
            if start {
                chan.drive(dir);
            }
        });
    }

    /// Execute or cancel the front op. Must run on the pipeline's strand
    /// while this pipeline is non-idle.
    fn drive(&self, dir: Direction) {
        let pipe = self.pipeline(dir);
        let mut st = pipe.state.lock();
        let cancelling = st.cancelling;

        let front = match st.queue.front_mut() {
            Some(front) => front,
            None => {
                st.idle = true;
                return;
            }
        };

        let chan = self.handle();
        let strand = pipe.strand.clone();
        if cancelling {
            let done: Box<dyn FnOnce(OpResult) + Send> = Box::new(move |res| {
                strand.dispatch(move || chan.cancel_completed(dir, res));
            });
            front.cancel(&self.handle(), done);
        } else {
            let done: Box<dyn FnOnce(OpResult) + Send> = Box::new(move |res| {
                strand.dispatch(move || chan.op_completed(dir, res));
            });
            front.perform(&self.handle(), done);
        }
    }

    /// Completion of a performed op. Runs on the pipeline's strand.
    fn op_completed(&self, dir: Direction, res: OpResult) {
        match dir {
            Direction::Send => self.stats.record_sent(res.bytes),
            Direction::Recv => self.stats.record_received(res.bytes),
        }

        let pipe = self.pipeline(dir);
        let mut st = pipe.state.lock();
        st.queue.pop_front();

        match res.status {
            OpStatus::Ok => {
                if st.queue.is_empty() {
                    st.idle = true;
                } else {
                    drop(st);
                    self.drive(dir);
                }
            }
            OpStatus::Closed => {
                drop(st);
                self.arrive_at_close();
            }
            OpStatus::Failed(err) => {
                st.cancelling = true;
                drop(st);
                self.log_transfer_error(dir, &err);
                self.drive(dir);
            }
        }
    }

    /// Completion of a cancelled op. Runs on the pipeline's strand.
    fn cancel_completed(&self, dir: Direction, res: OpResult) {
        let pipe = self.pipeline(dir);
        let mut st = pipe.state.lock();
        st.queue.pop_front();

        // Only the terminal sentinel counts toward the rendezvous, and only
        // the second arrival fires the close callback.
        let arrived_second = matches!(res.status, OpStatus::Closed)
            && self.close_count.fetch_add(1, Ordering::AcqRel) == 1;

        if arrived_second {
            drop(st);
            self.finish_close();
        } else if st.queue.is_empty() {
            st.idle = true;
        } else {
            drop(st);
            self.drive(dir);
        }
    }

    /// One pipeline has drained through its terminal sentinel; the second
    /// arrival fires the close callback.
    fn arrive_at_close(&self) {
        if self.close_count.fetch_add(1, Ordering::AcqRel) == 1 {
            self.finish_close();
        }
    }

    fn finish_close(&self) {
        {
            let mut status = self.status.lock();
            *status = match *status {
                Status::Cancelling => Status::Cancelled,
                _ => Status::Closed,
            };
        }

        if let Some(stream) = self.socket.lock().take() {
            self.reactor.close_stream(stream);
        }

        let done = self.close_done.lock().take();
        if let Some(done) = done {
            done();
        }

        log::debug!(
            "channel {} -> {} {}",
            self.local_name,
            self.remote_name,
            self.status()
        );
    }

    fn log_transfer_error(&self, dir: Direction, err: &ChannelError) {
        if err.is_cancelled() {
            log::debug!("transfer aborted ({} -> {})", self.local_name, self.remote_name);
            return;
        }
        match dir {
            Direction::Send => log::error!("network send error: {}", err),
            Direction::Recv => log::error!(
                "network receive error ({} {} -> {}): {}",
                self.session_name,
                self.remote_name,
                self.local_name,
                err
            ),
        }
    }

    // ========================================================================
    // Connection waiting
    // ========================================================================

    /// Block until the handshake completes.
    ///
    /// Returns `Ok(true)` on success, `Ok(false)` on timeout (`None` waits
    /// indefinitely), and `Err` on terminal connect failure. Must not be
    /// called from a completion callback.
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> Result<bool, ChannelError> {
        let connector = match &self.connector {
            Some(c) => c.clone(),
            None => return Ok(true),
        };

        let (tx, rx) = bounded(1);
        connector.add_waiter(Box::new(move |res| {
            let _ = tx.send(res);
        }));

        let result = match timeout {
            Some(t) => match rx.recv_timeout(t) {
                Ok(r) => r,
                Err(_) => return Ok(false),
            },
            None => match rx.recv() {
                Ok(r) => r,
                Err(_) => return Ok(false),
            },
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) => Err(ChannelError::ConnectFailed(e.to_string())),
        }
    }

    /// Register a callback for the connection result. Fires immediately
    /// with success when the channel has no connector.
    pub fn on_connect(&self, handle: impl FnOnce(Result<(), ChannelError>) + Send + 'static) {
        match &self.connector {
            Some(c) => c.add_waiter(Box::new(handle)),
            None => handle(Ok(())),
        }
    }

    // ========================================================================
    // Close and cancel
    // ========================================================================

    /// Graceful close: queued ops complete naturally, then the channel
    /// tears down. Blocks the calling thread; must not be called from a
    /// completion callback.
    pub fn close(&self) {
        let (tx, rx) = bounded(1);
        self.async_close(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Abrupt cancel: the in-flight op is aborted and queued ops are
    /// dropped with a cancellation error. Blocks the calling thread.
    pub fn cancel(&self) {
        let (tx, rx) = bounded(1);
        self.async_cancel(move || {
            let _ = tx.send(());
        });
        let _ = rx.recv();
    }

    /// Asynchronous graceful close; `done` fires once both pipelines have
    /// drained.
    pub fn async_close(&self, done: impl FnOnce() + Send + 'static) {
        {
            let mut status = self.status.lock();
            if status.is_stopped() {
                if matches!(*status, Status::Closing | Status::Cancelling) {
                    log::warn!(
                        "close requested on a channel that is already {}",
                        *status
                    );
                }
                drop(status);
                done();
                return;
            }
            *status = Status::Closing;
        }

        *self.close_done.lock() = Some(Box::new(done));

        self.enqueue_send(Box::new(CloseOp::new()));
        self.enqueue_recv(Box::new(CloseOp::new()));
    }

    /// Asynchronous cancel; `done` fires once both pipelines have drained.
    pub fn async_cancel(&self, done: impl FnOnce() + Send + 'static) {
        {
            let mut status = self.status.lock();
            if status.is_stopped() {
                if matches!(*status, Status::Closing | Status::Cancelling) {
                    log::warn!(
                        "cancel requested on a channel that is already {}",
                        *status
                    );
                }
                drop(status);
                done();
                return;
            }
            *status = Status::Cancelling;
        }

        *self.close_done.lock() = Some(Box::new(done));

        // Closing the socket now makes any in-flight transfer abort.
        if let Some(stream) = self.socket.lock().take() {
            self.reactor.close_stream(stream);
        }

        for dir in [Direction::Send, Direction::Recv] {
            let chan = self.handle();
            self.pipeline(dir).strand.dispatch(move || chan.begin_cancel(dir));
        }
    }

    /// Runs on the pipeline's strand: install the terminal sentinel and
    /// start cancelling.
    fn begin_cancel(&self, dir: Direction) {
        let pipe = self.pipeline(dir);
        let mut st = pipe.state.lock();
        st.queue.push_back(Box::new(CloseOp::new()));
        st.cancelling = true;

        if st.idle {
            st.idle = false;
            drop(st);
            self.drive(dir);
        } else if let Some(front) = st.queue.front_mut() {
            // An op is in flight against the socket; give it a nudge in
            // case closing the socket was not enough.
            front.cancel_pending(&self.handle());
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Total payload bytes sent, read coherently through the send strand.
    pub fn total_sent(&self) -> u64 {
        let (tx, rx) = bounded(1);
        let chan = self.handle();
        self.send.strand.dispatch(move || {
            let _ = tx.send(chan.stats.bytes_sent());
        });
        // Raw fallback in case the executor is already gone.
        rx.recv_timeout(Duration::from_secs(1))
            .unwrap_or_else(|_| self.stats.bytes_sent())
    }

    /// Total payload bytes received, read coherently through the recv
    /// strand.
    pub fn total_received(&self) -> u64 {
        let (tx, rx) = bounded(1);
        let chan = self.handle();
        self.recv.strand.dispatch(move || {
            let _ = tx.send(chan.stats.bytes_received());
        });
        // Raw fallback in case the executor is already gone.
        rx.recv_timeout(Duration::from_secs(1))
            .unwrap_or_else(|_| self.stats.bytes_received())
    }

    /// Zero the byte counters. By contract this is called on an idle
    /// channel; no strand synchronization is performed.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Raw snapshot of both counters, without strand synchronization.
    pub fn stats(&self) -> crate::stats::StatsSnapshot {
        self.stats.snapshot()
    }

    // ========================================================================
    // Internal accessors
    // ========================================================================

    pub(crate) fn stream_id(&self) -> Option<StreamId> {
        *self.socket.lock()
    }

    pub(crate) fn install_socket(&self, id: StreamId) {
        *self.socket.lock() = Some(id);
    }

    pub(crate) fn reactor_handle(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    pub(crate) fn strand_for(&self, dir: Direction) -> Strand {
        self.pipeline(dir).strand.clone()
    }

    pub(crate) fn max_message_size(&self) -> usize {
        self.config.max_message_size
    }

    pub(crate) fn session_core(&self) -> Option<Arc<SessionCore>> {
        self.session.upgrade()
    }

    pub(crate) fn connector(&self) -> Option<&Arc<Connector>> {
        self.connector.as_ref()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_name", &self.local_name)
            .field("remote_name", &self.remote_name)
            .field("session_name", &self.session_name)
            .field("status", &self.status())
            .field("connected", &self.is_connected())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Normal.to_string(), "Normal");
        assert_eq!(Status::Closing.to_string(), "Closing");
        assert_eq!(Status::Cancelling.to_string(), "Cancelling");
        assert_eq!(Status::Closed.to_string(), "Closed");
        assert_eq!(Status::Cancelled.to_string(), "Cancelled");
    }

    #[test]
    fn test_status_is_stopped() {
        assert!(!Status::Normal.is_stopped());
        assert!(Status::Closing.is_stopped());
        assert!(Status::Cancelling.is_stopped());
        assert!(Status::Closed.is_stopped());
        assert!(Status::Cancelled.is_stopped());
    }
}
