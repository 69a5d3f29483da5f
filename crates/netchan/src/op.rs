// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Queued transfer operations.
//!
//! Everything a channel pipeline executes satisfies [`TransferOp`]. Three
//! families exist:
//!
//! - [`SendOp`] / [`RecvOp`]: user operations moving one sized buffer
//!   (`u32`-LE length prefix, then the payload).
//! - `StartSendOp` / `StartRecvOp`: the first entry of each queue. They
//!   park their completion on the connector so no user data moves before
//!   the handshake finishes.
//! - `CloseOp`: the terminal sentinel pushed by close/cancel. It completes
//!   with [`OpStatus::Closed`], which is the drain marker the close
//!   rendezvous counts.
//!
//! An op's completion fires exactly once, with success, cancellation, or a
//! transport error. User callbacks run on the pipeline's strand and are
//! panic-trapped so they cannot unwind into a worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::channel::{Channel, Direction};
use crate::connector::Connector;
use crate::error::ChannelError;
use crate::frame;

// ============================================================================
// Contract
// ============================================================================

/// What kind of queue entry an op is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// Ordinary user operation.
    User,

    /// Start sentinel awaiting the connector.
    Start,

    /// Terminal drain marker.
    Close,
}

/// How an op finished.
#[derive(Debug)]
pub enum OpStatus {
    /// Completed against the socket.
    Ok,

    /// The terminal drain marker was reached. Reserved for `CloseOp`; the
    /// close rendezvous counts these.
    Closed,

    /// The op failed or was dropped during queue cancellation.
    Failed(ChannelError),
}

/// Completion value handed back to the pipeline.
#[derive(Debug)]
pub struct OpResult {
    /// Final status.
    pub status: OpStatus,

    /// Payload bytes moved (framing excluded).
    pub bytes: u64,
}

impl OpResult {
    /// Successful completion moving `bytes` payload bytes.
    pub fn ok(bytes: u64) -> Self {
        OpResult {
            status: OpStatus::Ok,
            bytes,
        }
    }

    /// Terminal drain marker.
    pub fn closed() -> Self {
        OpResult {
            status: OpStatus::Closed,
            bytes: 0,
        }
    }

    /// Failure after moving `bytes` payload bytes.
    pub fn failed(err: ChannelError, bytes: u64) -> Self {
        OpResult {
            status: OpStatus::Failed(err),
            bytes,
        }
    }
}

/// Pipeline completion callback; invoked exactly once per op.
pub type OpDone = Box<dyn FnOnce(OpResult) + Send>;

/// A unit of send or recv work queued on a channel pipeline.
pub trait TransferOp: Send {
    /// Execute against the connected socket. `done` must be invoked exactly
    /// once.
    fn perform(&mut self, chan: &Arc<Channel>, done: OpDone);

    /// Abort an op that was never performed (queue cancellation). `done`
    /// must be invoked exactly once.
    fn cancel(&mut self, chan: &Arc<Channel>, done: OpDone);

    /// Advisory: nudge an in-flight op to finish early. The socket is
    /// usually already closed when this is called.
    fn cancel_pending(&mut self, chan: &Arc<Channel>);

    /// Type tag.
    fn kind(&self) -> OpKind;
}

/// Run a user callback, trapping panics so they cannot unwind into the
/// executor.
pub(crate) fn run_user_callback(f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("user completion callback panicked");
    }
}

// ============================================================================
// SendOp
// ============================================================================

/// User callback for a send: payload bytes written, or the failure.
pub type SendCallback = Box<dyn FnOnce(Result<u64, ChannelError>) + Send>;

/// Sends one sized buffer.
pub struct SendOp {
    payload: Option<Vec<u8>>,
    on_done: Option<SendCallback>,
}

impl SendOp {
    /// Create a send op owning `payload`.
    pub fn new(
        payload: Vec<u8>,
        on_done: impl FnOnce(Result<u64, ChannelError>) + Send + 'static,
    ) -> SendOp {
        SendOp {
            payload: Some(payload),
            on_done: Some(Box::new(on_done)),
        }
    }

    fn finish(
        chan: &Arc<Channel>,
        user: Option<SendCallback>,
        done: OpDone,
        result: OpResult,
        user_result: Result<u64, ChannelError>,
    ) {
        let strand = chan.strand_for(Direction::Send);
        strand.dispatch(move || {
            // Queue the pipeline continuation first so byte accounting is
            // already ordered ahead of anything the user callback triggers.
            done(result);
            if let Some(cb) = user {
                run_user_callback(move || cb(user_result));
            }
        });
    }
}

impl TransferOp for SendOp {
    fn perform(&mut self, chan: &Arc<Channel>, done: OpDone) {
        let payload = self.payload.take().unwrap_or_default();
        let payload_len = payload.len() as u64;
        let user = self.on_done.take();

        let stream = match chan.stream_id() {
            Some(s) => s,
            None => {
                Self::finish(
                    chan,
                    user,
                    done,
                    OpResult::failed(ChannelError::Closed, 0),
                    Err(ChannelError::Closed),
                );
                return;
            }
        };

        let frame = frame::encode(&payload);
        let chan2 = chan.clone();
        chan.reactor_handle().send_all(
            stream,
            frame,
            Box::new(move |out| {
                // Frame header bytes are bookkeeping, not payload.
                let payload_bytes = (out.bytes.saturating_sub(frame::HEADER_SIZE)) as u64;
                match out.err {
                    None => Self::finish(
                        &chan2,
                        user,
                        done,
                        OpResult::ok(payload_len),
                        Ok(payload_len),
                    ),
                    Some(e) => {
                        let err = ChannelError::from(e);
                        Self::finish(
                            &chan2,
                            user,
                            done,
                            OpResult::failed(err.clone(), payload_bytes),
                            Err(err),
                        );
                    }
                }
            }),
        );
    }

    fn cancel(&mut self, chan: &Arc<Channel>, done: OpDone) {
        let user = self.on_done.take();
        Self::finish(
            chan,
            user,
            done,
            OpResult::failed(ChannelError::Closed, 0),
            Err(ChannelError::Closed),
        );
    }

    fn cancel_pending(&mut self, _chan: &Arc<Channel>) {
        // Closing the socket aborts the in-flight transfer; nothing to do.
    }

    fn kind(&self) -> OpKind {
        OpKind::User
    }
}

// ============================================================================
// RecvOp
// ============================================================================

/// User callback for a recv: the received payload, or the failure.
pub type RecvCallback = Box<dyn FnOnce(Result<Vec<u8>, ChannelError>) + Send>;

/// Receives one sized buffer.
pub struct RecvOp {
    on_done: Option<RecvCallback>,
}

impl RecvOp {
    /// Create a recv op.
    pub fn new(on_done: impl FnOnce(Result<Vec<u8>, ChannelError>) + Send + 'static) -> RecvOp {
        RecvOp {
            on_done: Some(Box::new(on_done)),
        }
    }

    fn finish(
        chan: &Arc<Channel>,
        user: Option<RecvCallback>,
        done: OpDone,
        result: OpResult,
        user_result: Result<Vec<u8>, ChannelError>,
    ) {
        let strand = chan.strand_for(Direction::Recv);
        strand.dispatch(move || {
            // Queue the pipeline continuation first so byte accounting is
            // already ordered ahead of anything the user callback triggers.
            done(result);
            if let Some(cb) = user {
                run_user_callback(move || cb(user_result));
            }
        });
    }
}

impl TransferOp for RecvOp {
    fn perform(&mut self, chan: &Arc<Channel>, done: OpDone) {
        let user = self.on_done.take();

        let stream = match chan.stream_id() {
            Some(s) => s,
            None => {
                Self::finish(
                    chan,
                    user,
                    done,
                    OpResult::failed(ChannelError::Closed, 0),
                    Err(ChannelError::Closed),
                );
                return;
            }
        };

        let chan2 = chan.clone();
        chan.reactor_handle().recv_exact(
            stream,
            frame::HEADER_SIZE,
            Box::new(move |out| {
                if let Some(e) = out.err {
                    let err = ChannelError::from(e);
                    Self::finish(
                        &chan2,
                        user,
                        done,
                        OpResult::failed(err.clone(), 0),
                        Err(err),
                    );
                    return;
                }

                let len = frame::decode_len(&out.data);
                let limit = chan2.max_message_size();
                if len > limit {
                    let err = ChannelError::Oversize { size: len, limit };
                    Self::finish(
                        &chan2,
                        user,
                        done,
                        OpResult::failed(err.clone(), 0),
                        Err(err),
                    );
                    return;
                }

                if len == 0 {
                    Self::finish(&chan2, user, done, OpResult::ok(0), Ok(Vec::new()));
                    return;
                }

                let chan3 = chan2.clone();
                chan2.reactor_handle().recv_exact(
                    stream,
                    len,
                    Box::new(move |body| {
                        let body_bytes = body.bytes as u64;
                        match body.err {
                            None => Self::finish(
                                &chan3,
                                user,
                                done,
                                OpResult::ok(body_bytes),
                                Ok(body.data),
                            ),
                            Some(e) => {
                                let err = ChannelError::from(e);
                                Self::finish(
                                    &chan3,
                                    user,
                                    done,
                                    OpResult::failed(err.clone(), body_bytes),
                                    Err(err),
                                );
                            }
                        }
                    }),
                );
            }),
        );
    }

    fn cancel(&mut self, chan: &Arc<Channel>, done: OpDone) {
        let user = self.on_done.take();
        Self::finish(
            chan,
            user,
            done,
            OpResult::failed(ChannelError::Closed, 0),
            Err(ChannelError::Closed),
        );
    }

    fn cancel_pending(&mut self, _chan: &Arc<Channel>) {
        // Closing the socket aborts the in-flight transfer; nothing to do.
    }

    fn kind(&self) -> OpKind {
        OpKind::User
    }
}

// ============================================================================
// Start sentinels
// ============================================================================

/// First entry of the send queue; resumes when the connector completes.
pub(crate) struct StartSendOp {
    connector: Arc<Connector>,
}

impl StartSendOp {
    pub(crate) fn new(connector: Arc<Connector>) -> Self {
        StartSendOp { connector }
    }
}

impl TransferOp for StartSendOp {
    fn perform(&mut self, _chan: &Arc<Channel>, done: OpDone) {
        self.connector.park(Direction::Send, done);
    }

    fn cancel(&mut self, _chan: &Arc<Channel>, done: OpDone) {
        self.connector.cancel();
        done(OpResult::failed(ChannelError::Cancelled, 0));
    }

    fn cancel_pending(&mut self, _chan: &Arc<Channel>) {
        self.connector.cancel();
    }

    fn kind(&self) -> OpKind {
        OpKind::Start
    }
}

/// First entry of the recv queue; resumes when the connector completes.
pub(crate) struct StartRecvOp {
    connector: Arc<Connector>,
}

impl StartRecvOp {
    pub(crate) fn new(connector: Arc<Connector>) -> Self {
        StartRecvOp { connector }
    }
}

impl TransferOp for StartRecvOp {
    fn perform(&mut self, _chan: &Arc<Channel>, done: OpDone) {
        self.connector.park(Direction::Recv, done);
    }

    fn cancel(&mut self, _chan: &Arc<Channel>, done: OpDone) {
        self.connector.cancel();
        done(OpResult::failed(ChannelError::Cancelled, 0));
    }

    fn cancel_pending(&mut self, _chan: &Arc<Channel>) {
        self.connector.cancel();
    }

    fn kind(&self) -> OpKind {
        OpKind::Start
    }
}

// ============================================================================
// Close sentinel
// ============================================================================

/// Terminal drain marker; completes with [`OpStatus::Closed`] whether
/// performed or cancelled.
pub(crate) struct CloseOp;

impl CloseOp {
    pub(crate) fn new() -> Self {
        CloseOp
    }
}

impl TransferOp for CloseOp {
    fn perform(&mut self, _chan: &Arc<Channel>, done: OpDone) {
        done(OpResult::closed());
    }

    fn cancel(&mut self, _chan: &Arc<Channel>, done: OpDone) {
        done(OpResult::closed());
    }

    fn cancel_pending(&mut self, _chan: &Arc<Channel>) {}

    fn kind(&self) -> OpKind {
        OpKind::Close
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_result_helpers() {
        let ok = OpResult::ok(7);
        assert!(matches!(ok.status, OpStatus::Ok));
        assert_eq!(ok.bytes, 7);

        let closed = OpResult::closed();
        assert!(matches!(closed.status, OpStatus::Closed));
        assert_eq!(closed.bytes, 0);

        let failed = OpResult::failed(ChannelError::Closed, 3);
        assert!(matches!(failed.status, OpStatus::Failed(ChannelError::Closed)));
        assert_eq!(failed.bytes, 3);
    }

    #[test]
    fn test_op_kinds() {
        let send = SendOp::new(vec![1, 2, 3], |_| {});
        assert_eq!(send.kind(), OpKind::User);

        let recv = RecvOp::new(|_| {});
        assert_eq!(recv.kind(), OpKind::User);

        assert_eq!(CloseOp::new().kind(), OpKind::Close);
    }

    #[test]
    fn test_run_user_callback_traps_panic() {
        run_user_callback(|| panic!("boom"));
        // Reaching this line is the assertion.
    }
}
