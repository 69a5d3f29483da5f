// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable, ordered, bidirectional message channels over TCP.
//!
//! netchan turns one TCP stream into a pair of independently progressing
//! operation queues between two named endpoints of a logical session. It
//! handles asynchronous connection establishment (greeting + identity
//! handshake, unbounded retry with backoff), strict FIFO execution of
//! queued send/recv operations, graceful close and abrupt cancel, and byte
//! accounting.
//!
//! # Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                          Session                              |
//! |   client: dials remote          server: Acceptor pairs by    |
//! |   and initiates handshake       (session, local, remote)     |
//! +------------------------------+-------------------------------+
//!                                |
//! +------------------------------v-------------------------------+
//! |                          Channel                              |
//! |  +----------------+  +----------------+  +----------------+  |
//! |  | send pipeline  |  | recv pipeline  |  |   Connector    |  |
//! |  | queue + strand |  | queue + strand |  | retry/backoff  |  |
//! |  +----------------+  +----------------+  +----------------+  |
//! +------------------------------+-------------------------------+
//!                                |
//! +------------------------------v-------------------------------+
//! |            Reactor (mio poll loop, one thread)                |
//! |            Executor (callback workers, strands)               |
//! +--------------------------------------------------------------+
//! ```
//!
//! # Example
//!
//! ```no_run
//! use netchan::{ChannelConfig, IoCore, Session};
//!
//! # fn main() -> std::io::Result<()> {
//! let io = IoCore::new(ChannelConfig::default())?;
//!
//! let server = Session::server(&io, "127.0.0.1:0".parse().unwrap(), "demo")?;
//! let addr = server.local_addr().unwrap();
//! let client = Session::client(&io, addr, "demo");
//!
//! // The names swap between the two sides.
//! let tx = client.channel("A", "B");
//! let rx = server.channel("B", "A");
//!
//! tx.send(vec![0xDE, 0xAD], |res| {
//!     assert_eq!(res.unwrap(), 2);
//! });
//! rx.recv(|res| {
//!     assert_eq!(res.unwrap(), vec![0xDE, 0xAD]);
//! });
//!
//! tx.close();
//! rx.close();
//! # Ok(())
//! # }
//! ```

mod acceptor;
mod channel;
mod config;
mod connector;
mod error;
mod frame;
mod op;
mod reactor;
mod session;
mod stats;
mod strand;

pub use channel::{Channel, Status};
pub use config::ChannelConfig;
pub use error::{ChannelError, ChannelResult};
pub use op::{
    OpDone, OpKind, OpResult, OpStatus, RecvCallback, RecvOp, SendCallback, SendOp, TransferOp,
};
pub use session::{IoCore, Session};
pub use stats::StatsSnapshot;
