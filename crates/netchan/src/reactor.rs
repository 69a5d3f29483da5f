// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! I/O reactor thread.
//!
//! One dedicated thread drives a `mio::Poll` event loop over every socket
//! the library touches. Callers interact with it through proactor-style
//! requests that carry a completion callback:
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                        Reactor                               |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - TCP listeners (accept)                              |  |
//! |  |  - TCP streams (connect, read, write)                  |  |
//! |  |  - Waker (command channel)                             |  |
//! |  +-------------------------------------------------------+  |
//! |                              |                               |
//! |  +-------------+    +-------------+    +-----------------+  |
//! |  | recv_exact  |    |  send_all   |    |     timers      |  |
//! |  | park until  |    | park until  |    |  binary heap    |  |
//! |  | buf filled  |    | buf drained |    |  of deadlines   |  |
//! |  +-------------+    +-------------+    +-----------------+  |
//! +-------------------------------------------------------------+
//! ```
//!
//! Requests are submitted over a command channel and a `mio::Waker`.
//! Reads and writes are attempted immediately on submission (readiness may
//! already be consumed) and parked on `WouldBlock`; each completion fires
//! exactly once. Closing a stream aborts its parked requests with
//! `ConnectionAborted`.
//!
//! Completion callbacks run on the reactor thread and must not block; the
//! channel layer immediately re-dispatches them onto a strand.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

// ============================================================================
// Constants
// ============================================================================

/// Token for the waker (command channel).
const WAKER_TOKEN: Token = Token(0);

/// First token handed out to sockets.
const FIRST_ID: u64 = 1;

/// Poll timeout when no timer is due sooner.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 128;

// ============================================================================
// Handles and completions
// ============================================================================

/// Handle to a registered stream socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) u64);

/// Handle to a registered listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Handle to a scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// Outcome of a `send_all` / `recv_exact` request.
#[derive(Debug)]
pub struct IoOutcome {
    /// Bytes moved before completion or failure.
    pub bytes: usize,

    /// Received data (`recv_exact` only; empty for sends). On failure this
    /// holds whatever was read before the error.
    pub data: Vec<u8>,

    /// Failure, if the request did not run to completion.
    pub err: Option<io::Error>,
}

impl IoOutcome {
    fn ok(bytes: usize, data: Vec<u8>) -> Self {
        IoOutcome {
            bytes,
            data,
            err: None,
        }
    }

    fn fail(bytes: usize, data: Vec<u8>, err: io::Error) -> Self {
        IoOutcome {
            bytes,
            data,
            err: Some(err),
        }
    }
}

/// Completion for connect requests.
pub type ConnectDone = Box<dyn FnOnce(io::Result<StreamId>) + Send>;

/// Completion for accept requests.
pub type AcceptDone = Box<dyn FnOnce(io::Result<(StreamId, SocketAddr)>) + Send>;

/// Completion for read/write requests.
pub type IoDone = Box<dyn FnOnce(IoOutcome) + Send>;

/// Deferred timer callback.
type TimerFn = Box<dyn FnOnce() + Send>;

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "operation aborted")
}

// ============================================================================
// Commands
// ============================================================================

enum Command {
    Connect {
        id: u64,
        addr: SocketAddr,
        done: ConnectDone,
    },
    Adopt {
        id: u64,
        stream: TcpStream,
    },
    Listen {
        id: u64,
        listener: TcpListener,
    },
    Accept {
        id: u64,
        done: AcceptDone,
    },
    RecvExact {
        id: u64,
        len: usize,
        done: IoDone,
    },
    SendAll {
        id: u64,
        buf: Vec<u8>,
        done: IoDone,
    },
    CloseStream {
        id: u64,
    },
    CloseListener {
        id: u64,
    },
    Schedule {
        id: u64,
        deadline: Instant,
        cb: TimerFn,
    },
    CancelTimer {
        id: u64,
        reply: Sender<bool>,
    },
    Shutdown,
}

// ============================================================================
// Reactor handle
// ============================================================================

/// Shared handle to the reactor thread.
pub struct Reactor {
    cmd_tx: Sender<Command>,
    waker: Waker,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    nodelay: bool,
}

impl Reactor {
    /// Spawn the reactor thread.
    ///
    /// `nodelay` is applied to every connected and accepted stream.
    pub fn spawn(nodelay: bool) -> io::Result<Arc<Reactor>> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (cmd_tx, cmd_rx) = unbounded();

        let mut thread_state = IoThread {
            poll,
            cmd_rx,
            streams: HashMap::new(),
            listeners: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_cbs: HashMap::new(),
            nodelay,
            running: true,
        };

        let handle = thread::Builder::new()
            .name("netchan-io".to_string())
            .spawn(move || thread_state.run())?;

        Ok(Arc::new(Reactor {
            cmd_tx,
            waker,
            next_id: AtomicU64::new(FIRST_ID),
            thread: Mutex::new(Some(handle)),
            nodelay,
        }))
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn submit(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Begin a non-blocking connect. The returned id is valid immediately
    /// and can be closed to abort the attempt; the completion reports the
    /// final result.
    pub fn connect(&self, addr: SocketAddr, done: ConnectDone) -> StreamId {
        let id = self.alloc_id();
        self.submit(Command::Connect { id, addr, done });
        StreamId(id)
    }

    /// Register an already-connected stream (raw-socket channels).
    pub fn adopt_stream(&self, stream: std::net::TcpStream) -> io::Result<StreamId> {
        stream.set_nonblocking(true)?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        let id = self.alloc_id();
        self.submit(Command::Adopt {
            id,
            stream: TcpStream::from_std(stream),
        });
        Ok(StreamId(id))
    }

    /// Bind a listener. The bind itself happens on the calling thread so
    /// errors surface synchronously; the listener is then registered with
    /// the poll loop.
    pub fn listen(&self, addr: SocketAddr, backlog: u32) -> io::Result<(ListenerId, SocketAddr)> {
        let domain = socket2::Domain::for_address(addr);
        let socket = socket2::Socket::new(domain, socket2::Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(backlog as i32)?;

        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;
        let listener = TcpListener::from_std(std_listener);

        let id = self.alloc_id();
        self.submit(Command::Listen { id, listener });
        Ok((ListenerId(id), local_addr))
    }

    /// Request one accepted connection from a listener.
    pub fn accept(&self, listener: ListenerId, done: AcceptDone) {
        self.submit(Command::Accept {
            id: listener.0,
            done,
        });
    }

    /// Read exactly `len` bytes from a stream.
    pub fn recv_exact(&self, stream: StreamId, len: usize, done: IoDone) {
        self.submit(Command::RecvExact {
            id: stream.0,
            len,
            done,
        });
    }

    /// Write an entire buffer to a stream.
    pub fn send_all(&self, stream: StreamId, buf: Vec<u8>, done: IoDone) {
        self.submit(Command::SendAll {
            id: stream.0,
            buf,
            done,
        });
    }

    /// Close a stream; parked requests abort with `ConnectionAborted`.
    pub fn close_stream(&self, stream: StreamId) {
        self.submit(Command::CloseStream { id: stream.0 });
    }

    /// Close a listener; parked accepts abort with `ConnectionAborted`.
    pub fn close_listener(&self, listener: ListenerId) {
        self.submit(Command::CloseListener { id: listener.0 });
    }

    /// Run a callback on the reactor thread after `delay`.
    pub fn schedule(&self, delay: Duration, cb: impl FnOnce() + Send + 'static) -> TimerId {
        let id = self.alloc_id();
        self.submit(Command::Schedule {
            id,
            deadline: Instant::now() + delay,
            cb: Box::new(cb),
        });
        TimerId(id)
    }

    /// Cancel a timer. Returns true when the callback was removed before
    /// firing; false means it already ran or is about to.
    pub fn cancel_timer(&self, timer: TimerId) -> bool {
        let (reply, rx) = bounded(1);
        self.submit(Command::CancelTimer {
            id: timer.0,
            reply,
        });
        rx.recv().unwrap_or(false)
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Reactor thread
// ============================================================================

struct IoThread {
    poll: Poll,
    cmd_rx: Receiver<Command>,
    streams: HashMap<u64, StreamEntry>,
    listeners: HashMap<u64, ListenerEntry>,
    timers: BinaryHeap<Reverse<(Instant, u64)>>,
    timer_cbs: HashMap<u64, TimerFn>,
    nodelay: bool,
    running: bool,
}

/// Per-stream state on the reactor thread.
struct StreamEntry {
    stream: TcpStream,
    /// Pending connect completion (present until the connect resolves).
    connecting: Option<ConnectDone>,
    read: Option<ReadOp>,
    write: Option<WriteOp>,
}

struct ReadOp {
    buf: Vec<u8>,
    filled: usize,
    done: IoDone,
}

struct WriteOp {
    buf: Vec<u8>,
    written: usize,
    done: IoDone,
}

struct ListenerEntry {
    listener: TcpListener,
    pending: VecDeque<AcceptDone>,
}

impl IoThread {
    fn run(&mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    log::error!("reactor poll error: {}", e);
                }
                continue;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    Token(raw) => {
                        let id = raw as u64;
                        if self.listeners.contains_key(&id) {
                            self.drive_accept(id);
                        } else {
                            if event.is_writable() {
                                self.on_writable(id);
                            }
                            if event.is_readable() {
                                self.drive_read(id);
                            }
                        }
                    }
                }
            }

            self.handle_commands();
            self.fire_due_timers();
        }

        self.cleanup();
    }

    fn next_timeout(&mut self) -> Duration {
        // Skip cancelled heap entries while peeking.
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if !self.timer_cbs.contains_key(&id) {
                self.timers.pop();
                continue;
            }
            let now = Instant::now();
            return if deadline <= now {
                Duration::ZERO
            } else {
                (deadline - now).min(DEFAULT_POLL_TIMEOUT)
            };
        }
        DEFAULT_POLL_TIMEOUT
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((deadline, id))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if let Some(cb) = self.timer_cbs.remove(&id) {
                cb();
            }
        }
    }

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { id, addr, done } => self.handle_connect(id, addr, done),
            Command::Adopt { id, stream } => self.handle_adopt(id, stream),
            Command::Listen { id, listener } => self.handle_listen(id, listener),
            Command::Accept { id, done } => self.handle_accept_req(id, done),
            Command::RecvExact { id, len, done } => self.handle_recv(id, len, done),
            Command::SendAll { id, buf, done } => self.handle_send(id, buf, done),
            Command::CloseStream { id } => self.close_stream(id),
            Command::CloseListener { id } => self.close_listener(id),
            Command::Schedule { id, deadline, cb } => {
                self.timers.push(Reverse((deadline, id)));
                self.timer_cbs.insert(id, cb);
            }
            Command::CancelTimer { id, reply } => {
                let won = self.timer_cbs.remove(&id).is_some();
                let _ = reply.send(won);
            }
            Command::Shutdown => self.running = false,
        }
    }

    // ========================================================================
    // Connect / adopt / listen
    // ========================================================================

    fn handle_connect(&mut self, id: u64, addr: SocketAddr, done: ConnectDone) {
        let mut stream = match TcpStream::connect(addr) {
            Ok(s) => s,
            Err(e) => {
                done(Err(e));
                return;
            }
        };

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(id as usize),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            done(Err(e));
            return;
        }

        self.streams.insert(
            id,
            StreamEntry {
                stream,
                connecting: Some(done),
                read: None,
                write: None,
            },
        );
    }

    fn handle_adopt(&mut self, id: u64, mut stream: TcpStream) {
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(id as usize),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            log::error!("failed to register adopted stream: {}", e);
            return;
        }
        self.streams.insert(
            id,
            StreamEntry {
                stream,
                connecting: None,
                read: None,
                write: None,
            },
        );
    }

    fn handle_listen(&mut self, id: u64, mut listener: TcpListener) {
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut listener, Token(id as usize), Interest::READABLE)
        {
            log::error!("failed to register listener: {}", e);
            return;
        }
        self.listeners.insert(
            id,
            ListenerEntry {
                listener,
                pending: VecDeque::new(),
            },
        );
    }

    /// Resolve a pending connect once the stream polls writable.
    fn on_writable(&mut self, id: u64) {
        let entry = match self.streams.get_mut(&id) {
            Some(e) => e,
            None => return,
        };

        if entry.connecting.is_some() {
            match entry.stream.take_error() {
                Ok(Some(e)) | Err(e) => {
                    let done = entry.connecting.take().expect("checked above");
                    self.remove_stream(id);
                    done(Err(e));
                    return;
                }
                Ok(None) => {
                    // A writable event with no socket error can still be
                    // spurious; peer_addr answers only once connected.
                    match entry.stream.peer_addr() {
                        Ok(_) => {
                            if self.nodelay {
                                if let Err(e) = entry.stream.set_nodelay(true) {
                                    let done = entry.connecting.take().expect("checked above");
                                    self.remove_stream(id);
                                    done(Err(e));
                                    return;
                                }
                            }
                            let done = entry.connecting.take().expect("checked above");
                            done(Ok(StreamId(id)));
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
                        Err(e) => {
                            let done = entry.connecting.take().expect("checked above");
                            self.remove_stream(id);
                            done(Err(e));
                            return;
                        }
                    }
                }
            }
        }

        self.drive_write(id);
    }

    // ========================================================================
    // Accept
    // ========================================================================

    fn handle_accept_req(&mut self, id: u64, done: AcceptDone) {
        match self.listeners.get_mut(&id) {
            Some(entry) => {
                entry.pending.push_back(done);
                self.drive_accept(id);
            }
            None => done(Err(aborted())),
        }
    }

    fn drive_accept(&mut self, id: u64) {
        loop {
            let entry = match self.listeners.get_mut(&id) {
                Some(e) => e,
                None => return,
            };
            if entry.pending.is_empty() {
                return;
            }

            match entry.listener.accept() {
                Ok((mut stream, remote_addr)) => {
                    let done = entry.pending.pop_front().expect("checked non-empty");
                    if self.nodelay {
                        let _ = stream.set_nodelay(true);
                    }

                    let stream_id = next_accept_id();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(stream_id as usize),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        done(Err(e));
                        continue;
                    }

                    self.streams.insert(
                        stream_id,
                        StreamEntry {
                            stream,
                            connecting: None,
                            read: None,
                            write: None,
                        },
                    );
                    done(Ok((StreamId(stream_id), remote_addr)));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let done = entry.pending.pop_front().expect("checked non-empty");
                    done(Err(e));
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Read / write
    // ========================================================================

    fn handle_recv(&mut self, id: u64, len: usize, done: IoDone) {
        let entry = match self.streams.get_mut(&id) {
            Some(e) => e,
            None => {
                done(IoOutcome::fail(0, Vec::new(), aborted()));
                return;
            }
        };

        if entry.read.is_some() {
            done(IoOutcome::fail(
                0,
                Vec::new(),
                io::Error::new(io::ErrorKind::Other, "receive already in flight"),
            ));
            return;
        }

        entry.read = Some(ReadOp {
            buf: vec![0u8; len],
            filled: 0,
            done,
        });

        if entry.connecting.is_none() {
            self.drive_read(id);
        }
    }

    fn handle_send(&mut self, id: u64, buf: Vec<u8>, done: IoDone) {
        let entry = match self.streams.get_mut(&id) {
            Some(e) => e,
            None => {
                done(IoOutcome::fail(0, Vec::new(), aborted()));
                return;
            }
        };

        if entry.write.is_some() {
            done(IoOutcome::fail(
                0,
                Vec::new(),
                io::Error::new(io::ErrorKind::Other, "send already in flight"),
            ));
            return;
        }

        entry.write = Some(WriteOp {
            buf,
            written: 0,
            done,
        });

        if entry.connecting.is_none() {
            self.drive_write(id);
        }
    }

    fn drive_read(&mut self, id: u64) {
        let entry = match self.streams.get_mut(&id) {
            Some(e) => e,
            None => return,
        };
        let op = match entry.read.as_mut() {
            Some(op) => op,
            None => return,
        };

        loop {
            if op.filled == op.buf.len() {
                break;
            }
            match entry.stream.read(&mut op.buf[op.filled..]) {
                Ok(0) => {
                    let op = entry.read.take().expect("read op present");
                    let err =
                        io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
                    (op.done)(IoOutcome::fail(op.filled, op.buf, err));
                    return;
                }
                Ok(n) => op.filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let op = entry.read.take().expect("read op present");
                    (op.done)(IoOutcome::fail(op.filled, op.buf, e));
                    return;
                }
            }
        }

        let op = entry.read.take().expect("read op present");
        (op.done)(IoOutcome::ok(op.filled, op.buf));
    }

    fn drive_write(&mut self, id: u64) {
        let entry = match self.streams.get_mut(&id) {
            Some(e) => e,
            None => return,
        };
        let op = match entry.write.as_mut() {
            Some(op) => op,
            None => return,
        };

        while op.written < op.buf.len() {
            match entry.stream.write(&op.buf[op.written..]) {
                Ok(0) => {
                    let op = entry.write.take().expect("write op present");
                    let err = io::Error::new(io::ErrorKind::WriteZero, "connection closed");
                    (op.done)(IoOutcome::fail(op.written, Vec::new(), err));
                    return;
                }
                Ok(n) => op.written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let op = entry.write.take().expect("write op present");
                    (op.done)(IoOutcome::fail(op.written, Vec::new(), e));
                    return;
                }
            }
        }

        let op = entry.write.take().expect("write op present");
        let _ = entry.stream.flush();
        (op.done)(IoOutcome::ok(op.written, Vec::new()));
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    fn remove_stream(&mut self, id: u64) {
        if let Some(mut entry) = self.streams.remove(&id) {
            let _ = self.poll.registry().deregister(&mut entry.stream);
        }
    }

    fn close_stream(&mut self, id: u64) {
        if let Some(mut entry) = self.streams.remove(&id) {
            let _ = self.poll.registry().deregister(&mut entry.stream);
            if let Some(done) = entry.connecting.take() {
                done(Err(aborted()));
            }
            if let Some(op) = entry.read.take() {
                (op.done)(IoOutcome::fail(op.filled, op.buf, aborted()));
            }
            if let Some(op) = entry.write.take() {
                (op.done)(IoOutcome::fail(op.written, Vec::new(), aborted()));
            }
        }
    }

    fn close_listener(&mut self, id: u64) {
        if let Some(mut entry) = self.listeners.remove(&id) {
            let _ = self.poll.registry().deregister(&mut entry.listener);
            for done in entry.pending.drain(..) {
                done(Err(aborted()));
            }
        }
    }

    fn cleanup(&mut self) {
        let ids: Vec<u64> = self.streams.keys().copied().collect();
        for id in ids {
            self.close_stream(id);
        }
        let ids: Vec<u64> = self.listeners.keys().copied().collect();
        for id in ids {
            self.close_listener(id);
        }
        self.timer_cbs.clear();
        self.timers.clear();
    }
}

/// Accepted streams get ids from a separate high range so they can be
/// allocated on the reactor thread without racing the handle's counter.
fn next_accept_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1 << 32);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_shutdown() {
        let reactor = Reactor::spawn(true).unwrap();
        drop(reactor);
    }

    #[test]
    fn test_timer_fires() {
        let reactor = Reactor::spawn(true).unwrap();
        let (tx, rx) = bounded(1);

        reactor.schedule(Duration::from_millis(10), move || {
            let _ = tx.send(Instant::now());
        });

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_timers_fire_in_deadline_order() {
        let reactor = Reactor::spawn(true).unwrap();
        let (tx, rx) = bounded(2);

        let tx2 = tx.clone();
        reactor.schedule(Duration::from_millis(60), move || {
            let _ = tx2.send("late");
        });
        reactor.schedule(Duration::from_millis(10), move || {
            let _ = tx.send("early");
        });

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "early");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "late");
    }

    #[test]
    fn test_cancel_timer() {
        let reactor = Reactor::spawn(true).unwrap();
        let (tx, rx) = bounded::<()>(1);

        let timer = reactor.schedule(Duration::from_secs(30), move || {
            let _ = tx.send(());
        });

        assert!(reactor.cancel_timer(timer));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        // Second cancel reports the callback is gone.
        assert!(!reactor.cancel_timer(timer));
    }

    #[test]
    fn test_ops_on_unknown_stream_abort() {
        let reactor = Reactor::spawn(true).unwrap();
        let (tx, rx) = bounded(1);

        reactor.recv_exact(
            StreamId(987654),
            4,
            Box::new(move |out| {
                let _ = tx.send(out.err.map(|e| e.kind()));
            }),
        );

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(io::ErrorKind::ConnectionAborted)
        );
    }

    #[test]
    fn test_connect_refused_reports_error() {
        let reactor = Reactor::spawn(true).unwrap();

        // Bind then drop a listener so the port is (briefly) refused.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let (tx, rx) = bounded(1);
        reactor.connect(
            addr,
            Box::new(move |res| {
                let _ = tx.send(res.is_err());
            }),
        );

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
