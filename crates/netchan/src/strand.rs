// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Callback executor and serial strands.
//!
//! [`Executor`] is a small pool of worker threads draining a shared task
//! channel. [`Strand`] layers serial execution on top of it: tasks
//! dispatched to one strand run one at a time, in dispatch order, on
//! whichever worker picks up the drainer. Two strands never block each
//! other.
//!
//! A strand is a mutex-guarded queue plus an in-flight flag. Dispatch
//! appends the task; if no drainer is running, one is posted to the pool
//! and pops tasks until the queue is empty. Completion handlers posted
//! from the I/O thread re-enter their pipeline's strand this way, so
//! queue state is never touched concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

// ============================================================================
// Executor
// ============================================================================

/// Worker pool draining posted tasks.
pub struct Executor {
    task_tx: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Spawn an executor with `threads` workers (at least one).
    pub fn new(threads: usize) -> Arc<Executor> {
        let threads = threads.max(1);
        let (task_tx, task_rx) = unbounded::<Task>();

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx: Receiver<Task> = task_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("netchan-worker-{}", i))
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .expect("failed to spawn executor worker");
            workers.push(handle);
        }

        Arc::new(Executor {
            task_tx: Mutex::new(Some(task_tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Post a task for execution on any worker.
    pub fn post(&self, task: Task) {
        let guard = self.task_tx.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(task);
        }
        // After shutdown the task is dropped; nothing left to run it.
    }

    /// Stop the workers. Queued tasks still drain; new posts are dropped.
    pub fn shutdown(&self) {
        *self.task_tx.lock() = None;
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Strand
// ============================================================================

/// Serial executor: tasks run one at a time, in dispatch order.
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

struct StrandInner {
    exec: Arc<Executor>,
    queue: Mutex<StrandQueue>,
}

struct StrandQueue {
    tasks: VecDeque<Task>,
    draining: bool,
}

impl Strand {
    /// Create a strand bound to an executor.
    pub fn new(exec: Arc<Executor>) -> Strand {
        Strand {
            inner: Arc::new(StrandInner {
                exec,
                queue: Mutex::new(StrandQueue {
                    tasks: VecDeque::new(),
                    draining: false,
                }),
            }),
        }
    }

    /// Queue a task; it runs after every previously dispatched task.
    pub fn dispatch(&self, task: impl FnOnce() + Send + 'static) {
        let start = {
            let mut q = self.inner.queue.lock();
            q.tasks.push_back(Box::new(task));
            if q.draining {
                false
            } else {
                q.draining = true;
                true
            }
        };

        if start {
            let inner = self.inner.clone();
            self.inner.exec.post(Box::new(move || drain(&inner)));
        }
    }
}

/// Pop and run tasks until the strand queue is empty.
fn drain(inner: &Arc<StrandInner>) {
    loop {
        let task = {
            let mut q = inner.queue.lock();
            match q.tasks.pop_front() {
                Some(task) => task,
                None => {
                    q.draining = false;
                    return;
                }
            }
        };
        task();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_post_runs_task() {
        let exec = Executor::new(2);
        let (tx, rx) = bounded(1);

        exec.post(Box::new(move || {
            let _ = tx.send(7);
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_strand_preserves_order() {
        let exec = Executor::new(4);
        let strand = Strand::new(exec.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = bounded(1);

        for i in 0..100 {
            let seen = seen.clone();
            let tx = tx.clone();
            strand.dispatch(move || {
                seen.lock().push(i);
                if i == 99 {
                    let _ = tx.send(());
                }
            });
        }

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let order = seen.lock().clone();
        assert_eq!(order, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_strand_serializes_against_itself() {
        // A task dispatched from inside a strand task runs after the
        // current one, never concurrently with it.
        let exec = Executor::new(4);
        let strand = Strand::new(exec.clone());
        let in_task = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let (tx, rx) = bounded(1);

        for i in 0..200 {
            let in_task = in_task.clone();
            let overlapped = overlapped.clone();
            let tx = tx.clone();
            strand.dispatch(move || {
                if in_task.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                std::thread::yield_now();
                in_task.store(false, Ordering::SeqCst);
                if i == 199 {
                    let _ = tx.send(());
                }
            });
        }

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_independent_strands_both_progress() {
        let exec = Executor::new(2);
        let a = Strand::new(exec.clone());
        let b = Strand::new(exec.clone());
        let (tx_a, rx_a) = bounded(1);
        let (tx_b, rx_b) = bounded(1);

        a.dispatch(move || {
            let _ = tx_a.send(());
        });
        b.dispatch(move || {
            let _ = tx_b.send(());
        });

        rx_a.recv_timeout(Duration::from_secs(5)).unwrap();
        rx_b.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
