//! Single-threaded FIFO executors and the pool that pins connections to
//! them.
//!
//! Each executor drains a FIFO of typed tasks on its own worker thread, so
//! all processing for a given connection is single-threaded and ordered
//! without locks on connection state. The event loop enqueues; the worker
//! dequeues, blocking when idle.

use std::collections::HashMap;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use tracing::debug;

use crate::connection::Connection;

/// Stable identifier the event loop assigns a connection at accept time.
pub type ConnId = usize;

/// A unit of work addressed to one executor.
pub enum Task {
    /// A newly accepted connection; ownership moves to the executor.
    New { id: ConnId, conn: Connection },
    /// A chunk of bytes read off the connection's socket.
    Read { id: ConnId, data: Bytes },
    /// The event loop observed EOF or a socket error.
    Close { id: ConnId },
    /// Drain and exit the worker loop.
    Shutdown,
}

/// One FIFO queue plus the worker thread draining it.
pub struct Executor {
    tx: Sender<Task>,
    thread: Option<JoinHandle<()>>,
}

impl Executor {
    fn spawn(index: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();

        let thread = thread::Builder::new()
            .name(format!("executor-{}", index))
            .spawn(move || run_worker(rx))
            .expect("failed to spawn executor thread");

        Executor {
            tx,
            thread: Some(thread),
        }
    }

    /// Enqueue a task. Never blocks.
    pub fn add(&self, task: Task) {
        // send only fails after the worker has exited during shutdown
        let _ = self.tx.send(task);
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Worker loop: process tasks strictly in arrival order.
fn run_worker(rx: Receiver<Task>) {
    let mut active: HashMap<ConnId, Connection> = HashMap::new();

    while let Ok(task) = rx.recv() {
        match task {
            Task::New { id, conn } => {
                debug_assert!(!active.contains_key(&id));
                active.insert(id, conn);
            }
            Task::Read { id, data } => {
                // The connection may already be gone if a protocol error
                // tore it down while reads were still queued.
                let keep_open = match active.get_mut(&id) {
                    Some(conn) => conn.ingest(&data),
                    None => continue,
                };
                if !keep_open {
                    debug!(id, "closing connection");
                    active.remove(&id);
                }
            }
            Task::Close { id } => {
                active.remove(&id);
            }
            Task::Shutdown => break,
        }
    }

    // Destroy remaining connections; dropping closes their sockets.
    active.clear();
}

/// Fixed pool of executors with round-robin assignment.
///
/// `pick` is called only from the single accept thread and is not
/// synchronized.
pub struct ExecutorPool {
    executors: Vec<Executor>,
    next: u64,
}

impl ExecutorPool {
    /// Spawn `size` executors.
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        ExecutorPool {
            executors: (0..size).map(Executor::spawn).collect(),
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// The next executor index in round-robin order.
    pub fn pick(&mut self) -> usize {
        let picked = (self.next % self.executors.len() as u64) as usize;
        self.next += 1;
        picked
    }

    /// Route a task to the executor at `index`, or pick one when absent.
    ///
    /// Routing to an explicit index keeps all of a connection's tasks on
    /// its pinned executor.
    pub fn add(&mut self, task: Task, index: Option<usize>) {
        let index = match index {
            Some(index) => index,
            None => self.pick(),
        };
        self.executors[index].add(task);
    }

    /// Send every executor a shutdown task and join the workers. Tasks
    /// queued behind the shutdown are dropped.
    pub fn shutdown(&mut self) {
        for executor in &self.executors {
            executor.add(Task::Shutdown);
        }
        for executor in &mut self.executors {
            executor.join();
        }
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
