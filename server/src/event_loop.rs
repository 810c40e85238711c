//! The accept/read event loop.
//!
//! A single thread owns the listener and every registered connection
//! socket. Readable sockets are drained in small chunks and the bytes are
//! posted to the connection's pinned executor as `Read` tasks; the loop
//! itself never parses or processes packets. Connection state travels to
//! the executor inside the `New` task — the loop keeps only the registered
//! descriptor for readiness notification.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::{Options, MAX_CONNECTIONS};
use crate::connection::Connection;
use crate::error::Error;
use crate::executor::{ExecutorPool, Task};
use crate::metrics::Stats;
use lru_cache::LruCache;

/// Token offset for the listener to avoid collision with connections.
const LISTENER: Token = Token(1 << 30);
const WAKER: Token = Token((1 << 30) + 1);

/// Sockets are drained in chunks of this size until they would block.
const READ_CHUNK_SIZE: usize = 128;

/// Handle used to stop a running event loop from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Signal the event loop to stop, drain its executors, and return.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// Per-connection state retained by the event loop.
struct ConnState {
    stream: TcpStream,
    executor: usize,
}

/// The accept/read event loop.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    conns: Slab<ConnState>,
    pool: ExecutorPool,
    cache: Arc<LruCache>,
    stats: Arc<Stats>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    max_connections: usize,
}

impl EventLoop {
    /// Bind the listening socket and prepare the loop.
    pub fn bind(
        options: &Options,
        cache: Arc<LruCache>,
        pool: ExecutorPool,
    ) -> Result<Self, Error> {
        let addr = options.listen_addr()?;
        let listener = build_listener(addr)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(256),
            listener,
            local_addr,
            conns: Slab::with_capacity(MAX_CONNECTIONS),
            pool,
            cache,
            stats: Arc::new(Stats::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            max_connections: MAX_CONNECTIONS,
        })
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle that stops the loop when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Shared operation counters.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Run until shut down. Blocks the calling thread.
    pub fn run(mut self) -> Result<(), Error> {
        info!(
            addr = %self.local_addr,
            executors = self.pool.len(),
            capacity = self.cache.capacity(),
            max_connections = self.max_connections,
            "listening"
        );

        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                self.pool.shutdown();
                return Err(e.into());
            }

            // Collect event info first; dispatch mutates the slab.
            let ready: Vec<(Token, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_error()))
                .collect();

            for (token, is_error) in ready {
                match token {
                    WAKER => {}
                    LISTENER => self.accept_ready(),
                    Token(id) => self.conn_ready(id, is_error),
                }
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
        }

        info!("shutting down");
        self.pool.shutdown();

        let snap = self.stats.snapshot();
        info!(
            connections = snap.connections_accepted,
            gets = snap.gets,
            sets = snap.sets,
            deletes = snap.deletes,
            hits = snap.hits,
            misses = snap.misses,
            protocol_errors = snap.protocol_errors,
            "server stopped"
        );
        Ok(())
    }

    /// Accept until the listener would block.
    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.register_connection(stream, peer) {
                        warn!(error = %e, "failed to register connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn register_connection(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<()> {
        if self.conns.len() >= self.max_connections {
            warn!(%peer, "connection limit reached, dropping connection");
            return Ok(());
        }

        let _ = stream.set_nodelay(true);

        // The executor writes responses through its own descriptor; the
        // registered stream stays here for readiness notification only.
        let writer = duplicate_stream(&stream)?;

        let executor = self.pool.pick();
        let entry = self.conns.vacant_entry();
        let id = entry.key();
        self.poll
            .registry()
            .register(&mut stream, Token(id), Interest::READABLE)?;
        entry.insert(ConnState { stream, executor });

        self.stats.inc_connections_accepted();
        debug!(%peer, id, executor, "accepted connection");

        let conn = Connection::new(writer, self.cache.clone(), self.stats.clone(), executor);
        self.pool.add(Task::New { id, conn }, Some(executor));
        Ok(())
    }

    /// Drain a readable connection in chunks, posting each to the pinned
    /// executor.
    fn conn_ready(&mut self, id: usize, is_error: bool) {
        let executor = match self.conns.get(id) {
            Some(state) => state.executor,
            // already closed; stale event
            None => return,
        };

        if is_error {
            self.close_connection(id);
            return;
        }

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let result = match self.conns.get_mut(id) {
                Some(state) => state.stream.read(&mut chunk),
                None => return,
            };

            match result {
                Ok(0) => {
                    self.close_connection(id);
                    return;
                }
                Ok(n) => {
                    self.pool.add(
                        Task::Read {
                            id,
                            data: Bytes::copy_from_slice(&chunk[..n]),
                        },
                        Some(executor),
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(id, error = %e, "read failed");
                    self.close_connection(id);
                    return;
                }
            }
        }
    }

    /// Release the loop's registration and tell the executor to destroy
    /// the connection.
    fn close_connection(&mut self, id: usize) {
        if let Some(mut state) = self.conns.try_remove(id) {
            let _ = self.poll.registry().deregister(&mut state.stream);
            self.stats.inc_connections_closed();
            self.pool.add(Task::Close { id }, Some(state.executor));
            debug!(id, "connection closed");
        }
    }
}

/// Build the listening socket: non-blocking, TCP_NODELAY, SO_KEEPALIVE,
/// and SO_LINGER {0,0} to avoid piling up TIME_WAIT sockets.
fn build_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_linger(Some(Duration::from_secs(0)))?;
    set_flag_sockopt(&socket, libc::IPPROTO_TCP, libc::TCP_NODELAY)?;
    set_flag_sockopt(&socket, libc::SOL_SOCKET, libc::SO_KEEPALIVE)?;
    socket.set_nonblocking(true)?;

    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}

fn set_flag_sockopt(socket: &Socket, level: libc::c_int, opt: libc::c_int) -> io::Result<()> {
    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            opt,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicate the connection's descriptor for the executor-side writer.
///
/// The duplicate shares the open socket (and its non-blocking status), so
/// a `shutdown` through either side is seen by both.
fn duplicate_stream(stream: &TcpStream) -> io::Result<std::net::TcpStream> {
    let fd = unsafe { libc::fcntl(stream.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { std::net::TcpStream::from_raw_fd(fd) })
}
