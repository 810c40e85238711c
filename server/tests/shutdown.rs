//! Integration tests for graceful shutdown.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use lru_cache::LruCache;
use protocol_memcache::{Request, ResponseHeader, Status, HEADER_LEN};
use server::config::Options;
use server::event_loop::EventLoop;
use server::executor::ExecutorPool;

#[test]
fn graceful_shutdown_stops_the_server() {
    let options = Options {
        port: 0,
        threads: Some(2),
        ..Options::default()
    };

    let cache = Arc::new(LruCache::new(options.capacity()));
    let pool = ExecutorPool::new(options.threads());
    let event_loop = EventLoop::bind(&options, cache, pool).unwrap();

    let addr = event_loop.local_addr();
    let handle = event_loop.shutdown_handle();
    let join = thread::spawn(move || event_loop.run());

    // the server answers before shutdown
    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = BytesMut::new();
    Request::set(b"k", b"v").encode(&mut buf);
    std::io::Write::write_all(&mut client, &buf).unwrap();

    let mut header_buf = [0u8; HEADER_LEN];
    client.read_exact(&mut header_buf).unwrap();
    let header = ResponseHeader::decode(&header_buf);
    assert_eq!(header.status, Status::NoError.code());

    // signal shutdown and wait for the loop to stop
    let start = Instant::now();
    handle.shutdown();

    while !join.is_finished() && start.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(20));
    }
    assert!(join.is_finished(), "server did not stop in time");
    join.join().unwrap().unwrap();

    // the open connection was destroyed on shutdown
    let mut byte = [0u8; 1];
    assert_eq!(client.read(&mut byte).unwrap(), 0);
}

#[test]
fn shutdown_is_prompt_when_idle() {
    let options = Options {
        port: 0,
        threads: Some(1),
        ..Options::default()
    };

    let cache = Arc::new(LruCache::new(options.capacity()));
    let pool = ExecutorPool::new(options.threads());
    let event_loop = EventLoop::bind(&options, cache, pool).unwrap();

    let handle = event_loop.shutdown_handle();
    let join = thread::spawn(move || event_loop.run());

    let shutdown_at = Instant::now();
    handle.shutdown();

    while !join.is_finished() && shutdown_at.elapsed() < Duration::from_secs(3) {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(
        join.is_finished(),
        "idle server took too long to stop: {:?}",
        shutdown_at.elapsed()
    );
    join.join().unwrap().unwrap();
}
