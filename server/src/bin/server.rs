//! Bantam cache server binary.

use std::sync::Arc;

use clap::Parser;
use lru_cache::LruCache;
use server::config::Options;
use server::event_loop::EventLoop;
use server::executor::ExecutorPool;
use server::{logging, signal};

fn main() {
    let options = Options::parse();
    logging::init();

    if let Err(e) = run(&options) {
        eprintln!("Server error: {}", e);
        std::process::exit(1);
    }
}

fn run(options: &Options) -> Result<(), server::Error> {
    let cache = Arc::new(LruCache::new(options.capacity()));
    let pool = ExecutorPool::new(options.threads());

    let event_loop = EventLoop::bind(options, cache, pool)?;
    signal::install_signal_handler(event_loop.shutdown_handle());

    event_loop.run()
}
