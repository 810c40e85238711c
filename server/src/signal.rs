//! Signal handling for graceful shutdown.
//!
//! SIGINT or SIGTERM triggers a graceful stop through the event loop's
//! shutdown handle; a second signal forces immediate exit.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::event_loop::ShutdownHandle;

/// Install signal handlers that stop the server via `handle`.
pub fn install_signal_handler(handle: ShutdownHandle) {
    let signaled = AtomicBool::new(false);

    ctrlc::set_handler(move || {
        if signaled.swap(true, Ordering::SeqCst) {
            tracing::warn!("received second signal, forcing immediate exit");
            std::process::exit(1);
        }
        tracing::info!("received shutdown signal, stopping server");
        handle.shutdown();
    })
    .expect("failed to set signal handler");
}
