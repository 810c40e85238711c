//! Server configuration from command-line options.

use clap::Parser;
use std::net::SocketAddr;

use crate::error::Error;

/// Fallback executor count when hardware concurrency cannot be determined.
pub const DEFAULT_NUM_THREADS: usize = 8;

/// Soft limit on concurrently open connections.
pub const MAX_CONNECTIONS: usize = 512;

const MB: usize = 1024 * 1024;

/// Command-line options.
#[derive(Debug, Clone, Parser)]
#[command(name = "bantam-server")]
#[command(about = "Memcached binary protocol cache server")]
pub struct Options {
    /// IP address of the listening socket.
    #[arg(short = 'i', value_name = "ip", default_value = "127.0.0.1")]
    pub ip: String,

    /// TCP port.
    #[arg(short = 'p', value_name = "port", default_value_t = 11211)]
    pub port: u16,

    /// Number of executor threads. Defaults to hardware concurrency,
    /// falling back to 8.
    #[arg(short = 't', value_name = "threads")]
    pub threads: Option<usize>,

    /// Cache capacity in megabytes.
    #[arg(short = 'm', value_name = "megabytes", default_value_t = 64)]
    pub memory: usize,
}

impl Options {
    /// Number of executors to run.
    pub fn threads(&self) -> usize {
        if let Some(threads) = self.threads {
            return threads;
        }
        let cores = num_cpus::get();
        if cores == 0 {
            DEFAULT_NUM_THREADS
        } else {
            cores
        }
    }

    /// Cache capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.memory * MB
    }

    /// The socket address to listen on.
    pub fn listen_addr(&self) -> Result<SocketAddr, Error> {
        format!("{}:{}", self.ip, self.port)
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("{}:{}", self.ip, self.port)))
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            ip: "127.0.0.1".to_string(),
            port: 11211,
            threads: None,
            memory: 64,
        }
    }
}
