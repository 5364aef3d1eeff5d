//! Register transport.
//!
//! Poll loops read holding registers through the [`RegisterReader`] trait so
//! they can run against a scripted reader in tests. [`ModbusTcpReader`] is the
//! production implementation on top of `tokio-modbus`.
//!
//! The Modbus context is stateful (transaction ids, one socket) and must not
//! be used by two requests at once. All groups share one reader, and the
//! reader serializes requests through a `tokio::sync::Mutex`. Every request is
//! bounded by a timeout so a silent device cannot hold the lock forever.
//!
//! A request that timed out or failed on the socket may still be answered
//! later, and that reply would be read as the answer to the next request. The
//! reader therefore drops the connection after such a failure and opens a new
//! one on the next read.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::lookup_host;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::Slave;
use tracing::{debug, info, warn};

/// Errors raised while reading registers.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid device address '{0}'")]
    InvalidAddress(String),

    #[error("Reading {count} registers at {start} failed: {message}")]
    Io {
        start: u16,
        count: u16,
        message: String,
    },

    #[error("Device answered reading {count} registers at {start} with exception {code}")]
    Exception { start: u16, count: u16, code: String },

    #[error("Reading {count} registers at {start} timed out after {timeout:?}")]
    Timeout {
        start: u16,
        count: u16,
        timeout: Duration,
    },

    #[error("Requested {expected} registers at {start}, received {actual}")]
    ShortRead {
        start: u16,
        expected: u16,
        actual: usize,
    },
}

/// Source of holding register blocks.
#[async_trait]
pub trait RegisterReader: Send + Sync {
    /// Read `count` holding registers starting at `start`.
    ///
    /// Implementations return exactly `count` words or an error.
    async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;
}

/// Check that a reply carries exactly the requested number of words.
pub fn check_word_count(
    start: u16,
    count: u16,
    words: Vec<u16>,
) -> Result<Vec<u16>, TransportError> {
    if words.len() == usize::from(count) {
        Ok(words)
    } else {
        Err(TransportError::ShortRead {
            start,
            expected: count,
            actual: words.len(),
        })
    }
}

/// Modbus TCP client shared by every poll loop.
pub struct ModbusTcpReader {
    /// `None` after a failed request, reopened by the next read
    ctx: Mutex<Option<Context>>,
    addr: SocketAddr,
    slave: Slave,
    timeout: Duration,
}

impl ModbusTcpReader {
    /// Resolve `address` (`host:port`) and open the connection.
    ///
    /// The connection attempt is bounded by `read_timeout` as well.
    pub async fn connect(
        address: &str,
        unit_id: u8,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let addr = lookup_host(address)
            .await
            .map_err(|source| TransportError::Connect {
                addr: address.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;

        let ctx = open(addr, Slave(unit_id), read_timeout).await?;
        info!(%addr, unit_id, "Connected to Modbus device");

        Ok(Self {
            ctx: Mutex::new(Some(ctx)),
            addr,
            slave: Slave(unit_id),
            timeout: read_timeout,
        })
    }

    /// Resolved address of the device.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn open(addr: SocketAddr, slave: Slave, limit: Duration) -> Result<Context, TransportError> {
    debug!(%addr, unit_id = slave.0, "Connecting to Modbus device");
    timeout(limit, tcp::connect_slave(addr, slave))
        .await
        .map_err(|_| TransportError::Connect {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
        })?
        .map_err(|source| TransportError::Connect {
            addr: addr.to_string(),
            source,
        })
}

#[async_trait]
impl RegisterReader for ModbusTcpReader {
    async fn read_holding_registers(
        &self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let mut guard = self.ctx.lock().await;
        let mut ctx = match guard.take() {
            Some(ctx) => ctx,
            None => {
                let ctx = open(self.addr, self.slave, self.timeout).await?;
                info!(addr = %self.addr, "Reconnected to Modbus device");
                ctx
            }
        };

        // The connection goes back into the slot only after a complete reply
        let outcome = timeout(self.timeout, ctx.read_holding_registers(start, count)).await;
        let reply = match outcome {
            Ok(Ok(reply)) => {
                *guard = Some(ctx);
                reply
            }
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "Dropping Modbus connection");
                return Err(TransportError::Io {
                    start,
                    count,
                    message: e.to_string(),
                });
            }
            Err(_) => {
                warn!(addr = %self.addr, start, count, "Dropping Modbus connection after timeout");
                return Err(TransportError::Timeout {
                    start,
                    count,
                    timeout: self.timeout,
                });
            }
        };

        let words = reply.map_err(|code| TransportError::Exception {
            start,
            count,
            code: format!("{code:?}"),
        })?;

        check_word_count(start, count, words)
    }
}
