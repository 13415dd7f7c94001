//! Direct-path probing.
//!
//! Dials each address directly, sends one request and drains the response
//! through first and follow-up reads, reporting what the classifiers saw.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::conn::direct::dial_direct;
use crate::conn::{Conn, IoResult};
use crate::context::Context;
use crate::detect;
use crate::error::ConnError;
use crate::whitelist::{MemoryWhitelist, Whitelist};

/// Read buffer size for each probe read.
pub const READ_BUF_SIZE: usize = 4096;

/// Configuration for a probe run.
pub struct ProbeConfig {
    /// Targets as host:port.
    pub addrs: Vec<String>,
    /// ISO 3166-1 alpha-2 code selecting detection rules.
    pub country: String,
    pub connect_timeout: Duration,
    /// Payload written after connecting; nothing is written when `None`.
    pub request: Option<Vec<u8>>,
}

/// What happened to one probed address.
#[derive(Debug)]
pub enum ProbeOutcome {
    /// No connection was delivered: dial failure, tampering or DNS poisoning.
    NotDelivered,
    /// Response read to end-of-stream.
    Completed { bytes: u64 },
    Failed { bytes: u64, error: ConnError },
}

impl ProbeOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ProbeOutcome::Completed { .. })
    }
}

/// Probe one address using `ctx`.
pub async fn probe_addr(addr: &str, ctx: Arc<Context>, request: Option<&[u8]>) -> ProbeOutcome {
    let (conn_tx, mut conn_rx) = mpsc::channel(1);
    dial_direct("tcp", addr, ctx, conn_tx);

    // The dial task drops its sender without sending when it gives up.
    let Some(conn) = conn_rx.recv().await else {
        return ProbeOutcome::NotDelivered;
    };

    let (tx, mut rx) = mpsc::channel(1);

    if let Some(request) = request {
        Arc::clone(&conn).write(request.to_vec(), tx.clone());
        if let Some(IoResult { err: Some(error), .. }) = rx.recv().await {
            conn.close();
            return ProbeOutcome::Failed { bytes: 0, error };
        }
    }

    let mut bytes = 0u64;
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut first = true;

    loop {
        buf.resize(READ_BUF_SIZE, 0);
        if first {
            Arc::clone(&conn).first_read(buf, tx.clone());
        } else {
            Arc::clone(&conn).followup_read(buf, tx.clone());
        }
        first = false;

        let Some(result) = rx.recv().await else {
            conn.close();
            return ProbeOutcome::Failed {
                bytes,
                error: io::Error::new(io::ErrorKind::BrokenPipe, "read task vanished").into(),
            };
        };

        match result.err {
            None => {
                debug!("{}: read {} bytes", addr, result.n);
                bytes += result.n as u64;
                buf = result.buf;
            }
            // Read errors already closed the connection.
            Some(ConnError::Eof) => return ProbeOutcome::Completed { bytes },
            Some(error) => return ProbeOutcome::Failed { bytes, error },
        }
    }
}

/// Run a probe over every configured address concurrently.
pub async fn run(config: ProbeConfig) -> io::Result<()> {
    detect::set_country(&config.country);

    let whitelist = Arc::new(MemoryWhitelist::default());
    let (direct_tx, mut direct_rx) = mpsc::channel(config.addrs.len().max(1));
    let ctx = Arc::new(
        Context::new(Arc::clone(&whitelist) as Arc<dyn Whitelist>)
            .with_connect_timeout(config.connect_timeout)
            .with_direct_addrs(direct_tx),
    );

    info!(
        "Probing {} address(es) directly (country rules: {:?})",
        config.addrs.len(),
        detect::current().country()
    );

    let request = config.request.as_deref();
    let outcomes = join_all(
        config
            .addrs
            .iter()
            .map(|addr| probe_addr(addr, Arc::clone(&ctx), request)),
    )
    .await;

    for (addr, outcome) in config.addrs.iter().zip(&outcomes) {
        let detour = if whitelist.contains(addr) { " (use detour)" } else { "" };
        match outcome {
            ProbeOutcome::NotDelivered => info!("{}: not delivered{}", addr, detour),
            ProbeOutcome::Completed { bytes } => info!("{}: completed, {} bytes{}", addr, bytes, detour),
            ProbeOutcome::Failed { bytes, error } => {
                info!("{}: failed after {} bytes: {}{}", addr, bytes, error, detour)
            }
        }
    }

    while let Ok(addr) = direct_rx.try_recv() {
        info!("{} can be dialed directly", addr);
    }

    let stats = ctx.stats().snapshot_and_reset();
    info!(
        "[stats] dials={} connected={} dial_failures={} dns_poisoned={} tampering={} hijacked={} confirmed_direct={} bytes_read={}",
        stats.dials,
        stats.connected,
        stats.dial_failures,
        stats.dns_poisoned,
        stats.tampering,
        stats.hijacked,
        stats.confirmed_direct,
        stats.bytes_read
    );

    Ok(())
}
