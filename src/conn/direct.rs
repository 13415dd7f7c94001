//! Direct-path connections.
//!
//! A direct connection is only handed out after it passed the DNS-poisoning
//! check. Every read is then classified: forged payloads and tampering-like
//! errors put the address on the whitelist so later dials take the detour, and
//! a connection that delivered clean bytes announces its address on close so
//! later dials can skip detection.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use socket2::SockRef;
use tokio::net::{TcpStream, lookup_host};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::{Conn, ConnType, IoResult};
use crate::context::Context;
use crate::detect::Detector;
use crate::error::{ConnError, DialError};

/// Dial `addr` directly in the background.
///
/// A connection that connected and passed the DNS-poisoning check is sent on
/// `tx`. Otherwise nothing is sent; the failure is only logged.
pub fn dial_direct(
    network: &str,
    addr: &str,
    ctx: Arc<Context>,
    tx: mpsc::Sender<Arc<dyn Conn>>,
) {
    let network = network.to_string();
    let addr = addr.to_string();

    tokio::spawn(async move {
        trace!("Dialing direct connection to {}", addr);
        match DirectConn::connect(&network, &addr, ctx).await {
            Ok(conn) => {
                trace!("Dial directly to {} succeeded", addr);
                let conn: Arc<dyn Conn> = Arc::new(conn);
                let _ = tx.send(conn).await;
            }
            Err(DialError::DnsPoisoned) => {
                debug!("Dial directly to {}, dns hijacked, add to whitelist", addr);
            }
            Err(DialError::TamperingSuspected(err)) => {
                debug!("Dial directly to {}, tampering suspected: {}", addr, err);
            }
            Err(err) => {
                debug!("Dial directly to {} failed: {}", addr, err);
            }
        }
    });
}

/// Address families accepted for a network name.
#[derive(Debug, Clone, Copy)]
enum Family {
    Any,
    V4,
    V6,
}

impl Family {
    fn parse(network: &str) -> Result<Self, DialError> {
        match network {
            "tcp" => Ok(Family::Any),
            "tcp4" => Ok(Family::V4),
            "tcp6" => Ok(Family::V6),
            other => Err(DialError::UnsupportedNetwork(other.to_string())),
        }
    }

    fn allows(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        }
    }
}

/// Resolve and connect, trying each resolved address in turn.
async fn dial_tcp(network: &str, family: Family, addr: &str) -> Result<TcpStream, DialError> {
    let mut last_err = None;

    for target in lookup_host(addr).await?.filter(|a| family.allows(a)) {
        match TcpStream::connect(target).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }

    Err(match last_err {
        Some(err) => DialError::Io(err),
        None => DialError::NoAddress {
            network: network.to_string(),
            addr: addr.to_string(),
        },
    })
}

/// Classifier rejection: the error to report, and whether the address looks
/// blocked and belongs on the whitelist.
#[derive(Debug)]
pub(crate) struct Rejected {
    err: ConnError,
    blocked: bool,
}

impl Rejected {
    fn blocked(err: impl Into<ConnError>) -> Self {
        Self {
            err: err.into(),
            blocked: true,
        }
    }

    fn pass(err: impl Into<ConnError>) -> Self {
        Self {
            err: err.into(),
            blocked: false,
        }
    }
}

type ReadChecker = fn(&Detector, &[u8], io::Result<usize>, &str) -> Result<usize, Rejected>;

/// Policy for the first read after a dial.
pub(crate) fn check_first_read(
    detector: &Detector,
    buf: &[u8],
    result: io::Result<usize>,
    addr: &str,
) -> Result<usize, Rejected> {
    match result {
        Ok(n) if n > 0 || buf.is_empty() => {
            if !detector.fake_response(&buf[..n]) {
                return Ok(n);
            }
            trace!("Read {} bytes from {} directly, response is hijacked", n, addr);
            Err(Rejected::blocked(ConnError::ResponseHijacked))
        }
        Ok(_) => {
            trace!("Read 0 bytes from {} directly, EOF", addr);
            Err(Rejected::pass(ConnError::Eof))
        }
        Err(err) => {
            debug!("Error while read from {} directly: {}", addr, err);
            if detector.tampering_suspected(&err) {
                return Err(Rejected::blocked(err));
            }
            Err(Rejected::pass(err))
        }
    }
}

/// Policy for reads after the first one.
pub(crate) fn check_followup_read(
    detector: &Detector,
    buf: &[u8],
    result: io::Result<usize>,
    addr: &str,
) -> Result<usize, Rejected> {
    let n = match result {
        Err(err) => {
            if detector.tampering_suspected(&err) {
                trace!("Seems {} still blocked, add to whitelist to try detour next time", addr);
                return Err(Rejected::blocked(err));
            }
            trace!("Read from {} directly failed: {}", addr, err);
            return Err(Rejected::pass(err));
        }
        Ok(0) if !buf.is_empty() => {
            trace!("Read 0 bytes from {} directly, EOF", addr);
            return Err(Rejected::pass(ConnError::Eof));
        }
        Ok(n) => n,
    };

    if detector.fake_response(&buf[..n]) {
        trace!("{} still content hijacked, add to whitelist to try detour next time", addr);
        return Err(Rejected::blocked(ConnError::ContentHijacked));
    }
    trace!("Read {} bytes from {} directly (follow-up)", n, addr);
    Ok(n)
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed network connection")
}

/// A TCP connection dialed without any intermediary.
pub struct DirectConn {
    stream: TcpStream,
    addr: String,
    /// Bytes accepted by read classification.
    read_bytes: AtomicU64,
    /// Set once classification put `addr` on the whitelist.
    flagged: AtomicBool,
    closed: watch::Sender<bool>,
    ctx: Arc<Context>,
}

impl DirectConn {
    /// Dial `addr` and run the DNS-poisoning check on the result.
    ///
    /// A poisoned connection is closed and its address whitelisted durably.
    /// Dial errors never touch the whitelist, even when they look like
    /// tampering.
    pub async fn connect(network: &str, addr: &str, ctx: Arc<Context>) -> Result<Self, DialError> {
        let family = Family::parse(network)?;
        ctx.stats().record_dial();

        let dialed = tokio::time::timeout(ctx.connect_timeout(), dial_tcp(network, family, addr)).await;
        let detector = ctx.detector();

        let stream = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(DialError::Io(err))) if detector.tampering_suspected(&err) => {
                ctx.stats().record_tampering();
                return Err(DialError::TamperingSuspected(err));
            }
            Ok(Err(err)) => {
                ctx.stats().record_dial_failure();
                return Err(err);
            }
            Err(_) => {
                let err = io::Error::new(io::ErrorKind::TimedOut, "dial timed out");
                if detector.tampering_suspected(&err) {
                    ctx.stats().record_tampering();
                    return Err(DialError::TamperingSuspected(err));
                }
                ctx.stats().record_dial_failure();
                return Err(DialError::Timeout);
            }
        };

        if detector.dns_poisoned(&stream) {
            let _ = SockRef::from(&stream).shutdown(Shutdown::Both);
            drop(stream);
            ctx.whitelist().add(addr, false);
            ctx.stats().record_dns_poisoned();
            return Err(DialError::DnsPoisoned);
        }

        ctx.stats().record_connected();
        Ok(Self::new(stream, addr, ctx))
    }

    fn new(stream: TcpStream, addr: &str, ctx: Arc<Context>) -> Self {
        let (closed, _) = watch::channel(false);

        Self {
            stream,
            addr: addr.to_string(),
            read_bytes: AtomicU64::new(0),
            flagged: AtomicBool::new(false),
            closed,
            ctx,
        }
    }

    /// Total bytes delivered by reads that passed classification.
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn do_read(self: Arc<Self>, mut buf: Vec<u8>, checker: ReadChecker, tx: mpsc::Sender<IoResult>) {
        tokio::spawn(async move {
            let result = self.read_some(&mut buf).await;
            let detector = self.ctx.detector();

            let (n, err) = match checker(&detector, &buf, result, &self.addr) {
                Ok(n) => {
                    self.read_bytes.fetch_add(n as u64, Ordering::SeqCst);
                    self.ctx.stats().record_bytes_read(n as u64);
                    (n, None)
                }
                Err(rejected) => {
                    if rejected.blocked {
                        self.mark_blocked(&rejected.err);
                    }
                    buf.clear();
                    trace!("Close direct conn to {}", self.addr);
                    self.close();
                    (0, Some(rejected.err))
                }
            };

            let _ = tx.send(IoResult { n, buf, err, conn: self }).await;
        });
    }

    fn mark_blocked(&self, err: &ConnError) {
        self.flagged.store(true, Ordering::SeqCst);
        self.ctx.whitelist().add(&self.addr, false);
        if err.is_hijack() {
            self.ctx.stats().record_hijacked();
        } else {
            self.ctx.stats().record_tampering();
        }
    }

    /// One transport read, abandoned with `NotConnected` if the connection
    /// is closed meanwhile.
    async fn read_some(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(closed_error());
        }

        loop {
            tokio::select! {
                biased;
                _ = closed.changed() => return Err(closed_error()),
                ready = self.stream.readable() => {
                    ready?;
                    match self.stream.try_read(buf) {
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                        result => return result,
                    }
                }
            }
        }
    }

    /// Write all of `buf`, returning how much went out before any error.
    async fn write_all(&self, buf: &[u8]) -> (usize, Option<io::Error>) {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return (0, Some(closed_error()));
        }

        let mut written = 0;
        while written < buf.len() {
            tokio::select! {
                biased;
                _ = closed.changed() => return (written, Some(closed_error())),
                ready = self.stream.writable() => {
                    if let Err(err) = ready {
                        return (written, Some(err));
                    }
                    match self.stream.try_write(&buf[written..]) {
                        Ok(0) => return (written, Some(io::ErrorKind::WriteZero.into())),
                        Ok(n) => written += n,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                        Err(err) => return (written, Some(err)),
                    }
                }
            }
        }

        (written, None)
    }
}

impl Conn for DirectConn {
    fn conn_type(&self) -> ConnType {
        ConnType::Direct
    }

    fn addr(&self) -> &str {
        &self.addr
    }

    fn first_read(self: Arc<Self>, buf: Vec<u8>, tx: mpsc::Sender<IoResult>) {
        self.do_read(buf, check_first_read, tx);
    }

    fn followup_read(self: Arc<Self>, buf: Vec<u8>, tx: mpsc::Sender<IoResult>) {
        self.do_read(buf, check_followup_read, tx);
    }

    fn write(self: Arc<Self>, buf: Vec<u8>, tx: mpsc::Sender<IoResult>) {
        tokio::spawn(async move {
            let (n, err) = self.write_all(&buf).await;
            let _ = tx
                .send(IoResult {
                    n,
                    buf,
                    err: err.map(ConnError::Io),
                    conn: self,
                })
                .await;
        });
    }

    /// Shut the socket down; on the first call, announce the address as
    /// direct-capable if clean bytes came through and nothing flagged it.
    fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Err(err) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            trace!("Shutdown of direct conn to {}: {}", self.addr, err);
        }

        if self.read_bytes.load(Ordering::SeqCst) > 0
            && !self.flagged.load(Ordering::SeqCst)
            && !self.ctx.whitelist().is_temporary(&self.addr)
        {
            trace!(
                "no error found till closing, notify caller that {} can be dialed directly",
                self.addr
            );
            if self.ctx.notify_direct(&self.addr) {
                self.ctx.stats().record_confirmed_direct();
            }
        }
    }
}
