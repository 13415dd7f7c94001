//! Connection contract shared by direct and detour connections.
//!
//! Every operation spawns one task that performs a single transport call and
//! reports exactly one [`IoResult`] on the caller's channel. Upstream logic
//! that races the two kinds dispatches on [`Conn::conn_type`].

pub mod direct;

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::ConnError;

/// Kind of connection, used to pick the classification and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    Direct,
    Detour,
}

impl ConnType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnType::Direct => "direct",
            ConnType::Detour => "detour",
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one read or write.
pub struct IoResult {
    /// Bytes transferred. Zero when a read failed classification.
    pub n: usize,
    /// The caller's buffer, handed back. Cleared when a read failed classification.
    pub buf: Vec<u8>,
    pub err: Option<ConnError>,
    /// Connection the operation ran on.
    pub conn: Arc<dyn Conn>,
}

impl IoResult {
    /// The transferred bytes.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.n.min(self.buf.len())]
    }
}

impl fmt::Debug for IoResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoResult")
            .field("n", &self.n)
            .field("err", &self.err)
            .field("conn_type", &self.conn.conn_type())
            .field("addr", &self.conn.addr())
            .finish()
    }
}

/// A connection whose reads and writes report asynchronously.
pub trait Conn: Send + Sync {
    fn conn_type(&self) -> ConnType;

    /// Address the connection was dialed with.
    fn addr(&self) -> &str;

    /// First read after the dial, where forged responses are most likely.
    fn first_read(self: Arc<Self>, buf: Vec<u8>, tx: mpsc::Sender<IoResult>);

    fn followup_read(self: Arc<Self>, buf: Vec<u8>, tx: mpsc::Sender<IoResult>);

    fn write(self: Arc<Self>, buf: Vec<u8>, tx: mpsc::Sender<IoResult>);

    /// Close the connection. Safe to call more than once.
    fn close(&self);
}
