//! Detour - adaptive direct-path connections.
//!
//! Dials addresses directly, classifies every read for signs of censorship,
//! and learns which addresses need the detour path and which are safe to
//! dial directly.

pub mod conn;
pub mod context;
pub mod detect;
pub mod error;
pub mod probe;
pub mod stats;
pub mod whitelist;

pub use conn::direct::{DirectConn, dial_direct};
pub use conn::{Conn, ConnType, IoResult};
pub use context::{Context, TIMEOUT_TO_CONNECT};
pub use detect::{Detector, DetectorCell, set_country};
pub use error::{ConnError, DialError};
pub use whitelist::{MemoryWhitelist, Whitelist};
