//! Built-in per-country detection tables.
//!
//! Each table lists peer addresses that only a poisoned resolver would hand
//! out, and payload prefixes of block pages injected in place of the genuine
//! response.

use std::io::ErrorKind;
use std::net::Ipv4Addr;

/// Errors that, on a direct dial or read, point at active interference.
pub(super) const TAMPERING_KINDS: [ErrorKind; 4] = [
    ErrorKind::TimedOut,
    ErrorKind::ConnectionReset,
    ErrorKind::ConnectionAborted,
    ErrorKind::BrokenPipe,
];

/// Detection table for one country.
pub(super) struct Rules {
    pub poisoned_ips: &'static [Ipv4Addr],
    pub fake_prefixes: &'static [&'static [u8]],
}

const EMPTY: Rules = Rules {
    poisoned_ips: &[],
    fake_prefixes: &[],
};

const IR: Rules = Rules {
    poisoned_ips: &[
        Ipv4Addr::new(10, 10, 34, 34),
        Ipv4Addr::new(10, 10, 34, 35),
        Ipv4Addr::new(10, 10, 34, 36),
    ],
    fake_prefixes: &[IR_BLOCK_PAGE],
};

// Served with the real server's socket still open, so it only shows up on read.
const IR_BLOCK_PAGE: &[u8] = b"HTTP/1.1 403 Forbidden\r\nConnection:close\r\n\r\n<html><head><meta http-equiv=\"Content-Type\" content=\"text/html; charset=windows-1256\"><title>M1-";

const CN: Rules = Rules {
    poisoned_ips: &[
        Ipv4Addr::new(4, 36, 66, 178),
        Ipv4Addr::new(8, 7, 198, 45),
        Ipv4Addr::new(37, 61, 54, 158),
        Ipv4Addr::new(46, 82, 174, 68),
        Ipv4Addr::new(59, 24, 3, 173),
        Ipv4Addr::new(64, 33, 88, 161),
        Ipv4Addr::new(78, 16, 49, 15),
        Ipv4Addr::new(93, 46, 8, 89),
        Ipv4Addr::new(159, 106, 121, 75),
        Ipv4Addr::new(203, 98, 7, 65),
        Ipv4Addr::new(243, 185, 187, 39),
    ],
    fake_prefixes: &[],
};

/// Look up the table for an ISO 3166-1 alpha-2 code, case-insensitively.
///
/// Unknown codes get the empty table.
pub(super) fn for_country(country: &str) -> &'static Rules {
    match country.to_ascii_uppercase().as_str() {
        "IR" => &IR,
        "CN" => &CN,
        _ => &EMPTY,
    }
}
