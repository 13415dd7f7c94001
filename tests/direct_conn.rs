//! Direct connections against local TCP peers.

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use detour_direct::probe::{ProbeOutcome, probe_addr};
use detour_direct::{
    Conn, ConnError, ConnType, Context, DetectorCell, Detector, DialError, DirectConn, IoResult,
    MemoryWhitelist, Whitelist, dial_direct,
};

const FORGED: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\nBLOCKED";

struct Harness {
    ctx: Arc<Context>,
    whitelist: Arc<MemoryWhitelist>,
    direct_rx: mpsc::Receiver<String>,
}

fn harness(detector: Detector) -> Harness {
    let whitelist = Arc::new(MemoryWhitelist::default());
    let (direct_tx, direct_rx) = mpsc::channel(8);
    let ctx = Context::new(Arc::clone(&whitelist) as Arc<dyn Whitelist>)
        .with_detectors(Arc::new(DetectorCell::new(detector)))
        .with_direct_addrs(direct_tx);

    Harness {
        ctx: Arc::new(ctx),
        whitelist,
        direct_rx,
    }
}

fn forging_detector() -> Detector {
    Detector::default().with_fake_prefix(FORGED)
}

/// Accept one connection on a local port and hand it to `handler`.
async fn peer<F, Fut>(handler: F) -> String
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            handler(stream).await;
        }
    });
    addr.to_string()
}

/// Write `payload`, then hold the connection until the client goes away.
async fn send_and_hold(mut stream: TcpStream, payload: Vec<u8>) {
    stream.write_all(&payload).await.unwrap();
    let mut sink = [0u8; 256];
    while let Ok(n) = stream.read(&mut sink).await {
        if n == 0 {
            break;
        }
    }
}

async fn first_read(conn: &Arc<DirectConn>, size: usize) -> IoResult {
    let (tx, mut rx) = mpsc::channel(1);
    Arc::clone(conn).first_read(vec![0u8; size], tx);
    rx.recv().await.unwrap()
}

async fn followup_read(conn: &Arc<DirectConn>, size: usize) -> IoResult {
    let (tx, mut rx) = mpsc::channel(1);
    Arc::clone(conn).followup_read(vec![0u8; size], tx);
    rx.recv().await.unwrap()
}

async fn write(conn: &Arc<DirectConn>, payload: &[u8]) -> IoResult {
    let (tx, mut rx) = mpsc::channel(1);
    Arc::clone(conn).write(payload.to_vec(), tx);
    rx.recv().await.unwrap()
}

async fn connect(addr: &str, h: &Harness) -> Arc<DirectConn> {
    Arc::new(DirectConn::connect("tcp", addr, Arc::clone(&h.ctx)).await.unwrap())
}

/// An address nothing listens on.
async fn refused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

#[tokio::test]
async fn clean_first_read_is_delivered_and_counted() {
    let h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, vec![7u8; 512])).await;

    let conn = connect(&addr, &h).await;
    let result = first_read(&conn, 1024).await;

    assert!(result.err.is_none());
    assert_eq!(result.n, 512);
    assert_eq!(result.data(), &[7u8; 512][..]);
    assert_eq!(conn.read_bytes(), 512);
    assert!(!conn.is_closed());
    assert!(!h.whitelist.contains(&addr));
}

#[tokio::test]
async fn dial_direct_delivers_direct_conn() {
    let h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, b"hello".to_vec())).await;
    let (tx, mut rx) = mpsc::channel(1);

    dial_direct("tcp", &addr, Arc::clone(&h.ctx), tx);
    let conn = rx.recv().await.unwrap();

    assert_eq!(conn.conn_type(), ConnType::Direct);
    assert_eq!(conn.addr(), addr);

    let (io_tx, mut io_rx) = mpsc::channel(1);
    Arc::clone(&conn).first_read(vec![0u8; 64], io_tx);
    let result = io_rx.recv().await.unwrap();

    assert_eq!(result.data(), b"hello");
    assert_eq!(result.conn.conn_type(), ConnType::Direct);
    conn.close();
}

#[tokio::test]
async fn forged_first_read_closes_and_whitelists() {
    let mut h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, FORGED.to_vec())).await;

    let conn = connect(&addr, &h).await;
    let result = first_read(&conn, 1024).await;

    assert!(matches!(result.err, Some(ConnError::ResponseHijacked)));
    assert_eq!(result.err.as_ref().unwrap().to_string(), "response is hijacked");
    assert_eq!(result.n, 0);
    assert!(result.buf.is_empty());
    assert!(conn.is_closed());
    assert!(h.whitelist.contains(&addr));
    assert!(!h.whitelist.is_temporary(&addr));
    assert_eq!(conn.read_bytes(), 0);
    assert!(h.direct_rx.try_recv().is_err());
    assert_eq!(h.ctx.stats().snapshot_and_reset().hijacked, 1);
}

#[tokio::test]
async fn forged_followup_read_is_content_hijacked() {
    let mut h = harness(forging_detector());
    let addr = peer(|mut s| async move {
        s.write_all(b"hello").await.unwrap();
        let mut ack = [0u8; 1];
        s.read_exact(&mut ack).await.unwrap();
        send_and_hold(s, FORGED.to_vec()).await;
    })
    .await;

    let conn = connect(&addr, &h).await;
    assert_eq!(first_read(&conn, 64).await.n, 5);
    assert!(write(&conn, b"k").await.err.is_none());
    let result = followup_read(&conn, 64).await;

    assert!(matches!(result.err, Some(ConnError::ContentHijacked)));
    assert_eq!(result.n, 0);
    assert!(conn.is_closed());
    assert!(h.whitelist.contains(&addr));
    assert_eq!(conn.read_bytes(), 5);
    // Clean bytes came through, but the connection was flagged before closing.
    assert!(h.direct_rx.try_recv().is_err());
}

#[tokio::test]
async fn eof_passes_through_without_whitelisting() {
    let h = harness(forging_detector());
    let addr = peer(|s| async move { drop(s) }).await;

    let conn = connect(&addr, &h).await;
    let result = first_read(&conn, 64).await;

    assert!(result.err.as_ref().is_some_and(ConnError::is_eof));
    assert_eq!(result.n, 0);
    assert!(conn.is_closed());
    assert!(h.whitelist.is_empty());
}

#[tokio::test]
async fn read_bytes_is_sum_of_accepted_reads() {
    let h = harness(forging_detector());
    let addr = peer(|mut s| async move {
        for size in [100usize, 200, 300] {
            s.write_all(&vec![1u8; size]).await.unwrap();
            let mut ack = [0u8; 1];
            if s.read_exact(&mut ack).await.is_err() {
                return;
            }
        }
    })
    .await;

    let conn = connect(&addr, &h).await;
    let mut total = 0;

    let result = first_read(&conn, 1024).await;
    total += result.n;
    for _ in 0..2 {
        write(&conn, b"k").await;
        let result = followup_read(&conn, 1024).await;
        assert!(result.err.is_none());
        total += result.n;
    }

    assert_eq!(total, 600);
    assert_eq!(conn.read_bytes(), 600);
    assert_eq!(h.ctx.stats().snapshot_and_reset().bytes_read, 600);
}

#[tokio::test]
async fn close_notifies_once() {
    let mut h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, b"genuine".to_vec())).await;

    let conn = connect(&addr, &h).await;
    assert!(first_read(&conn, 64).await.err.is_none());

    conn.close();
    conn.close();

    assert_eq!(h.direct_rx.try_recv().unwrap(), addr);
    assert!(h.direct_rx.try_recv().is_err());
    assert_eq!(h.ctx.stats().snapshot_and_reset().confirmed_direct, 1);
}

#[tokio::test]
async fn close_without_data_does_not_notify() {
    let mut h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, Vec::new())).await;

    let conn = connect(&addr, &h).await;
    conn.close();

    assert!(conn.is_closed());
    assert!(h.direct_rx.try_recv().is_err());
}

#[tokio::test]
async fn temporarily_flagged_address_does_not_notify() {
    let mut h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, b"genuine".to_vec())).await;

    let conn = connect(&addr, &h).await;
    assert!(first_read(&conn, 64).await.err.is_none());
    h.whitelist.add(&addr, true);
    conn.close();

    assert!(h.direct_rx.try_recv().is_err());
}

#[tokio::test]
async fn notification_dropped_without_listener() {
    let h = harness(forging_detector());
    let Harness { ctx, direct_rx, .. } = h;
    drop(direct_rx);
    let addr = peer(|s| send_and_hold(s, b"genuine".to_vec())).await;

    let conn = Arc::new(DirectConn::connect("tcp", &addr, Arc::clone(&ctx)).await.unwrap());
    assert!(first_read(&conn, 64).await.err.is_none());
    conn.close();

    assert_eq!(ctx.stats().snapshot_and_reset().confirmed_direct, 0);
}

#[tokio::test]
async fn pending_read_fails_when_closed() {
    let h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, Vec::new())).await;

    let conn = connect(&addr, &h).await;
    let (tx, mut rx) = mpsc::channel(1);
    Arc::clone(&conn).first_read(vec![0u8; 64], tx);
    tokio::task::yield_now().await;
    conn.close();

    let result = rx.recv().await.unwrap();
    assert!(matches!(
        result.err,
        Some(ConnError::Io(ref e)) if e.kind() == io::ErrorKind::NotConnected
    ));
    assert!(h.whitelist.is_empty());
}

#[tokio::test]
async fn write_reports_bytes_written() {
    let h = harness(forging_detector());
    let (seen_tx, mut seen_rx) = mpsc::channel(1);
    let addr = peer(move |mut s| async move {
        let mut buf = vec![0u8; 100];
        s.read_exact(&mut buf).await.unwrap();
        let _ = seen_tx.send(buf).await;
    })
    .await;

    let conn = connect(&addr, &h).await;
    let result = write(&conn, &[9u8; 100]).await;

    assert!(result.err.is_none());
    assert_eq!(result.n, 100);
    assert_eq!(seen_rx.recv().await.unwrap(), vec![9u8; 100]);
}

#[tokio::test]
async fn write_after_close_fails() {
    let h = harness(forging_detector());
    let addr = peer(|s| send_and_hold(s, Vec::new())).await;

    let conn = connect(&addr, &h).await;
    conn.close();
    let result = write(&conn, b"late").await;

    assert_eq!(result.n, 0);
    assert!(result.err.is_some());
}

#[tokio::test]
async fn dns_poisoned_dial_is_never_delivered() {
    let h = harness(Detector::default().with_poisoned_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let addr = peer(|s| send_and_hold(s, b"hello".to_vec())).await;

    let result = DirectConn::connect("tcp", &addr, Arc::clone(&h.ctx)).await;

    assert!(matches!(result, Err(DialError::DnsPoisoned)));
    assert!(h.whitelist.contains(&addr));
    assert!(!h.whitelist.is_temporary(&addr));
}

#[tokio::test]
async fn dial_direct_drops_poisoned_connection() {
    let h = harness(Detector::default().with_poisoned_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let addr = peer(|s| send_and_hold(s, b"hello".to_vec())).await;
    let (tx, mut rx) = mpsc::channel(1);

    dial_direct("tcp", &addr, Arc::clone(&h.ctx), tx);

    assert!(rx.recv().await.is_none());
    assert!(h.whitelist.contains(&addr));
}

#[tokio::test]
async fn tampering_dial_failure_does_not_whitelist() {
    let h = harness(Detector::default().with_tampering_kind(io::ErrorKind::ConnectionRefused));
    let addr = refused_addr().await;

    let result = DirectConn::connect("tcp", &addr, Arc::clone(&h.ctx)).await;

    assert!(matches!(result, Err(DialError::TamperingSuspected(_))));
    assert!(h.whitelist.is_empty());

    let (tx, mut rx) = mpsc::channel(1);
    dial_direct("tcp", &addr, Arc::clone(&h.ctx), tx);
    assert!(rx.recv().await.is_none());
    assert!(h.whitelist.is_empty());
}

#[tokio::test]
async fn ordinary_dial_failure_is_io_error() {
    let h = harness(Detector::default());
    let addr = refused_addr().await;

    let result = DirectConn::connect("tcp", &addr, Arc::clone(&h.ctx)).await;

    assert!(matches!(result, Err(DialError::Io(_))));
    assert!(h.whitelist.is_empty());
}

#[tokio::test]
async fn unsupported_network_is_rejected() {
    let h = harness(Detector::default());

    let result = DirectConn::connect("udp", "127.0.0.1:53", Arc::clone(&h.ctx)).await;

    assert!(matches!(result, Err(DialError::UnsupportedNetwork(_))));
    assert_eq!(h.ctx.stats().snapshot_and_reset().dials, 0);
}

#[tokio::test]
async fn tcp6_finds_no_address_for_ipv4_literal() {
    let h = harness(Detector::default());

    let result = DirectConn::connect("tcp6", "127.0.0.1:80", Arc::clone(&h.ctx)).await;

    assert!(matches!(result, Err(DialError::NoAddress { .. })));
}

#[tokio::test]
async fn detector_swap_applies_to_next_read() {
    let cell = Arc::new(DetectorCell::new(Detector::default()));
    let whitelist = Arc::new(MemoryWhitelist::default());
    let ctx = Arc::new(
        Context::new(Arc::clone(&whitelist) as Arc<dyn Whitelist>).with_detectors(Arc::clone(&cell)),
    );
    let addr = peer(|s| send_and_hold(s, FORGED.to_vec())).await;

    let conn = Arc::new(DirectConn::connect("tcp", &addr, ctx).await.unwrap());
    cell.store(forging_detector());
    let result = first_read(&conn, 1024).await;

    assert!(matches!(result.err, Some(ConnError::ResponseHijacked)));
    assert!(whitelist.contains(&addr));
}

#[tokio::test]
async fn probe_completes_against_clean_peer() {
    let h = harness(forging_detector());
    let addr = peer(|mut s| async move {
        let mut req = [0u8; 4];
        s.read_exact(&mut req).await.unwrap();
        s.write_all(b"pong").await.unwrap();
    })
    .await;

    let outcome = probe_addr(&addr, Arc::clone(&h.ctx), Some(b"ping")).await;

    assert!(matches!(outcome, ProbeOutcome::Completed { bytes: 4 }));
}

#[tokio::test]
async fn probe_reports_undelivered_dial() {
    let h = harness(Detector::default());
    let addr = refused_addr().await;

    let outcome = probe_addr(&addr, Arc::clone(&h.ctx), None).await;

    assert!(matches!(outcome, ProbeOutcome::NotDelivered));
}
