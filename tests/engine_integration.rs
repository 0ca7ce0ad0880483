//! End-to-end scenarios driven over real loopback TCP and a real FIFO,
//! matching the plain-proxy and bad-status cases the core is built around.
//! The engine's readiness loop never returns on its own — the only exit is
//! process interrupt — so each test spawns it on a background thread and
//! abandons it once the log file shows the expected line.

use std::io::{Read, Write};
use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};

use slitscan::config::Config;
use slitscan::Engine;

fn unique_path(tag: &str) -> String {
    std::env::temp_dir()
        .join(format!("slitscan-test-{tag}-{}", std::process::id()))
        .to_str()
        .unwrap()
        .to_string()
}

fn read_connect_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

fn wait_for_log_containing(path: &str, needle: &str, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if contents.contains(needle) {
                return true;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

#[test]
fn plain_open_proxy_logs_same_back() {
    let fifo_path = unique_path("plain-fifo");
    let log_path = unique_path("plain-log");

    let harness_addr: SocketAddrV4 = "127.0.0.1:19190".parse().unwrap();
    let listener_addr: SocketAddrV4 = "127.0.0.1:19191".parse().unwrap();

    let harness = TcpListener::bind(harness_addr).unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = harness.accept().unwrap();
        let _ = read_connect_line(&mut stream);
        stream.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();

        let mut nonce = [0u8; 64];
        stream.read_exact(&mut nonce).unwrap();

        // Dial the listener back from the same source IP as the candidate
        // (loopback), which is what makes this SAME_BACK rather than
        // DIFF_BACK.
        let _callback = TcpStream::connect(listener_addr).unwrap();
        std::thread::sleep(Duration::from_secs(2));
    });

    let config = Config {
        bind: listener_addr,
        advertise: listener_addr,
        ingest_path: fifo_path.clone(),
        log_path: log_path.clone(),
    };

    let mut engine = Engine::new(config).unwrap();
    std::thread::spawn(move || {
        let _ = engine.run();
    });

    // The ingest FIFO's read side is opened inside Engine::new above, so
    // this write-side open will not block waiting for a reader.
    std::thread::sleep(Duration::from_millis(200));
    let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo_path).unwrap();
    writeln!(writer, "127.0.0.1:{}", harness_addr.port()).unwrap();
    drop(writer);

    assert!(
        wait_for_log_containing(&log_path, "><", Duration::from_secs(10)),
        "expected a same-IP connect-back log line"
    );

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains(&format!("127.0.0.1:{}", harness_addr.port())));
}

#[test]
fn bad_status_logs_failure() {
    let fifo_path = unique_path("bad-status-fifo");
    let log_path = unique_path("bad-status-log");

    let harness_addr: SocketAddrV4 = "127.0.0.1:19192".parse().unwrap();
    let listener_addr: SocketAddrV4 = "127.0.0.1:19193".parse().unwrap();

    let harness = TcpListener::bind(harness_addr).unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = harness.accept().unwrap();
        let _ = read_connect_line(&mut stream);
        stream.write_all(b"HTTP/1.0 407 Proxy Authentication Required\r\n\r\n").unwrap();
        std::thread::sleep(Duration::from_secs(2));
    });

    let config = Config {
        bind: listener_addr,
        advertise: listener_addr,
        ingest_path: fifo_path.clone(),
        log_path: log_path.clone(),
    };

    let mut engine = Engine::new(config).unwrap();
    std::thread::spawn(move || {
        let _ = engine.run();
    });

    std::thread::sleep(Duration::from_millis(200));
    let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo_path).unwrap();
    writeln!(writer, "127.0.0.1:{}", harness_addr.port()).unwrap();
    drop(writer);

    assert!(
        wait_for_log_containing(&log_path, "--", Duration::from_secs(10)),
        "expected a failure log line for the non-200 status"
    );

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("non-200 status"));
}

#[test]
fn tunnel_correlation_discovers_both_sides() {
    let fifo_path = unique_path("tunnel-fifo");
    let log_path = unique_path("tunnel-log");

    let harness_addr: SocketAddrV4 = "127.0.0.1:19195".parse().unwrap();
    let listener_addr: SocketAddrV4 = "127.0.0.1:19196".parse().unwrap();
    // A distinct loopback alias stands in for the tunnel's egress host: its
    // source IP must differ from the ingress candidate's (127.0.0.1) or the
    // connect-back would be classified SAME_BACK instead of DIFF_BACK.
    let egress_source: SocketAddrV4 = "127.0.0.2:0".parse().unwrap();

    let harness = TcpListener::bind(harness_addr).unwrap();
    std::thread::spawn(move || {
        let (mut stream, _) = harness.accept().unwrap();
        let _ = read_connect_line(&mut stream);
        stream.write_all(b"HTTP/1.0 200 OK\r\n\r\n").unwrap();

        let mut nonce = [0u8; 64];
        stream.read_exact(&mut nonce).unwrap();

        let mut egress = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        egress.bind(&SockAddr::from(SocketAddr::V4(egress_source))).unwrap();
        egress.connect(&SockAddr::from(SocketAddr::V4(listener_addr))).unwrap();
        egress.write_all(&nonce).unwrap();

        std::thread::sleep(Duration::from_secs(2));
    });

    let config = Config {
        bind: listener_addr,
        advertise: listener_addr,
        ingest_path: fifo_path.clone(),
        log_path: log_path.clone(),
    };

    let mut engine = Engine::new(config).unwrap();
    std::thread::spawn(move || {
        let _ = engine.run();
    });

    std::thread::sleep(Duration::from_millis(200));
    let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo_path).unwrap();
    writeln!(writer, "127.0.0.1:{}", harness_addr.port()).unwrap();
    drop(writer);

    assert!(
        wait_for_log_containing(&log_path, ")(", Duration::from_secs(10)),
        "expected the egress side of the tunnel to be logged"
    );

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("()"), "expected the ingress side of the tunnel to be logged");
    assert!(contents.contains("DISCOVERED"));
    assert!(contents.contains(&format!("127.0.0.1:{}", harness_addr.port())));
}

#[test]
fn unrecognized_nonce_on_diff_back_logs_discord_failure() {
    let fifo_path = unique_path("unknown-nonce-fifo");
    let log_path = unique_path("unknown-nonce-log");

    let listener_addr: SocketAddrV4 = "127.0.0.1:19197".parse().unwrap();

    let config = Config {
        bind: listener_addr,
        advertise: listener_addr,
        ingest_path: fifo_path,
        log_path: log_path.clone(),
    };

    let mut engine = Engine::new(config).unwrap();
    std::thread::spawn(move || {
        let _ = engine.run();
    });

    std::thread::sleep(Duration::from_millis(200));

    // No outbound probe was ever dialed, so the IP index is empty and this
    // connect-back is classified DIFF_BACK regardless of its source address.
    let mut stream = TcpStream::connect(listener_addr).unwrap();
    stream.write_all(&[b'x'; 64]).unwrap();

    assert!(
        wait_for_log_containing(&log_path, "--", Duration::from_secs(10)),
        "expected a failure log line for the unrecognized nonce"
    );

    let contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(contents.contains("unrecognized nonce"));
}
