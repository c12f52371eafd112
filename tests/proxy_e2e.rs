//! End-to-end forwarding scenarios over loopback sockets.
//!
//! Each test builds a worker from a real configuration, points it at
//! echo servers running on threads, and drives the scheduler loop from
//! the test thread until the expected outcome is observed.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard::{Config, Worker};

/// Stats shared with an echo-server thread.
#[derive(Default)]
struct EchoStats {
    accepted: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
}

/// Starts an echo server; every accepted connection echoes whatever it
/// reads until the peer closes.
fn spawn_echo() -> (SocketAddr, Arc<EchoStats>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("echo bind");
    let addr = listener.local_addr().unwrap();
    let stats = Arc::new(EchoStats::default());
    let tstats = Arc::clone(&stats);
    std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { continue };
            let cstats = Arc::clone(&tstats);
            cstats.accepted.fetch_add(1, Ordering::SeqCst);
            let cur = cstats.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            cstats.max_concurrent.fetch_max(cur, Ordering::SeqCst);
            std::thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
                cstats.concurrent.fetch_sub(1, Ordering::SeqCst);
            });
        }
    });
    (addr, stats)
}

/// Runs scheduler iterations until `pred` holds or the deadline passes.
fn pump(w: &mut Worker, deadline: Duration, mut pred: impl FnMut(&Worker) -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if pred(w) {
            return true;
        }
        if !w.run_once().expect("scheduler iteration") {
            return pred(w);
        }
    }
    pred(w)
}

fn two_server_config(a: SocketAddr, b: SocketAddr, extra_be: &str) -> Config {
    Config::from_json(&format!(
        r#"{{
            "global": {{ "grace": 200 }},
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "maxconn": 100,
                "default_backend": "be",
                "timeouts": {{ "client": 5000 }}
            }}],
            "backends": [{{
                "name": "be",
                "balance": "roundrobin",
                "retries": 2,
                "timeouts": {{ "connect": 2000, "server": 5000, "queue": 3000 }}{extra_be},
                "servers": [
                    {{ "name": "a", "addr": "{a}" }},
                    {{ "name": "b", "addr": "{b}" }}
                ]
            }}]
        }}"#
    ))
    .expect("config")
}

/// One client exchange: connect, send, expect the echo, close.
fn client_roundtrip(addr: SocketAddr, payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut c = TcpStream::connect(addr)?;
    c.set_read_timeout(Some(Duration::from_secs(5)))?;
    c.write_all(payload)?;
    let mut got = vec![0u8; payload.len()];
    c.read_exact(&mut got)?;
    Ok(got)
}

#[test]
fn round_robin_splits_sequential_clients() {
    let (a_addr, a_stats) = spawn_echo();
    let (b_addr, b_stats) = spawn_echo();
    let cfg = two_server_config(a_addr, b_addr, "");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    for i in 0..20 {
        let payload = format!("ping-{i}");
        let handle = std::thread::spawn(move || client_roundtrip(front, payload.as_bytes()));
        // drive the proxy while the client blocks on its reply
        let done = pump(&mut w, Duration::from_secs(5), |_| handle.is_finished());
        assert!(done, "client {i} stuck");
        let got = handle.join().unwrap().expect("roundtrip");
        assert_eq!(got, format!("ping-{i}").as_bytes());
    }
    // let the closes drain
    pump(&mut w, Duration::from_secs(2), |w| w.session_count() == 0);

    assert_eq!(a_stats.accepted.load(Ordering::SeqCst), 10);
    assert_eq!(b_stats.accepted.load(Ordering::SeqCst), 10);
}

#[test]
fn saturated_server_queues_then_serves() {
    let (a_addr, a_stats) = spawn_echo();
    // single server with maxconn 1: the second client must wait in queue
    let cfg = Config::from_json(&format!(
        r#"{{
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "default_backend": "be",
                "timeouts": {{ "client": 5000 }}
            }}],
            "backends": [{{
                "name": "be",
                "timeouts": {{ "connect": 2000, "server": 5000, "queue": 5000 }},
                "servers": [
                    {{ "name": "a", "addr": "{a_addr}", "maxconn": 1 }}
                ]
            }}]
        }}"#
    ))
    .expect("config");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    let release = Arc::new(AtomicUsize::new(0));
    let h1_release = Arc::clone(&release);
    let h1 = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.write_all(b"first").unwrap();
        let mut got = [0u8; 5];
        c.read_exact(&mut got).unwrap();
        // hold the slot until the main thread observed the queue
        while h1_release.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(10));
        }
        drop(c);
        got
    });
    std::thread::sleep(Duration::from_millis(50));
    let h2 = std::thread::spawn(move || client_roundtrip(front, b"second"));

    // while the first client holds the only slot, the second one must be
    // waiting in the backend's shared queue (the rotation skipped the
    // saturated server, so no server was assigned)
    let saw_queue = {
        let start = Instant::now();
        let mut seen = false;
        while start.elapsed() < Duration::from_secs(5) && !seen {
            let contents = w.admin_exec("pool.contents be");
            let v: serde_json::Value = serde_json::from_str(&contents).unwrap();
            if v["queued"] == 1 && v["servers"][0]["served"] == 1 {
                seen = true;
                break;
            }
            if !w.run_once().expect("iteration") {
                break;
            }
        }
        seen
    };
    assert!(saw_queue, "second session never appeared in the queue");
    release.store(1, Ordering::SeqCst);

    let done = pump(&mut w, Duration::from_secs(10), |_| {
        h1.is_finished() && h2.is_finished()
    });
    assert!(done, "clients stuck");
    assert_eq!(&h1.join().unwrap(), b"first");
    assert_eq!(h2.join().unwrap().expect("second client"), b"second");

    pump(&mut w, Duration::from_secs(2), |w| w.session_count() == 0);
    assert_eq!(a_stats.accepted.load(Ordering::SeqCst), 2);
}

#[test]
fn content_rule_rejects_before_any_server_contact() {
    let (a_addr, a_stats) = spawn_echo();
    let cfg = Config::from_json(&format!(
        r#"{{
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "default_backend": "be",
                "timeouts": {{ "client": 3000 }},
                "tcp_request_content": {{
                    "inspect_delay": 1000,
                    "rules": [
                        {{ "action": "reject",
                           "cond": {{ "payload_starts_with": {{ "prefix": "BAD" }} }} }}
                    ]
                }}
            }}],
            "backends": [{{
                "name": "be",
                "timeouts": {{ "connect": 2000, "server": 3000 }},
                "servers": [{{ "name": "a", "addr": "{a_addr}" }}]
            }}]
        }}"#
    ))
    .expect("config");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    let handle = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        c.write_all(b"BAD request").unwrap();
        let mut buf = [0u8; 16];
        // the proxy kills the session: EOF or reset, never data
        matches!(c.read(&mut buf), Ok(0) | Err(_))
    });
    let done = pump(&mut w, Duration::from_secs(5), |_| handle.is_finished());
    assert!(done, "client stuck");
    assert!(handle.join().unwrap(), "expected the session to be killed");

    pump(&mut w, Duration::from_secs(1), |w| w.session_count() == 0);
    assert_eq!(a_stats.accepted.load(Ordering::SeqCst), 0);
}

#[test]
fn good_payload_passes_inspection_after_delay_rules() {
    let (a_addr, _) = spawn_echo();
    let cfg = Config::from_json(&format!(
        r#"{{
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "default_backend": "be",
                "timeouts": {{ "client": 3000 }},
                "tcp_request_content": {{
                    "inspect_delay": 500,
                    "rules": [
                        {{ "action": "reject",
                           "cond": {{ "payload_starts_with": {{ "prefix": "BAD" }} }} }}
                    ]
                }}
            }}],
            "backends": [{{
                "name": "be",
                "timeouts": {{ "connect": 2000, "server": 3000 }},
                "servers": [{{ "name": "a", "addr": "{a_addr}" }}]
            }}]
        }}"#
    ))
    .expect("config");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    let handle = std::thread::spawn(move || client_roundtrip(front, b"GOOD data"));
    let done = pump(&mut w, Duration::from_secs(5), |_| handle.is_finished());
    assert!(done, "client stuck");
    assert_eq!(handle.join().unwrap().expect("roundtrip"), b"GOOD data");
}

#[test]
fn response_rule_blocks_server_bytes_from_the_client() {
    let (a_addr, _) = spawn_echo();
    let cfg = Config::from_json(&format!(
        r#"{{
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "default_backend": "be",
                "timeouts": {{ "client": 3000 }}
            }}],
            "backends": [{{
                "name": "be",
                "timeouts": {{ "connect": 2000, "server": 3000 }},
                "tcp_response_content": {{
                    "inspect_delay": 1000,
                    "rules": [
                        {{ "action": "reject",
                           "cond": {{ "payload_starts_with": {{ "prefix": "SECRET" }} }} }}
                    ]
                }},
                "servers": [{{ "name": "a", "addr": "{a_addr}" }}]
            }}]
        }}"#
    ))
    .expect("config");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    let handle = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        // the echo turns this into a response starting with SECRET
        c.write_all(b"SECRET leak").unwrap();
        let mut buf = [0u8; 16];
        matches!(c.read(&mut buf), Ok(0) | Err(_))
    });
    let done = pump(&mut w, Duration::from_secs(5), |_| handle.is_finished());
    assert!(done, "client stuck");
    assert!(handle.join().unwrap(), "response must never reach the client");
}

#[test]
fn connect_failure_exhausts_retries_and_closes() {
    // a port with nothing listening on it
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let cfg = Config::from_json(&format!(
        r#"{{
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "default_backend": "be",
                "timeouts": {{ "client": 10000 }}
            }}],
            "backends": [{{
                "name": "be",
                "retries": 1,
                "timeouts": {{ "connect": 300, "server": 3000 }},
                "servers": [{{ "name": "dead", "addr": "{dead}" }}]
            }}]
        }}"#
    ))
    .expect("config");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    let handle = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        c.write_all(b"hello?").unwrap();
        let mut buf = [0u8; 16];
        matches!(c.read(&mut buf), Ok(0) | Err(_))
    });
    // retries with turn-around take a few seconds at most
    let done = pump(&mut w, Duration::from_secs(8), |_| handle.is_finished());
    assert!(done, "client stuck");
    assert!(handle.join().unwrap(), "client should see the close");
    pump(&mut w, Duration::from_secs(1), |w| w.session_count() == 0);
    assert_eq!(w.session_count(), 0);
}

#[test]
fn redispatch_reaches_the_healthy_server() {
    let (good_addr, good_stats) = spawn_echo();
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    // roundrobin alternates; whichever client lands on the dead server
    // must be redispatched to the live one on its last retry
    let cfg = Config::from_json(&format!(
        r#"{{
            "frontends": [{{
                "name": "fe",
                "listeners": [{{ "addr": "127.0.0.1:0" }}],
                "default_backend": "be",
                "timeouts": {{ "client": 15000 }}
            }}],
            "backends": [{{
                "name": "be",
                "retries": 1,
                "options": {{ "redispatch": true }},
                "timeouts": {{ "connect": 200, "server": 5000 }},
                "servers": [
                    {{ "name": "dead", "addr": "{dead}" }},
                    {{ "name": "good", "addr": "{good_addr}" }}
                ]
            }}]
        }}"#
    ))
    .expect("config");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    let handle = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.set_read_timeout(Some(Duration::from_secs(12))).unwrap();
        c.write_all(b"persist").unwrap();
        let mut got = vec![0u8; 7];
        c.read_exact(&mut got).map(|()| got)
    });
    let done = pump(&mut w, Duration::from_secs(12), |_| handle.is_finished());
    assert!(done, "client stuck");
    assert_eq!(handle.join().unwrap().expect("redispatch"), b"persist");
    assert!(good_stats.accepted.load(Ordering::SeqCst) >= 1);
}

#[test]
fn soft_stop_drains_then_forces_the_stragglers() {
    let (a_addr, _) = spawn_echo();
    let cfg = two_server_config(a_addr, a_addr, "");
    let mut w = Worker::new(&cfg).expect("worker");
    let front = w.listener_addr(0, 0).unwrap();

    // a client that never closes on its own
    let echoed = Arc::new(AtomicUsize::new(0));
    let t_echoed = Arc::clone(&echoed);
    let handle = std::thread::spawn(move || {
        let mut c = TcpStream::connect(front).unwrap();
        c.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        c.write_all(b"linger").unwrap();
        let mut got = [0u8; 6];
        c.read_exact(&mut got).unwrap();
        t_echoed.store(1, Ordering::SeqCst);
        // now just wait for the proxy to close us
        let mut buf = [0u8; 16];
        matches!(c.read(&mut buf), Ok(0) | Err(_))
    });

    // wait until the exchange completed, then stop gracefully
    assert!(pump(&mut w, Duration::from_secs(5), |_| {
        echoed.load(Ordering::SeqCst) == 1
    }));
    w.soft_stop();

    // new connections must be refused (listener is gone)
    std::thread::sleep(Duration::from_millis(50));
    assert!(TcpStream::connect(front).is_err(), "listener still accepting");

    // grace is 200ms: the worker force-closes and exits
    let start = Instant::now();
    loop {
        match w.run_once() {
            Ok(true) => {
                assert!(start.elapsed() < Duration::from_secs(5), "worker never exited");
            }
            Ok(false) => break,
            Err(e) => panic!("worker error: {e}"),
        }
    }
    assert_eq!(w.session_count(), 0);
    assert!(handle.join().unwrap(), "client should see the forced close");
}
