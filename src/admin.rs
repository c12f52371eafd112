//! Admin applet served over a Unix socket.
//!
//! Line-oriented commands, one per line; responses are JSON objects for
//! the `pool.*` family and plain diagnostic lines otherwise. The applet
//! shares the worker loop with the data path: commands take effect
//! between two scheduler iterations, never mid-selection.
//!
//! ```text
//! pool.add {"backend":"be","name":"s3","addr":"10.0.0.3:80","weight":2}
//! pool.disable be s3
//! pool.enable be s3
//! pool.weight be s3 4
//! pool.status be s3
//! pool.contents be
//! version
//! ```

use crate::error::{Error, ErrorKind, Result};
use crate::poller::{Dir, Token};
use crate::proxy::server::{Server, SrvState};
use crate::proxy::AddServerReq;
use crate::scheduler::{FdOwner, Worker};
use serde_json::json;
use slab::Slab;
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Protocol identity returned by `version`.
pub const API_VERSION: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"), " api/1");

/// Commands longer than this are rejected outright.
const MAX_LINE: usize = 16 * 1024;

/// One admin connection.
#[derive(Debug)]
pub(crate) struct AdminConn {
    pub(crate) sock: UnixStream,
    pub(crate) tok: Token,
    inbuf: Vec<u8>,
    out: Vec<u8>,
    closing: bool,
}

/// The applet's listener and connections.
#[derive(Debug)]
pub(crate) struct AdminState {
    pub(crate) listener: UnixListener,
    pub(crate) ltok: Option<Token>,
    pub(crate) conns: Slab<AdminConn>,
    pub(crate) path: PathBuf,
}

impl AdminState {
    /// Binds the admin socket, replacing a stale file from a previous
    /// run.
    pub(crate) fn bind(path: &Path) -> Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|e| {
            Error::new(ErrorKind::Listener)
                .with_context(format!("admin socket {}", path.display()))
                .with_source(e)
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::new(ErrorKind::Listener).with_source(e))?;
        Ok(Self {
            listener,
            ltok: None,
            conns: Slab::new(),
            path: path.to_path_buf(),
        })
    }
}

/// Accepts pending admin connections.
pub(crate) fn accept_loop(w: &mut Worker) {
    loop {
        let Worker { admin, poller, .. } = w;
        let Some(admin) = admin.as_mut() else {
            return;
        };
        match admin.listener.accept() {
            Ok((sock, _)) => {
                if sock.set_nonblocking(true).is_err() {
                    continue;
                }
                let entry = admin.conns.vacant_entry();
                let cid = entry.key();
                let tok = poller.register(sock.as_raw_fd(), FdOwner::AdminConn(cid));
                poller.want(tok, Dir::Read);
                entry.insert(AdminConn {
                    sock,
                    tok,
                    inbuf: Vec::new(),
                    out: Vec::new(),
                    closing: false,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                if let Some(tok) = admin.ltok {
                    poller.cant(tok, Dir::Read);
                }
                return;
            }
            Err(_) => return,
        }
    }
}

/// Handles readiness on one admin connection.
pub(crate) fn conn_io(w: &mut Worker, cid: usize, readable: bool, writable: bool) {
    let mut lines: Vec<String> = Vec::new();
    {
        let Worker { admin, poller, .. } = w;
        let Some(admin) = admin.as_mut() else {
            return;
        };
        let Some(conn) = admin.conns.get_mut(cid) else {
            return;
        };

        if readable {
            let mut buf = [0u8; 1024];
            loop {
                match conn.sock.read(&mut buf) {
                    Ok(0) => {
                        conn.closing = true;
                        poller.stop(conn.tok, Dir::Read);
                        break;
                    }
                    Ok(n) => {
                        conn.inbuf.extend_from_slice(&buf[..n]);
                        if conn.inbuf.len() > MAX_LINE {
                            conn.out.extend_from_slice(b"err line too long\n");
                            conn.closing = true;
                            poller.stop(conn.tok, Dir::Read);
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        poller.cant(conn.tok, Dir::Read);
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => {
                        conn.closing = true;
                        break;
                    }
                }
            }
            while let Some(pos) = conn.inbuf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = conn.inbuf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1])
                    .trim()
                    .to_string();
                if !line.is_empty() {
                    lines.push(line);
                }
            }
        }
        let _ = writable;
    }

    for line in lines {
        let resp = exec_command(w, &line);
        let Some(admin) = w.admin.as_mut() else {
            return;
        };
        let Some(conn) = admin.conns.get_mut(cid) else {
            return;
        };
        conn.out.extend_from_slice(resp.as_bytes());
        conn.out.push(b'\n');
    }

    flush(w, cid);
}

/// Writes out pending response bytes, closing when done if requested.
fn flush(w: &mut Worker, cid: usize) {
    let Worker { admin, poller, .. } = w;
    let Some(admin) = admin.as_mut() else {
        return;
    };
    let Some(conn) = admin.conns.get_mut(cid) else {
        return;
    };
    while !conn.out.is_empty() {
        match conn.sock.write(&conn.out) {
            Ok(0) => break,
            Ok(n) => {
                conn.out.drain(..n);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                poller.cant(conn.tok, Dir::Write);
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(_) => {
                conn.closing = true;
                break;
            }
        }
    }
    if conn.out.is_empty() {
        poller.stop(conn.tok, Dir::Write);
        if conn.closing {
            poller.unregister(conn.tok);
            admin.conns.remove(cid);
        }
    }
}

fn state_str(s: &Server) -> &'static str {
    if s.state.has(SrvState::MAINT) {
        "maint"
    } else if !s.state.has(SrvState::RUNNING) {
        "down"
    } else if s.state.has(SrvState::GOINGDOWN) {
        "drain"
    } else {
        "up"
    }
}

fn server_json(s: &Server) -> serde_json::Value {
    json!({
        "name": s.name,
        "addr": s.addr.to_string(),
        "state": state_str(s),
        "backup": s.state.has(SrvState::BACKUP),
        "weight": s.uweight,
        "served": s.served,
        "pending": s.nbpend(),
        "maxconn": s.maxconn,
        "cum_sess": s.counters.cum_sess,
        "failed_conns": s.counters.failed_conns,
        "retries": s.counters.retries,
        "max_served": s.counters.max_served,
    })
}

/// Executes one command line and renders the response.
pub(crate) fn exec_command(w: &mut Worker, line: &str) -> String {
    match exec_inner(w, line) {
        Ok(resp) => resp,
        Err(e) => format!("err {e}"),
    }
}

fn exec_inner(w: &mut Worker, line: &str) -> Result<String> {
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    match cmd {
        "version" => Ok(API_VERSION.to_string()),
        "pool.add" => {
            let req: AddServerReq = serde_json::from_str(rest.trim()).map_err(|e| {
                Error::new(ErrorKind::Admin).with_context(format!("bad request: {e}"))
            })?;
            let (be, srv) = w.registry.add_server(&req)?;
            Ok(json!({"ok": true, "backend": be, "server": srv}).to_string())
        }
        "pool.disable" => {
            let (be, srv) = be_srv_args(w, rest)?;
            let orphans = w.registry.disable_server(be, srv);
            for sid in orphans {
                w.rebalance_orphan(sid);
            }
            Ok(json!({"ok": true}).to_string())
        }
        "pool.enable" => {
            let (be, srv) = be_srv_args(w, rest)?;
            w.registry.enable_server(be, srv);
            Ok(json!({"ok": true}).to_string())
        }
        "pool.weight" => {
            let mut it = rest.split_whitespace();
            let (Some(be_name), Some(srv_name), Some(weight)) = (it.next(), it.next(), it.next())
            else {
                return Err(Error::new(ErrorKind::Admin)
                    .with_context("usage: pool.weight <backend> <server> <weight>"));
            };
            let weight: u32 = weight.parse().map_err(|_| {
                Error::new(ErrorKind::Admin).with_context("weight must be 0..=255")
            })?;
            if weight > 255 {
                return Err(Error::new(ErrorKind::Admin).with_context("weight must be 0..=255"));
            }
            let be = w.registry.backend_by_name(be_name)?;
            let srv = w.registry.server_by_name(be, srv_name)?;
            w.registry.set_server_weight(be, srv, weight);
            Ok(json!({"ok": true, "weight": weight}).to_string())
        }
        "pool.status" => {
            let (be, srv) = be_srv_args(w, rest)?;
            Ok(server_json(&w.registry.backends[be].servers[srv]).to_string())
        }
        "pool.contents" => {
            let name = rest.trim();
            let be = w.registry.backend_by_name(name)?;
            let be = &w.registry.backends[be];
            let servers: Vec<_> = be.servers.iter().map(server_json).collect();
            Ok(json!({
                "backend": be.name,
                "beconn": be.beconn,
                "queued": be.pend.len(),
                "servers": servers,
            })
            .to_string())
        }
        _ => Err(Error::new(ErrorKind::Admin).with_context(format!("unknown command {cmd:?}"))),
    }
}

fn be_srv_args(w: &Worker, rest: &str) -> Result<(usize, usize)> {
    let mut it = rest.split_whitespace();
    let (Some(be_name), Some(srv_name)) = (it.next(), it.next()) else {
        return Err(Error::new(ErrorKind::Admin).with_context("expected <backend> <server>"));
    };
    let be = w.registry.backend_by_name(be_name)?;
    let srv = w.registry.server_by_name(be, srv_name)?;
    Ok((be, srv))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn worker() -> Worker {
        let cfg = Config::from_json(
            r#"{
            "frontends": [{
                "name": "fe",
                "listeners": [{ "addr": "127.0.0.1:0" }],
                "default_backend": "be"
            }],
            "backends": [{
                "name": "be",
                "servers": [
                    { "name": "s1", "addr": "127.0.0.1:8001", "weight": 1 },
                    { "name": "s2", "addr": "127.0.0.1:8002", "weight": 1 }
                ]
            }]
        }"#,
        )
        .unwrap();
        Worker::new(&cfg).unwrap()
    }

    #[test]
    fn version_line() {
        let mut w = worker();
        let resp = exec_command(&mut w, "version");
        assert!(resp.starts_with("switchyard/"));
        assert!(resp.ends_with("api/1"));
    }

    #[test]
    fn unknown_command_is_diagnosed() {
        let mut w = worker();
        let resp = exec_command(&mut w, "pool.destroy be");
        assert!(resp.starts_with("err "), "{resp}");
    }

    #[test]
    fn add_then_status_roundtrip() {
        let mut w = worker();
        let resp = exec_command(
            &mut w,
            r#"pool.add {"backend":"be","name":"s3","addr":"127.0.0.1:8003","weight":3}"#,
        );
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["ok"], true);

        let resp = exec_command(&mut w, "pool.status be s3");
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["state"], "up");
        assert_eq!(v["weight"], 3);
        assert_eq!(w.registry.backends[0].srv_act, 3);
    }

    #[test]
    fn disable_enable_cycle() {
        let mut w = worker();
        exec_command(&mut w, "pool.disable be s1");
        assert_eq!(w.registry.backends[0].srv_act, 1);
        let resp = exec_command(&mut w, "pool.status be s1");
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["state"], "maint");

        exec_command(&mut w, "pool.enable be s1");
        assert_eq!(w.registry.backends[0].srv_act, 2);
    }

    #[test]
    fn weight_command_validates() {
        let mut w = worker();
        let resp = exec_command(&mut w, "pool.weight be s1 4");
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["ok"], true);
        assert_eq!(w.registry.backends[0].servers[0].eweight, 64);

        let resp = exec_command(&mut w, "pool.weight be s1 999");
        assert!(resp.starts_with("err "));
        let resp = exec_command(&mut w, "pool.weight be nope 1");
        assert!(resp.starts_with("err "));
    }

    #[test]
    fn contents_lists_everyone() {
        let mut w = worker();
        let resp = exec_command(&mut w, "pool.contents be");
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["servers"].as_array().unwrap().len(), 2);
        assert_eq!(v["backend"], "be");
    }
}
