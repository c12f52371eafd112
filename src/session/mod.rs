//! The per-connection forwarding engine.
//!
//! A session owns both sides of one client↔server relay: two stream
//! interfaces, two ring buffers (`req` client→server, `rep` the reverse)
//! and the routing state accumulated along the way. Its handler runs to
//! completion each time the scheduler wakes it, re-reads the flags the
//! poller callbacks and timers left on the buffers, advances both stream
//! interfaces, and re-arms its own wakeups before returning; nothing is
//! carried implicitly across suspensions.

pub mod proto;
pub mod stream_int;

use crate::buffer::{BufFlags, Buffer};
use crate::poller::Dir;
use crate::queue::PendPos;
use crate::rules::{RuleCtx, RuleVerdict};
use crate::scheduler::{TaskRef, Worker};
use crate::ticks::{tick_add_ifset, tick_first, tick_is_expired, Tick, TICK_ETERNITY};
use crate::timer::TimerKey;
use std::net::SocketAddr;
use stream_int::{SiFlags, SiState, StreamInt};

/// Frontend content-inspection analyser.
pub const AN_REQ_INSPECT_FE: u32 = 0x0001;
/// Backend-switching analyser.
pub const AN_REQ_SWITCH: u32 = 0x0002;
/// Backend content-inspection analyser.
pub const AN_REQ_INSPECT_BE: u32 = 0x0004;
/// Response content-inspection analyser; client writes are held until it
/// accepts.
pub const AN_RES_INSPECT: u32 = 0x0008;

/// Who ended the session, recorded once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrClass {
    /// Clean termination.
    None,
    /// Client timed out.
    CliTo,
    /// Client closed or errored.
    CliCl,
    /// Server or connect timeout.
    SrvTo,
    /// Server closed or connect error.
    SrvCl,
    /// The proxy decided to end it (rules, admission).
    PrxCond,
    /// Local resource exhaustion.
    Resource,
    /// Internal error.
    Internal,
    /// No usable server in the backend.
    Down,
}

impl std::fmt::Display for ErrClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "--",
            Self::CliTo => "cT",
            Self::CliCl => "cC",
            Self::SrvTo => "sT",
            Self::SrvCl => "sC",
            Self::PrxCond => "PR",
            Self::Resource => "RS",
            Self::Internal => "IN",
            Self::Down => "DN",
        };
        f.write_str(s)
    }
}

/// Which stage the session was in when it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinState {
    /// During the client request.
    R,
    /// While connecting to the server.
    C,
    /// While waiting for server headers.
    H,
    /// During data transfer.
    D,
    /// While pushing the last data to the client.
    L,
    /// While waiting in a queue.
    Q,
    /// While tarpitted.
    T,
}

impl std::fmt::Display for FinState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::R => "R",
            Self::C => "C",
            Self::H => "H",
            Self::D => "D",
            Self::L => "L",
            Self::Q => "Q",
            Self::T => "T",
        };
        f.write_str(s)
    }
}

/// Routing flags of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessFlags(u32);

impl SessFlags {
    /// Server was chosen by persistence, not balancing.
    pub const DIRECT: Self = Self(0x01);
    /// A server is assigned; no selection needed.
    pub const ASSIGNED: Self = Self(0x02);
    /// The server address has been resolved.
    pub const ADDR_SET: Self = Self(0x04);
    /// A backend is assigned and its counters include this session.
    pub const BE_ASSIGNED: Self = Self(0x08);
    /// The session was moved off a failing server.
    pub const REDISP: Self = Self(0x10);
    /// This session occupies a `served` slot on its target server.
    pub const CURR_SESS: Self = Self(0x20);

    /// Tests whether all bits of `other` are set.
    #[must_use]
    pub const fn has(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets the bits of `other`.
    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// Clears the bits of `other`.
    pub fn clear(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for SessFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Timing milestones, in ms since accept; -1 means "not reached".
#[derive(Debug, Clone, Copy)]
pub struct SessLogs {
    /// Tick at accept.
    pub accept: Tick,
    /// Time spent queued before a server slot opened.
    pub t_queue: i64,
    /// Time until the server connection was established.
    pub t_connect: i64,
    /// Total session lifetime.
    pub t_close: i64,
}

impl SessLogs {
    fn new(accept: Tick) -> Self {
        Self {
            accept,
            t_queue: -1,
            t_connect: -1,
            t_close: -1,
        }
    }

    /// Milliseconds elapsed since accept.
    #[must_use]
    pub fn since_accept(&self, now: Tick) -> i64 {
        i64::from(now.wrapping_sub(self.accept))
    }
}

/// One end-to-end forwarding context.
#[derive(Debug)]
pub struct Session {
    /// Owning frontend.
    pub fe: usize,
    /// Assigned backend, once switching ran.
    pub be: Option<usize>,
    /// Assigned server index within the backend.
    pub target: Option<usize>,
    /// Routing flags.
    pub flags: SessFlags,
    /// Error class, set once.
    pub err: ErrClass,
    /// Final stage, set once.
    pub finst: Option<FinState>,
    /// Client-side stream interface.
    pub cli: StreamInt,
    /// Server-side stream interface.
    pub srv: StreamInt,
    /// Client→server buffer.
    pub req: Buffer,
    /// Server→client buffer.
    pub rep: Buffer,
    /// Queue position while parked.
    pub pend_pos: Option<PendPos>,
    /// Timing milestones.
    pub logs: SessLogs,
    /// Armed wakeup timer.
    pub timer: Option<TimerKey>,
    /// Already sitting in the run queue.
    pub task_queued: bool,
    /// Client address.
    pub peer: SocketAddr,
}

impl Session {
    /// Creates a session for a just-accepted client connection.
    #[must_use]
    pub fn new(fe: usize, peer: SocketAddr, bufsize: usize, now: Tick) -> Self {
        let mut req = Buffer::new(bufsize);
        let mut rep = Buffer::new(bufsize);
        req.analysers = AN_REQ_INSPECT_FE | AN_REQ_SWITCH;
        rep.flags.set(BufFlags::AUTO_CLOSE);
        req.flags.set(BufFlags::AUTO_CLOSE);
        let mut cli = StreamInt::new();
        cli.state = SiState::Est;
        Self {
            fe,
            be: None,
            target: None,
            flags: SessFlags::default(),
            err: ErrClass::None,
            finst: None,
            cli,
            srv: StreamInt::new(),
            req,
            rep,
            pend_pos: None,
            logs: SessLogs::new(now),
            timer: None,
            task_queued: false,
            peer,
        }
    }

    /// Records the error class and final stage unless already set.
    pub fn record_error(&mut self, err: ErrClass, finst: FinState) {
        if self.err == ErrClass::None {
            self.err = err;
        }
        if self.finst.is_none() {
            self.finst = Some(finst);
        }
    }

    /// Marks expired buffer timeouts and stream-interface deadlines.
    pub fn check_timeouts(&mut self, now: Tick) {
        for buf in [&mut self.req, &mut self.rep] {
            if tick_is_expired(buf.rex, now) && !buf.flags.has(BufFlags::SHUTR) {
                buf.flags.set(BufFlags::READ_TIMEOUT);
                buf.rex = TICK_ETERNITY;
            }
            if tick_is_expired(buf.wex, now) && !buf.flags.has(BufFlags::SHUTW) {
                buf.flags.set(BufFlags::WRITE_TIMEOUT);
                buf.wex = TICK_ETERNITY;
            }
        }
        for si in [&mut self.cli, &mut self.srv] {
            if tick_is_expired(si.exp, now) {
                si.flags.set(SiFlags::EXP);
            }
        }
    }

    /// The final stage implied by the server-side state, used when no
    /// analyser recorded one.
    #[must_use]
    pub fn default_finst(&self) -> FinState {
        if self.srv.state < SiState::Req {
            FinState::R
        } else if self.srv.state == SiState::Que {
            FinState::Q
        } else if self.srv.state < SiState::Est {
            FinState::C
        } else if self.srv.state == SiState::Est || self.srv.prev_state == SiState::Est {
            FinState::D
        } else {
            FinState::L
        }
    }
}

/// Extracts the bytes a hash-based backend keys on. Returns `None` when
/// the request does not carry the key (falls back to rotation).
#[must_use]
pub fn hash_key(hash_on: &crate::proxy::HashOn, peer: &SocketAddr, data: &[u8]) -> Option<u32> {
    use crate::lb::chash::{full_hash, hash_bytes};
    use crate::proxy::HashOn;
    match hash_on {
        HashOn::None => None,
        HashOn::Src => Some(match peer.ip() {
            std::net::IpAddr::V4(ip) => full_hash(u32::from_be_bytes(ip.octets())),
            std::net::IpAddr::V6(ip) => hash_bytes(&ip.octets()),
        }),
        HashOn::Uri => {
            // second token of the request line
            let line = data.split(|&b| b == b'\r' || b == b'\n').next()?;
            let mut parts = line.split(|&b| b == b' ').filter(|p| !p.is_empty());
            let _method = parts.next()?;
            let uri = parts.next()?;
            Some(hash_bytes(uri))
        }
        HashOn::UrlParam(name) => {
            let line = data.split(|&b| b == b'\r' || b == b'\n').next()?;
            let query_start = line.iter().position(|&b| b == b'?')? + 1;
            let query = &line[query_start..];
            let query_end = query.iter().position(|&b| b == b' ').unwrap_or(query.len());
            for pair in query[..query_end].split(|&b| b == b'&') {
                let mut kv = pair.splitn(2, |&b| b == b'=');
                if kv.next() == Some(name.as_bytes()) {
                    return Some(hash_bytes(kv.next().unwrap_or(b"")));
                }
            }
            None
        }
        HashOn::Hdr(name) => {
            for line in data.split(|&b| b == b'\n').skip(1) {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                if line.is_empty() {
                    break;
                }
                let mut kv = line.splitn(2, |&b| b == b':');
                let (k, v) = (kv.next()?, kv.next());
                if k.eq_ignore_ascii_case(name.as_bytes()) {
                    let v = v.unwrap_or(b"");
                    let v = v.strip_prefix(b" ").unwrap_or(v);
                    return Some(hash_bytes(v));
                }
            }
            None
        }
    }
}

/// Runs the request analysers still pending on `req`. Returns false when
/// evaluation suspended waiting for more data.
fn run_analysers(w: &mut Worker, s: &mut Session, sid: usize) -> bool {
    let now = w.clock.now_ms();
    let mut payload = vec![0u8; s.req.len()];
    let copied = s.req.peek(&mut payload);
    payload.truncate(copied);

    while s.req.analysers != 0 {
        let (bit, ruleset_of_be) = if s.req.analysers & AN_REQ_INSPECT_FE != 0 {
            (AN_REQ_INSPECT_FE, false)
        } else if s.req.analysers & AN_REQ_SWITCH != 0 {
            (AN_REQ_SWITCH, false)
        } else if s.req.analysers & AN_REQ_INSPECT_BE != 0 {
            (AN_REQ_INSPECT_BE, true)
        } else {
            break;
        };

        if bit == AN_REQ_SWITCH {
            let fe = &w.registry.frontends[s.fe];
            let ctx = RuleCtx {
                src: s.peer,
                data: &payload,
                partial: false,
            };
            let be_id = crate::rules::select_backend(&fe.switching, &ctx).or(fe.default_backend);
            let Some(be_id) = be_id else {
                s.record_error(ErrClass::PrxCond, FinState::R);
                kill_session(w, s);
                return true;
            };
            s.be = Some(be_id);
            s.flags.set(SessFlags::BE_ASSIGNED);
            let be = &mut w.registry.backends[be_id];
            be.beconn += 1;
            be.counters.cum_conn += 1;
            s.srv.conn_retries = be.retries as i32;
            s.req.analysers &= !AN_REQ_SWITCH;
            if !be.tcp_req.is_empty() {
                s.req.analysers |= AN_REQ_INSPECT_BE;
            }
            tracing::trace!(session = sid, backend = %be.name, "backend assigned");
            continue;
        }

        let ruleset = if ruleset_of_be {
            let Some(be) = s.be else {
                s.req.analysers &= !bit;
                continue;
            };
            &w.registry.backends[be].tcp_req
        } else {
            &w.registry.frontends[s.fe].tcp_req
        };
        if ruleset.is_empty() {
            s.req.analysers &= !bit;
            s.req.analyse_exp = TICK_ETERNITY;
            continue;
        }

        // partial evaluation is allowed until the delay runs out or the
        // input can no longer grow
        let partial = !(s.req.flags.has(BufFlags::SHUTR)
            || s.req.is_full()
            || ruleset.inspect_delay.is_none()
            || tick_is_expired(s.req.analyse_exp, now));
        let ctx = RuleCtx {
            src: s.peer,
            data: &payload,
            partial,
        };
        match ruleset.evaluate(&ctx) {
            RuleVerdict::Missing => {
                if s.req.analyse_exp == TICK_ETERNITY {
                    s.req.analyse_exp = tick_add_ifset(now, ruleset.inspect_delay);
                }
                return false;
            }
            RuleVerdict::Reject => {
                w.registry.frontends[s.fe].counters.denied_req += 1;
                if let Some(be) = s.be {
                    w.registry.backends[be].counters.denied_req += 1;
                }
                s.record_error(ErrClass::PrxCond, FinState::R);
                kill_session(w, s);
                return true;
            }
            RuleVerdict::Accept => {
                s.req.analysers &= !bit;
                s.req.analyse_exp = TICK_ETERNITY;
            }
        }
    }
    true
}

/// Runs the response analyser when armed. The client-facing write side
/// stays gated until the rules accept the stream.
fn run_response_analysers(w: &mut Worker, s: &mut Session) {
    if s.rep.analysers & AN_RES_INSPECT == 0 {
        return;
    }
    let Some(be_id) = s.be else {
        s.rep.analysers &= !AN_RES_INSPECT;
        return;
    };
    let now = w.clock.now_ms();
    let mut payload = vec![0u8; s.rep.len()];
    let copied = s.rep.peek(&mut payload);
    payload.truncate(copied);

    let ruleset = &w.registry.backends[be_id].tcp_rep;
    if ruleset.is_empty() {
        s.rep.analysers &= !AN_RES_INSPECT;
        return;
    }
    let partial = !(s.rep.flags.has(BufFlags::SHUTR)
        || s.rep.is_full()
        || ruleset.inspect_delay.is_none()
        || tick_is_expired(s.rep.analyse_exp, now));
    let ctx = RuleCtx {
        src: s.peer,
        data: &payload,
        partial,
    };
    match ruleset.evaluate(&ctx) {
        RuleVerdict::Missing => {
            if s.rep.analyse_exp == TICK_ETERNITY {
                s.rep.analyse_exp = tick_add_ifset(now, ruleset.inspect_delay);
            }
        }
        RuleVerdict::Reject => {
            w.registry.backends[be_id].counters.denied_resp += 1;
            s.record_error(ErrClass::PrxCond, FinState::D);
            kill_session(w, s);
        }
        RuleVerdict::Accept => {
            s.rep.analysers &= !AN_RES_INSPECT;
            s.rep.analyse_exp = TICK_ETERNITY;
        }
    }
}

/// Aborts both directions and drives the session to the closed state.
pub(crate) fn kill_session(w: &mut Worker, s: &mut Session) {
    s.req.abort();
    s.rep.abort();
    s.req.analysers = 0;
    stream_int::close_si(&mut w.poller, &mut s.cli);
    stream_int::close_si(&mut w.poller, &mut s.srv);
    s.cli.state = SiState::Clo;
    s.srv.state = SiState::Clo;
}

/// Interprets client-side buffer events while the client is connected.
fn handle_client_events(w: &mut Worker, s: &mut Session) {
    if s.cli.state != SiState::Est && s.cli.state != SiState::Dis {
        return;
    }
    if s.req.flags.has(BufFlags::READ_ERROR) || s.rep.flags.has(BufFlags::WRITE_ERROR) {
        s.record_error(ErrClass::CliCl, s.default_finst());
        stream_int::close_si(&mut w.poller, &mut s.cli);
        s.cli.state = SiState::Dis;
        s.req.flags.set(BufFlags::SHUTR | BufFlags::SHUTW_NOW);
        s.rep.flags.set(BufFlags::SHUTW);
        return;
    }
    if s.req.flags.has(BufFlags::READ_TIMEOUT) {
        s.record_error(ErrClass::CliTo, s.default_finst());
        stream_int::shutr(&mut w.poller, &mut s.cli, &mut s.req, &s.rep);
    }
    if s.rep.flags.has(BufFlags::WRITE_TIMEOUT) {
        s.record_error(ErrClass::CliTo, s.default_finst());
        stream_int::shutw(&mut w.poller, &mut s.cli, &mut s.rep, &mut s.req);
    }
    if s.cli.state == SiState::Est
        && s.req.flags.has(BufFlags::SHUTR)
        && s.rep.flags.has(BufFlags::SHUTW)
    {
        stream_int::close_si(&mut w.poller, &mut s.cli);
        s.cli.state = SiState::Dis;
    }
}

/// Interprets server-side buffer events once a connection is established.
fn handle_server_events(w: &mut Worker, s: &mut Session) {
    if s.srv.state != SiState::Est && s.srv.state != SiState::Dis {
        return;
    }
    if s.rep.flags.has(BufFlags::READ_ERROR) || s.req.flags.has(BufFlags::WRITE_ERROR) {
        s.record_error(ErrClass::SrvCl, FinState::D);
        stream_int::close_si(&mut w.poller, &mut s.srv);
        s.srv.state = SiState::Dis;
        s.rep.flags.set(BufFlags::SHUTR | BufFlags::SHUTW_NOW);
        s.req.flags.set(BufFlags::SHUTW);
        return;
    }
    if s.rep.flags.has(BufFlags::READ_TIMEOUT) {
        s.record_error(ErrClass::SrvTo, FinState::D);
        stream_int::shutr(&mut w.poller, &mut s.srv, &mut s.rep, &s.req);
    }
    if s.req.flags.has(BufFlags::WRITE_TIMEOUT) {
        s.record_error(ErrClass::SrvTo, FinState::D);
        stream_int::shutw(&mut w.poller, &mut s.srv, &mut s.req, &mut s.rep);
    }
    if s.srv.state == SiState::Est
        && s.rep.flags.has(BufFlags::SHUTR)
        && s.req.flags.has(BufFlags::SHUTW)
    {
        stream_int::close_si(&mut w.poller, &mut s.srv);
        s.srv.state = SiState::Dis;
    }
}

/// Propagates end-of-stream across the two buffers: once a producer is
/// gone and its buffer drained, the consumer side is shut in turn.
fn sync_shutdowns(w: &mut Worker, s: &mut Session) {
    // client EOF, request drained: close the server's write side
    if s.req.flags.has(BufFlags::SHUTR)
        && !s.req.flags.has(BufFlags::SHUTW)
        && s.req.is_empty()
        && s.req.flags.has(BufFlags::AUTO_CLOSE)
        && s.srv.state == SiState::Est
    {
        stream_int::shutw(&mut w.poller, &mut s.srv, &mut s.req, &mut s.rep);
    }
    // server EOF, response drained: close the client's write side
    if s.rep.flags.has(BufFlags::SHUTR)
        && !s.rep.flags.has(BufFlags::SHUTW)
        && s.rep.is_empty()
        && s.rep.flags.has(BufFlags::AUTO_CLOSE)
    {
        stream_int::shutw(&mut w.poller, &mut s.cli, &mut s.rep, &mut s.req);
    }
}

/// The session task handler: runs both stream interfaces until the state
/// stops changing, then either tears the session down or re-arms its I/O
/// interest and wakeup timer.
pub(crate) fn process_session(w: &mut Worker, sid: usize) {
    let Some(slot) = w.sessions.get_mut(sid) else {
        return;
    };
    let Some(mut s) = slot.take() else {
        return;
    };

    let now = w.clock.now_ms();
    s.check_timeouts(now);

    for _ in 0..16 {
        let before = (
            s.cli.state,
            s.srv.state,
            s.req.analysers,
            s.rep.analysers,
            s.req.flags,
            s.rep.flags,
        );

        // transient disconnected states collapse to closed
        if s.cli.state == SiState::Dis {
            s.cli.state = SiState::Clo;
        }
        if s.srv.state == SiState::Dis {
            s.srv.state = SiState::Clo;
        }

        handle_client_events(w, &mut s);
        handle_server_events(w, &mut s);

        // server-side state machine
        match s.srv.state {
            SiState::Con => {
                if !stream_int::update_st_con_tcp(w, &mut s) {
                    stream_int::update_st_cer(w, &mut s, sid);
                }
                if s.srv.state == SiState::Est {
                    stream_int::establish(w, &mut s, sid);
                }
            }
            SiState::Ass | SiState::Que | SiState::Tar => {
                stream_int::update_stream_int(w, &mut s, sid);
                if s.srv.state == SiState::Est {
                    stream_int::establish(w, &mut s, sid);
                }
            }
            _ => {}
        }

        // request analysers, then the decision to contact a server
        if s.cli.state == SiState::Est && s.req.analysers != 0 {
            run_analysers(w, &mut s, sid);
        }
        if s.rep.analysers != 0 {
            run_response_analysers(w, &mut s);
        }
        if s.srv.state == SiState::Ini {
            let client_gone = s.req.flags.has(BufFlags::READ_ERROR)
                || (s.req.flags.has(BufFlags::SHUTR) && s.req.is_empty());
            if client_gone {
                // client left before the request warranted a connection
                stream_int::close_si(&mut w.poller, &mut s.cli);
                s.cli.state = SiState::Clo;
                s.srv.state = SiState::Clo;
            } else if s.req.analysers == 0 {
                s.srv.state = SiState::Req;
            }
        }
        if s.srv.state == SiState::Req {
            stream_int::prepare_conn_req(w, &mut s, sid);
            if s.srv.state == SiState::Ass {
                stream_int::update_stream_int(w, &mut s, sid);
                if s.srv.state == SiState::Est {
                    stream_int::establish(w, &mut s, sid);
                }
            }
        }

        sync_shutdowns(w, &mut s);

        let after = (
            s.cli.state,
            s.srv.state,
            s.req.analysers,
            s.rep.analysers,
            s.req.flags,
            s.rep.flags,
        );
        if before == after {
            break;
        }
    }

    if s.cli.state == SiState::Clo && s.srv.state == SiState::Clo {
        terminate(w, s, sid);
        w.sessions.remove(sid);
        return;
    }

    rearm(w, &mut s, sid);
    if let Some(slot) = w.sessions.get_mut(sid) {
        *slot = Some(s);
    }
}

/// Re-requests I/O interest and the wakeup timer from current state.
fn rearm(w: &mut Worker, s: &mut Session, sid: usize) {
    let now = w.clock.now_ms();

    if let Some(tok) = s.cli.tok {
        if !s.req.flags.has(BufFlags::SHUTR) && !s.req.is_full() {
            w.poller.want(tok, Dir::Read);
            if s.req.rex == TICK_ETERNITY {
                s.req.rex = tick_add_ifset(now, s.req.rto);
            }
        } else {
            w.poller.stop(tok, Dir::Read);
            s.req.rex = TICK_ETERNITY;
        }
        if !s.rep.is_empty() && !s.rep.flags.has(BufFlags::SHUTW) && s.rep.analysers == 0 {
            w.poller.want(tok, Dir::Write);
            if s.rep.wex == TICK_ETERNITY {
                s.rep.wex = tick_add_ifset(now, s.rep.wto);
            }
        } else {
            w.poller.stop(tok, Dir::Write);
            s.rep.wex = TICK_ETERNITY;
        }
    }

    if s.srv.state == SiState::Est {
        if let Some(tok) = s.srv.tok {
            if !s.rep.flags.has(BufFlags::SHUTR) && !s.rep.is_full() {
                w.poller.want(tok, Dir::Read);
                if s.rep.rex == TICK_ETERNITY {
                    s.rep.rex = tick_add_ifset(now, s.rep.rto);
                }
            } else {
                w.poller.stop(tok, Dir::Read);
                s.rep.rex = TICK_ETERNITY;
            }
            if !s.req.is_empty() && !s.req.flags.has(BufFlags::SHUTW) {
                w.poller.want(tok, Dir::Write);
                if s.req.wex == TICK_ETERNITY {
                    s.req.wex = tick_add_ifset(now, s.req.wto);
                }
            } else {
                w.poller.stop(tok, Dir::Write);
                s.req.wex = TICK_ETERNITY;
            }
        }
    }

    let mut exp = tick_first(s.req.rex, s.req.wex);
    exp = tick_first(exp, tick_first(s.rep.rex, s.rep.wex));
    exp = tick_first(exp, tick_first(s.cli.exp, s.srv.exp));
    exp = tick_first(exp, tick_first(s.req.analyse_exp, s.rep.analyse_exp));

    if let Some(key) = s.timer.take() {
        w.timers.remove(key);
    }
    s.timer = w.timers.insert(exp, TaskRef::Session(sid));
}

/// Final teardown: termination flags, counters, queue promotion, captures.
pub(crate) fn terminate(w: &mut Worker, mut s: Session, sid: usize) {
    let now = w.clock.now_ms();
    s.logs.t_close = s.logs.since_accept(now);
    let finst = s.finst.unwrap_or_else(|| s.default_finst());

    if s.err != ErrClass::None && finst == FinState::R {
        w.registry.frontends[s.fe].counters.failed_req += 1;
    }

    // release the server slot and hand it to the next queued session
    stream_int::change_server(w, &mut s, None);

    if let (Some(pos), Some(be)) = (s.pend_pos.take(), s.be) {
        crate::queue::pendconn_remove(&mut w.registry.backends[be], pos, sid);
    }
    if s.flags.has(SessFlags::BE_ASSIGNED) {
        if let Some(be) = s.be {
            w.registry.backends[be].beconn = w.registry.backends[be].beconn.saturating_sub(1);
        }
    }

    if s.err != ErrClass::None {
        let mut capture = vec![0u8; s.req.len().min(64)];
        let n = s.req.peek(&mut capture);
        capture.truncate(n);
        w.registry.frontends[s.fe].capture_error(crate::proxy::ErrSnapshot {
            when: now,
            err: s.err,
            finst,
            peer: s.peer,
            capture,
        });
    }

    stream_int::close_si(&mut w.poller, &mut s.cli);
    stream_int::close_si(&mut w.poller, &mut s.srv);
    if let Some(key) = s.timer.take() {
        w.timers.remove(key);
    }

    let fe = &mut w.registry.frontends[s.fe];
    fe.feconn = fe.feconn.saturating_sub(1);
    w.reenable_full_listeners(s.fe);

    tracing::debug!(
        session = sid,
        err = %s.err,
        finst = %finst,
        bytes_in = s.req.total,
        bytes_out = s.rep.total,
        t_queue = s.logs.t_queue,
        t_connect = s.logs.t_connect,
        t_close = s.logs.t_close,
        "session closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::HashOn;

    fn peer() -> SocketAddr {
        "192.168.7.9:4242".parse().unwrap()
    }

    #[test]
    fn error_class_is_recorded_once() {
        let mut s = Session::new(0, peer(), 256, 0);
        s.record_error(ErrClass::CliTo, FinState::D);
        s.record_error(ErrClass::SrvCl, FinState::C);
        assert_eq!(s.err, ErrClass::CliTo);
        assert_eq!(s.finst, Some(FinState::D));
    }

    #[test]
    fn timeout_marks_are_oneshot_per_direction() {
        let mut s = Session::new(0, peer(), 256, 0);
        s.req.rex = 100;
        s.check_timeouts(150);
        assert!(s.req.flags.has(BufFlags::READ_TIMEOUT));
        assert_eq!(s.req.rex, TICK_ETERNITY);
        assert!(!s.rep.flags.has(BufFlags::READ_TIMEOUT));
    }

    #[test]
    fn default_finst_follows_server_state() {
        let mut s = Session::new(0, peer(), 256, 0);
        assert_eq!(s.default_finst(), FinState::R);
        s.srv.state = SiState::Que;
        assert_eq!(s.default_finst(), FinState::Q);
        s.srv.state = SiState::Con;
        assert_eq!(s.default_finst(), FinState::C);
        s.srv.state = SiState::Est;
        assert_eq!(s.default_finst(), FinState::D);
    }

    #[test]
    fn hash_key_source_is_stable() {
        let a = hash_key(&HashOn::Src, &peer(), b"");
        let b = hash_key(&HashOn::Src, &peer(), b"different payload");
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn hash_key_uri_extraction() {
        let data = b"GET /app/login?user=bob HTTP/1.0\r\nHost: x\r\n\r\n";
        let h = hash_key(&HashOn::Uri, &peer(), data);
        assert!(h.is_some());
        let again = hash_key(&HashOn::Uri, &peer(), b"POST /app/login?user=bob HTTP/1.1\r\n");
        assert_eq!(h, again, "same URI hashes the same regardless of method");
    }

    #[test]
    fn hash_key_url_param_extraction() {
        let data = b"GET /x?a=1&user=alice&z=9 HTTP/1.0\r\n";
        let h = hash_key(&HashOn::UrlParam("user".into()), &peer(), data);
        let same = hash_key(
            &HashOn::UrlParam("user".into()),
            &peer(),
            b"GET /other?user=alice HTTP/1.0\r\n",
        );
        assert_eq!(h, same);
        let missing = hash_key(&HashOn::UrlParam("nope".into()), &peer(), data);
        assert!(missing.is_none());
    }

    #[test]
    fn hash_key_header_extraction() {
        let data = b"GET / HTTP/1.0\r\nHost: shop.example\r\nX-Tenant: t1\r\n\r\n";
        let h = hash_key(&HashOn::Hdr("x-tenant".into()), &peer(), data);
        assert!(h.is_some());
        let same = hash_key(
            &HashOn::Hdr("X-Tenant".into()),
            &peer(),
            b"POST /y HTTP/1.1\r\nX-Tenant: t1\r\n\r\n",
        );
        assert_eq!(h, same);
    }
}
