//! Stream interfaces and the server-side connection state machine.
//!
//! Each session side is a stream interface. The client side is
//! established at accept and only ever closes; the server side walks
//! the full path: request a connection, possibly wait in a queue or in
//! turn-around after a failure, get a server assigned, connect, then
//! forward until close. Transitions mirror the buffer flags left by the
//! poller callbacks; every handler leaves a consistent state behind
//! before the scheduler moves on.

use super::{ErrClass, FinState, Session, SessFlags};
use crate::buffer::{BufFlags, Buffer};
use crate::lb;
use crate::poller::{Dir, Poller, Token};
use crate::queue::{pendconn_add, pendconn_remove, EnqueueResult};
use crate::scheduler::{FdOwner, Worker};
use crate::ticks::{tick_add, tick_add_ifset, Tick, TICK_ETERNITY};
use std::net::TcpStream;

/// Delay before retrying a server that failed asynchronously, ms.
const TURN_AROUND_MS: u32 = 1000;

/// Stream-interface states, in forwarding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SiState {
    /// Not solicited yet.
    Ini,
    /// A server connection is wanted.
    Req,
    /// Waiting in a pending queue.
    Que,
    /// Turn-around delay after a failed connect.
    Tar,
    /// A server was just assigned.
    Ass,
    /// Connect issued, waiting for the outcome.
    Con,
    /// Connect failed, retry decision pending.
    Cer,
    /// Established, data flowing.
    Est,
    /// One side disconnected, cleanup pending.
    Dis,
    /// Closed.
    Clo,
}

/// Stream-interface flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SiFlags(u16);

impl SiFlags {
    /// The interface's own deadline expired.
    pub const EXP: Self = Self(0x01);
    /// A non-recoverable error occurred.
    pub const ERR: Self = Self(0x02);
    /// Streams are independent: writes do not refresh read timeouts.
    pub const INDEP_STR: Self = Self(0x04);
    /// Close without lingering.
    pub const NOLINGER: Self = Self(0x08);

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

/// Detailed cause kept alongside the coarse session error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiErrType {
    /// Nothing wrong.
    #[default]
    None,
    /// Queue wait timed out.
    QueueTo,
    /// Queue refused the session.
    QueueErr,
    /// Aborted while queued.
    QueueAbrt,
    /// Connect timed out.
    ConnTo,
    /// Connect failed.
    ConnErr,
    /// Aborted while connecting.
    ConnAbrt,
    /// Connection refused for another reason.
    ConnOther,
}

/// One side of a session.
#[derive(Debug)]
pub struct StreamInt {
    /// Current state.
    pub state: SiState,
    /// State before the last handler run.
    pub prev_state: SiState,
    /// Flags.
    pub flags: SiFlags,
    /// Wakeup deadline for connect, queue and turn-around waits.
    pub exp: Tick,
    /// Detailed error cause.
    pub err_type: SiErrType,
    /// Connect retries left.
    pub conn_retries: i32,
    /// The socket, when one exists.
    pub sock: Option<TcpStream>,
    /// Poller token of the socket.
    pub tok: Option<Token>,
}

impl StreamInt {
    /// Creates an idle interface.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SiState::Ini,
            prev_state: SiState::Ini,
            flags: SiFlags::default(),
            exp: TICK_ETERNITY,
            err_type: SiErrType::None,
            conn_retries: 0,
            sock: None,
            tok: None,
        }
    }

    fn set_err(&mut self, err: SiErrType) {
        if self.err_type == SiErrType::None {
            self.err_type = err;
        }
    }
}

impl Default for StreamInt {
    fn default() -> Self {
        Self::new()
    }
}

/// Releases the interface's socket and poller registration.
pub(crate) fn close_si(poller: &mut Poller<FdOwner>, si: &mut StreamInt) {
    if let Some(tok) = si.tok.take() {
        poller.unregister(tok);
    }
    si.sock = None;
}

/// Shuts the read side: the producer is gone.
pub(crate) fn shutr(poller: &mut Poller<FdOwner>, si: &mut StreamInt, ib: &mut Buffer, ob: &Buffer) {
    if ib.flags.has(BufFlags::SHUTR) {
        return;
    }
    ib.flags.set(BufFlags::SHUTR);
    ib.rex = TICK_ETERNITY;
    if ob.flags.has(BufFlags::SHUTW) {
        close_si(poller, si);
        si.state = SiState::Dis;
    } else if let (Some(sock), Some(tok)) = (&si.sock, si.tok) {
        let _ = sock.shutdown(std::net::Shutdown::Read);
        poller.stop(tok, Dir::Read);
    }
}

/// Shuts the write side: pending output is abandoned or already sent.
pub(crate) fn shutw(
    poller: &mut Poller<FdOwner>,
    si: &mut StreamInt,
    ob: &mut Buffer,
    ib: &mut Buffer,
) {
    if ob.flags.has(BufFlags::SHUTW) {
        return;
    }
    ob.flags.set(BufFlags::SHUTW | BufFlags::SHUTW_NOW);
    ob.wex = TICK_ETERNITY;
    if si.flags.has(SiFlags::NOLINGER) {
        // one shot: the close that follows sends a reset instead of
        // draining through the FIN handshake
        si.flags.clear(SiFlags::NOLINGER);
        if let Some(sock) = &si.sock {
            let _ = socket2::SockRef::from(sock).set_linger(Some(std::time::Duration::ZERO));
        }
    }
    if ib.flags.has(BufFlags::SHUTR) || si.state != SiState::Est {
        close_si(poller, si);
        if si.state == SiState::Est || si.state == SiState::Con {
            si.state = SiState::Dis;
        }
    } else if let (Some(sock), Some(tok)) = (&si.sock, si.tok) {
        let _ = sock.shutdown(std::net::Shutdown::Write);
        poller.stop(tok, Dir::Write);
    }
}

/// Moves the session's `served` slot between servers: releasing the old
/// one may promote queued sessions, which are woken here.
pub(crate) fn change_server(w: &mut Worker, s: &mut Session, new: Option<usize>) {
    let Some(be_id) = s.be else {
        return;
    };
    if s.flags.has(SessFlags::CURR_SESS) {
        if let Some(old) = s.target {
            let be = &mut w.registry.backends[be_id];
            be.servers[old].drop_conn();
            lb::server_drop_conn(be, old);
            s.flags.clear(SessFlags::CURR_SESS);
            let promoted = crate::queue::process_pending(&mut w.registry.backends[be_id], old);
            for psid in promoted {
                w.promote_queued_session(psid, old);
            }
        }
    }
    if let Some(new) = new {
        let be = &mut w.registry.backends[be_id];
        be.servers[new].take_conn();
        lb::server_take_conn(be, new);
        s.flags.set(SessFlags::CURR_SESS);
        s.target = Some(new);
    }
}

/// Picks a server for the session, honouring hash keys and redispatch
/// avoidance. On success the session is marked assigned.
fn assign_server(w: &mut Worker, s: &mut Session) -> Result<(), ErrClass> {
    if s.flags.has(SessFlags::ASSIGNED) {
        return Ok(());
    }
    let Some(be_id) = s.be else {
        return Err(ErrClass::Internal);
    };

    let mut payload = vec![0u8; s.req.len()];
    let n = s.req.peek(&mut payload);
    payload.truncate(n);
    let avoid = if s.flags.has(SessFlags::REDISP) {
        s.target
    } else {
        None
    };

    let be = &mut w.registry.backends[be_id];
    if be.lbprm.tot_weight == 0 {
        return Err(ErrClass::Down);
    }
    let hash = super::hash_key(&be.hash_on, &s.peer, &payload);
    let picked = match hash {
        Some(h) => lb::pick_server_hash(be, h),
        None => lb::pick_server(be, avoid),
    };
    let Some(srv) = picked else {
        // every usable server is saturated
        return Err(ErrClass::PrxCond);
    };
    if s.flags.has(SessFlags::REDISP) && s.target.is_some() && s.target != Some(srv) {
        be.counters.redispatches += 1;
    }
    s.target = Some(srv);
    s.flags.set(SessFlags::ASSIGNED);
    Ok(())
}

/// Tries to reserve a slot on the assigned server, queueing the session
/// when the server is saturated. Leaves the interface in `Ass` or `Que`.
pub(crate) fn prepare_conn_req(w: &mut Worker, s: &mut Session, sid: usize) {
    if s.srv.state != SiState::Req {
        return;
    }
    let now = w.clock.now_ms();

    match assign_server(w, s) {
        Ok(()) => {}
        Err(class) => {
            let finst = if class == ErrClass::PrxCond {
                // saturated backend: wait in the shared queue instead
                if let Some(be_id) = s.be {
                    let be = &mut w.registry.backends[be_id];
                    if let EnqueueResult::Queued(pos) = pendconn_add(be_id, be, None, sid) {
                        s.pend_pos = Some(pos);
                        s.srv.state = SiState::Que;
                        s.srv.exp = tick_add_ifset(now, be.timeouts.queue);
                        return;
                    }
                }
                FinState::Q
            } else {
                FinState::C
            };
            s.srv.set_err(SiErrType::ConnOther);
            s.record_error(class, finst);
            super::kill_session(w, s);
            return;
        }
    }

    // reserve the slot or wait for one
    let be_id = match s.be {
        Some(b) => b,
        None => return,
    };
    let srv = match s.target {
        Some(t) => t,
        None => return,
    };
    let saturated = {
        let be = &w.registry.backends[be_id];
        lb::srv_is_full(&be.servers[srv], be.beconn, be.fullconn)
    };
    if saturated {
        let be = &mut w.registry.backends[be_id];
        let res = pendconn_add(be_id, be, Some(srv), sid);
        let pos = match res {
            EnqueueResult::Queued(pos) => Some(pos),
            EnqueueResult::ServerQueueFull => {
                match pendconn_add(be_id, be, None, sid) {
                    EnqueueResult::Queued(pos) => Some(pos),
                    EnqueueResult::ServerQueueFull => None,
                }
            }
        };
        match pos {
            Some(pos) => {
                s.pend_pos = Some(pos);
                s.srv.state = SiState::Que;
                s.srv.exp = tick_add_ifset(now, be.timeouts.queue);
            }
            None => {
                s.srv.set_err(SiErrType::QueueErr);
                s.record_error(ErrClass::PrxCond, FinState::Q);
                super::kill_session(w, s);
            }
        }
        return;
    }

    change_server(w, s, Some(srv));
    s.logs.t_queue = s.logs.since_accept(now);
    s.srv.state = SiState::Ass;
}

/// Handles `Ass`, `Que` and `Tar`.
pub(crate) fn update_stream_int(w: &mut Worker, s: &mut Session, sid: usize) {
    let now = w.clock.now_ms();
    match s.srv.state {
        SiState::Ass => {
            match proto_connect(w, s, sid) {
                ConnectOutcome::Started => {
                    if let (Some(be), Some(srv)) = (s.be, s.target) {
                        w.registry.backends[be].servers[srv].counters.cum_sess += 1;
                    }
                }
                ConnectOutcome::Fatal => {
                    s.srv.set_err(SiErrType::ConnOther);
                    if let (Some(be), Some(srv)) = (s.be, s.target) {
                        w.registry.backends[be].servers[srv].counters.failed_conns += 1;
                        w.registry.backends[be].counters.failed_conns += 1;
                    }
                    change_server(w, s, None);
                    s.record_error(ErrClass::Resource, FinState::C);
                    super::kill_session(w, s);
                }
                ConnectOutcome::Retryable => {
                    s.srv.state = SiState::Cer;
                    s.srv.flags.clear(SiFlags::ERR);
                    update_st_cer(w, s, sid);
                }
            }
        }
        SiState::Que => {
            if s.pend_pos.is_none() {
                // promoted out of the queue, or rebalancing requested
                s.srv.exp = TICK_ETERNITY;
                s.srv.flags.clear(SiFlags::EXP);
                if s.flags.has(SessFlags::ASSIGNED) {
                    s.logs.t_queue = s.logs.since_accept(now);
                    s.srv.state = SiState::Ass;
                } else {
                    s.srv.state = SiState::Req;
                }
                return;
            }
            if s.srv.flags.has(SiFlags::EXP) {
                s.srv.exp = TICK_ETERNITY;
                s.srv.flags.clear(SiFlags::EXP);
                s.logs.t_queue = s.logs.since_accept(now);
                if let (Some(pos), Some(be)) = (s.pend_pos.take(), s.be) {
                    pendconn_remove(&mut w.registry.backends[be], pos, sid);
                    w.registry.backends[be].counters.failed_conns += 1;
                }
                s.srv.set_err(SiErrType::QueueTo);
                s.record_error(ErrClass::SrvTo, FinState::Q);
                super::kill_session(w, s);
                return;
            }
            if client_abort_wanted(s, w) {
                s.srv.exp = TICK_ETERNITY;
                s.logs.t_queue = s.logs.since_accept(now);
                if let (Some(pos), Some(be)) = (s.pend_pos.take(), s.be) {
                    pendconn_remove(&mut w.registry.backends[be], pos, sid);
                }
                s.srv.set_err(SiErrType::QueueAbrt);
                s.record_error(ErrClass::CliCl, FinState::Q);
                super::kill_session(w, s);
            }
        }
        SiState::Tar => {
            if client_abort_wanted(s, w) {
                s.srv.exp = TICK_ETERNITY;
                s.srv.set_err(SiErrType::ConnAbrt);
                s.record_error(ErrClass::CliCl, FinState::C);
                super::kill_session(w, s);
                return;
            }
            if !s.srv.flags.has(SiFlags::EXP) {
                return; // still in turn-around
            }
            s.srv.flags.clear(SiFlags::EXP);
            s.srv.exp = TICK_ETERNITY;
            s.srv.state = if s.flags.has(SessFlags::ASSIGNED) {
                SiState::Ass
            } else {
                SiState::Req
            };
        }
        _ => {}
    }
}

/// True when the client went away and the session should give up before
/// holding a server slot.
fn client_abort_wanted(s: &Session, w: &Worker) -> bool {
    if s.req.flags.has(BufFlags::READ_ERROR) {
        return true;
    }
    let abortonclose = s
        .be
        .map(|b| w.registry.backends[b].options.abortonclose)
        .unwrap_or(false);
    s.req.flags.has(BufFlags::SHUTR) && (s.req.is_empty() || abortonclose)
}

/// Handles `Con`: connect completion, failure or client abort. Returns
/// false when the caller must run the error path.
pub(crate) fn update_st_con_tcp(w: &mut Worker, s: &mut Session) -> bool {
    let now = w.clock.now_ms();

    if s.srv.flags.has(SiFlags::EXP) || s.srv.flags.has(SiFlags::ERR) {
        let timed_out = !s.srv.flags.has(SiFlags::ERR);
        s.srv.exp = TICK_ETERNITY;
        s.srv.flags.clear(SiFlags::EXP);
        s.srv.state = SiState::Cer;
        close_si(&mut w.poller, &mut s.srv);
        s.srv.set_err(if timed_out {
            SiErrType::ConnTo
        } else {
            SiErrType::ConnErr
        });
        return false;
    }

    // client abort while the connection is still being established
    if s.rep.flags.has(BufFlags::SHUTW) || client_abort_wanted(s, w) {
        s.srv.set_err(SiErrType::ConnAbrt);
        close_si(&mut w.poller, &mut s.srv);
        s.srv.state = SiState::Clo;
        s.record_error(ErrClass::CliCl, FinState::C);
        return true;
    }

    if !s
        .req
        .flags
        .has_any(BufFlags::WRITE_ACTIVITY | BufFlags::WRITE_NULL)
    {
        return true; // nothing happened yet, keep waiting
    }

    s.logs.t_connect = s.logs.since_accept(now);
    s.srv.exp = TICK_ETERNITY;
    s.srv.flags.clear(SiFlags::EXP);
    s.srv.state = SiState::Est;
    s.srv.err_type = SiErrType::None;
    true
}

/// Handles `Cer`: decide between retry, turn-around, redispatch and
/// giving up.
pub(crate) fn update_st_cer(w: &mut Worker, s: &mut Session, _sid: usize) {
    s.srv.conn_retries -= 1;
    if s.srv.conn_retries < 0 {
        s.srv.set_err(SiErrType::ConnErr);
        if let (Some(be), Some(srv)) = (s.be, s.target) {
            w.registry.backends[be].servers[srv].counters.failed_conns += 1;
            w.registry.backends[be].counters.failed_conns += 1;
        }
        let class = if s.srv.err_type == SiErrType::ConnTo {
            ErrClass::SrvTo
        } else {
            ErrClass::SrvCl
        };
        // the slot is released during teardown, waking any queued session
        s.record_error(class, FinState::C);
        super::kill_session(w, s);
        return;
    }

    let redispatch = s
        .be
        .map(|b| w.registry.backends[b].options.redispatch)
        .unwrap_or(false);
    if s.target.is_some() && s.srv.conn_retries == 0 && redispatch {
        // last retry may move to another server; give the slot back now
        change_server(w, s, None);
        s.flags.clear(SessFlags::DIRECT | SessFlags::ADDR_SET);
        s.flags.clear(SessFlags::ASSIGNED);
        s.flags.set(SessFlags::REDISP);
        s.srv.state = SiState::Req;
    } else {
        // plain retry on the same server keeps the reserved slot
        if let (Some(be), Some(srv)) = (s.be, s.target) {
            w.registry.backends[be].servers[srv].counters.retries += 1;
            w.registry.backends[be].counters.retries += 1;
        }
        s.srv.state = SiState::Ass;
    }

    if s.srv.flags.has(SiFlags::ERR) {
        // an asynchronous error would likely repeat immediately; wait a
        // bit before the next attempt
        s.srv.set_err(SiErrType::ConnErr);
        s.srv.flags.clear(SiFlags::ERR);
        s.srv.state = SiState::Tar;
        s.srv.exp = tick_add(w.clock.now_ms(), TURN_AROUND_MS);
    }
}

/// Transition work for `Con`/`Ini` → `Est`.
pub(crate) fn establish(w: &mut Worker, s: &mut Session, sid: usize) {
    let now = w.clock.now_ms();
    let Some(be_id) = s.be else {
        return;
    };
    let be = &w.registry.backends[be_id];
    s.req.wto = be.timeouts.server;
    s.rep.rto = be.timeouts.server;
    s.rep.rex = tick_add_ifset(now, be.timeouts.server);
    s.req.wex = TICK_ETERNITY;
    s.rep.flags.set(BufFlags::READ_ATTACHED);
    if !be.tcp_rep.is_empty() {
        s.rep.analysers |= super::AN_RES_INSPECT;
    }
    if be.options.independent_streams {
        s.cli.flags.set(SiFlags::INDEP_STR);
        s.srv.flags.set(SiFlags::INDEP_STR);
    }
    if be.options.nolinger {
        s.cli.flags.set(SiFlags::NOLINGER);
        s.srv.flags.set(SiFlags::NOLINGER);
    }
    if be.options.tcp_nodelay {
        s.req.flags.set(BufFlags::NEVER_WAIT);
        s.rep.flags.set(BufFlags::NEVER_WAIT);
        if let Some(sock) = &s.srv.sock {
            let _ = sock.set_nodelay(true);
        }
    }
    tracing::trace!(session = sid, backend = %be.name, "connection established");
}

/// Outcome of a connect attempt.
enum ConnectOutcome {
    /// In progress or completed; the interface is in `Con`.
    Started,
    /// Resource-level failure, not worth retrying.
    Fatal,
    /// Transient failure; run the retry path.
    Retryable,
}

/// Issues the non-blocking connect for the assigned server.
fn proto_connect(w: &mut Worker, s: &mut Session, sid: usize) -> ConnectOutcome {
    let Some(be_id) = s.be else {
        return ConnectOutcome::Fatal;
    };
    let Some(srv_id) = s.target else {
        return ConnectOutcome::Fatal;
    };
    let (addr, connect_to) = {
        let be = &w.registry.backends[be_id];
        (be.servers[srv_id].addr, be.timeouts.connect)
    };
    s.flags.set(SessFlags::ADDR_SET);

    match super::proto::start_connect(addr) {
        Ok(sock) => {
            let now = w.clock.now_ms();
            let tok = w
                .poller
                .register(std::os::fd::AsRawFd::as_raw_fd(&sock), FdOwner::SessSrv(sid));
            s.srv.sock = Some(sock);
            s.srv.tok = Some(tok);
            s.srv.flags.clear(SiFlags::ERR);
            s.srv.flags.clear(SiFlags::EXP);
            // speculative write: the completion check runs before any
            // kernel registration
            w.poller.want(tok, Dir::Write);
            s.srv.state = SiState::Con;
            s.srv.exp = tick_add_ifset(now, connect_to);
            s.req.flags.clear(BufFlags::WRITE_ACTIVITY | BufFlags::WRITE_NULL);
            tracing::trace!(session = sid, server = srv_id, %addr, "connect issued");
            ConnectOutcome::Started
        }
        Err(e) if matches!(
            e.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        ) =>
        {
            tracing::error!(session = sid, error = %e, "out of local resources for connect");
            ConnectOutcome::Fatal
        }
        Err(e) => {
            tracing::debug!(session = sid, server = srv_id, error = %e, "connect failed");
            s.srv.set_err(SiErrType::ConnErr);
            ConnectOutcome::Retryable
        }
    }
}
