//! The single-threaded worker loop.
//!
//! One `Worker` owns every mutable piece of the data path: clock, timer
//! queue, run queue, poller, signal state, the proxy registry and the
//! session table. Each loop iteration drains pending signals, runs every
//! runnable task to completion, sleeps in the poller no longer than the
//! nearest timer, then turns readiness events into buffer flags and
//! freshly runnable tasks. Handlers never block; everything they want to
//! happen later is expressed as fd interest or a timer before they
//! return.

use crate::admin::{self, AdminState};
use crate::buffer::BufFlags;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::poller::{Dir, FdEvent, Poller};
use crate::proxy::listener::ListenerState;
use crate::proxy::Registry;
use crate::rules::{RuleCtx, RuleVerdict};
use crate::session::{self, stream_int::SiState, ErrClass, Session, SessFlags};
use crate::signals::{Signals, SIG_INTERNAL};
use crate::ticks::{tick_add, tick_remain, MAX_DELAY_MS};
use crate::timer::TimerQueue;
use slab::Slab;
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use tracing::{debug, error, info};

/// What a poller token belongs to.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FdOwner {
    /// A frontend's bound socket.
    Listener {
        /// Frontend index.
        fe: usize,
        /// Listener index within the frontend.
        li: usize,
    },
    /// The client side of a session.
    SessCli(usize),
    /// The server side of a session.
    SessSrv(usize),
    /// The admin applet's bound socket.
    AdminListener,
    /// One admin connection.
    AdminConn(usize),
    /// The signal self-pipe.
    SignalPipe,
}

/// A unit of deferred work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskRef {
    /// Run a session handler.
    Session(usize),
    /// Re-enable a rate-limited listener.
    EnableListener {
        /// Frontend index.
        fe: usize,
        /// Listener index.
        li: usize,
    },
    /// The soft-stop grace period ran out.
    StopDeadline,
}

/// The worker context: all former globals in one owned struct, threaded
/// explicitly through every handler.
pub struct Worker {
    pub(crate) clock: Clock,
    pub(crate) timers: TimerQueue<TaskRef>,
    pub(crate) run_queue: VecDeque<TaskRef>,
    pub(crate) poller: Poller<FdOwner>,
    pub(crate) signals: Signals,
    pub(crate) registry: Registry,
    pub(crate) sessions: Slab<Option<Session>>,
    pub(crate) admin: Option<AdminState>,
    pub(crate) stopping: bool,
    pub(crate) exiting: bool,
}

impl Worker {
    /// Builds the worker: registry, bound listeners, admin socket and
    /// signal plumbing, all registered with a fresh poller.
    pub fn new(cfg: &Config) -> Result<Self> {
        let registry = Registry::build(cfg).map_err(|e| {
            Error::new(ErrorKind::Config).with_context(e.to_string())
        })?;
        let mut worker = Self {
            clock: Clock::new(),
            timers: TimerQueue::new(),
            run_queue: VecDeque::new(),
            poller: Poller::new()?,
            signals: Signals::new()?,
            registry,
            sessions: Slab::new(),
            admin: None,
            stopping: false,
            exiting: false,
        };

        for fe_id in 0..worker.registry.frontends.len() {
            for li_id in 0..worker.registry.frontends[fe_id].listeners.len() {
                worker.registry.frontends[fe_id].listeners[li_id].bind()?;
                let raw = {
                    let li = &worker.registry.frontends[fe_id].listeners[li_id];
                    li.sock.as_ref().map(|s| s.as_raw_fd())
                };
                if let Some(raw) = raw {
                    let tok = worker
                        .poller
                        .register(raw, FdOwner::Listener { fe: fe_id, li: li_id });
                    worker.registry.frontends[fe_id].listeners[li_id].tok = Some(tok);
                    worker.poller.want(tok, Dir::Read);
                }
            }
        }

        if let Some(path) = worker.registry.global.admin_socket.clone() {
            let mut state = AdminState::bind(&path)?;
            let tok = worker
                .poller
                .register(state.listener.as_raw_fd(), FdOwner::AdminListener);
            worker.poller.cant(tok, Dir::Read);
            state.ltok = Some(tok);
            worker.admin = Some(state);
        }

        let pipe_tok = worker
            .poller
            .register(worker.signals.pipe_fd(), FdOwner::SignalPipe);
        worker.poller.cant(pipe_tok, Dir::Read);

        Ok(worker)
    }

    /// Installs the process control signals. Separated from `new` so
    /// tests can run workers without touching global signal dispositions.
    pub fn watch_control_signals(&mut self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM, SIGTTIN, SIGTTOU, SIGUSR1};
        for sig in [SIGUSR1, SIGTERM, SIGINT, SIGTTOU, SIGTTIN] {
            self.signals.watch(sig)?;
        }
        Ok(())
    }

    /// Runs until told to stop. Returns cleanly on graceful exit.
    pub fn run(&mut self) -> Result<()> {
        info!(
            frontends = self.registry.frontends.len(),
            backends = self.registry.backends.len(),
            "worker running"
        );
        while self.run_once()? {}
        info!("worker exiting");
        Ok(())
    }

    /// One scheduler iteration. Returns false when the worker is done.
    pub fn run_once(&mut self) -> Result<bool> {
        // 1. deferred signal work
        if self.signals.has_pending() {
            for sig in self.signals.drain() {
                self.handle_signal(sig);
            }
        }

        // 2. the run queue, drained to exhaustion
        while let Some(task) = self.run_queue.pop_front() {
            match task {
                TaskRef::Session(sid) => {
                    if let Some(Some(s)) = self.sessions.get_mut(sid) {
                        s.task_queued = false;
                    }
                    session::process_session(self, sid);
                }
                TaskRef::EnableListener { fe, li } => self.enable_listener(fe, li),
                TaskRef::StopDeadline => self.hard_stop(),
            }
        }

        if self.exiting || (self.stopping && self.sessions.is_empty()) {
            return Ok(false);
        }

        // 3. sleep no longer than the nearest timer
        let now = self.clock.now_ms();
        let timeout = if self.signals.has_pending() {
            0
        } else {
            tick_remain(now, self.timers.next_expiry(now)).unwrap_or(MAX_DELAY_MS)
        };
        let max_wait = timeout.min(MAX_DELAY_MS);

        let mut events: Vec<FdEvent<FdOwner>> = Vec::new();
        self.poller.wait(Some(max_wait), &mut events)?;
        self.clock.update(max_wait, !events.is_empty());

        // 4. expired timers become runnable
        let now = self.clock.now_ms();
        for task in self.timers.pop_expired(now) {
            match task {
                TaskRef::Session(sid) => self.enqueue_session(sid),
                other => self.run_queue.push_back(other),
            }
        }

        // 5. deliver fd events
        for ev in events {
            self.dispatch(ev);
        }
        Ok(true)
    }

    /// Queues a session handler run, once.
    pub(crate) fn enqueue_session(&mut self, sid: usize) {
        if let Some(Some(s)) = self.sessions.get_mut(sid) {
            if !s.task_queued {
                s.task_queued = true;
                self.run_queue.push_back(TaskRef::Session(sid));
            }
        }
    }

    fn dispatch(&mut self, ev: FdEvent<FdOwner>) {
        // resolve the owner again: an earlier event in this batch may
        // have closed the fd
        let Some(owner) = self.poller.owner(ev.token) else {
            return;
        };
        match owner {
            FdOwner::Listener { fe, li } => {
                if ev.readable {
                    self.accept_loop(fe, li);
                }
            }
            FdOwner::SessCli(sid) => self.session_io(sid, true, &ev),
            FdOwner::SessSrv(sid) => self.session_io(sid, false, &ev),
            FdOwner::AdminListener => admin::accept_loop(self),
            FdOwner::AdminConn(cid) => admin::conn_io(self, cid, ev.readable, ev.writable),
            FdOwner::SignalPipe => {
                // the pending work is picked up at the top of the next
                // iteration; nothing to do here
            }
        }
    }

    fn session_io(&mut self, sid: usize, client_side: bool, ev: &FdEvent<FdOwner>) {
        let now = self.clock.now_ms();
        let Worker {
            sessions, poller, ..
        } = self;
        let Some(Some(s)) = sessions.get_mut(sid) else {
            return;
        };
        if client_side {
            if ev.readable && !s.req.flags.has(BufFlags::SHUTR) {
                session::proto::si_read(now, poller, &mut s.cli, &mut s.req);
            }
            if ev.writable && !s.rep.flags.has(BufFlags::SHUTW) && s.rep.analysers == 0 {
                session::proto::si_write(now, poller, &mut s.cli, &mut s.rep, &mut s.req);
            }
        } else if s.srv.state == SiState::Con {
            if ev.writable && !session::proto::conn_check(poller, &mut s.srv, &mut s.req) {
                return; // connect still pending, no wakeup
            }
        } else {
            if ev.readable && !s.rep.flags.has(BufFlags::SHUTR) {
                session::proto::si_read(now, poller, &mut s.srv, &mut s.rep);
            }
            if ev.writable && !s.req.flags.has(BufFlags::SHUTW) {
                session::proto::si_write(now, poller, &mut s.srv, &mut s.req, &mut s.rep);
            }
        }
        self.enqueue_session(sid);
    }

    fn accept_loop(&mut self, fe_id: usize, li_id: usize) {
        loop {
            if self.stopping {
                return;
            }
            let now = self.clock.now_ms();
            let global_cap = self.registry.global.maxconn;
            let sessions_now = self.sessions.len() as u32;

            // admission checks before touching the socket
            {
                let fe = &mut self.registry.frontends[fe_id];
                let li = &mut fe.listeners[li_id];
                if li.state != ListenerState::Ready {
                    return;
                }
                if fe.feconn >= fe.maxconn || sessions_now >= global_cap {
                    li.state = ListenerState::Full;
                    if let Some(tok) = li.tok {
                        self.poller.stop(tok, Dir::Read);
                    }
                    debug!(frontend = %fe.name, "listener full");
                    return;
                }
                if let Some(limit) = fe.rate_limit {
                    if fe.sess_rate.read(now) >= limit {
                        let delay = fe.sess_rate.next_event_delay(limit, now).max(1);
                        li.state = ListenerState::Limited;
                        if let Some(tok) = li.tok {
                            self.poller.stop(tok, Dir::Read);
                        }
                        self.timers.insert(
                            tick_add(now, delay),
                            TaskRef::EnableListener { fe: fe_id, li: li_id },
                        );
                        debug!(frontend = %fe.name, delay, "session rate limit reached");
                        return;
                    }
                }
            }

            let res = {
                let li = &self.registry.frontends[fe_id].listeners[li_id];
                let Some(sock) = li.sock.as_ref() else {
                    return;
                };
                sock.accept()
            };
            let tok = self.registry.frontends[fe_id].listeners[li_id].tok;
            match res {
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if let Some(tok) = tok {
                        self.poller.cant(tok, Dir::Read);
                    }
                    return;
                }
                Err(e) => {
                    // transient accept failures (fd pressure, resets)
                    error!(error = %e, "accept failed");
                    if let Some(tok) = tok {
                        self.poller.cant(tok, Dir::Read);
                    }
                    return;
                }
                Ok((stream, peer)) => {
                    self.new_session(fe_id, stream, peer);
                }
            }
        }
    }

    fn new_session(&mut self, fe_id: usize, stream: std::net::TcpStream, peer: std::net::SocketAddr) {
        let now = self.clock.now_ms();
        let bufsize = self.registry.global.bufsize;

        {
            let fe = &mut self.registry.frontends[fe_id];
            fe.counters.cum_conn += 1;
            fe.sess_rate.record(now);
            let ctx = RuleCtx {
                src: peer,
                data: &[],
                partial: false,
            };
            if fe.l4_rules.evaluate(&ctx) == RuleVerdict::Reject {
                fe.counters.denied_conn += 1;
                debug!(frontend = %fe.name, %peer, "connection denied by layer-4 rule");
                return;
            }
        }
        if stream.set_nonblocking(true).is_err() {
            return;
        }

        let entry = self.sessions.vacant_entry();
        let sid = entry.key();
        let tok = self.poller.register(stream.as_raw_fd(), FdOwner::SessCli(sid));

        let mut s = Session::new(fe_id, peer, bufsize, now);
        s.cli.sock = Some(stream);
        s.cli.tok = Some(tok);
        {
            let fe = &mut self.registry.frontends[fe_id];
            s.req.rto = fe.timeouts.client;
            s.rep.wto = fe.timeouts.client;
            s.req.rex = crate::ticks::tick_add_ifset(now, fe.timeouts.client);
            fe.feconn += 1;
        }
        entry.insert(Some(s));
        self.poller.want(tok, Dir::Read);
        self.enqueue_session(sid);
        debug!(session = sid, %peer, "accepted");
    }

    /// Hands a freed server slot to a queued session and wakes it.
    pub(crate) fn promote_queued_session(&mut self, sid: usize, srv: usize) {
        let Some(Some(s)) = self.sessions.get_mut(sid) else {
            return;
        };
        let Some(be_id) = s.be else {
            return;
        };
        s.pend_pos = None;
        s.target = Some(srv);
        s.flags.set(SessFlags::ASSIGNED | SessFlags::CURR_SESS);
        let be = &mut self.registry.backends[be_id];
        be.servers[srv].take_conn();
        crate::lb::server_take_conn(be, srv);
        self.enqueue_session(sid);
    }

    /// Puts an orphaned queued session (its server went away) back on
    /// the balancing path.
    pub(crate) fn rebalance_orphan(&mut self, sid: usize) {
        if let Some(Some(s)) = self.sessions.get_mut(sid) {
            s.pend_pos = None;
            s.flags.clear(SessFlags::ASSIGNED);
            s.flags.set(SessFlags::REDISP);
        }
        self.enqueue_session(sid);
    }

    /// Re-enables listeners parked in the `Full` state once headroom is
    /// back.
    pub(crate) fn reenable_full_listeners(&mut self, fe_id: usize) {
        let global_cap = self.registry.global.maxconn;
        let sessions_now = self.sessions.len() as u32;
        let fe = &mut self.registry.frontends[fe_id];
        if fe.feconn >= fe.maxconn || sessions_now >= global_cap {
            return;
        }
        for li in &mut fe.listeners {
            if li.state == ListenerState::Full {
                li.state = ListenerState::Ready;
                if let Some(tok) = li.tok {
                    self.poller.want(tok, Dir::Read);
                }
            }
        }
    }

    fn enable_listener(&mut self, fe_id: usize, li_id: usize) {
        if self.stopping {
            return;
        }
        let Some(fe) = self.registry.frontends.get_mut(fe_id) else {
            return;
        };
        let Some(li) = fe.listeners.get_mut(li_id) else {
            return;
        };
        if li.state == ListenerState::Limited {
            li.state = ListenerState::Ready;
            if let Some(tok) = li.tok {
                self.poller.want(tok, Dir::Read);
            }
        }
    }

    fn handle_signal(&mut self, sig: i32) {
        use signal_hook::consts::{SIGINT, SIGTERM, SIGTTIN, SIGTTOU, SIGUSR1};
        match sig {
            SIG_INTERNAL => {
                // broadcast: management state may have changed, nothing
                // beyond waking the loop is required
            }
            s if s == SIGUSR1 => self.soft_stop(),
            s if s == SIGTERM || s == SIGINT => self.hard_stop(),
            s if s == SIGTTOU => self.pause_listeners(),
            s if s == SIGTTIN => self.resume_listeners(),
            other => debug!(signal = other, "ignored signal"),
        }
    }

    /// Graceful stop: unbind every listener, let sessions drain, force
    /// the rest out when the grace period ends.
    pub fn soft_stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        info!(grace_ms = self.registry.global.grace, "soft stop");
        for fe in &mut self.registry.frontends {
            for li in &mut fe.listeners {
                if let Some(tok) = li.tok.take() {
                    self.poller.unregister(tok);
                }
                li.unbind();
            }
            fe.stopped = true;
        }
        let grace = self.registry.global.grace;
        if self.sessions.is_empty() {
            self.exiting = true;
        } else if grace == 0 {
            self.hard_stop();
        } else {
            let now = self.clock.now_ms();
            self.timers.insert(tick_add(now, grace), TaskRef::StopDeadline);
        }
        self.signals.raise_internal();
    }

    /// Immediate stop: every remaining session is terminated now.
    pub fn hard_stop(&mut self) {
        info!(sessions = self.sessions.len(), "hard stop");
        self.stopping = true;
        let sids: Vec<usize> = self.sessions.iter().map(|(k, _)| k).collect();
        for sid in sids {
            let Some(slot) = self.sessions.get_mut(sid) else {
                continue;
            };
            let Some(mut s) = slot.take() else {
                continue;
            };
            let err = if s.srv.state == SiState::Est {
                ErrClass::SrvCl
            } else {
                ErrClass::CliCl
            };
            let finst = s.default_finst();
            s.record_error(err, finst);
            session::kill_session(self, &mut s);
            session::terminate(self, s, sid);
            self.sessions.remove(sid);
        }
        for fe in &mut self.registry.frontends {
            for li in &mut fe.listeners {
                if let Some(tok) = li.tok.take() {
                    self.poller.unregister(tok);
                }
                li.unbind();
            }
        }
        self.exiting = true;
    }

    /// Temporarily stops accepting; the sockets stay bound.
    pub fn pause_listeners(&mut self) {
        info!("pausing listeners");
        for fe in &mut self.registry.frontends {
            for li in &mut fe.listeners {
                if li.state == ListenerState::Ready {
                    li.state = ListenerState::Paused;
                    if let Some(tok) = li.tok {
                        self.poller.stop(tok, Dir::Read);
                    }
                }
            }
        }
    }

    /// Resumes accepting after a pause.
    pub fn resume_listeners(&mut self) {
        info!("resuming listeners");
        for fe in &mut self.registry.frontends {
            for li in &mut fe.listeners {
                if li.state == ListenerState::Paused {
                    li.state = ListenerState::Ready;
                    if let Some(tok) = li.tok {
                        self.poller.want(tok, Dir::Read);
                    }
                }
            }
        }
    }

    /// Number of live sessions, exposed for tests and diagnostics.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Executes one admin command line directly, bypassing the socket.
    /// This is the same dispatcher the Unix-socket applet uses.
    pub fn admin_exec(&mut self, line: &str) -> String {
        admin::exec_command(self, line)
    }

    /// Effective address of a bound listener, for tests binding port 0.
    #[must_use]
    pub fn listener_addr(&self, fe: usize, li: usize) -> Option<std::net::SocketAddr> {
        self.registry
            .frontends
            .get(fe)
            .and_then(|f| f.listeners.get(li))
            .map(|l| l.addr)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(admin) = &self.admin {
            let _ = std::fs::remove_file(&admin.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(json: &str) -> Config {
        Config::from_json(json).expect("config")
    }

    fn minimal() -> Config {
        cfg(r#"{
            "frontends": [{
                "name": "fe",
                "listeners": [{ "addr": "127.0.0.1:0" }],
                "default_backend": "be"
            }],
            "backends": [{
                "name": "be",
                "servers": [{ "name": "s1", "addr": "127.0.0.1:1" }]
            }]
        }"#)
    }

    #[test]
    fn worker_builds_and_binds() {
        let w = Worker::new(&minimal()).expect("worker");
        let addr = w.listener_addr(0, 0).unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(w.session_count(), 0);
    }

    #[test]
    fn idle_iteration_makes_progress() {
        let mut w = Worker::new(&minimal()).expect("worker");
        assert!(w.run_once().expect("iteration"));
    }

    #[test]
    fn soft_stop_without_sessions_exits() {
        let mut w = Worker::new(&minimal()).expect("worker");
        w.soft_stop();
        assert!(!w.run_once().expect("iteration"));
    }

    #[test]
    fn pause_and_resume_toggle_listener_state() {
        let mut w = Worker::new(&minimal()).expect("worker");
        w.pause_listeners();
        assert_eq!(
            w.registry.frontends[0].listeners[0].state,
            ListenerState::Paused
        );
        // a paused listener still owns its socket
        assert!(w.registry.frontends[0].listeners[0].sock.is_some());
        w.resume_listeners();
        assert_eq!(
            w.registry.frontends[0].listeners[0].state,
            ListenerState::Ready
        );
    }

    #[test]
    fn internal_broadcast_is_harmless() {
        let mut w = Worker::new(&minimal()).expect("worker");
        w.signals.raise_internal();
        assert!(w.run_once().expect("iteration"));
    }
}
