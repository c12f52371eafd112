//! Bound listening sockets.

use crate::error::{Error, ErrorKind, Result, ResultExt};
use crate::poller::Token;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener};

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Configured but not bound yet.
    Init,
    /// Bound and accepting.
    Ready,
    /// Temporarily desubscribed (hot-reload pause); fd stays open.
    Paused,
    /// Throttled by the session-rate limit; re-enabled by a timer.
    Limited,
    /// Frontend is at maxconn; re-enabled when a session ends.
    Full,
    /// Unbound for good (soft stop).
    Stopped,
}

/// One bound address of a frontend.
#[derive(Debug)]
pub struct Listener {
    /// Address requested in the configuration.
    pub addr: SocketAddr,
    /// Listen backlog.
    pub backlog: i32,
    /// The bound socket, while any.
    pub sock: Option<TcpListener>,
    /// Poller token, while registered.
    pub tok: Option<Token>,
    /// Current state.
    pub state: ListenerState,
}

impl Listener {
    /// Creates an unbound listener.
    #[must_use]
    pub fn new(addr: SocketAddr, backlog: Option<i32>) -> Self {
        Self {
            addr,
            backlog: backlog.unwrap_or(128),
            sock: None,
            tok: None,
            state: ListenerState::Init,
        }
    }

    /// Binds the socket: non-blocking, `SO_REUSEADDR`, configured backlog.
    pub fn bind(&mut self) -> Result<()> {
        let domain = Domain::for_address(self.addr);
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("socket allocation")?;
        sock.set_reuse_address(true).context("SO_REUSEADDR")?;
        sock.set_nonblocking(true).context("O_NONBLOCK")?;
        sock.bind(&self.addr.into())
            .with_context(|| format!("bind {}", self.addr))?;
        sock.listen(self.backlog)
            .with_context(|| format!("listen {}", self.addr))?;
        let std_listener: TcpListener = sock.into();
        // remember the effective address: port 0 binds get a real one
        self.addr = std_listener
            .local_addr()
            .map_err(|e| Error::new(ErrorKind::Listener).with_source(e))?;
        self.sock = Some(std_listener);
        self.state = ListenerState::Ready;
        Ok(())
    }

    /// Drops the socket for good.
    pub fn unbind(&mut self) {
        self.sock = None;
        self.tok = None;
        self.state = ListenerState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_assigns_effective_port() {
        let mut l = Listener::new("127.0.0.1:0".parse().unwrap(), None);
        l.bind().expect("bind");
        assert_eq!(l.state, ListenerState::Ready);
        assert_ne!(l.addr.port(), 0);
        l.unbind();
        assert_eq!(l.state, ListenerState::Stopped);
        assert!(l.sock.is_none());
    }

    #[test]
    fn bind_conflict_is_reported() {
        let mut a = Listener::new("127.0.0.1:0".parse().unwrap(), None);
        a.bind().expect("first bind");
        // second raw std bind on the same port fails; our bind surfaces it
        let mut b = Listener::new(a.addr, None);
        // SO_REUSEADDR allows rebinding a listening port on some platforms
        // only after close, so accept either outcome but never a panic
        let _ = b.bind();
    }
}
