//! Server identity, state and weights.

use crate::config::CheckCfg;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Number of distinct user weights (0..=255).
pub const SRV_UWGHT_RANGE: u32 = 256;
/// Highest user weight.
pub const SRV_UWGHT_MAX: u32 = SRV_UWGHT_RANGE - 1;
/// Internal weight scale: effective weight = user weight × 16, which gives
/// the round-robin enough resolution to modulate weights smoothly.
pub const BE_WEIGHT_SCALE: u32 = 16;
/// Number of distinct effective weights.
pub const SRV_EWGHT_RANGE: u32 = SRV_UWGHT_RANGE * BE_WEIGHT_SCALE;
/// Highest effective weight.
pub const SRV_EWGHT_MAX: u32 = SRV_UWGHT_MAX * BE_WEIGHT_SCALE;

/// Server state bits. `prev` snapshots of this and of the effective weight
/// let the balancer detect whether a reported transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SrvState(u8);

impl SrvState {
    /// The server is up and may receive traffic.
    pub const RUNNING: Self = Self(0x01);
    /// The server only receives traffic when no active server is usable.
    pub const BACKUP: Self = Self(0x02);
    /// The server is draining (soft stop); treated as unusable.
    pub const GOINGDOWN: Self = Self(0x04);
    /// Administratively disabled.
    pub const MAINT: Self = Self(0x08);

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

impl std::ops::BitOr for SrvState {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Returns true if a server with this state and effective weight can be
/// selected by the balancer.
#[must_use]
pub const fn srv_is_usable(state: SrvState, eweight: u32) -> bool {
    eweight != 0 && state.has(SrvState::RUNNING) && !state.has(SrvState::GOINGDOWN)
}

/// Per-server traffic counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct SrvCounters {
    /// Sessions ever assigned.
    pub cum_sess: u64,
    /// Failed connection attempts.
    pub failed_conns: u64,
    /// Connect retries performed.
    pub retries: u64,
    /// High-water mark of concurrent connections.
    pub max_served: u32,
}

/// One member of a backend's pool.
#[derive(Debug)]
pub struct Server {
    /// Name, unique within the backend.
    pub name: String,
    /// Process-unique numeric id, used to seed consistent-hash keys.
    pub uuid: u32,
    /// Network endpoint.
    pub addr: SocketAddr,
    /// Current state bits.
    pub state: SrvState,
    /// State at the last applied transition.
    pub prev_state: SrvState,
    /// User weight, 0..=255.
    pub uweight: u32,
    /// Effective weight (`uweight × BE_WEIGHT_SCALE`); 0 excludes.
    pub eweight: u32,
    /// Effective weight at the last applied transition.
    pub prev_eweight: u32,
    /// Concurrent-connection cap; 0 means unlimited.
    pub maxconn: u32,
    /// Pending-queue cap; 0 means unlimited.
    pub maxqueue: u32,
    /// Connections currently in flight.
    pub served: u32,
    /// Sessions queued waiting for this specific server, FIFO.
    pub pend: VecDeque<usize>,
    /// Traffic counters.
    pub counters: SrvCounters,
    /// Health-check settings carried for the external prober.
    pub check: CheckCfg,
}

impl Server {
    /// Creates a server; `disabled` starts it in maintenance.
    #[must_use]
    pub fn new(name: String, uuid: u32, addr: SocketAddr, uweight: u32, backup: bool) -> Self {
        let mut state = SrvState::RUNNING;
        if backup {
            state.set(SrvState::BACKUP);
        }
        Self {
            name,
            uuid,
            addr,
            state,
            prev_state: state,
            uweight,
            eweight: uweight * BE_WEIGHT_SCALE,
            prev_eweight: uweight * BE_WEIGHT_SCALE,
            maxconn: 0,
            maxqueue: 0,
            served: 0,
            pend: VecDeque::new(),
            counters: SrvCounters::default(),
            check: CheckCfg::default(),
        }
    }

    /// True when the server may be selected right now.
    #[must_use]
    pub fn usable(&self) -> bool {
        srv_is_usable(self.state, self.eweight)
    }

    /// Number of sessions queued on this server.
    #[must_use]
    pub fn nbpend(&self) -> u32 {
        self.pend.len() as u32
    }

    /// Accounts one more in-flight connection.
    pub fn take_conn(&mut self) {
        self.served += 1;
        if self.served > self.counters.max_served {
            self.counters.max_served = self.served;
        }
    }

    /// Releases one in-flight connection.
    pub fn drop_conn(&mut self) {
        self.served = self.served.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:80".parse().unwrap()
    }

    #[test]
    fn usable_requires_running_and_weight() {
        let mut s = Server::new("a".into(), 1, addr(), 1, false);
        assert!(s.usable());
        s.eweight = 0;
        assert!(!s.usable());
        s.eweight = 16;
        s.state.clear(SrvState::RUNNING);
        assert!(!s.usable());
        s.state.set(SrvState::RUNNING);
        s.state.set(SrvState::GOINGDOWN);
        assert!(!s.usable());
    }

    #[test]
    fn eweight_scales_user_weight() {
        let s = Server::new("a".into(), 1, addr(), 10, false);
        assert_eq!(s.eweight, 160);
    }

    #[test]
    fn conn_accounting_tracks_high_water() {
        let mut s = Server::new("a".into(), 1, addr(), 1, false);
        s.take_conn();
        s.take_conn();
        s.drop_conn();
        s.take_conn();
        assert_eq!(s.served, 2);
        assert_eq!(s.counters.max_served, 2);
        s.drop_conn();
        s.drop_conn();
        s.drop_conn(); // saturates at zero
        assert_eq!(s.served, 0);
    }
}
