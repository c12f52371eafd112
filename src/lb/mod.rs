//! Load-balancer core.
//!
//! Each backend carries one of three disciplines in [`LbAlgo`]; every
//! entry point dispatches on the variant with a single match. All three
//! keep their servers in ordered trees over two partitions (active,
//! backup) and share the weight bookkeeping below.
//!
//! Server state transitions are only ever applied between two scheduler
//! iterations, never during a selection, so none of this needs interior
//! mutability or locking.

pub mod chash;
pub mod fwlc;
pub mod fwrr;

use crate::proxy::server::{srv_is_usable, Server, SrvState};
use crate::proxy::Backend;
use std::collections::BTreeMap;

pub use chash::ChashState;
pub use fwlc::FwlcState;
pub use fwrr::FwrrState;

/// Position of a server node inside a [`Tree`].
pub type NodeKey = (u32, u64);

/// An ordered tree of `(key, server)` pairs.
///
/// Duplicate keys are allowed; an insertion sequence keeps them stable so
/// equal-key servers come out in insertion order, like the intrusive
/// radix trees this structure replaces.
#[derive(Debug, Default)]
pub struct Tree {
    map: BTreeMap<NodeKey, usize>,
    seq: u64,
}

impl Tree {
    /// Inserts a server under `key`, returning its node handle.
    pub fn insert(&mut self, key: u32, srv: usize) -> NodeKey {
        let node = (key, self.seq);
        self.seq += 1;
        self.map.insert(node, srv);
        node
    }

    /// Removes a node.
    pub fn remove(&mut self, node: NodeKey) -> Option<usize> {
        self.map.remove(&node)
    }

    /// Leftmost entry.
    #[must_use]
    pub fn first(&self) -> Option<(NodeKey, usize)> {
        self.map.iter().next().map(|(k, v)| (*k, *v))
    }

    /// Rightmost entry.
    #[must_use]
    pub fn last(&self) -> Option<(NodeKey, usize)> {
        self.map.iter().next_back().map(|(k, v)| (*k, *v))
    }

    /// First entry whose key is `>= key`.
    #[must_use]
    pub fn lookup_ge(&self, key: u32) -> Option<(NodeKey, usize)> {
        self.map.range((key, 0)..).next().map(|(k, v)| (*k, *v))
    }

    /// Entry strictly after `node`.
    #[must_use]
    pub fn next(&self, node: NodeKey) -> Option<(NodeKey, usize)> {
        self.map
            .range((node.0, node.1 + 1)..)
            .next()
            .map(|(k, v)| (*k, *v))
    }

    /// Entry strictly before `node`.
    #[must_use]
    pub fn prev(&self, node: NodeKey) -> Option<(NodeKey, usize)> {
        self.map.range(..node).next_back().map(|(k, v)| (*k, *v))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True when the tree holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Discipline-specific balancer state.
#[derive(Debug)]
pub enum LbAlgo {
    /// Fast weighted round-robin.
    Fwrr(FwrrState),
    /// Fast weighted least-connections.
    Fwlc(FwlcState),
    /// Consistent hashing.
    Chash(ChashState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LbKind {
    Fwrr,
    Fwlc,
    Chash,
}

impl LbAlgo {
    fn kind(&self) -> LbKind {
        match self {
            Self::Fwrr(_) => LbKind::Fwrr,
            Self::Fwlc(_) => LbKind::Fwlc,
            Self::Chash(_) => LbKind::Chash,
        }
    }
}

/// Balancer parameters shared by all disciplines of one backend.
#[derive(Debug)]
pub struct LbParams {
    /// Discipline state.
    pub algo: LbAlgo,
    /// Sum of effective weights of usable active servers.
    pub tot_wact: u32,
    /// Sum of effective weights of usable backup servers.
    pub tot_wbck: u32,
    /// Weight of the partition traffic currently goes to.
    pub tot_weight: u32,
    /// Usable servers in that partition.
    pub tot_used: u32,
    /// Divisor turning effective weights back into user weights.
    pub wdiv: u32,
    /// First usable backup server, when only one backup is used.
    pub fbck: Option<usize>,
}

/// Recounts usable servers and partition weights from scratch.
pub fn recount_servers(be: &mut Backend) {
    be.srv_act = 0;
    be.srv_bck = 0;
    be.lbprm.tot_wact = 0;
    be.lbprm.tot_wbck = 0;
    be.lbprm.fbck = None;
    for (i, srv) in be.servers.iter().enumerate() {
        if !srv.usable() {
            continue;
        }
        if srv.state.has(SrvState::BACKUP) {
            if be.srv_bck == 0 && !be.options.use_all_backups {
                be.lbprm.fbck = Some(i);
            }
            be.srv_bck += 1;
            be.lbprm.tot_wbck += srv.eweight;
        } else {
            be.srv_act += 1;
            be.lbprm.tot_wact += srv.eweight;
        }
    }
}

/// Refreshes the aggregate weight of the partition in use.
pub fn update_backend_weight(be: &mut Backend) {
    if be.srv_act > 0 {
        be.lbprm.tot_weight = be.lbprm.tot_wact;
        be.lbprm.tot_used = be.srv_act;
    } else if let Some(fbck) = be.lbprm.fbck {
        // only the first backup server is used
        be.lbprm.tot_weight = be.servers[fbck].eweight;
        be.lbprm.tot_used = 1;
    } else {
        be.lbprm.tot_weight = be.lbprm.tot_wbck;
        be.lbprm.tot_used = be.srv_bck;
    }
}

/// First usable backup server in declaration order.
pub(crate) fn first_usable_backup(servers: &[Server]) -> Option<usize> {
    servers
        .iter()
        .position(|s| s.state.has(SrvState::BACKUP) && s.usable())
}

/// True when the server cannot take one more connection right now.
pub(crate) fn srv_is_full(s: &Server, beconn: u32, fullconn: u32) -> bool {
    s.maxconn > 0
        && (s.nbpend() > 0 || s.served >= crate::queue::srv_dynamic_maxconn(s, beconn, fullconn))
}

/// Initializes the discipline's trees from the backend's current servers.
pub fn init(be: &mut Backend) {
    for srv in &mut be.servers {
        srv.eweight = srv.uweight * crate::proxy::server::BE_WEIGHT_SCALE;
        srv.prev_eweight = srv.eweight;
        srv.prev_state = srv.state;
    }
    recount_servers(be);
    update_backend_weight(be);
    match be.lbprm.algo.kind() {
        LbKind::Fwrr => fwrr::init(be),
        LbKind::Fwlc => fwlc::init(be),
        LbKind::Chash => chash::init(be),
    }
}

/// Selects a server for a request, skipping `avoid` when possible.
pub fn pick_server(be: &mut Backend, avoid: Option<usize>) -> Option<usize> {
    match be.lbprm.algo.kind() {
        LbKind::Fwrr => fwrr::get_next_server(be, avoid),
        LbKind::Fwlc => fwlc::get_next_server(be, avoid),
        LbKind::Chash => chash::get_next_server(be, avoid),
    }
}

/// Selects a server by hash key (hash-based disciplines only); falls back
/// to the rotation pick when the backend is not hash-balanced.
pub fn pick_server_hash(be: &mut Backend, hash: u32) -> Option<usize> {
    match be.lbprm.algo.kind() {
        LbKind::Chash => chash::get_server_hash(be, hash),
        LbKind::Fwrr | LbKind::Fwlc => pick_server(be, None),
    }
}

/// Applies a status change towards "down" for `srv`.
pub fn set_server_status_down(be: &mut Backend, srv: usize) {
    match be.lbprm.algo.kind() {
        LbKind::Fwrr => fwrr::set_server_status_down(be, srv),
        LbKind::Fwlc => fwlc::set_server_status_down(be, srv),
        LbKind::Chash => chash::set_server_status_down(be, srv),
    }
}

/// Applies a status change towards "up" for `srv`.
pub fn set_server_status_up(be: &mut Backend, srv: usize) {
    match be.lbprm.algo.kind() {
        LbKind::Fwrr => fwrr::set_server_status_up(be, srv),
        LbKind::Fwlc => fwlc::set_server_status_up(be, srv),
        LbKind::Chash => chash::set_server_status_up(be, srv),
    }
}

/// Applies an effective-weight update for `srv`.
pub fn update_server_weight(be: &mut Backend, srv: usize) {
    match be.lbprm.algo.kind() {
        LbKind::Fwrr => fwrr::update_server_weight(be, srv),
        LbKind::Fwlc => fwlc::update_server_weight(be, srv),
        LbKind::Chash => chash::update_server_weight(be, srv),
    }
}

/// Grows per-server bookkeeping after a runtime server addition. The new
/// slot joins a tree through the regular status-up transition.
pub fn server_added(be: &mut Backend, _srv: usize) {
    match &mut be.lbprm.algo {
        LbAlgo::Fwrr(st) => st.server_added(),
        LbAlgo::Fwlc(st) => st.server_added(),
        LbAlgo::Chash(st) => st.server_added(),
    }
}

/// Hook invoked after a connection was assigned to `srv`.
pub fn server_take_conn(be: &mut Backend, srv: usize) {
    if let LbKind::Fwlc = be.lbprm.algo.kind() {
        fwlc::srv_reposition(be, srv);
    }
}

/// Hook invoked after a connection left `srv`.
pub fn server_drop_conn(be: &mut Backend, srv: usize) {
    if let LbKind::Fwlc = be.lbprm.algo.kind() {
        fwlc::srv_reposition(be, srv);
    }
}

/// Shared tail of every status/weight transition: snapshot the applied
/// state so the next report can detect a no-op.
pub(crate) fn commit_transition(be: &mut Backend, srv: usize) {
    let s = &mut be.servers[srv];
    s.prev_state = s.state;
    s.prev_eweight = s.eweight;
}

/// True when the reported transition changes nothing the balancer sees.
pub(crate) fn transition_is_noop(be: &Backend, srv: usize) -> bool {
    let s = &be.servers[srv];
    s.state == s.prev_state && s.eweight == s.prev_eweight
}

/// Usability with the *previous* snapshot, for transition detection.
pub(crate) fn was_usable(be: &Backend, srv: usize) -> bool {
    let s = &be.servers[srv];
    srv_is_usable(s.prev_state, s.prev_eweight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_orders_and_keeps_duplicates_stable() {
        let mut t = Tree::default();
        t.insert(10, 0);
        t.insert(5, 1);
        t.insert(10, 2);
        assert_eq!(t.first().map(|(_, s)| s), Some(1));
        let (n1, s1) = t.lookup_ge(10).unwrap();
        assert_eq!(s1, 0); // first inserted of the equal keys
        assert_eq!(t.next(n1).map(|(_, s)| s), Some(2));
        t.remove(n1);
        assert_eq!(t.lookup_ge(10).map(|(_, s)| s), Some(2));
    }

    #[test]
    fn tree_prev_and_last() {
        let mut t = Tree::default();
        let a = t.insert(1, 0);
        let b = t.insert(2, 1);
        assert_eq!(t.last(), Some((b, 1)));
        assert_eq!(t.prev(b), Some((a, 0)));
        assert_eq!(t.prev(a), None);
    }
}
