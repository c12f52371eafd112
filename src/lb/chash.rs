//! Consistent hashing.
//!
//! Every server owns `eweight` virtual nodes spread over a 32-bit ring by
//! an avalanche hash of its uuid, so a request key lands near the same
//! server for as long as that server is up, and losing a server only
//! moves the keys it owned. Weight changes add or remove that server's
//! nodes without touching anyone else's.
//!
//! Two lookups are provided: by request hash (sticky routing) and a
//! rotation walk with a persistent cursor for requests without a key.

use super::{
    commit_transition, first_usable_backup, srv_is_full, transition_is_noop,
    update_backend_weight, was_usable, LbAlgo, NodeKey, Tree,
};
use crate::proxy::server::{SrvState, SRV_EWGHT_RANGE};
use crate::proxy::Backend;

/// Bob Jenkins' 32-bit full-avalanche mix, spread by a large prime so
/// close inputs land far apart on the ring.
#[must_use]
pub fn full_hash(mut a: u32) -> u32 {
    a = a.wrapping_add(0x7ed5_5d16).wrapping_add(a << 12);
    a = (a ^ 0xc761_c23c) ^ (a >> 19);
    a = a.wrapping_add(0x1656_67b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2_646c) ^ (a << 9);
    a = a.wrapping_add(0xfd70_46c5).wrapping_add(a << 3);
    a = (a ^ 0xb55a_4f09) ^ (a >> 16);
    a.wrapping_mul(3_221_225_473)
}

/// Hashes arbitrary bytes onto the ring (URI, header or parameter keys).
#[must_use]
pub fn hash_bytes(data: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &b in data {
        h = h.wrapping_mul(31).wrapping_add(u32::from(b));
    }
    full_hash(h)
}

#[derive(Debug, Default, Clone)]
struct ChashSrv {
    /// Ring keys this server may occupy, one per effective weight unit.
    keys: Vec<u32>,
    /// Handles of the nodes currently inserted, a prefix of `keys`.
    nodes: Vec<NodeKey>,
    /// Whether the inserted nodes live in the backup tree.
    backup: bool,
}

/// Consistent-hash state of one backend.
#[derive(Debug, Default)]
pub struct ChashState {
    act: Tree,
    bck: Tree,
    srv: Vec<ChashSrv>,
    /// Rotation cursor of the keyless walk.
    last: Option<NodeKey>,
}

impl ChashState {
    /// Grows the per-server bookkeeping after a runtime `pool.add`.
    pub fn server_added(&mut self) {
        self.srv.push(ChashSrv::default());
    }
}

fn tree_of<'a>(st: &'a mut ChashState, backup: bool) -> &'a mut Tree {
    if backup {
        &mut st.bck
    } else {
        &mut st.act
    }
}

/// Entry after `node` with wrap-around; `None` when the tree would only
/// yield `node` itself again.
fn skip_node(tree: &Tree, node: NodeKey) -> Option<NodeKey> {
    let next = tree.next(node).or_else(|| tree.first());
    match next {
        Some((n, _)) if n != node => Some(n),
        _ => None,
    }
}

/// Adjusts the inserted node count of a server to its effective weight.
fn queue_dequeue_srv(st: &mut ChashState, sid: usize, target: u32) {
    let backup = st.srv[sid].backup;
    while st.srv[sid].nodes.len() as u32 > target {
        let Some(node) = st.srv[sid].nodes.pop() else {
            break;
        };
        if st.last == Some(node) {
            let next = skip_node(tree_of(st, backup), node);
            st.last = next;
        }
        tree_of(st, backup).remove(node);
    }
    while (st.srv[sid].nodes.len() as u32) < target {
        let i = st.srv[sid].nodes.len();
        if i >= st.srv[sid].keys.len() {
            break;
        }
        let key = st.srv[sid].keys[i];
        let node = tree_of(st, backup).insert(key, sid);
        st.srv[sid].nodes.push(node);
    }
}

/// Precomputes a server's ring keys and inserts it when usable.
fn install_srv(st: &mut ChashState, be_srv: &crate::proxy::server::Server, sid: usize) {
    let tot = be_srv.uweight * crate::proxy::server::BE_WEIGHT_SCALE;
    st.srv[sid] = ChashSrv {
        keys: (0..tot)
            .map(|i| full_hash(be_srv.uuid.wrapping_mul(SRV_EWGHT_RANGE).wrapping_add(i)))
            .collect(),
        nodes: Vec::new(),
        backup: be_srv.state.has(SrvState::BACKUP),
    };
    if be_srv.usable() {
        queue_dequeue_srv(st, sid, be_srv.eweight);
    }
}

/// Builds the ring from the backend's current servers.
pub fn init(be: &mut Backend) {
    let Backend { servers, lbprm, .. } = be;
    let LbAlgo::Chash(st) = &mut lbprm.algo else {
        return;
    };
    st.act = Tree::default();
    st.bck = Tree::default();
    st.last = None;
    st.srv = vec![ChashSrv::default(); servers.len()];
    for (sid, s) in servers.iter().enumerate() {
        install_srv(st, s, sid);
    }
}

/// Returns the server owning the ring position closest to `hash`.
pub fn get_server_hash(be: &mut Backend, hash: u32) -> Option<usize> {
    let Backend {
        lbprm,
        srv_act,
        srv_bck,
        ..
    } = be;
    let LbAlgo::Chash(st) = &mut lbprm.algo else {
        return None;
    };
    let root = if *srv_act > 0 {
        &st.act
    } else if let Some(f) = lbprm.fbck {
        return Some(f);
    } else if *srv_bck > 0 {
        &st.bck
    } else {
        return None;
    };

    let (next_node, next_srv) = root.lookup_ge(hash).or_else(|| root.first())?;
    let (prev_node, prev_srv) = root.prev(next_node).or_else(|| root.last())?;
    if next_srv == prev_srv {
        return Some(next_srv);
    }
    // wrap-aware distances to both neighbours; ties go to the lower key
    let dp = hash.wrapping_sub(prev_node.0);
    let dn = next_node.0.wrapping_sub(hash);
    Some(if dp <= dn { prev_srv } else { next_srv })
}

/// Rotation walk for keyless requests: resumes after the last pick and
/// skips saturated servers, remembering `avoid` as a fallback.
pub fn get_next_server(be: &mut Backend, avoid: Option<usize>) -> Option<usize> {
    let Backend {
        servers,
        lbprm,
        srv_act,
        srv_bck,
        beconn,
        fullconn,
        ..
    } = be;
    let LbAlgo::Chash(st) = &mut lbprm.algo else {
        return None;
    };
    let use_backup = if *srv_act > 0 {
        false
    } else if let Some(f) = lbprm.fbck {
        return Some(f);
    } else if *srv_bck > 0 {
        true
    } else {
        return None;
    };
    let root = if use_backup { &st.bck } else { &st.act };

    // one full turn of the ring at most, resuming after the last pick
    let mut node = st.last;
    let mut avoided = None;
    for _ in 0..=root.len() {
        let entry = match node {
            Some(n) => root.next(n).or_else(|| root.first()),
            None => root.first(),
        };
        let Some((n, sid)) = entry else {
            st.last = None;
            return None;
        };
        node = Some(n);
        st.last = node;
        if !srv_is_full(&servers[sid], *beconn, *fullconn) {
            if avoid != Some(sid) {
                return Some(sid);
            }
            avoided = Some(sid);
        }
    }
    avoided
}

/// Applies a transition towards "down": all the server's nodes leave the
/// ring, so only its keys move to neighbours.
pub fn set_server_status_down(be: &mut Backend, sid: usize) {
    if transition_is_noop(be, sid) {
        return;
    }
    if be.servers[sid].usable() {
        commit_transition(be, sid);
        return;
    }
    if was_usable(be, sid) {
        let Backend {
            servers,
            lbprm,
            srv_act,
            srv_bck,
            ..
        } = be;
        let LbAlgo::Chash(st) = &mut lbprm.algo else {
            return;
        };
        if servers[sid].state.has(SrvState::BACKUP) {
            lbprm.tot_wbck -= servers[sid].prev_eweight;
            *srv_bck -= 1;
            if lbprm.fbck == Some(sid) {
                lbprm.fbck = first_usable_backup(servers);
            }
        } else {
            lbprm.tot_wact -= servers[sid].prev_eweight;
            *srv_act -= 1;
        }
        queue_dequeue_srv(st, sid, 0);
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

/// Applies a transition towards "up": the server's nodes come back at
/// their original ring positions.
pub fn set_server_status_up(be: &mut Backend, sid: usize) {
    if transition_is_noop(be, sid) {
        return;
    }
    if !be.servers[sid].usable() {
        commit_transition(be, sid);
        return;
    }
    if !was_usable(be, sid) {
        let Backend {
            servers,
            lbprm,
            srv_act,
            srv_bck,
            options,
            ..
        } = be;
        let LbAlgo::Chash(st) = &mut lbprm.algo else {
            return;
        };
        if servers[sid].state.has(SrvState::BACKUP) {
            lbprm.tot_wbck += servers[sid].eweight;
            *srv_bck += 1;
            if !options.use_all_backups {
                lbprm.fbck = first_usable_backup(servers);
            }
        } else {
            lbprm.tot_wact += servers[sid].eweight;
            *srv_act += 1;
        }
        if st.srv[sid].keys.is_empty() {
            install_srv(st, &servers[sid], sid);
        } else {
            queue_dequeue_srv(st, sid, servers[sid].eweight);
        }
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

/// Applies an effective-weight change by adjusting the node count.
pub fn update_server_weight(be: &mut Backend, sid: usize) {
    if transition_is_noop(be, sid) {
        return;
    }
    let old = was_usable(be, sid);
    let new = be.servers[sid].usable();
    if !old && !new {
        commit_transition(be, sid);
        return;
    }
    if !old && new {
        set_server_status_up(be, sid);
        return;
    }
    if old && !new {
        set_server_status_down(be, sid);
        return;
    }

    let Backend { servers, lbprm, .. } = be;
    let LbAlgo::Chash(st) = &mut lbprm.algo else {
        return;
    };
    if servers[sid].eweight > st.srv[sid].keys.len() as u32 {
        // weight grew beyond the precomputed keys: pull every node out,
        // regenerate the key set (deterministic in the uuid) and reinsert
        queue_dequeue_srv(st, sid, 0);
        install_srv(st, &servers[sid], sid);
    }
    queue_dequeue_srv(st, sid, servers[sid].eweight);
    if servers[sid].state.has(SrvState::BACKUP) {
        lbprm.tot_wbck = lbprm.tot_wbck + servers[sid].eweight - servers[sid].prev_eweight;
    } else {
        lbprm.tot_wact = lbprm.tot_wact + servers[sid].eweight - servers[sid].prev_eweight;
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalanceCfg;
    use crate::lb;
    use crate::proxy::tests::backend_with;

    fn ch_backend(specs: &[(&str, u32)]) -> Backend {
        backend_with(specs, &[], BalanceCfg::Source)
    }

    #[test]
    fn same_hash_same_server() {
        let mut be = ch_backend(&[("a", 1), ("b", 1), ("c", 1)]);
        for h in [0u32, 1234, 0xdead_beef, u32::MAX] {
            let first = lb::pick_server_hash(&mut be, h);
            for _ in 0..5 {
                assert_eq!(lb::pick_server_hash(&mut be, h), first);
            }
        }
    }

    #[test]
    fn losing_a_server_only_moves_its_keys() {
        let mut be = ch_backend(&[("a", 1), ("b", 1), ("c", 1)]);
        let hashes: Vec<u32> = (0..500u32).map(|i| full_hash(i)).collect();
        let before: Vec<usize> = hashes
            .iter()
            .map(|&h| lb::pick_server_hash(&mut be, h).unwrap())
            .collect();

        be.servers[1].state.clear(SrvState::RUNNING);
        lb::set_server_status_down(&mut be, 1);
        let after: Vec<usize> = hashes
            .iter()
            .map(|&h| lb::pick_server_hash(&mut be, h).unwrap())
            .collect();

        for (i, (&b, &a)) in before.iter().zip(after.iter()).enumerate() {
            assert_ne!(a, 1, "hash {i} routed to the downed server");
            if b != 1 {
                assert_eq!(a, b, "hash {i} moved although its server stayed up");
            }
        }
    }

    #[test]
    fn server_return_restores_mapping() {
        let mut be = ch_backend(&[("a", 1), ("b", 1), ("c", 1)]);
        let hashes: Vec<u32> = (0..200u32).map(|i| full_hash(i.wrapping_mul(7))).collect();
        let before: Vec<usize> = hashes
            .iter()
            .map(|&h| lb::pick_server_hash(&mut be, h).unwrap())
            .collect();
        be.servers[2].state.clear(SrvState::RUNNING);
        lb::set_server_status_down(&mut be, 2);
        be.servers[2].state.set(SrvState::RUNNING);
        lb::set_server_status_up(&mut be, 2);
        let after: Vec<usize> = hashes
            .iter()
            .map(|&h| lb::pick_server_hash(&mut be, h).unwrap())
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn weight_scales_key_share() {
        let mut be = ch_backend(&[("a", 4), ("b", 1)]);
        let mut counts = [0usize; 2];
        for i in 0..2000u32 {
            let sid = lb::pick_server_hash(&mut be, full_hash(i)).unwrap();
            counts[sid] += 1;
        }
        // a owns 4× the nodes: expect roughly 80% of keys, generously
        assert!(counts[0] > counts[1] * 2, "counts {counts:?}");
    }

    #[test]
    fn rotation_walk_covers_all_servers() {
        let mut be = ch_backend(&[("a", 1), ("b", 1), ("c", 1)]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(lb::pick_server(&mut be, None).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn rotation_walk_skips_saturated() {
        let mut be = ch_backend(&[("a", 1), ("b", 1)]);
        be.servers[0].maxconn = 1;
        be.servers[0].served = 1;
        for _ in 0..20 {
            assert_eq!(lb::pick_server(&mut be, None), Some(1));
        }
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let mut be = ch_backend(&[("a", 1)]);
        be.servers[0].state.clear(SrvState::RUNNING);
        lb::set_server_status_down(&mut be, 0);
        assert_eq!(lb::pick_server(&mut be, None), None);
        assert_eq!(lb::pick_server_hash(&mut be, 123), None);
    }
}
