//! Fast weighted least-connections.
//!
//! One tree per partition, keyed on `served × SRV_EWGHT_MAX / eweight` so
//! the leftmost node is always the least-loaded server relative to its
//! weight. The session layer reports every connection grant and release
//! through the take/drop hooks, which simply re-key the server.

use super::{
    commit_transition, first_usable_backup, srv_is_full, transition_is_noop,
    update_backend_weight, was_usable, LbAlgo, NodeKey, Tree,
};
use crate::proxy::server::{Server, SrvState, SRV_EWGHT_MAX};
use crate::proxy::Backend;

/// Which partition tree a server sits in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum FwlcLoc {
    /// Not queued (down).
    #[default]
    None,
    /// Active partition.
    Act,
    /// Backup partition.
    Bck,
}

/// Least-connections state of one backend.
#[derive(Debug, Default)]
pub struct FwlcState {
    act: Tree,
    bck: Tree,
    node: Vec<Option<NodeKey>>,
    loc: Vec<FwlcLoc>,
}

impl FwlcState {
    /// Grows the per-server bookkeeping after a runtime `pool.add`.
    pub fn server_added(&mut self) {
        self.node.push(None);
        self.loc.push(FwlcLoc::None);
    }
}

fn key_of(s: &Server) -> u32 {
    (u64::from(s.served) * u64::from(SRV_EWGHT_MAX) / u64::from(s.eweight)) as u32
}

fn queue_srv(st: &mut FwlcState, s: &Server, sid: usize, loc: FwlcLoc) {
    let tree = match loc {
        FwlcLoc::Act => &mut st.act,
        FwlcLoc::Bck => &mut st.bck,
        FwlcLoc::None => return,
    };
    st.node[sid] = Some(tree.insert(key_of(s), sid));
    st.loc[sid] = loc;
}

fn dequeue_srv(st: &mut FwlcState, sid: usize) {
    if let Some(node) = st.node[sid].take() {
        match st.loc[sid] {
            FwlcLoc::Act => {
                st.act.remove(node);
            }
            FwlcLoc::Bck => {
                st.bck.remove(node);
            }
            FwlcLoc::None => {}
        }
    }
}

/// Builds both partition trees from the backend's current servers.
pub fn init(be: &mut Backend) {
    let Backend { servers, lbprm, .. } = be;
    let LbAlgo::Fwlc(st) = &mut lbprm.algo else {
        return;
    };
    st.act = Tree::default();
    st.bck = Tree::default();
    st.node = vec![None; servers.len()];
    st.loc = vec![FwlcLoc::None; servers.len()];
    for (sid, s) in servers.iter().enumerate() {
        if !s.usable() {
            continue;
        }
        let loc = if s.state.has(SrvState::BACKUP) {
            FwlcLoc::Bck
        } else {
            FwlcLoc::Act
        };
        queue_srv(st, s, sid, loc);
    }
}

/// Re-keys a server after its connection count changed.
pub fn srv_reposition(be: &mut Backend, sid: usize) {
    let Backend { servers, lbprm, .. } = be;
    let LbAlgo::Fwlc(st) = &mut lbprm.algo else {
        return;
    };
    if st.node[sid].is_none() {
        // not in a tree: taken out by a failed health check meanwhile
        return;
    }
    let loc = st.loc[sid];
    dequeue_srv(st, sid);
    queue_srv(st, &servers[sid], sid, loc);
}

/// Walks the tree leftmost-first, skipping saturated servers; the first
/// eligible one wins. `avoid` is only returned when nothing else fits.
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
    let LbAlgo::Fwlc(st) = &mut lbprm.algo else {
        return None;
    };
    let tree = if *srv_act > 0 {
        &st.act
    } else if let Some(f) = lbprm.fbck {
        return Some(f);
    } else if *srv_bck > 0 {
        &st.bck
    } else {
        return None;
    };

    let mut avoided = None;
    let mut cursor = tree.first();
    while let Some((node, sid)) = cursor {
        if !srv_is_full(&servers[sid], *beconn, *fullconn) {
            if avoid != Some(sid) {
                return Some(sid);
            }
            avoided = Some(sid);
        }
        cursor = tree.next(node);
    }
    avoided
}

/// Applies a transition towards "down".
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
        let LbAlgo::Fwlc(st) = &mut lbprm.algo else {
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
        dequeue_srv(st, sid);
        st.loc[sid] = FwlcLoc::None;
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

/// Applies a transition towards "up".
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
        let LbAlgo::Fwlc(st) = &mut lbprm.algo else {
            return;
        };
        let loc = if servers[sid].state.has(SrvState::BACKUP) {
            lbprm.tot_wbck += servers[sid].eweight;
            *srv_bck += 1;
            if !options.use_all_backups {
                lbprm.fbck = first_usable_backup(servers);
            }
            FwlcLoc::Bck
        } else {
            lbprm.tot_wact += servers[sid].eweight;
            *srv_act += 1;
            FwlcLoc::Act
        };
        queue_srv(st, &servers[sid], sid, loc);
    }
    update_backend_weight(be);
    commit_transition(be, sid);
}

/// Applies an effective-weight change.
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
    let LbAlgo::Fwlc(st) = &mut lbprm.algo else {
        return;
    };
    dequeue_srv(st, sid);
    let loc = if servers[sid].state.has(SrvState::BACKUP) {
        lbprm.tot_wbck = lbprm.tot_wbck + servers[sid].eweight - servers[sid].prev_eweight;
        FwlcLoc::Bck
    } else {
        lbprm.tot_wact = lbprm.tot_wact + servers[sid].eweight - servers[sid].prev_eweight;
        FwlcLoc::Act
    };
    queue_srv(st, &servers[sid], sid, loc);
    update_backend_weight(be);
    commit_transition(be, sid);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BalanceCfg;
    use crate::lb;
    use crate::proxy::tests::backend_with;

    fn lc_backend(specs: &[(&str, u32)]) -> Backend {
        backend_with(specs, &[], BalanceCfg::Leastconn)
    }

    /// Checks P2: the chosen server minimises served × MAX / eweight.
    fn assert_minimal(be: &Backend, chosen: usize) {
        let chosen_key = key_of(&be.servers[chosen]);
        for s in be.servers.iter().filter(|s| s.usable()) {
            assert!(
                chosen_key <= key_of(s),
                "chosen key {chosen_key} > candidate {}",
                key_of(s)
            );
        }
    }

    #[test]
    fn picks_least_loaded_relative_to_weight() {
        let mut be = lc_backend(&[("a", 2), ("b", 1)]);
        be.servers[0].served = 3;
        be.servers[1].served = 1;
        lb::init(&mut be);
        // a: 3/2 relative load, b: 1/1: b wins
        let picked = lb::pick_server(&mut be, None).unwrap();
        assert_eq!(picked, 1);
        assert_minimal(&be, picked);
    }

    #[test]
    fn take_and_drop_repositions() {
        let mut be = lc_backend(&[("a", 1), ("b", 1)]);
        let first = lb::pick_server(&mut be, None).unwrap();
        be.servers[first].take_conn();
        lb::server_take_conn(&mut be, first);

        let second = lb::pick_server(&mut be, None).unwrap();
        assert_ne!(second, first, "loaded server must not win again");
        be.servers[second].take_conn();
        lb::server_take_conn(&mut be, second);

        be.servers[first].drop_conn();
        lb::server_drop_conn(&mut be, first);
        let third = lb::pick_server(&mut be, None).unwrap();
        assert_eq!(third, first);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut be = lc_backend(&[("a", 1), ("b", 1), ("c", 1)]);
        assert_eq!(lb::pick_server(&mut be, None), Some(0));
    }

    #[test]
    fn avoid_is_fallback_only() {
        let mut be = lc_backend(&[("a", 1), ("b", 1)]);
        assert_eq!(lb::pick_server(&mut be, Some(0)), Some(1));
        be.servers[1].state.clear(SrvState::RUNNING);
        lb::set_server_status_down(&mut be, 1);
        assert_eq!(lb::pick_server(&mut be, Some(0)), Some(0));
    }

    #[test]
    fn saturated_servers_are_skipped() {
        let mut be = lc_backend(&[("a", 1), ("b", 1)]);
        be.servers[0].maxconn = 1;
        be.servers[0].served = 1;
        lb::init(&mut be);
        assert_eq!(lb::pick_server(&mut be, None), Some(1));
    }

    #[test]
    fn down_then_up_rejoins_tree() {
        let mut be = lc_backend(&[("a", 1), ("b", 1)]);
        be.servers[0].state.clear(SrvState::RUNNING);
        lb::set_server_status_down(&mut be, 0);
        assert_eq!(lb::pick_server(&mut be, None), Some(1));
        be.servers[0].state.set(SrvState::RUNNING);
        lb::set_server_status_up(&mut be, 0);
        be.servers[1].served = 5;
        lb::server_take_conn(&mut be, 1);
        assert_eq!(lb::pick_server(&mut be, None), Some(0));
    }

    #[test]
    fn weight_change_rekeys() {
        let mut be = lc_backend(&[("a", 1), ("b", 1)]);
        be.servers[0].served = 2;
        be.servers[1].served = 2;
        lb::init(&mut be);
        // double a's weight: its relative load halves and it wins
        be.servers[0].uweight = 2;
        be.servers[0].eweight = 32;
        lb::update_server_weight(&mut be, 0);
        assert_eq!(lb::pick_server(&mut be, None), Some(0));
    }
}
