//! Frontends, backends and the registry tying them together.

pub mod listener;
pub mod server;

use crate::config::{BalanceCfg, CheckCfg, Config, ConfigError, FeTimeouts, GlobalCfg};
use crate::config::{BackendOptions, BeTimeouts};
use crate::error::{Error, ErrorKind, Result};
use crate::freq::FreqCtr;
use crate::lb::{self, ChashState, FwlcState, FwrrState, LbAlgo, LbParams};
use crate::rules::{Rule, RuleSet, SwitchRule};
use crate::session::{ErrClass, FinState};
use crate::ticks::Tick;
use listener::Listener;
use server::{Server, SrvState, BE_WEIGHT_SCALE};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

/// How many terminated-in-error sessions a frontend keeps for diagnosis.
const ERR_SNAPSHOTS: usize = 4;

/// Per-frontend counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct FeCounters {
    /// Connections ever accepted.
    pub cum_conn: u64,
    /// Connections denied by layer-4 rules or admission limits.
    pub denied_conn: u64,
    /// Requests denied by content rules.
    pub denied_req: u64,
    /// Sessions that ended before reaching the connect stage.
    pub failed_req: u64,
}

/// Per-backend counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct BeCounters {
    /// Sessions ever assigned to this backend.
    pub cum_conn: u64,
    /// Requests denied by content rules.
    pub denied_req: u64,
    /// Responses denied by content rules.
    pub denied_resp: u64,
    /// Connection attempts that failed for good.
    pub failed_conns: u64,
    /// Connect retries performed.
    pub retries: u64,
    /// Sessions moved to another server after retries ran out.
    pub redispatches: u64,
}

/// A captured summary of a session that died in error.
#[derive(Debug, Clone)]
pub struct ErrSnapshot {
    /// When it died.
    pub when: Tick,
    /// Error class.
    pub err: ErrClass,
    /// Final session stage.
    pub finst: FinState,
    /// Client address.
    pub peer: SocketAddr,
    /// Leading bytes of the request buffer at death.
    pub capture: Vec<u8>,
}

/// What a hash-balanced backend hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashOn {
    /// Rotation disciplines: nothing to hash.
    None,
    /// Client source address.
    Src,
    /// Request-line URI bytes.
    Uri,
    /// A URL parameter value.
    UrlParam(String),
    /// A header value.
    Hdr(String),
}

/// The proxy side accepting client connections.
#[derive(Debug)]
pub struct Frontend {
    /// Unique name.
    pub name: String,
    /// Concurrent-session cap.
    pub maxconn: u32,
    /// Sessions currently attached.
    pub feconn: u32,
    /// Sessions-per-second admission limit.
    pub rate_limit: Option<u32>,
    /// Session rate over the trailing second.
    pub sess_rate: FreqCtr,
    /// Backend used when no switching rule matches.
    pub default_backend: Option<usize>,
    /// Frontend timeouts.
    pub timeouts: FeTimeouts,
    /// Layer-4 rules evaluated at accept time.
    pub l4_rules: RuleSet,
    /// Layer-7 content rules.
    pub tcp_req: RuleSet,
    /// Backend switching rules.
    pub switching: Vec<SwitchRule>,
    /// Bound addresses.
    pub listeners: Vec<Listener>,
    /// Counters.
    pub counters: FeCounters,
    /// Set once a soft stop unbound the listeners.
    pub stopped: bool,
    /// Recent error captures.
    pub errors: VecDeque<ErrSnapshot>,
}

impl Frontend {
    /// Records an error capture, keeping only the most recent few.
    pub fn capture_error(&mut self, snap: ErrSnapshot) {
        if self.errors.len() == ERR_SNAPSHOTS {
            self.errors.pop_front();
        }
        self.errors.push_back(snap);
    }
}

/// A pool of servers plus its balancing discipline.
#[derive(Debug)]
pub struct Backend {
    /// Unique name.
    pub name: String,
    /// Member servers. Slots are append-only so indices stay stable.
    pub servers: Vec<Server>,
    /// Balancer parameters and discipline state.
    pub lbprm: LbParams,
    /// Usable non-backup servers.
    pub srv_act: u32,
    /// Usable backup servers.
    pub srv_bck: u32,
    /// Sessions currently assigned to this backend.
    pub beconn: u32,
    /// Load threshold for the dynamic-maxconn ramp; 0 disables it.
    pub fullconn: u32,
    /// Connect retries per session.
    pub retries: u32,
    /// Backend timeouts.
    pub timeouts: BeTimeouts,
    /// Behavioural options.
    pub options: BackendOptions,
    /// Sessions queued without an assigned server, FIFO.
    pub pend: VecDeque<usize>,
    /// Layer-7 content rules evaluated after assignment.
    pub tcp_req: RuleSet,
    /// Content rules evaluated on the response stream.
    pub tcp_rep: RuleSet,
    /// What hash-based balancing hashes.
    pub hash_on: HashOn,
    /// Counters.
    pub counters: BeCounters,
}

/// Request accepted by `pool.add`.
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddServerReq {
    /// Target backend name.
    pub backend: String,
    /// Server name, unique within the backend.
    pub name: String,
    /// Endpoint address.
    pub addr: SocketAddr,
    /// User weight.
    #[serde(default = "default_add_weight")]
    pub weight: u32,
    /// Connection cap; 0 unlimited.
    #[serde(default)]
    pub maxconn: u32,
    /// Queue cap; 0 unlimited.
    #[serde(default)]
    pub maxqueue: u32,
    /// Join the backup partition.
    #[serde(default)]
    pub backup: bool,
    /// Start in maintenance.
    #[serde(default)]
    pub disabled: bool,
    /// Health-check settings for the external prober.
    #[serde(default)]
    pub check: CheckCfg,
}

fn default_add_weight() -> u32 {
    1
}

/// All configured proxies of one worker.
#[derive(Debug)]
pub struct Registry {
    /// Process-wide settings.
    pub global: GlobalCfg,
    /// Frontends.
    pub frontends: Vec<Frontend>,
    /// Backends.
    pub backends: Vec<Backend>,
    next_uuid: u32,
}

impl Registry {
    /// Builds the runtime model from a validated configuration.
    pub fn build(cfg: &Config) -> std::result::Result<Self, ConfigError> {
        let be_index: HashMap<&str, usize> = cfg
            .backends
            .iter()
            .enumerate()
            .map(|(i, b)| (b.name.as_str(), i))
            .collect();

        let mut next_uuid = 1;
        let mut backends = Vec::with_capacity(cfg.backends.len());
        for bc in &cfg.backends {
            let (algo, hash_on) = match &bc.balance {
                BalanceCfg::Roundrobin => (LbAlgo::Fwrr(FwrrState::default()), HashOn::None),
                BalanceCfg::Leastconn => (LbAlgo::Fwlc(FwlcState::default()), HashOn::None),
                BalanceCfg::Source => (LbAlgo::Chash(ChashState::default()), HashOn::Src),
                BalanceCfg::Uri => (LbAlgo::Chash(ChashState::default()), HashOn::Uri),
                BalanceCfg::UrlParam { name } => (
                    LbAlgo::Chash(ChashState::default()),
                    HashOn::UrlParam(name.clone()),
                ),
                BalanceCfg::Hdr { name } => (
                    LbAlgo::Chash(ChashState::default()),
                    HashOn::Hdr(name.clone()),
                ),
            };
            let mut servers = Vec::with_capacity(bc.servers.len());
            for sc in &bc.servers {
                let mut srv = Server::new(sc.name.clone(), next_uuid, sc.addr, sc.weight, sc.backup);
                next_uuid += 1;
                srv.maxconn = sc.maxconn;
                srv.maxqueue = sc.maxqueue;
                srv.check = sc.check.clone();
                if sc.disabled {
                    srv.state.clear(SrvState::RUNNING);
                    srv.state.set(SrvState::MAINT);
                    srv.prev_state = srv.state;
                }
                servers.push(srv);
            }
            let mut be = Backend {
                name: bc.name.clone(),
                servers,
                lbprm: LbParams {
                    algo,
                    tot_wact: 0,
                    tot_wbck: 0,
                    tot_weight: 0,
                    tot_used: 0,
                    wdiv: BE_WEIGHT_SCALE,
                    fbck: None,
                },
                srv_act: 0,
                srv_bck: 0,
                beconn: 0,
                fullconn: bc.fullconn,
                retries: bc.retries,
                timeouts: bc.timeouts.clone(),
                options: bc.options,
                pend: VecDeque::new(),
                tcp_req: RuleSet::compile(&bc.tcp_request_content),
                tcp_rep: RuleSet::compile(&bc.tcp_response_content),
                hash_on,
                counters: BeCounters::default(),
            };
            lb::init(&mut be);
            backends.push(be);
        }

        let mut frontends = Vec::with_capacity(cfg.frontends.len());
        for fc in &cfg.frontends {
            let switching = fc
                .switching
                .iter()
                .map(|r| SwitchRule::compile(r, be_index[r.backend.as_str()]))
                .collect();
            frontends.push(Frontend {
                name: fc.name.clone(),
                maxconn: fc.maxconn,
                feconn: 0,
                rate_limit: fc.rate_limit_sessions,
                sess_rate: FreqCtr::new(),
                default_backend: fc.default_backend.as_deref().map(|n| be_index[n]),
                timeouts: fc.timeouts.clone(),
                l4_rules: RuleSet {
                    inspect_delay: None,
                    rules: fc.tcp_request_connection.iter().map(Rule::compile).collect(),
                },
                tcp_req: RuleSet::compile(&fc.tcp_request_content),
                switching,
                listeners: fc
                    .listeners
                    .iter()
                    .map(|l| Listener::new(l.addr, l.backlog))
                    .collect(),
                counters: FeCounters::default(),
                stopped: false,
                errors: VecDeque::new(),
            });
        }

        Ok(Self {
            global: cfg.global.clone(),
            frontends,
            backends,
            next_uuid,
        })
    }

    /// Finds a backend by name.
    pub fn backend_by_name(&self, name: &str) -> Result<usize> {
        self.backends
            .iter()
            .position(|b| b.name == name)
            .ok_or_else(|| {
                Error::new(ErrorKind::Admin).with_context(format!("unknown backend {name:?}"))
            })
    }

    /// Finds a server by name within a backend.
    pub fn server_by_name(&self, be: usize, name: &str) -> Result<usize> {
        self.backends[be]
            .servers
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| {
                Error::new(ErrorKind::Admin).with_context(format!("unknown server {name:?}"))
            })
    }

    /// Adds a server to a running backend and puts it in rotation unless
    /// disabled. Returns its indices.
    pub fn add_server(&mut self, req: &AddServerReq) -> Result<(usize, usize)> {
        let be_id = self.backend_by_name(&req.backend)?;
        let be = &mut self.backends[be_id];
        if be.servers.iter().any(|s| s.name == req.name) {
            return Err(Error::new(ErrorKind::Admin)
                .with_context(format!("server {:?} already exists", req.name)));
        }
        let mut srv = Server::new(
            req.name.clone(),
            self.next_uuid,
            req.addr,
            req.weight.min(255),
            req.backup,
        );
        self.next_uuid += 1;
        srv.maxconn = req.maxconn;
        srv.maxqueue = req.maxqueue;
        srv.check = req.check.clone();
        if req.disabled {
            srv.state.clear(SrvState::RUNNING);
            srv.state.set(SrvState::MAINT);
        }
        // snapshot "not usable" so the up transition below is detected
        srv.prev_state = srv.state;
        srv.prev_state.clear(SrvState::RUNNING);
        srv.prev_eweight = 0;
        be.servers.push(srv);
        let srv_id = be.servers.len() - 1;
        lb::server_added(be, srv_id);
        lb::set_server_status_up(be, srv_id);
        tracing::info!(backend = %req.backend, server = %req.name, "server added");
        Ok((be_id, srv_id))
    }

    /// Puts a server into maintenance. Returns the sessions that were
    /// waiting on it and must be rebalanced by the caller.
    pub fn disable_server(&mut self, be_id: usize, srv_id: usize) -> Vec<usize> {
        let be = &mut self.backends[be_id];
        let srv = &mut be.servers[srv_id];
        srv.state.clear(SrvState::RUNNING);
        srv.state.set(SrvState::MAINT);
        lb::set_server_status_down(be, srv_id);
        let orphans: Vec<usize> = be.servers[srv_id].pend.drain(..).collect();
        tracing::info!(backend = %be.name, server = %be.servers[srv_id].name, "server disabled");
        orphans
    }

    /// Takes a server out of maintenance.
    pub fn enable_server(&mut self, be_id: usize, srv_id: usize) {
        let be = &mut self.backends[be_id];
        let srv = &mut be.servers[srv_id];
        srv.state.clear(SrvState::MAINT);
        srv.state.set(SrvState::RUNNING);
        lb::set_server_status_up(be, srv_id);
        tracing::info!(backend = %be.name, server = %be.servers[srv_id].name, "server enabled");
    }

    /// Re-weights a server.
    pub fn set_server_weight(&mut self, be_id: usize, srv_id: usize, weight: u32) {
        let be = &mut self.backends[be_id];
        let srv = &mut be.servers[srv_id];
        srv.uweight = weight.min(255);
        srv.eweight = srv.uweight * BE_WEIGHT_SCALE;
        lb::update_server_weight(be, srv_id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a round-robin backend with the given `(name, weight)` servers
    /// for unit tests across the crate.
    pub(crate) fn backend_with_servers(specs: &[(&str, u32)]) -> Backend {
        backend_with(specs, &[], BalanceCfg::Roundrobin)
    }

    /// Same, with explicit backup servers and discipline.
    pub(crate) fn backend_with(
        active: &[(&str, u32)],
        backup: &[(&str, u32)],
        balance: BalanceCfg,
    ) -> Backend {
        let mk = |(i, (name, weight)): (usize, &(&str, u32)), is_bck: bool| {
            let off: usize = if is_bck { 1000 } else { 0 };
            let addr: SocketAddr = format!("127.0.0.1:{}", 9000 + off + i)
                .parse()
                .unwrap();
            crate::config::ServerCfg {
                name: (*name).to_string(),
                addr,
                weight: *weight,
                maxconn: 0,
                maxqueue: 0,
                backup: is_bck,
                disabled: false,
                check: CheckCfg::default(),
            }
        };
        let servers: Vec<_> = active
            .iter()
            .enumerate()
            .map(|e| mk(e, false))
            .chain(backup.iter().enumerate().map(|e| mk(e, true)))
            .collect();
        let cfg = Config {
            global: GlobalCfg::default(),
            frontends: vec![],
            backends: vec![crate::config::BackendCfg {
                name: "test".into(),
                balance,
                servers,
                fullconn: 0,
                retries: 3,
                timeouts: BeTimeouts::default(),
                options: BackendOptions::default(),
                tcp_request_content: crate::config::RulesCfg::default(),
                tcp_response_content: crate::config::RulesCfg::default(),
            }],
        };
        let mut reg = Registry::build(&cfg).expect("registry");
        reg.backends.remove(0)
    }

    #[test]
    fn build_resolves_backend_references() {
        let cfg = Config::from_json(
            r#"{
              "frontends": [{
                "name": "fe", "listeners": [{"addr": "127.0.0.1:0"}],
                "default_backend": "b2",
                "switching": [{"backend": "b1", "cond": {"payload_len": {"n": 1}}}]
              }],
              "backends": [
                {"name": "b1", "servers": [{"name": "s", "addr": "127.0.0.1:1"}]},
                {"name": "b2", "servers": []}
              ]
            }"#,
        )
        .unwrap();
        let reg = Registry::build(&cfg).unwrap();
        assert_eq!(reg.frontends[0].default_backend, Some(1));
        assert_eq!(reg.frontends[0].switching[0].backend, 0);
    }

    #[test]
    fn add_server_joins_rotation() {
        let be = backend_with_servers(&[("a", 1)]);
        let mut reg = Registry {
            global: GlobalCfg::default(),
            frontends: vec![],
            backends: vec![be],
            next_uuid: 100,
        };
        let req: AddServerReq = serde_json::from_str(
            r#"{"backend": "test", "name": "late", "addr": "127.0.0.1:9100", "weight": 2}"#,
        )
        .unwrap();
        let (be_id, srv_id) = reg.add_server(&req).unwrap();
        assert_eq!((be_id, srv_id), (0, 1));
        let be = &reg.backends[0];
        assert_eq!(be.srv_act, 2);
        assert_eq!(be.servers[1].eweight, 2 * BE_WEIGHT_SCALE);
        assert!(lb::pick_server(&mut reg.backends[0], None).is_some());
    }

    #[test]
    fn add_duplicate_server_fails() {
        let be = backend_with_servers(&[("a", 1)]);
        let mut reg = Registry {
            global: GlobalCfg::default(),
            frontends: vec![],
            backends: vec![be],
            next_uuid: 100,
        };
        let req: AddServerReq = serde_json::from_str(
            r#"{"backend": "test", "name": "a", "addr": "127.0.0.1:9100"}"#,
        )
        .unwrap();
        assert!(reg.add_server(&req).is_err());
    }

    #[test]
    fn disable_drains_pending_sessions() {
        let be = backend_with_servers(&[("a", 1), ("b", 1)]);
        let mut reg = Registry {
            global: GlobalCfg::default(),
            frontends: vec![],
            backends: vec![be],
            next_uuid: 100,
        };
        reg.backends[0].servers[0].pend.push_back(42);
        let orphans = reg.disable_server(0, 0);
        assert_eq!(orphans, vec![42]);
        assert_eq!(reg.backends[0].srv_act, 1);
        reg.enable_server(0, 0);
        assert_eq!(reg.backends[0].srv_act, 2);
    }
}
