//! Configuration model.
//!
//! The worker consumes an already-structured configuration: a JSON document
//! deserialized into the types below, then validated and normalized. There
//! is no configuration *language* here; translating from any richer format
//! is the front-end tooling's problem.

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

/// Errors produced while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The document is not valid JSON or does not match the schema.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// The document parsed but is semantically invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_bufsize() -> usize {
    8192
}
fn default_maxconn() -> u32 {
    2000
}
fn default_weight() -> u32 {
    1
}
fn default_retries() -> u32 {
    3
}

/// Process-wide settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalCfg {
    /// Grace period granted to running sessions on soft stop, in ms.
    #[serde(default)]
    pub grace: u32,
    /// Unix socket path for the admin applet, if enabled.
    #[serde(default)]
    pub admin_socket: Option<PathBuf>,
    /// Session buffer capacity in bytes.
    #[serde(default = "default_bufsize")]
    pub bufsize: usize,
    /// Hard cap on concurrent sessions for the worker.
    #[serde(default = "default_maxconn")]
    pub maxconn: u32,
}

impl Default for GlobalCfg {
    fn default() -> Self {
        Self {
            grace: 0,
            admin_socket: None,
            bufsize: default_bufsize(),
            maxconn: default_maxconn(),
        }
    }
}

/// Frontend-side timeouts, in milliseconds. Absent means unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeTimeouts {
    /// Client inactivity timeout.
    pub client: Option<u32>,
    /// Maximum time to receive a complete request.
    pub http_request: Option<u32>,
    /// Keep-alive idle timeout between requests.
    pub http_keep_alive: Option<u32>,
}

/// Backend-side timeouts, in milliseconds. Absent means unlimited.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BeTimeouts {
    /// Time allowed for a connect() to succeed.
    pub connect: Option<u32>,
    /// Server inactivity timeout.
    pub server: Option<u32>,
    /// Maximum time spent waiting in a pending queue.
    pub queue: Option<u32>,
    /// Duration of the tarpit hold.
    pub tarpit: Option<u32>,
    /// Interval for external health probes (carried for the prober).
    pub check: Option<u32>,
}

/// A condition a rule may test.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CondCfg {
    /// Client source address belongs to `addr/prefix_len`.
    SrcIp {
        /// Network address.
        addr: IpAddr,
        /// Prefix length in bits.
        prefix: u8,
    },
    /// Client source port within the inclusive range.
    SrcPort {
        /// Lowest accepted port.
        lo: u16,
        /// Highest accepted port.
        hi: u16,
    },
    /// At least `n` request payload bytes are buffered.
    PayloadLen {
        /// Minimum byte count.
        n: usize,
    },
    /// At least `n` request bytes have arrived, whatever they are.
    ReqLen {
        /// Minimum byte count.
        n: usize,
    },
    /// The request payload begins with the given bytes.
    PayloadStartsWith {
        /// Expected prefix (UTF-8 text).
        prefix: String,
    },
    /// The buffered request payload contains the given bytes.
    PayloadContains {
        /// Needle (UTF-8 text).
        needle: String,
    },
    /// Matches unconditionally.
    Always,
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleActionCfg {
    /// Stop evaluating and let the session continue.
    Accept,
    /// Kill the session.
    Reject,
}

/// One inspection rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleCfg {
    /// Action taken when the condition holds.
    pub action: RuleActionCfg,
    /// Condition; a rule without one always matches.
    #[serde(default)]
    pub cond: Option<CondCfg>,
    /// Invert the condition.
    #[serde(default)]
    pub unless: bool,
}

/// Content-inspection rule list with its optional delay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RulesCfg {
    /// How long to wait for enough data before giving up on MISSes, ms.
    #[serde(default)]
    pub inspect_delay: Option<u32>,
    /// Rules in evaluation order.
    #[serde(default)]
    pub rules: Vec<RuleCfg>,
}

/// A backend-switching rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SwitchRuleCfg {
    /// Target backend name.
    pub backend: String,
    /// Condition; absent means always.
    #[serde(default)]
    pub cond: Option<CondCfg>,
    /// Invert the condition.
    #[serde(default)]
    pub unless: bool,
}

/// One bound address of a frontend.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerCfg {
    /// Address to bind.
    pub addr: SocketAddr,
    /// Listen backlog.
    #[serde(default)]
    pub backlog: Option<i32>,
}

/// A frontend: accepts client connections.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrontendCfg {
    /// Unique name.
    pub name: String,
    /// Bound addresses.
    pub listeners: Vec<ListenerCfg>,
    /// Concurrent-session cap for this frontend.
    #[serde(default = "default_maxconn")]
    pub maxconn: u32,
    /// Sessions-per-second admission limit.
    #[serde(default)]
    pub rate_limit_sessions: Option<u32>,
    /// Backend used when no switching rule matches.
    #[serde(default)]
    pub default_backend: Option<String>,
    /// Frontend timeouts.
    #[serde(default)]
    pub timeouts: FeTimeouts,
    /// Layer-4 rules evaluated at accept time.
    #[serde(default)]
    pub tcp_request_connection: Vec<RuleCfg>,
    /// Layer-7 content rules with inspect delay.
    #[serde(default)]
    pub tcp_request_content: RulesCfg,
    /// Backend switching rules, evaluated in order.
    #[serde(default)]
    pub switching: Vec<SwitchRuleCfg>,
}

/// Load-balancing discipline of a backend.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BalanceCfg {
    /// Fast weighted round-robin.
    Roundrobin,
    /// Fast weighted least-connections.
    Leastconn,
    /// Consistent hash of the client source address.
    Source,
    /// Consistent hash of the request URI bytes.
    Uri,
    /// Consistent hash of a URL parameter value.
    UrlParam {
        /// Parameter name.
        name: String,
    },
    /// Consistent hash of a header value.
    Hdr {
        /// Header name.
        name: String,
    },
}

impl Default for BalanceCfg {
    fn default() -> Self {
        Self::Roundrobin
    }
}

/// Optional health-check settings carried for an external prober.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckCfg {
    /// Whether probing is requested at all.
    #[serde(default)]
    pub enabled: bool,
    /// Probe address override.
    #[serde(default)]
    pub addr: Option<IpAddr>,
    /// Probe port override.
    #[serde(default)]
    pub port: Option<u16>,
    /// Interval between probes, ms.
    #[serde(default)]
    pub inter: Option<u32>,
    /// Consecutive successes before marking up.
    #[serde(default)]
    pub rise: Option<u32>,
    /// Consecutive failures before marking down.
    #[serde(default)]
    pub fall: Option<u32>,
}

/// One server inside a backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerCfg {
    /// Unique name within the backend.
    pub name: String,
    /// Network endpoint.
    pub addr: SocketAddr,
    /// User weight, 0..=255. Zero excludes the server from balancing.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Concurrent-connection cap; 0 means unlimited.
    #[serde(default)]
    pub maxconn: u32,
    /// Pending-queue cap; 0 means unlimited.
    #[serde(default)]
    pub maxqueue: u32,
    /// Backup servers only receive traffic when no active server is usable.
    #[serde(default)]
    pub backup: bool,
    /// Start in maintenance.
    #[serde(default)]
    pub disabled: bool,
    /// Health-check settings for the external prober.
    #[serde(default)]
    pub check: CheckCfg,
}

/// Behavioural options of a backend.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendOptions {
    /// Allow the last connect retry to pick a different server.
    #[serde(default)]
    pub redispatch: bool,
    /// Abort queued/connecting sessions as soon as the client goes away.
    #[serde(default)]
    pub abortonclose: bool,
    /// Do not refresh the read timeout on write activity.
    #[serde(default)]
    pub independent_streams: bool,
    /// Disable Nagle on server connections and push writes eagerly.
    #[serde(default)]
    pub tcp_nodelay: bool,
    /// Reset connections on close instead of lingering through the
    /// normal FIN handshake.
    #[serde(default)]
    pub nolinger: bool,
    /// Use every usable backup server instead of the first one only.
    #[serde(default)]
    pub use_all_backups: bool,
}

/// A backend: a pool of servers plus a balancing discipline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendCfg {
    /// Unique name.
    pub name: String,
    /// Balancing discipline.
    #[serde(default)]
    pub balance: BalanceCfg,
    /// Member servers.
    #[serde(default)]
    pub servers: Vec<ServerCfg>,
    /// Load threshold for the dynamic-maxconn ramp; 0 disables it.
    #[serde(default)]
    pub fullconn: u32,
    /// Connect retries before giving up on a session.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Backend timeouts.
    #[serde(default)]
    pub timeouts: BeTimeouts,
    /// Behavioural options.
    #[serde(default)]
    pub options: BackendOptions,
    /// Layer-7 content rules evaluated after backend assignment.
    #[serde(default)]
    pub tcp_request_content: RulesCfg,
    /// Content rules evaluated on the server's response.
    #[serde(default)]
    pub tcp_response_content: RulesCfg,
}

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Process-wide settings.
    #[serde(default)]
    pub global: GlobalCfg,
    /// Frontends.
    #[serde(default)]
    pub frontends: Vec<FrontendCfg>,
    /// Backends.
    #[serde(default)]
    pub backends: Vec<BackendCfg>,
}

impl Config {
    /// Loads and validates a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: Self = serde_json::from_str(&text)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a configuration from a JSON string (used by tests).
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: Self = serde_json::from_str(text)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Clamps out-of-range values to safe ones.
    pub fn normalize(&mut self) {
        if self.global.bufsize == 0 {
            self.global.bufsize = default_bufsize();
        }
        for be in &mut self.backends {
            for srv in &mut be.servers {
                if srv.weight > 255 {
                    srv.weight = 255;
                }
            }
        }
    }

    /// Cross-checks references and uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut be_names = std::collections::HashSet::new();
        for be in &self.backends {
            if !be_names.insert(be.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate backend {:?}",
                    be.name
                )));
            }
            let mut srv_names = std::collections::HashSet::new();
            for srv in &be.servers {
                if !srv_names.insert(srv.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate server {:?} in backend {:?}",
                        srv.name, be.name
                    )));
                }
            }
        }
        let mut fe_names = std::collections::HashSet::new();
        for fe in &self.frontends {
            if !fe_names.insert(fe.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate frontend {:?}",
                    fe.name
                )));
            }
            if fe.listeners.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "frontend {:?} has no listener",
                    fe.name
                )));
            }
            for name in fe
                .default_backend
                .iter()
                .chain(fe.switching.iter().map(|r| &r.backend))
            {
                if !be_names.contains(name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "frontend {:?} references unknown backend {name:?}",
                        fe.name
                    )));
                }
            }
        }
        Ok(())
    }
}
