//! TCP inspection and switching rules.
//!
//! Rules are evaluated in declaration order. Content matchers may find the
//! buffered bytes insufficient to decide; while partial evaluation is
//! allowed (inspect delay running, buffer neither closed nor full) such a
//! rule reports [`RuleVerdict::Missing`] and the whole evaluation suspends
//! until more data or the delay's expiry. Once partial evaluation is over,
//! an undecidable match counts as a non-match.
//!
//! A matching `accept` stops the list; a matching `reject` kills the
//! session; running off the end is an implicit accept.

use crate::config::{CondCfg, RuleActionCfg, RuleCfg, RulesCfg, SwitchRuleCfg};
use std::net::{IpAddr, SocketAddr};

/// Outcome of one condition against the current evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRes {
    /// The condition holds.
    Yes,
    /// The condition does not hold.
    No,
    /// Not enough buffered data to decide.
    Missing,
}

/// Outcome of evaluating a rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    /// Processing continues.
    Accept,
    /// The session must be killed.
    Reject,
    /// More data is needed; retry when some arrives or the delay expires.
    Missing,
}

/// What a matching rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// Stop evaluating, let the session continue.
    Accept,
    /// Kill the session.
    Reject,
}

/// A compiled condition.
#[derive(Debug, Clone)]
pub enum Cond {
    /// Source address within `addr/prefix`.
    SrcIp {
        /// Network address.
        addr: IpAddr,
        /// Prefix length.
        prefix: u8,
    },
    /// Source port within the inclusive range.
    SrcPort {
        /// Low bound.
        lo: u16,
        /// High bound.
        hi: u16,
    },
    /// At least `n` payload bytes buffered.
    PayloadLen {
        /// Minimum byte count.
        n: usize,
    },
    /// At least `n` request bytes received, regardless of content. The
    /// classic "wait until the client sent anything" guard in front of
    /// payload matchers.
    ReqLenAtLeast {
        /// Minimum byte count.
        n: usize,
    },
    /// Payload begins with these bytes.
    PayloadStartsWith(Vec<u8>),
    /// Payload contains these bytes.
    PayloadContains(Vec<u8>),
    /// Always true.
    Always,
}

/// Evidence a condition is judged against.
#[derive(Debug, Clone, Copy)]
pub struct RuleCtx<'a> {
    /// Client address.
    pub src: SocketAddr,
    /// Buffered request payload.
    pub data: &'a [u8],
    /// Whether "not enough data" is still a possible answer.
    pub partial: bool,
}

fn ip_in_prefix(ip: IpAddr, net: IpAddr, prefix: u8) -> bool {
    match (ip, net) {
        (IpAddr::V4(ip), IpAddr::V4(net)) => {
            let bits = u32::from(prefix.min(32));
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            u32::from_be_bytes(ip.octets()) & mask == u32::from_be_bytes(net.octets()) & mask
        }
        (IpAddr::V6(ip), IpAddr::V6(net)) => {
            let bits = u32::from(prefix.min(128));
            let mask = if bits == 0 {
                0
            } else {
                u128::MAX << (128 - bits)
            };
            u128::from_be_bytes(ip.octets()) & mask == u128::from_be_bytes(net.octets()) & mask
        }
        _ => false,
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

impl Cond {
    /// Compiles a configured condition.
    #[must_use]
    pub fn compile(cfg: &CondCfg) -> Self {
        match cfg {
            CondCfg::SrcIp { addr, prefix } => Self::SrcIp {
                addr: *addr,
                prefix: *prefix,
            },
            CondCfg::SrcPort { lo, hi } => Self::SrcPort { lo: *lo, hi: *hi },
            CondCfg::PayloadLen { n } => Self::PayloadLen { n: *n },
            CondCfg::ReqLen { n } => Self::ReqLenAtLeast { n: *n },
            CondCfg::PayloadStartsWith { prefix } => {
                Self::PayloadStartsWith(prefix.clone().into_bytes())
            }
            CondCfg::PayloadContains { needle } => {
                Self::PayloadContains(needle.clone().into_bytes())
            }
            CondCfg::Always => Self::Always,
        }
    }

    /// Evaluates against the evidence.
    #[must_use]
    pub fn eval(&self, ctx: &RuleCtx<'_>) -> MatchRes {
        match self {
            Self::Always => MatchRes::Yes,
            Self::SrcIp { addr, prefix } => {
                if ip_in_prefix(ctx.src.ip(), *addr, *prefix) {
                    MatchRes::Yes
                } else {
                    MatchRes::No
                }
            }
            Self::SrcPort { lo, hi } => {
                if (*lo..=*hi).contains(&ctx.src.port()) {
                    MatchRes::Yes
                } else {
                    MatchRes::No
                }
            }
            Self::PayloadLen { n } | Self::ReqLenAtLeast { n } => {
                if ctx.data.len() >= *n {
                    MatchRes::Yes
                } else if ctx.partial {
                    MatchRes::Missing
                } else {
                    MatchRes::No
                }
            }
            Self::PayloadStartsWith(p) => {
                if ctx.data.len() >= p.len() {
                    if &ctx.data[..p.len()] == p.as_slice() {
                        MatchRes::Yes
                    } else {
                        MatchRes::No
                    }
                } else if ctx.partial && p.starts_with(ctx.data) {
                    MatchRes::Missing
                } else {
                    MatchRes::No
                }
            }
            Self::PayloadContains(p) => {
                if contains(ctx.data, p) {
                    MatchRes::Yes
                } else if ctx.partial {
                    MatchRes::Missing
                } else {
                    MatchRes::No
                }
            }
        }
    }
}

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Action on match.
    pub action: RuleAction,
    /// Condition; `None` always matches.
    pub cond: Option<Cond>,
    /// Invert the condition.
    pub unless: bool,
}

impl Rule {
    /// Compiles a configured rule.
    #[must_use]
    pub fn compile(cfg: &RuleCfg) -> Self {
        Self {
            action: match cfg.action {
                RuleActionCfg::Accept => RuleAction::Accept,
                RuleActionCfg::Reject => RuleAction::Reject,
            },
            cond: cfg.cond.as_ref().map(Cond::compile),
            unless: cfg.unless,
        }
    }

    fn matches(&self, ctx: &RuleCtx<'_>) -> MatchRes {
        let res = self.cond.as_ref().map_or(MatchRes::Yes, |c| c.eval(ctx));
        match (res, self.unless) {
            (MatchRes::Missing, _) => MatchRes::Missing,
            (MatchRes::Yes, true) | (MatchRes::No, false) => MatchRes::No,
            (MatchRes::Yes, false) | (MatchRes::No, true) => MatchRes::Yes,
        }
    }
}

/// A rule list plus its inspect delay.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// How long the evaluation may wait for more data, ms.
    pub inspect_delay: Option<u32>,
    /// Rules in evaluation order.
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Compiles a configured rule list.
    #[must_use]
    pub fn compile(cfg: &RulesCfg) -> Self {
        Self {
            inspect_delay: cfg.inspect_delay,
            rules: cfg.rules.iter().map(Rule::compile).collect(),
        }
    }

    /// True when there is nothing to evaluate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs the list against the evidence.
    #[must_use]
    pub fn evaluate(&self, ctx: &RuleCtx<'_>) -> RuleVerdict {
        for rule in &self.rules {
            match rule.matches(ctx) {
                MatchRes::Missing => return RuleVerdict::Missing,
                MatchRes::No => continue,
                MatchRes::Yes => {
                    return match rule.action {
                        RuleAction::Accept => RuleVerdict::Accept,
                        RuleAction::Reject => RuleVerdict::Reject,
                    }
                }
            }
        }
        RuleVerdict::Accept
    }
}

/// A compiled backend-switching rule.
#[derive(Debug, Clone)]
pub struct SwitchRule {
    /// Target backend index.
    pub backend: usize,
    /// Condition; `None` always matches.
    pub cond: Option<Cond>,
    /// Invert the condition.
    pub unless: bool,
}

impl SwitchRule {
    /// Compiles a configured switching rule; the caller resolves the
    /// backend name to an index.
    #[must_use]
    pub fn compile(cfg: &SwitchRuleCfg, backend: usize) -> Self {
        Self {
            backend,
            cond: cfg.cond.as_ref().map(Cond::compile),
            unless: cfg.unless,
        }
    }
}

/// Picks the first switching rule that matches. Switching runs after
/// inspection completed, so missing data counts as a non-match.
#[must_use]
pub fn select_backend(rules: &[SwitchRule], ctx: &RuleCtx<'_>) -> Option<usize> {
    for r in rules {
        let res = r.cond.as_ref().map_or(MatchRes::Yes, |c| c.eval(ctx));
        let hit = match (res, r.unless) {
            (MatchRes::Yes, false) | (MatchRes::No, true) => true,
            _ => false,
        };
        if hit {
            return Some(r.backend);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(data: &'a [u8], partial: bool) -> RuleCtx<'a> {
        RuleCtx {
            src: "10.1.2.3:5555".parse().unwrap(),
            data,
            partial,
        }
    }

    fn reject_if_prefix(p: &str) -> RuleSet {
        RuleSet {
            inspect_delay: Some(100),
            rules: vec![Rule {
                action: RuleAction::Reject,
                cond: Some(Cond::PayloadStartsWith(p.as_bytes().to_vec())),
                unless: false,
            }],
        }
    }

    #[test]
    fn empty_list_accepts() {
        let rs = RuleSet::default();
        assert_eq!(rs.evaluate(&ctx(b"", false)), RuleVerdict::Accept);
    }

    #[test]
    fn prefix_match_decides_once_enough_data() {
        let rs = reject_if_prefix("QUIT");
        assert_eq!(rs.evaluate(&ctx(b"QU", true)), RuleVerdict::Missing);
        assert_eq!(rs.evaluate(&ctx(b"QUIT now", true)), RuleVerdict::Reject);
        assert_eq!(rs.evaluate(&ctx(b"HELLO", true)), RuleVerdict::Accept);
    }

    #[test]
    fn partial_over_means_no_match() {
        let rs = reject_if_prefix("QUIT");
        // delay expired: the short payload can no longer match
        assert_eq!(rs.evaluate(&ctx(b"QU", false)), RuleVerdict::Accept);
    }

    #[test]
    fn accept_shadows_later_reject() {
        let rs = RuleSet {
            inspect_delay: None,
            rules: vec![
                Rule {
                    action: RuleAction::Accept,
                    cond: Some(Cond::SrcIp {
                        addr: "10.0.0.0".parse().unwrap(),
                        prefix: 8,
                    }),
                    unless: false,
                },
                Rule {
                    action: RuleAction::Reject,
                    cond: None,
                    unless: false,
                },
            ],
        };
        assert_eq!(rs.evaluate(&ctx(b"x", false)), RuleVerdict::Accept);
    }

    #[test]
    fn unless_inverts() {
        let rule = Rule {
            action: RuleAction::Reject,
            cond: Some(Cond::SrcPort { lo: 1, hi: 1000 }),
            unless: true,
        };
        let rs = RuleSet {
            inspect_delay: None,
            rules: vec![rule],
        };
        // src port is 5555, outside the range, inverted => reject
        assert_eq!(rs.evaluate(&ctx(b"", false)), RuleVerdict::Reject);
    }

    #[test]
    fn req_len_gates_until_data_arrives() {
        // accept once anything showed up, otherwise keep waiting
        let rs = RuleSet {
            inspect_delay: Some(200),
            rules: vec![Rule {
                action: RuleAction::Accept,
                cond: Some(Cond::ReqLenAtLeast { n: 1 }),
                unless: false,
            }],
        };
        assert_eq!(rs.evaluate(&ctx(b"", true)), RuleVerdict::Missing);
        assert_eq!(rs.evaluate(&ctx(b"x", true)), RuleVerdict::Accept);
        // delay over, nothing came: the implicit accept applies
        assert_eq!(rs.evaluate(&ctx(b"", false)), RuleVerdict::Accept);
    }

    #[test]
    fn payload_contains_scans_window() {
        let c = Cond::PayloadContains(b"abc".to_vec());
        assert_eq!(c.eval(&ctx(b"zzabczz", false)), MatchRes::Yes);
        assert_eq!(c.eval(&ctx(b"zzab", true)), MatchRes::Missing);
        assert_eq!(c.eval(&ctx(b"zzab", false)), MatchRes::No);
    }

    #[test]
    fn switching_picks_first_match() {
        let rules = vec![
            SwitchRule {
                backend: 0,
                cond: Some(Cond::PayloadStartsWith(b"GET".to_vec())),
                unless: false,
            },
            SwitchRule {
                backend: 1,
                cond: None,
                unless: false,
            },
        ];
        assert_eq!(select_backend(&rules, &ctx(b"GET /", false)), Some(0));
        assert_eq!(select_backend(&rules, &ctx(b"POST /", false)), Some(1));
        assert_eq!(select_backend(&rules[..1], &ctx(b"POST /", false)), None);
    }

    #[test]
    fn ipv4_prefix_matching() {
        assert!(ip_in_prefix(
            "10.200.3.4".parse().unwrap(),
            "10.0.0.0".parse().unwrap(),
            8
        ));
        assert!(!ip_in_prefix(
            "11.0.0.1".parse().unwrap(),
            "10.0.0.0".parse().unwrap(),
            8
        ));
        assert!(ip_in_prefix(
            "1.2.3.4".parse().unwrap(),
            "9.9.9.9".parse().unwrap(),
            0
        ));
    }
}
