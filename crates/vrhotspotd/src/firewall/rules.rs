//! Direct packet-filter backend.
//!
//! Inserts FORWARD and NAT rules straight into the filter when no zone
//! manager owns the host. Every rule carries the daemon's comment tag so
//! revert and repair remove only what this daemon added.

use super::{FirewallBackend, Profile, RevertToken};
use crate::platform::{run_cmd, which};
use std::path::PathBuf;
use std::time::Duration;
use vrhotspot_shared::error::{ErrorKind, LifecycleError};

/// Comment tag identifying this daemon's rules.
pub const RULE_TAG: &str = "vrhotspot";

const IPT_TIMEOUT: Duration = Duration::from_secs(3);

fn iptables() -> Option<PathBuf> {
    which("iptables")
}

/// Build the full argv for one action on a rule spec, honoring the
/// table-before-action ordering iptables requires.
fn ipt_args(action: &str, rule: &[String]) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(rule.len() + 3);
    if rule.len() >= 2 && rule[0] == "-t" {
        args.extend_from_slice(&rule[..2]);
        args.push(action.to_string());
        args.extend_from_slice(&rule[2..]);
    } else {
        args.push(action.to_string());
        args.extend_from_slice(rule);
    }
    args
}

async fn ipt(action: &str, rule: &[String]) -> (bool, String) {
    let Some(bin) = iptables() else {
        return (false, "iptables not found".to_string());
    };
    let args = ipt_args(action, rule);
    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let out = run_cmd(&bin, &arg_refs, IPT_TIMEOUT).await;
    (out.ok(), out.combined())
}

/// Append a rule unless an identical one already exists.
async fn add_unique(rule: &[String]) -> (bool, String) {
    let (exists, _) = ipt("-C", rule).await;
    if exists {
        return (true, "exists".to_string());
    }
    ipt("-A", rule).await
}

fn tagged(mut rule: Vec<String>) -> Vec<String> {
    rule.extend(
        ["-m", "comment", "--comment", RULE_TAG]
            .iter()
            .map(|s| s.to_string()),
    );
    rule
}

/// Rule specs (without the action flag) this backend installed.
#[derive(Debug, Clone, Default)]
pub struct RulesRevert {
    pub rules: Vec<Vec<String>>,
}

impl RulesRevert {
    pub async fn revert(self) -> Vec<String> {
        let mut warnings = Vec::new();
        // Strict LIFO against insertion order.
        for rule in self.rules.into_iter().rev() {
            let (ok, out) = ipt("-D", &rule).await;
            if !ok && !out.to_ascii_lowercase().contains("does a matching rule exist") {
                warnings.push(format!(
                    "firewall_rule_delete_failed:{}",
                    out.chars().take(120).collect::<String>()
                ));
            }
        }
        warnings
    }
}

/// The direct-rules reconciler backend.
pub struct RulesBackend;

impl RulesBackend {
    fn forward_rules(profile: &Profile) -> Vec<Vec<String>> {
        let mut rules = Vec::new();
        let Some(uplink) = profile.uplink_ifname.as_deref() else {
            return rules;
        };
        if profile.forward {
            rules.push(tagged(
                [
                    "FORWARD", "-i", uplink, "-o", &profile.ap_ifname, "-m", "state", "--state",
                    "RELATED,ESTABLISHED", "-j", "ACCEPT",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ));
            rules.push(tagged(
                ["FORWARD", "-i", &profile.ap_ifname, "-o", uplink, "-j", "ACCEPT"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            ));
        }
        if profile.masquerade {
            rules.push(tagged(
                [
                    "-t",
                    "nat",
                    "POSTROUTING",
                    "-s",
                    &profile.lan_cidr,
                    "-o",
                    uplink,
                    "-j",
                    "MASQUERADE",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ));
        }
        rules
    }
}

impl FirewallBackend for RulesBackend {
    fn name(&self) -> &'static str {
        "rules"
    }

    async fn apply(&self, profile: &Profile) -> Result<RevertToken, LifecycleError> {
        let rules = Self::forward_rules(profile);
        if rules.is_empty() {
            return Ok(RevertToken::None);
        }

        let mut state = RulesRevert::default();
        for rule in rules {
            let (ok, out) = add_unique(&rule).await;
            if !ok {
                // Roll back what this apply already added before failing.
                let partial = std::mem::take(&mut state);
                let _ = partial.revert().await;
                return Err(LifecycleError::new(ErrorKind::FirewallApplyFailed)
                    .with_detail(out.chars().take(120).collect::<String>()));
            }
            state.rules.push(rule);
        }
        Ok(RevertToken::Rules(state))
    }
}

/// Repair-time sweep: delete every rule carrying the daemon's tag, found by
/// listing the chains this backend writes to.
pub async fn purge_tagged_rules() -> Vec<String> {
    let mut warnings = Vec::new();
    let Some(bin) = iptables() else {
        return warnings;
    };

    for (table_args, chain) in [
        (Vec::<&str>::new(), "FORWARD"),
        (vec!["-t", "nat"], "POSTROUTING"),
    ] {
        let mut args = table_args.clone();
        args.extend(["-S", chain]);
        let out = run_cmd(&bin, &args, IPT_TIMEOUT).await;
        if !out.ok() {
            continue;
        }
        for line in out.stdout.lines() {
            if !line.contains(RULE_TAG) {
                continue;
            }
            let Some(spec) = line.strip_prefix(&format!("-A {chain} ")) else {
                continue;
            };
            let mut del: Vec<String> = table_args.iter().map(|s| s.to_string()).collect();
            del.push("-D".to_string());
            del.push(chain.to_string());
            del.extend(shell_split(spec));
            let del_refs: Vec<&str> = del.iter().map(String::as_str).collect();
            let result = run_cmd(&bin, &del_refs, IPT_TIMEOUT).await;
            if !result.ok() {
                warnings.push(format!(
                    "firewall_purge_failed:{}",
                    result.combined().chars().take(120).collect::<String>()
                ));
            }
        }
    }
    warnings
}

/// Minimal tokenizer for `iptables -S` output; values iptables prints with
/// quotes (comments) are unwrapped.
fn shell_split(spec: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in spec.chars() {
        match ch {
            '"' => in_quote = !in_quote,
            ' ' if !in_quote => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
