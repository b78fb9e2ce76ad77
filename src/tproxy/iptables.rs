//! Linux `iptables` / `ip rule` installer.
//!
//! Install runs a fixed command plan; each step that changes kernel state
//! records its inverse. Cleanup replays the recorded inverses in reverse order.

use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;

use crate::tproxy::{RuleInstaller, TProxyError, TProxyRules};

const PREROUTING_CHAIN: &str = "TUNNEL_HUB_PREROUTING";
const OUTPUT_CHAIN: &str = "TUNNEL_HUB_OUTPUT";
const DNS_CHAIN: &str = "TUNNEL_HUB_DNS";
const TPROXY_MARK: &str = "0x1/0x1";
const ROUTE_TABLE: &str = "100";

/// Destinations never sent through the proxy.
const RESERVED_RANGES: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: &'static str,
    pub args: Vec<String>,
}

impl Cmd {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// One install command and the command that reverts it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub apply: Cmd,
    pub undo: Option<Cmd>,
}

fn step(apply: Cmd, undo: Cmd) -> Step {
    Step {
        apply,
        undo: Some(undo),
    }
}

fn append(table: &str, chain: &str, rule: &[&str]) -> Step {
    let mut args = vec!["-t", table, "-A", chain];
    args.extend_from_slice(rule);
    Step {
        apply: Cmd::new("iptables", &args),
        undo: None,
    }
}

fn new_chain(table: &str, chain: &str) -> Step {
    step(
        Cmd::new("iptables", &["-t", table, "-N", chain]),
        Cmd::new("iptables", &["-t", table, "-X", chain]),
    )
}

/// Flushed again on undo so the chain can be deleted.
fn flush_chain(table: &str, chain: &str) -> Step {
    step(
        Cmd::new("iptables", &["-t", table, "-F", chain]),
        Cmd::new("iptables", &["-t", table, "-F", chain]),
    )
}

fn jump(table: &str, from: &str, to: &str, matcher: &[&str]) -> Step {
    let mut insert = vec!["-t", table, "-I", from];
    insert.extend_from_slice(matcher);
    insert.extend_from_slice(&["-j", to]);
    let mut delete = vec!["-t", table, "-D", from];
    delete.extend_from_slice(matcher);
    delete.extend_from_slice(&["-j", to]);
    step(Cmd::new("iptables", &insert), Cmd::new("iptables", &delete))
}

/// Command plan for `rules`, in execution order.
pub fn install_plan(rules: &TProxyRules) -> Vec<Step> {
    let port = rules.port.to_string();
    let dns_port = rules.dns_port.to_string();
    let mark = rules.routing_mark.to_string();
    let (port, dns_port, mark) = (port.as_str(), dns_port.as_str(), mark.as_str());
    let interface = rules.interface.as_str();
    let mut plan = Vec::new();

    plan.push(step(
        Cmd::new("ip", &["-f", "inet", "rule", "add", "fwmark", TPROXY_MARK, "lookup", ROUTE_TABLE]),
        Cmd::new("ip", &["-f", "inet", "rule", "del", "fwmark", TPROXY_MARK, "lookup", ROUTE_TABLE]),
    ));
    plan.push(step(
        Cmd::new(
            "ip",
            &["-f", "inet", "route", "add", "local", "default", "dev", interface, "table", ROUTE_TABLE],
        ),
        Cmd::new(
            "ip",
            &["-f", "inet", "route", "del", "local", "default", "dev", interface, "table", ROUTE_TABLE],
        ),
    ));

    // PREROUTING: tproxy everything not reserved or bypassed
    plan.push(new_chain("mangle", PREROUTING_CHAIN));
    plan.push(flush_chain("mangle", PREROUTING_CHAIN));
    for range in RESERVED_RANGES.iter().copied().chain(rules.bypass.iter().map(String::as_str)) {
        plan.push(append("mangle", PREROUTING_CHAIN, &["-d", range, "-j", "RETURN"]));
    }
    for proto in ["tcp", "udp"] {
        plan.push(append(
            "mangle",
            PREROUTING_CHAIN,
            &["-p", proto, "-j", "TPROXY", "--on-port", port, "--tproxy-mark", TPROXY_MARK],
        ));
    }
    plan.push(jump("mangle", "PREROUTING", PREROUTING_CHAIN, &[]));

    // OUTPUT: reroute local traffic, except what the proxy itself sends
    plan.push(new_chain("mangle", OUTPUT_CHAIN));
    plan.push(flush_chain("mangle", OUTPUT_CHAIN));
    plan.push(append("mangle", OUTPUT_CHAIN, &["-m", "mark", "--mark", mark, "-j", "RETURN"]));
    for range in RESERVED_RANGES.iter().copied().chain(rules.bypass.iter().map(String::as_str)) {
        plan.push(append("mangle", OUTPUT_CHAIN, &["-d", range, "-j", "RETURN"]));
    }
    for proto in ["tcp", "udp"] {
        plan.push(append(
            "mangle",
            OUTPUT_CHAIN,
            &["-p", proto, "-j", "MARK", "--set-mark", TPROXY_MARK],
        ));
    }
    plan.push(jump("mangle", "OUTPUT", OUTPUT_CHAIN, &[]));

    if rules.dns_redirect {
        plan.push(new_chain("nat", DNS_CHAIN));
        plan.push(flush_chain("nat", DNS_CHAIN));
        for proto in ["udp", "tcp"] {
            plan.push(append(
                "nat",
                DNS_CHAIN,
                &["-p", proto, "--dport", "53", "-j", "REDIRECT", "--to-ports", dns_port],
            ));
        }
        plan.push(jump("nat", "PREROUTING", DNS_CHAIN, &[]));
        plan.push(jump("nat", "OUTPUT", DNS_CHAIN, &["-m", "mark", "!", "--mark", mark]));
    }

    plan
}

/// Runs one command.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &Cmd) -> Result<(), String>;
}

pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &Cmd) -> Result<(), String> {
        tracing::debug!(command = %cmd, "[IPTABLES] running");
        let output = Command::new(cmd.program)
            .args(&cmd.args)
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

pub struct IptablesInstaller<R = SystemRunner> {
    runner: R,
    /// Inverse commands of what is currently installed, in install order.
    installed: Mutex<Vec<Cmd>>,
}

impl IptablesInstaller<SystemRunner> {
    pub fn new() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl Default for IptablesInstaller<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> IptablesInstaller<R> {
    pub fn with_runner(runner: R) -> Self {
        Self {
            runner,
            installed: Mutex::new(Vec::new()),
        }
    }

    pub fn is_installed(&self) -> bool {
        !self.installed.lock().is_empty()
    }

    async fn revert(&self) {
        let undo = std::mem::take(&mut *self.installed.lock());
        for cmd in undo.iter().rev() {
            if let Err(e) = self.runner.run(cmd).await {
                tracing::warn!(command = %cmd, error = %e, "[IPTABLES] cleanup step failed");
            }
        }
    }
}

#[async_trait]
impl<R: CommandRunner> RuleInstaller for IptablesInstaller<R> {
    async fn cleanup(&self) {
        if !self.is_installed() {
            return;
        }
        tracing::info!("[IPTABLES] Cleaning up tproxy rules");
        self.revert().await;
    }

    async fn install(&self, rules: &TProxyRules) -> Result<(), TProxyError> {
        for step in install_plan(rules) {
            if let Err(reason) = self.runner.run(&step.apply).await {
                self.revert().await;
                return Err(TProxyError::Install {
                    command: step.apply.to_string(),
                    reason,
                });
            }
            if let Some(undo) = step.undo {
                self.installed.lock().push(undo);
            }
        }
        Ok(())
    }
}
