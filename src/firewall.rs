use async_trait::async_trait;
use nftables::{
    batch::Batch,
    expr::{Expression, NamedExpression, Payload, PayloadField},
    helper::{apply_ruleset, get_current_ruleset},
    schema::{Chain, Element, NfCmd, NfListObject, NfObject, Rule, Set, SetType, SetTypeValue, Table},
    stmt::{Match, Operator, Statement},
    types::{NfChainPolicy, NfChainType, NfFamily, NfHook},
};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{FirewallBackend, FirewallConfig, NftablesConfig};
use crate::error::{Error, Result};

/// Network-level enforcement of bans
#[async_trait]
pub trait Enforcer: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Get the backend ready to accept blocks (create tables, enable ufw, ...)
    async fn prepare(&self) -> Result<()>;

    /// Drop traffic from `ip`
    async fn block(&self, ip: IpAddr) -> Result<()>;

    /// Stop dropping traffic from `ip`
    async fn unblock(&self, ip: IpAddr) -> Result<()>;

    /// Whether the backend is currently enforcing anything
    async fn is_active(&self) -> bool;
}

/// Build the enforcer selected in the config
pub fn build_enforcer(config: &FirewallConfig) -> Arc<dyn Enforcer> {
    match config.backend {
        FirewallBackend::Nftables => Arc::new(NftablesFirewall::new(config.nftables.clone())),
        FirewallBackend::Ufw => Arc::new(UfwFirewall::new(config.ufw_auto_install)),
        FirewallBackend::None => Arc::new(NoopFirewall),
    }
}

/// Firewall manager for nftables operations
#[derive(Debug, Clone)]
pub struct NftablesFirewall {
    config: NftablesConfig,
}

impl NftablesFirewall {
    pub fn new(config: NftablesConfig) -> Self {
        Self { config }
    }

    /// Create table, sets, chain and drop rules unless the table exists
    pub fn init(&self) -> anyhow::Result<()> {
        if self.table_exists()? {
            debug!("Table {} already exists", self.config.table_name);
            return Ok(());
        }

        info!("Initializing nftables table {}", self.config.table_name);
        let mut batch = Batch::new();

        batch.add(NfListObject::Table(Table {
            family: NfFamily::INet,
            name: Cow::Owned(self.config.table_name.clone()),
            handle: None,
        }));

        // Expiry is tracked by the daemon, so the sets carry no timeout flag
        for (set_name, set_type, comment) in [
            (&self.config.set_v4, SetType::Ipv4Addr, "sshwarden banned IPv4 addresses"),
            (&self.config.set_v6, SetType::Ipv6Addr, "sshwarden banned IPv6 addresses"),
        ] {
            batch.add(NfListObject::Set(Box::new(Set {
                family: NfFamily::INet,
                table: Cow::Owned(self.config.table_name.clone()),
                name: Cow::Owned(set_name.clone()),
                handle: None,
                set_type: SetTypeValue::Single(set_type),
                policy: None,
                flags: None,
                elem: None,
                timeout: None,
                gc_interval: None,
                size: None,
                comment: Some(Cow::Borrowed(comment)),
            })));
        }

        batch.add(NfListObject::Chain(Chain {
            family: NfFamily::INet,
            table: Cow::Owned(self.config.table_name.clone()),
            name: Cow::Owned(self.config.chain_name.clone()),
            newname: None,
            handle: None,
            _type: Some(NfChainType::Filter),
            hook: Some(NfHook::Input),
            prio: Some(self.config.priority),
            dev: None,
            policy: Some(NfChainPolicy::Accept),
        }));

        for (protocol, set_name, comment) in [
            ("ip", &self.config.set_v4, "Drop banned IPv4"),
            ("ip6", &self.config.set_v6, "Drop banned IPv6"),
        ] {
            batch.add(NfListObject::Rule(Rule {
                family: NfFamily::INet,
                table: Cow::Owned(self.config.table_name.clone()),
                chain: Cow::Owned(self.config.chain_name.clone()),
                handle: None,
                index: None,
                comment: Some(Cow::Borrowed(comment)),
                expr: Cow::Owned(vec![
                    Statement::Match(Match {
                        left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(
                            PayloadField {
                                protocol: Cow::Borrowed(protocol),
                                field: Cow::Borrowed("saddr"),
                            },
                        ))),
                        right: Expression::String(Cow::Owned(format!("@{}", set_name))),
                        op: Operator::IN,
                    }),
                    Statement::Drop(None),
                ]),
            }));
        }

        let ruleset = batch.to_nftables();
        apply_ruleset(&ruleset)?;

        info!("nftables table {} initialized", self.config.table_name);
        Ok(())
    }

    fn table_exists(&self) -> anyhow::Result<bool> {
        let ruleset = get_current_ruleset()?;

        for obj in ruleset.objects.iter() {
            if let NfObject::ListObject(NfListObject::Table(table)) = obj {
                if table.name == self.config.table_name && table.family == NfFamily::INet {
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    fn set_for(&self, ip: &IpAddr) -> String {
        match ip {
            IpAddr::V4(_) => self.config.set_v4.clone(),
            IpAddr::V6(_) => self.config.set_v6.clone(),
        }
    }

    fn apply_element(&self, ip: IpAddr, add: bool) -> anyhow::Result<()> {
        let element = NfListObject::Element(Element {
            family: NfFamily::INet,
            table: Cow::Owned(self.config.table_name.clone()),
            name: Cow::Owned(self.set_for(&ip)),
            elem: Cow::Owned(vec![Expression::String(Cow::Owned(ip.to_string()))]),
        });

        let mut batch = Batch::new();
        batch.add_cmd(if add {
            NfCmd::Add(element)
        } else {
            NfCmd::Delete(element)
        });

        let ruleset = batch.to_nftables();
        apply_ruleset(&ruleset)?;
        Ok(())
    }

    async fn run_blocking<F>(&self, action: &'static str, ip: IpAddr, f: F) -> Result<()>
    where
        F: FnOnce(NftablesFirewall) -> anyhow::Result<()> + Send + 'static,
    {
        let this = self.clone();
        let outcome = tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| Error::Enforcement {
                action,
                ip,
                reason: format!("nft task panicked: {}", e),
            })?;

        outcome.map_err(|e| Error::Enforcement {
            action,
            ip,
            reason: format!("{:#}", e),
        })
    }
}

#[async_trait]
impl Enforcer for NftablesFirewall {
    fn name(&self) -> &str {
        "nftables"
    }

    async fn prepare(&self) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.init())
            .await
            .map_err(|e| Error::Config(format!("nft task panicked: {}", e)))?
            .map_err(|e| Error::Config(format!("failed to initialize nftables: {:#}", e)))
    }

    async fn block(&self, ip: IpAddr) -> Result<()> {
        self.run_blocking("block", ip, move |fw| fw.apply_element(ip, true))
            .await?;
        info!(ip = %ip, "Added to nftables set");
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        self.run_blocking("unblock", ip, move |fw| fw.apply_element(ip, false))
            .await?;
        info!(ip = %ip, "Removed from nftables set");
        Ok(())
    }

    async fn is_active(&self) -> bool {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.table_exists()).await {
            Ok(Ok(exists)) => exists,
            Ok(Err(e)) => {
                warn!("Failed to read nftables ruleset: {:#}", e);
                false
            }
            Err(e) => {
                warn!("nft task panicked: {}", e);
                false
            }
        }
    }
}

/// Enforcement through the `ufw` command line tool
#[derive(Debug, Clone)]
pub struct UfwFirewall {
    auto_install: bool,
}

impl UfwFirewall {
    pub fn new(auto_install: bool) -> Self {
        Self { auto_install }
    }

    fn deny_args(ip: IpAddr) -> Vec<String> {
        vec![
            "deny".to_string(),
            "from".to_string(),
            ip.to_string(),
            "to".to_string(),
            "any".to_string(),
        ]
    }

    fn delete_args(ip: IpAddr) -> Vec<String> {
        let mut args = vec!["delete".to_string()];
        args.extend(Self::deny_args(ip));
        args
    }

    async fn ufw(&self, action: &'static str, ip: IpAddr, args: &[String]) -> Result<()> {
        let output = Command::new("ufw")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Enforcement {
                action,
                ip,
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::Enforcement {
                action,
                ip,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Install ufw with the first package manager found
    async fn install(&self) -> anyhow::Result<()> {
        let managers: [(&str, &[&str]); 3] = [
            ("apt-get", &["install", "-y", "ufw"]),
            ("dnf", &["install", "-y", "ufw"]),
            ("yum", &["install", "-y", "ufw"]),
        ];

        for (manager, args) in managers {
            let found = Command::new("which")
                .arg(manager)
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if !found {
                continue;
            }

            if manager == "apt-get" {
                run_checked("apt-get", &["update"]).await?;
            }
            info!("Installing ufw with {}", manager);
            return run_checked(manager, args).await;
        }

        anyhow::bail!("no supported package manager found (apt-get, dnf, yum)")
    }
}

async fn run_checked(program: &str, args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new(program).args(args).output().await?;
    if !output.status.success() {
        anyhow::bail!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[async_trait]
impl Enforcer for UfwFirewall {
    fn name(&self) -> &str {
        "ufw"
    }

    async fn prepare(&self) -> Result<()> {
        if self.is_active().await {
            return Ok(());
        }
        if !self.auto_install {
            warn!("ufw is not active; bans will not be enforced until it is enabled");
            return Ok(());
        }

        self.install()
            .await
            .map_err(|e| Error::Config(format!("failed to install ufw: {:#}", e)))?;
        run_checked("ufw", &["--force", "enable"])
            .await
            .map_err(|e| Error::Config(format!("failed to enable ufw: {:#}", e)))?;
        info!("ufw installed and enabled");
        Ok(())
    }

    async fn block(&self, ip: IpAddr) -> Result<()> {
        self.ufw("block", ip, &Self::deny_args(ip)).await?;
        info!(ip = %ip, "Added ufw deny rule");
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        self.ufw("unblock", ip, &Self::delete_args(ip)).await?;
        info!(ip = %ip, "Removed ufw deny rule");
        Ok(())
    }

    async fn is_active(&self) -> bool {
        match Command::new("ufw").arg("status").output().await {
            Ok(output) => {
                output.status.success()
                    && String::from_utf8_lossy(&output.stdout).contains("Status: active")
            }
            Err(_) => false,
        }
    }
}

/// Dry-run backend: decisions are logged, nothing is enforced
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFirewall;

#[async_trait]
impl Enforcer for NoopFirewall {
    fn name(&self) -> &str {
        "none"
    }

    async fn prepare(&self) -> Result<()> {
        warn!("Firewall backend is 'none': bans are tracked but not enforced");
        Ok(())
    }

    async fn block(&self, ip: IpAddr) -> Result<()> {
        info!(ip = %ip, "Would block (dry run)");
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        info!(ip = %ip, "Would unblock (dry run)");
        Ok(())
    }

    async fn is_active(&self) -> bool {
        false
    }
}

/// In-memory enforcer that records every call, for tests
#[derive(Debug, Default)]
pub struct RecordingFirewall {
    blocked: Mutex<HashSet<IpAddr>>,
    calls: Mutex<Vec<(&'static str, IpAddr)>>,
    failing: Mutex<HashSet<IpAddr>>,
}

impl RecordingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call for `ip` fail
    pub fn fail_for(&self, ip: IpAddr) {
        self.failing.lock().insert(ip);
    }

    pub fn is_blocked(&self, ip: &IpAddr) -> bool {
        self.blocked.lock().contains(ip)
    }

    pub fn count(&self, action: &str) -> usize {
        self.calls.lock().iter().filter(|(a, _)| *a == action).count()
    }

    fn record(&self, action: &'static str, ip: IpAddr) -> Result<()> {
        self.calls.lock().push((action, ip));
        if self.failing.lock().contains(&ip) {
            return Err(Error::Enforcement {
                action,
                ip,
                reason: "simulated failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Enforcer for RecordingFirewall {
    fn name(&self) -> &str {
        "recording"
    }

    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn block(&self, ip: IpAddr) -> Result<()> {
        self.record("block", ip)?;
        self.blocked.lock().insert(ip);
        Ok(())
    }

    async fn unblock(&self, ip: IpAddr) -> Result<()> {
        self.record("unblock", ip)?;
        self.blocked.lock().remove(&ip);
        Ok(())
    }

    async fn is_active(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_nftables_set_selection() {
        let fw = NftablesFirewall::new(NftablesConfig::default());
        assert_eq!(fw.set_for(&ip("10.0.0.1")), "banned_v4");
        assert_eq!(fw.set_for(&ip("2001:db8::1")), "banned_v6");
    }

    #[test]
    fn test_ufw_arguments() {
        assert_eq!(
            UfwFirewall::deny_args(ip("10.0.0.1")),
            vec!["deny", "from", "10.0.0.1", "to", "any"]
        );
        assert_eq!(
            UfwFirewall::delete_args(ip("10.0.0.1")),
            vec!["delete", "deny", "from", "10.0.0.1", "to", "any"]
        );
    }

    #[test]
    fn test_build_enforcer_backends() {
        let mut config = FirewallConfig::default();
        assert_eq!(build_enforcer(&config).name(), "nftables");
        config.backend = FirewallBackend::Ufw;
        assert_eq!(build_enforcer(&config).name(), "ufw");
        config.backend = FirewallBackend::None;
        assert_eq!(build_enforcer(&config).name(), "none");
    }

    #[tokio::test]
    async fn test_recording_firewall() {
        let fw = RecordingFirewall::new();
        let good = ip("10.0.0.1");
        let bad = ip("10.0.0.2");
        fw.fail_for(bad);

        fw.block(good).await.unwrap();
        assert!(fw.is_blocked(&good));
        assert!(fw.block(bad).await.is_err());
        assert!(!fw.is_blocked(&bad));

        fw.unblock(good).await.unwrap();
        assert!(!fw.is_blocked(&good));
        assert_eq!(fw.count("block"), 2);
        assert_eq!(fw.count("unblock"), 1);
    }

    #[tokio::test]
    async fn test_noop_firewall_never_fails() {
        let fw = NoopFirewall;
        fw.block(ip("10.0.0.1")).await.unwrap();
        fw.unblock(ip("10.0.0.1")).await.unwrap();
        assert!(!fw.is_active().await);
    }
}
