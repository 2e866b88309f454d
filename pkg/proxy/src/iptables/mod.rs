//! NAT table driver: primitive chain/rule operations plus the one-time
//! bootstrap of the global chains every service hangs off.

pub mod exec;
pub mod memory;
pub mod rule;

pub use exec::{CommandExecutor, IptablesError, SystemExecutor};
pub use memory::MemoryTables;
pub use rule::{IptablesCommand, Operation, Rule};

use pkg_constants::iptables as ipt;
use std::sync::Arc;
use tracing::{debug, info};

/// Packet-filter driver bound to the nat table.
#[derive(Clone)]
pub struct PacketFilter {
    executor: Arc<dyn CommandExecutor>,
    table: String,
}

impl PacketFilter {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            table: ipt::NAT_TABLE.to_string(),
        }
    }

    async fn run(&self, chain: &str, operation: Operation) -> Result<String, IptablesError> {
        let command = IptablesCommand::new(&self.table, chain, operation);
        debug!("{}", command);
        self.executor.execute(&command).await
    }

    /// Run a query, mapping "does not exist" to `false`.
    async fn query(&self, chain: &str, operation: Operation) -> Result<bool, IptablesError> {
        match self.run(chain, operation).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn new_chain(&self, chain: &str) -> Result<(), IptablesError> {
        self.run(chain, Operation::NewChain).await.map(drop)
    }

    pub async fn append_rule(&self, chain: &str, rule: &Rule) -> Result<(), IptablesError> {
        self.run(chain, Operation::Append(rule.clone())).await.map(drop)
    }

    /// Insert at a 1-based position.
    pub async fn insert_rule(
        &self,
        chain: &str,
        index: u32,
        rule: &Rule,
    ) -> Result<(), IptablesError> {
        self.run(chain, Operation::Insert(index, rule.clone()))
            .await
            .map(drop)
    }

    pub async fn delete_rule_at(&self, chain: &str, index: u32) -> Result<(), IptablesError> {
        self.run(chain, Operation::DeleteAt(index)).await.map(drop)
    }

    /// Flush, then destroy.
    pub async fn delete_chain(&self, chain: &str) -> Result<(), IptablesError> {
        self.run(chain, Operation::FlushChain).await?;
        self.run(chain, Operation::DeleteChain).await.map(drop)
    }

    pub async fn chain_exists(&self, chain: &str) -> Result<bool, IptablesError> {
        self.query(chain, Operation::ListChain).await
    }

    pub async fn rule_exists(&self, chain: &str, rule: &Rule) -> Result<bool, IptablesError> {
        self.query(chain, Operation::Check(rule.clone())).await
    }

    /// Rule specs of `chain` in evaluation order, without the `-A <chain>` prefix.
    pub async fn list_rules(&self, chain: &str) -> Result<Vec<String>, IptablesError> {
        let out = self.run(chain, Operation::ListChain).await?;
        let prefix = format!("-A {} ", chain);
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .map(str::to_string)
            .collect())
    }

    /// Jump targets of `chain` in evaluation order. A missing chain has none.
    pub async fn jumps(&self, chain: &str) -> Result<Vec<String>, IptablesError> {
        let rules = match self.list_rules(chain).await {
            Ok(rules) => rules,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(rules
            .iter()
            .filter_map(|spec| jump_target(spec))
            .map(str::to_string)
            .collect())
    }

    /// Delete every rule of `chain` that jumps to `target`. Returns how many
    /// were deleted.
    pub async fn remove_jumps(&self, chain: &str, target: &str) -> Result<usize, IptablesError> {
        let positions: Vec<u32> = self
            .list_rules(chain)
            .await?
            .iter()
            .enumerate()
            .filter(|(_, spec)| jump_target(spec) == Some(target))
            .map(|(i, _)| i as u32 + 1)
            .collect();
        for position in positions.iter().rev() {
            self.delete_rule_at(chain, *position).await?;
        }
        Ok(positions.len())
    }

    /// Create `chain` unless present. Returns whether it was created.
    pub async fn ensure_chain(&self, chain: &str) -> Result<bool, IptablesError> {
        if self.chain_exists(chain).await? {
            return Ok(false);
        }
        self.new_chain(chain).await?;
        Ok(true)
    }

    /// Append `rule` unless an identical rule is present. Returns whether it was added.
    pub async fn ensure_rule(&self, chain: &str, rule: &Rule) -> Result<bool, IptablesError> {
        if self.rule_exists(chain, rule).await? {
            return Ok(false);
        }
        self.append_rule(chain, rule).await?;
        Ok(true)
    }

    /// Delete the chain if present. Returns whether it existed.
    pub async fn remove_chain(&self, chain: &str) -> Result<bool, IptablesError> {
        if !self.chain_exists(chain).await? {
            return Ok(false);
        }
        self.delete_chain(chain).await?;
        Ok(true)
    }

    /// Global entry chain hooked from PREROUTING and OUTPUT, the masquerade
    /// mark chain and the post-routing SNAT chain.
    pub async fn init_services_chain(&self) -> Result<(), IptablesError> {
        self.ensure_chain(ipt::KUBE_SERVICES_CHAIN).await?;
        let hook = Rule::new()
            .comment("kubernetes-services")
            .jump(ipt::KUBE_SERVICES_CHAIN);
        self.ensure_rule(ipt::PREROUTING_CHAIN, &hook)
            .await?;
        self.ensure_rule(ipt::OUTPUT_CHAIN, &hook)
            .await?;

        self.ensure_chain(ipt::KUBE_MARK_MASQ_CHAIN).await?;
        let mark = Rule::new()
            .comment("kubernetes-service-mark")
            .jump("MARK")
            .with(["--set-xmark", ipt::MASQ_MARK]);
        self.ensure_rule(ipt::KUBE_MARK_MASQ_CHAIN, &mark)
            .await?;

        self.ensure_chain(ipt::KUBE_POSTROUTING_CHAIN).await?;
        let hook = Rule::new()
            .comment("kubernetes-postrouting-rules")
            .jump(ipt::KUBE_POSTROUTING_CHAIN);
        self.ensure_rule(ipt::POSTROUTING_CHAIN, &hook)
            .await?;
        for rule in postrouting_rules() {
            self.ensure_rule(ipt::KUBE_POSTROUTING_CHAIN, &rule)
                .await?;
        }

        info!("Initialized {} chain", ipt::KUBE_SERVICES_CHAIN);
        Ok(())
    }

    /// NodePort entry chain, reached from the global chain for local destinations.
    pub async fn init_node_port_chain(&self) -> Result<(), IptablesError> {
        self.ensure_chain(ipt::KUBE_NODEPORT_CHAIN).await?;
        let hook = Rule::new()
            .comment("kubernetes-service-nodeports")
            .local_destination()
            .jump(ipt::KUBE_NODEPORT_CHAIN);
        self.ensure_rule(ipt::KUBE_SERVICES_CHAIN, &hook)
            .await?;

        info!("Initialized {} chain", ipt::KUBE_NODEPORT_CHAIN);
        Ok(())
    }
}

/// Target of the `-j` in a rule spec.
fn jump_target(spec: &str) -> Option<&str> {
    let mut words = spec.split_whitespace();
    words.by_ref().find(|w| *w == "-j")?;
    words.next()
}

fn postrouting_rules() -> [Rule; 3] {
    [
        Rule::new().not_marked(ipt::MASQ_MARK).jump("RETURN"),
        Rule::new()
            .jump("MARK")
            .with(["--set-xmark", ipt::MASQ_MARK_CLEAR]),
        Rule::new()
            .comment("kubernetes-service-traffic-requiring-SNAT")
            .jump("MASQUERADE")
            .with(["--random-fully"]),
    ]
}
