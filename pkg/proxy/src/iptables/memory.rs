//! In-process packet filter with iptables chain and rule semantics.
//!
//! Backs dry-run mode and the reconciliation tests. Only the operations the
//! proxy issues are modelled; matches are compared textually.

use async_trait::async_trait;
use pkg_constants::iptables as ipt;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

use super::exec::{CommandExecutor, IptablesError};
use super::rule::{IptablesCommand, Operation, Rule};

const BUILTIN_CHAINS: [&str; 4] = [
    ipt::PREROUTING_CHAIN,
    "INPUT",
    ipt::OUTPUT_CHAIN,
    ipt::POSTROUTING_CHAIN,
];

const BUILTIN_TARGETS: [&str; 7] = [
    "ACCEPT",
    "DROP",
    "RETURN",
    "MARK",
    "MASQUERADE",
    "DNAT",
    "SNAT",
];

#[derive(Default)]
struct State {
    /// Keyed by `(table, chain)`.
    chains: BTreeMap<(String, String), Vec<Rule>>,
    history: Vec<String>,
    rejected: HashSet<String>,
}

impl State {
    fn chain(&self, table: &str, chain: &str) -> Option<&Vec<Rule>> {
        self.chains.get(&(table.to_string(), chain.to_string()))
    }

    fn chain_mut(&mut self, table: &str, chain: &str) -> Option<&mut Vec<Rule>> {
        self.chains.get_mut(&(table.to_string(), chain.to_string()))
    }

    fn is_referenced(&self, table: &str, chain: &str) -> bool {
        self.chains
            .iter()
            .filter(|((t, _), _)| t == table)
            .flat_map(|(_, rules)| rules.iter())
            .any(|rule| rule.target() == Some(chain))
    }
}

pub struct MemoryTables {
    state: Mutex<State>,
    announce: bool,
}

impl Default for MemoryTables {
    fn default() -> Self {
        let mut state = State::default();
        for chain in BUILTIN_CHAINS {
            state
                .chains
                .insert((ipt::NAT_TABLE.to_string(), chain.to_string()), Vec::new());
        }
        Self {
            state: Mutex::new(state),
            announce: false,
        }
    }
}

fn exit(command: &IptablesCommand, status: i32, stderr: &str) -> IptablesError {
    IptablesError::Exit {
        command: command.to_string(),
        status,
        stderr: format!("iptables: {}", stderr),
    }
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Like `new`, but every mutating command is logged at info level.
    pub fn dry_run() -> Self {
        Self {
            announce: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every mutating command on `chain` fail.
    pub fn reject_chain(&self, chain: &str) {
        self.lock().rejected.insert(chain.to_string());
    }

    pub fn chain_exists(&self, chain: &str) -> bool {
        self.lock().chain(ipt::NAT_TABLE, chain).is_some()
    }

    /// Rules of a nat chain in evaluation order, rendered as rule specs.
    pub fn rules(&self, chain: &str) -> Vec<String> {
        self.lock()
            .chain(ipt::NAT_TABLE, chain)
            .map(|rules| rules.iter().map(Rule::to_string).collect())
            .unwrap_or_default()
    }

    /// User-defined nat chains.
    pub fn chains(&self) -> Vec<String> {
        self.lock()
            .chains
            .keys()
            .filter(|(table, chain)| {
                table == ipt::NAT_TABLE && !BUILTIN_CHAINS.contains(&chain.as_str())
            })
            .map(|(_, chain)| chain.clone())
            .collect()
    }

    /// Successful mutating commands, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    fn apply(state: &mut State, command: &IptablesCommand) -> Result<String, IptablesError> {
        let table = command.table.as_str();
        let name = command.chain.as_str();

        if !command.is_query() && state.rejected.contains(name) {
            return Err(IptablesError::Rejected {
                command: command.to_string(),
                reason: format!("chain {} is rejecting changes", name),
            });
        }

        if let Operation::NewChain = command.operation {
            if state.chain(table, name).is_some() {
                return Err(exit(command, 1, "Chain already exists."));
            }
            state
                .chains
                .insert((table.to_string(), name.to_string()), Vec::new());
            return Ok(String::new());
        }

        if state.chain(table, name).is_none() {
            return Err(exit(command, 1, "No chain/target/match by that name."));
        }

        if let Operation::Append(rule) | Operation::Insert(_, rule) = &command.operation {
            if let Some(target) = rule.target() {
                if !BUILTIN_TARGETS.contains(&target) && state.chain(table, target).is_none() {
                    return Err(exit(command, 2, "Couldn't load target."));
                }
            }
        }

        if let Operation::DeleteChain = command.operation {
            if BUILTIN_CHAINS.contains(&name) {
                return Err(exit(command, 2, "Cannot delete built-in chain."));
            }
            if state.chain(table, name).is_some_and(|rules| !rules.is_empty()) {
                return Err(exit(command, 1, "Directory not empty."));
            }
            if state.is_referenced(table, name) {
                return Err(exit(command, 1, "Too many links."));
            }
            state.chains.remove(&(table.to_string(), name.to_string()));
            return Ok(String::new());
        }

        let Some(rules) = state.chain_mut(table, name) else {
            return Err(exit(command, 1, "No chain/target/match by that name."));
        };

        match &command.operation {
            Operation::FlushChain => rules.clear(),
            Operation::ListChain => {
                let header = if BUILTIN_CHAINS.contains(&name) {
                    format!("-P {} ACCEPT", name)
                } else {
                    format!("-N {}", name)
                };
                let mut out = vec![header];
                out.extend(rules.iter().map(|r| format!("-A {} {}", name, r)));
                return Ok(out.join("\n") + "\n");
            }
            Operation::Append(rule) => rules.push(rule.clone()),
            Operation::Insert(index, rule) => {
                let pos = *index as usize;
                if pos == 0 || pos > rules.len() + 1 {
                    return Err(exit(command, 1, "Index of insertion too big."));
                }
                rules.insert(pos - 1, rule.clone());
            }
            Operation::DeleteAt(index) => {
                let pos = *index as usize;
                if pos == 0 || pos > rules.len() {
                    return Err(exit(command, 1, "Index of deletion too big."));
                }
                rules.remove(pos - 1);
            }
            Operation::Check(rule) => {
                if !rules.contains(rule) {
                    return Err(exit(
                        command,
                        1,
                        "Bad rule (does a matching rule exist in that chain?).",
                    ));
                }
                return Ok(String::new());
            }
            Operation::NewChain | Operation::DeleteChain => {}
        }
        Ok(String::new())
    }
}

#[async_trait]
impl CommandExecutor for MemoryTables {
    async fn execute(&self, command: &IptablesCommand) -> Result<String, IptablesError> {
        let mut state = self.lock();
        let out = Self::apply(&mut state, command)?;
        if !command.is_query() {
            if self.announce {
                info!("dry-run: {}", command);
            }
            state.history.push(command.to_string());
        }
        Ok(out)
    }
}
