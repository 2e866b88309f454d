use std::fmt;

/// A single NAT rule: optional provenance comment, match arguments and a target.
///
/// Rendered as `-m comment --comment <c> <matches...> -j <target> <target options...>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rule {
    comment: Option<String>,
    matches: Vec<String>,
    target: Vec<String>,
}

impl Rule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        let comment = comment.into();
        self.comment = (!comment.is_empty()).then_some(comment);
        self
    }

    pub fn source(self, cidr: &str) -> Self {
        self.matching(["-s", cidr])
    }

    pub fn not_source(self, cidr: &str) -> Self {
        self.matching(["!", "-s", cidr])
    }

    pub fn destination(self, cidr: &str) -> Self {
        self.matching(["-d", cidr])
    }

    /// `-p tcp -m tcp`
    pub fn tcp(self) -> Self {
        self.matching(["-p", "tcp", "-m", "tcp"])
    }

    pub fn dport(self, port: u16) -> Self {
        self.matching(["--dport".to_string(), port.to_string()])
    }

    pub fn not_marked(self, mark: &str) -> Self {
        self.matching(["-m", "mark", "!", "--mark", mark])
    }

    pub fn local_destination(self) -> Self {
        self.matching(["-m", "addrtype", "--dst-type", "LOCAL"])
    }

    /// Match with the given probability. Zero leaves the rule unconditional.
    pub fn probability(self, p: f64) -> Self {
        if p == 0.0 {
            return self;
        }
        self.matching([
            "-m".to_string(),
            "statistic".to_string(),
            "--mode".to_string(),
            "random".to_string(),
            "--probability".to_string(),
            format!("{:.6}", p),
        ])
    }

    pub fn jump(mut self, target: &str) -> Self {
        self.target = vec!["-j".to_string(), target.to_string()];
        self
    }

    /// Extra target options, e.g. `--set-xmark 0x4000/0x4000`.
    pub fn with<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target.extend(options.into_iter().map(Into::into));
        self
    }

    fn matching<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.matches.extend(args.into_iter().map(Into::into));
        self
    }

    /// The chain or builtin target this rule jumps to.
    pub fn target(&self) -> Option<&str> {
        self.target.get(1).map(String::as_str)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.matches.len() + self.target.len() + 4);
        if let Some(comment) = &self.comment {
            args.extend(["-m", "comment", "--comment"].map(String::from));
            args.push(comment.clone());
        }
        args.extend(self.matches.iter().cloned());
        args.extend(self.target.iter().cloned());
        args
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

/// What to do to a chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    NewChain,
    FlushChain,
    DeleteChain,
    /// `-S`: dump the chain in rule-spec form.
    ListChain,
    Append(Rule),
    /// 1-based position.
    Insert(u32, Rule),
    /// 1-based position.
    DeleteAt(u32),
    Check(Rule),
}

/// One `iptables` invocation against a single chain.
#[derive(Debug, Clone, PartialEq)]
pub struct IptablesCommand {
    pub table: String,
    pub chain: String,
    pub operation: Operation,
}

impl IptablesCommand {
    pub fn new(table: &str, chain: &str, operation: Operation) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            operation,
        }
    }

    /// Whether the command only reads state.
    pub fn is_query(&self) -> bool {
        matches!(self.operation, Operation::ListChain | Operation::Check(_))
    }

    /// Arguments passed to the iptables binary. `-w` waits for the xtables lock.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-w".to_string(), "-t".to_string(), self.table.clone()];
        let chain = self.chain.clone();
        match &self.operation {
            Operation::NewChain => args.extend(["-N".to_string(), chain]),
            Operation::FlushChain => args.extend(["-F".to_string(), chain]),
            Operation::DeleteChain => args.extend(["-X".to_string(), chain]),
            Operation::ListChain => args.extend(["-S".to_string(), chain]),
            Operation::Append(rule) => {
                args.extend(["-A".to_string(), chain]);
                args.extend(rule.args());
            }
            Operation::Insert(index, rule) => {
                args.extend(["-I".to_string(), chain, index.to_string()]);
                args.extend(rule.args());
            }
            Operation::DeleteAt(index) => {
                args.extend(["-D".to_string(), chain, index.to_string()]);
            }
            Operation::Check(rule) => {
                args.extend(["-C".to_string(), chain]);
                args.extend(rule.args());
            }
        }
        args
    }
}

impl fmt::Display for IptablesCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iptables {}", self.args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_comment_before_matches() {
        let rule = Rule::new()
            .comment("default/web:http-clusterIP")
            .destination("10.96.0.1/32")
            .tcp()
            .dport(80)
            .jump("KUBE-SVC-ABC");
        assert_eq!(
            rule.to_string(),
            "-m comment --comment default/web:http-clusterIP -d 10.96.0.1/32 -p tcp -m tcp --dport 80 -j KUBE-SVC-ABC"
        );
        assert_eq!(rule.target(), Some("KUBE-SVC-ABC"));
    }

    #[test]
    fn zero_probability_is_unconditional() {
        let rule = Rule::new().probability(0.0).jump("KUBE-SEP-X");
        assert_eq!(rule.to_string(), "-j KUBE-SEP-X");

        let rule = Rule::new().probability(1.0 / 3.0).jump("KUBE-SEP-X");
        assert_eq!(
            rule.to_string(),
            "-m statistic --mode random --probability 0.333333 -j KUBE-SEP-X"
        );
    }

    #[test]
    fn empty_comment_is_omitted() {
        let rule = Rule::new().comment("").jump("RETURN");
        assert_eq!(rule.args(), vec!["-j", "RETURN"]);
    }

    #[test]
    fn command_args_wait_for_lock() {
        let cmd = IptablesCommand::new("nat", "KUBE-SVC-A", Operation::Insert(2, Rule::new().jump("KUBE-SEP-B")));
        assert_eq!(
            cmd.to_string(),
            "iptables -w -t nat -I KUBE-SVC-A 2 -j KUBE-SEP-B"
        );
        assert!(!cmd.is_query());
        assert!(IptablesCommand::new("nat", "X", Operation::ListChain).is_query());
    }
}
