use kf_core::{CommandError, TransactionError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static FAILED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"line (\d+) failed").expect("static regex"));

pub const COMMIT: &str = "COMMIT";

/// One line of an `iptables-restore` program, chain declarations aside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Directive {
    Append {
        chain: String,
        rule: Vec<String>,
    },
    /// Insert at a 1-based position, or at the head of the chain.
    Insert {
        chain: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<usize>,
        rule: Vec<String>,
    },
    Delete {
        chain: String,
        rule: Vec<String>,
    },
    Flush {
        chain: String,
    },
    DeleteChain {
        chain: String,
    },
}

impl Directive {
    pub fn chain(&self) -> &str {
        match self {
            Directive::Append { chain, .. }
            | Directive::Insert { chain, .. }
            | Directive::Delete { chain, .. }
            | Directive::Flush { chain }
            | Directive::DeleteChain { chain } => chain,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Directive::Append { chain, rule } => rule_line("-A", chain, None, rule),
            Directive::Insert { chain, index, rule } => rule_line("-I", chain, *index, rule),
            Directive::Delete { chain, rule } => rule_line("-D", chain, None, rule),
            Directive::Flush { chain } => format!("-F {}", chain),
            Directive::DeleteChain { chain } => format!("-X {}", chain),
        }
    }
}

fn rule_line(flag: &str, chain: &str, index: Option<usize>, rule: &[String]) -> String {
    let mut line = format!("{} {}", flag, chain);
    if let Some(index) = index {
        line.push_str(&format!(" {}", index));
    }
    for arg in rule {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

/// iptables-restore splits on whitespace unless the argument is quoted.
fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(char::is_whitespace) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Convenience for building rule argument lists.
pub fn rule_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// An in-memory `iptables-restore` program for one table.
///
/// Chain declarations are always rendered right after the table header, so
/// every chain exists (and is flushed) before any rule mentions it. The
/// program always ends with `COMMIT`. Building does no I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTransaction {
    table: String,
    chains: Vec<String>,
    directives: Vec<Directive>,
    retired: Vec<String>,
}

impl RestoreTransaction {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            chains: vec![],
            directives: vec![],
            retired: vec![],
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the chain, or flush it if it already exists.
    pub fn declare_chain(&mut self, chain: &str) -> &mut Self {
        if !self.chains.iter().any(|c| c == chain) {
            self.chains.push(chain.to_string());
        }
        self
    }

    pub fn add(&mut self, directive: Directive) -> &mut Self {
        self.directives.push(directive);
        self
    }

    pub fn append(&mut self, chain: &str, rule: Vec<String>) -> &mut Self {
        self.add(Directive::Append {
            chain: chain.to_string(),
            rule,
        })
    }

    pub fn insert(&mut self, chain: &str, index: Option<usize>, rule: Vec<String>) -> &mut Self {
        self.add(Directive::Insert {
            chain: chain.to_string(),
            index,
            rule,
        })
    }

    pub fn delete(&mut self, chain: &str, rule: Vec<String>) -> &mut Self {
        self.add(Directive::Delete {
            chain: chain.to_string(),
            rule,
        })
    }

    pub fn flush(&mut self, chain: &str) -> &mut Self {
        self.add(Directive::Flush {
            chain: chain.to_string(),
        })
    }

    pub fn delete_chain(&mut self, chain: &str) -> &mut Self {
        self.add(Directive::DeleteChain {
            chain: chain.to_string(),
        })
    }

    /// Flush a policy chain now and destroy it later, once nothing can
    /// reference it anymore.
    pub fn retire(&mut self, chain: &str) -> &mut Self {
        if !self.retired.iter().any(|c| c == chain) {
            self.retired.push(chain.to_string());
            self.flush(chain);
        }
        self
    }

    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn retired(&self) -> &[String] {
        &self.retired
    }

    /// Every chain the program creates, flushes, edits or deletes.
    pub fn touched_chains(&self) -> impl Iterator<Item = &str> {
        self.chains
            .iter()
            .map(String::as_str)
            .chain(self.directives.iter().map(Directive::chain))
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty() && self.directives.is_empty()
    }

    /// Number of declarations and directives, header and COMMIT excluded.
    pub fn len(&self) -> usize {
        self.chains.len() + self.directives.len()
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.len() + 2);
        lines.push(format!("*{}", self.table));
        lines.extend(self.chains.iter().map(|c| format!(":{} - -", c)));
        lines.extend(self.directives.iter().map(Directive::render));
        lines.push(COMMIT.to_string());
        lines
    }

    pub fn render(&self) -> String {
        let mut program = self.lines().join("\n");
        program.push('\n');
        program
    }

    /// Wrap a failed restore, attributing it to a line when the tool said which.
    pub fn failure(&self, source: CommandError) -> TransactionError {
        let failed_line = match &source {
            CommandError::Exit { output, .. } => failed_line(output),
            _ => None,
        };
        let failed_directive =
            failed_line.and_then(|n| n.checked_sub(1).and_then(|i| self.lines().get(i).cloned()));

        TransactionError {
            directives: self.len(),
            failed_line,
            failed_directive,
            source,
        }
    }
}

/// Parse `iptables-restore: line N failed`.
pub fn failed_line(output: &str) -> Option<usize> {
    FAILED_LINE
        .captures(output)
        .and_then(|cap| cap[1].parse().ok())
}

/// A policy change as read from YAML or JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyChange {
    /// Chains to create or flush before the directives run.
    pub chains: Vec<String>,
    pub directives: Vec<Directive>,
    /// Policy chains to flush now and garbage-collect later.
    pub retire: Vec<String>,
}

impl PolicyChange {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// `.json` files are read as JSON, anything else as YAML.
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn into_transaction(self, table: &str) -> RestoreTransaction {
        let mut tx = RestoreTransaction::new(table);
        for chain in &self.chains {
            tx.declare_chain(chain);
        }
        for directive in self.directives {
            tx.add(directive);
        }
        for chain in &self.retire {
            tx.retire(chain);
        }
        tx
    }
}
