//! In-memory iptables for unit tests.

use crate::exec::{CommandExecutor, CommandSpec, PipeOutput, ProcessOutput};
use kf_core::{ErrorId, ErrorRecorder};
use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

const BUILTIN_CHAINS: [&str; 3] = ["INPUT", "FORWARD", "OUTPUT"];
const BUILTIN_TARGETS: [&str; 6] = ["ACCEPT", "DROP", "RETURN", "MARK", "REJECT", "LOG"];

pub fn rule(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[derive(Debug, Clone, Default)]
struct Table {
    chains: BTreeMap<String, Vec<Vec<String>>>,
}

impl Table {
    fn target_missing(&self, rule: &[String]) -> bool {
        jump_target(rule).is_some_and(|t| {
            !BUILTIN_TARGETS.contains(&t) && !self.chains.contains_key(t)
        })
    }

    fn references(&self, chain: &str) -> usize {
        self.chains
            .values()
            .flatten()
            .filter(|r| jump_target(r) == Some(chain))
            .count()
    }

    /// Apply one mutating operation; `Err` carries the exit code.
    fn apply(&mut self, op: &str, chain: &str, rest: &[String]) -> Result<(), i32> {
        match op {
            "-A" => {
                if self.target_missing(rest) {
                    return Err(2);
                }
                self.chains.get_mut(chain).ok_or(1)?.push(rest.to_vec());
            }
            "-I" => {
                let (index, rule) = match rest.first().and_then(|a| a.parse::<usize>().ok()) {
                    Some(index) => (index, &rest[1..]),
                    None => (1, rest),
                };
                if self.target_missing(rule) {
                    return Err(2);
                }
                let rules = self.chains.get_mut(chain).ok_or(1)?;
                if index == 0 || index > rules.len() + 1 {
                    return Err(1);
                }
                rules.insert(index - 1, rule.to_vec());
            }
            "-D" => {
                if self.target_missing(rest) {
                    return Err(2);
                }
                let rules = self.chains.get_mut(chain).ok_or(1)?;
                let pos = rules.iter().position(|r| r == rest).ok_or(1)?;
                rules.remove(pos);
            }
            "-C" => {
                if self.target_missing(rest) {
                    return Err(2);
                }
                let rules = self.chains.get(chain).ok_or(1)?;
                if !rules.iter().any(|r| r == rest) {
                    return Err(1);
                }
            }
            "-F" => {
                self.chains.get_mut(chain).ok_or(1)?.clear();
            }
            "-X" => {
                if BUILTIN_CHAINS.contains(&chain) || !self.chains.contains_key(chain) {
                    return Err(1);
                }
                self.chains.remove(chain);
            }
            _ => return Err(2),
        }
        Ok(())
    }

    fn list_chain(&self, chain: &str) -> Result<String, i32> {
        let rules = self.chains.get(chain).ok_or(1)?;
        let mut out = format!("{}\n", self.chain_header(chain));
        out.push_str("num  target     prot opt source               destination\n");
        for (i, rule) in rules.iter().enumerate() {
            out.push_str(&row(Some(i + 1), rule));
        }
        Ok(out)
    }

    fn list_all(&self) -> String {
        let mut out = String::new();
        for (chain, rules) in &self.chains {
            out.push_str(&format!("{}\n", self.chain_header(chain)));
            out.push_str("target     prot opt source               destination\n");
            for rule in rules {
                out.push_str(&row(None, rule));
            }
            out.push('\n');
        }
        out
    }

    fn chain_header(&self, chain: &str) -> String {
        if BUILTIN_CHAINS.contains(&chain) {
            format!("Chain {} (policy ACCEPT)", chain)
        } else {
            format!("Chain {} ({} references)", chain, self.references(chain))
        }
    }
}

fn jump_target(rule: &[String]) -> Option<&str> {
    rule.iter()
        .position(|a| a == "-j")
        .and_then(|i| rule.get(i + 1))
        .map(String::as_str)
}

fn row(num: Option<usize>, rule: &[String]) -> String {
    let target = jump_target(rule).unwrap_or("");
    let extra = rule.join(" ");
    match num {
        Some(n) => format!(
            "{:<4} {:<12} all  --  0.0.0.0/0            0.0.0.0/0            {}\n",
            n, target, extra
        ),
        None => format!(
            "{:<12} all  --  0.0.0.0/0            0.0.0.0/0            {}\n",
            target, extra
        ),
    }
}

/// Split a restore line, honoring double quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_token = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

#[derive(Debug, Clone)]
struct Injected {
    program: Option<String>,
    tokens: Vec<String>,
    code: i32,
    stderr: String,
}

#[derive(Debug, Default)]
struct State {
    table: Table,
    calls: Vec<CommandSpec>,
    restores: Vec<String>,
    failures: Vec<Injected>,
}

impl State {
    fn injected(&self, cmd: &CommandSpec) -> Option<ProcessOutput> {
        self.failures
            .iter()
            .find(|f| {
                f.program.as_ref().is_none_or(|p| *p == cmd.program)
                    && f.tokens.iter().all(|t| cmd.args.contains(t))
            })
            .map(|f| ProcessOutput::failure(f.code, f.stderr.clone()))
    }

    fn run_iptables(&mut self, args: &[String]) -> ProcessOutput {
        let mut op = None;
        let mut chain = None;
        let mut rest = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = args[i].as_str();
            match arg {
                "-w" | "-t" if op.is_none() => i += 1,
                "-n" | "--line-numbers" if op.is_none() || op == Some("-L") => {}
                "-C" | "-I" | "-A" | "-D" | "-F" | "-X" | "-L" if op.is_none() => {
                    op = Some(arg);
                    if let Some(next) = args.get(i + 1).filter(|a| !a.starts_with('-')) {
                        chain = Some(next.clone());
                        i += 1;
                    }
                }
                _ => rest.push(args[i].clone()),
            }
            i += 1;
        }

        let Some(op) = op else {
            return ProcessOutput::failure(2, "no command specified");
        };

        if op == "-L" {
            return match chain {
                Some(chain) => match self.table.list_chain(&chain) {
                    Ok(out) => ProcessOutput::success(out),
                    Err(code) => ProcessOutput::failure(
                        code,
                        format!("iptables: No chain/target/match by that name: {}", chain),
                    ),
                },
                None => ProcessOutput::success(self.table.list_all()),
            };
        }

        let Some(chain) = chain else {
            return ProcessOutput::failure(2, "chain name required");
        };
        match self.table.apply(op, &chain, &rest) {
            Ok(()) => ProcessOutput::success(""),
            Err(1) => ProcessOutput::failure(
                1,
                "iptables: Bad rule (does a matching rule exist in that chain?).\n",
            ),
            Err(code) => ProcessOutput::failure(code, "iptables: Couldn't load target.\n"),
        }
    }

    fn run_restore(&mut self, program: &str) -> ProcessOutput {
        self.restores.push(program.to_string());
        let mut staged = self.table.clone();

        for (i, line) in program.lines().enumerate() {
            let line_no = i + 1;
            let failed = || {
                ProcessOutput::failure(1, format!("iptables-restore: line {} failed\n", line_no))
            };

            if line.starts_with('*') || line == "COMMIT" || line.trim().is_empty() {
                continue;
            }
            if let Some(decl) = line.strip_prefix(':') {
                let Some(name) = decl.split_whitespace().next() else {
                    return failed();
                };
                staged.chains.entry(name.to_string()).or_default().clear();
                continue;
            }

            let tokens = tokenize(line);
            let (Some(op), Some(chain)) = (tokens.first(), tokens.get(1)) else {
                return failed();
            };
            if staged.apply(op, chain, &tokens[2..]).is_err() {
                return failed();
            }
        }

        if !program.trim_end().ends_with("COMMIT") {
            return ProcessOutput::failure(1, "iptables-restore: COMMIT expected\n");
        }
        self.table = staged;
        ProcessOutput::success("")
    }
}

/// Simulated `iptables`, `iptables-restore` and `grep`.
///
/// Clones share state, so a test can keep a handle after moving one into a
/// manager.
#[derive(Debug, Clone)]
pub struct FakeIptables {
    state: Arc<Mutex<State>>,
}

impl FakeIptables {
    pub fn new() -> Self {
        let mut table = Table::default();
        for chain in BUILTIN_CHAINS {
            table.chains.insert(chain.to_string(), vec![]);
        }
        Self {
            state: Arc::new(Mutex::new(State {
                table,
                ..State::default()
            })),
        }
    }

    pub fn with_chain(self, chain: &str) -> Self {
        self.add_chain(chain);
        self
    }

    /// kube-proxy style: `KUBE-SERVICES` exists and FORWARD jumps to it.
    pub fn with_services_jump(self) -> Self {
        self.add_chain("KUBE-SERVICES");
        self.push_forward(&["-j", "KUBE-SERVICES", "-m", "conntrack", "--ctstate", "NEW"]);
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_chain(&self, chain: &str) {
        self.state()
            .table
            .chains
            .entry(chain.to_string())
            .or_default();
    }

    pub fn add_rule(&self, chain: &str, args: &[&str]) {
        self.state()
            .table
            .chains
            .entry(chain.to_string())
            .or_default()
            .push(rule(args));
    }

    pub fn push_forward(&self, args: &[&str]) {
        self.add_rule("FORWARD", args);
    }

    pub fn has_chain(&self, chain: &str) -> bool {
        self.state().table.chains.contains_key(chain)
    }

    pub fn chain_names(&self) -> Vec<String> {
        self.state().table.chains.keys().cloned().collect()
    }

    pub fn rules(&self, chain: &str) -> Vec<String> {
        self.state()
            .table
            .chains
            .get(chain)
            .map(|rules| rules.iter().map(|r| r.join(" ")).collect())
            .unwrap_or_default()
    }

    /// Jump targets of FORWARD, top to bottom.
    pub fn forward_targets(&self) -> Vec<String> {
        self.state().table.chains["FORWARD"]
            .iter()
            .map(|r| jump_target(r).unwrap_or("").to_string())
            .collect()
    }

    /// Fail every invocation of any program whose arguments contain `op`.
    pub fn fail_on(&self, op: &str, code: i32) {
        self.fail_when(&[op], code);
    }

    /// Fail invocations whose arguments contain all of `tokens`.
    pub fn fail_when(&self, tokens: &[&str], code: i32) {
        self.state().failures.push(Injected {
            program: None,
            tokens: rule(tokens),
            code,
            stderr: format!("injected failure {}\n", code),
        });
    }

    pub fn fail_restore(&self, code: i32, stderr: &str) {
        self.state().failures.push(Injected {
            program: Some("iptables-restore".to_string()),
            tokens: vec![],
            code,
            stderr: stderr.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state().calls.clone()
    }

    /// Calls that can change firewall state.
    pub fn mutating_calls(&self) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| {
                c.program == "iptables-restore"
                    || c.args
                        .iter()
                        .any(|a| matches!(a.as_str(), "-A" | "-I" | "-D" | "-F" | "-X"))
            })
            .collect()
    }

    /// Calls destroying `chain`.
    pub fn destroy_calls(&self, chain: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.args.iter().any(|a| a == "-X") && c.args.last().is_some_and(|a| a == chain))
            .count()
    }

    pub fn restore_programs(&self) -> Vec<String> {
        self.state().restores.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state();
        state.calls.clear();
        state.restores.clear();
    }

    fn execute(&self, cmd: &CommandSpec, stdin: Option<&str>) -> ProcessOutput {
        let mut state = self.state();
        state.calls.push(cmd.clone());
        if let Some(out) = state.injected(cmd) {
            if cmd.program == "iptables-restore" {
                state.restores.push(stdin.unwrap_or_default().to_string());
            }
            return out;
        }
        match cmd.program.as_str() {
            "iptables" => state.run_iptables(&cmd.args),
            "iptables-restore" => state.run_restore(stdin.unwrap_or_default()),
            other => ProcessOutput::failure(127, format!("{}: command not found", other)),
        }
    }
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

/// `grep` with BRE `\|` alternation of fixed strings.
fn grep(pattern: &str, input: &[u8]) -> ProcessOutput {
    let alternatives: Vec<&str> = pattern.split("\\|").collect();
    let text = String::from_utf8_lossy(input);
    let matched: String = text
        .lines()
        .filter(|line| alternatives.iter().any(|alt| line.contains(alt)))
        .map(|line| format!("{}\n", line))
        .collect();

    if matched.is_empty() {
        ProcessOutput::failure(1, "")
    } else {
        ProcessOutput::success(matched)
    }
}

impl CommandExecutor for FakeIptables {
    async fn output(&self, cmd: &CommandSpec, stdin: Option<&str>) -> io::Result<ProcessOutput> {
        Ok(self.execute(cmd, stdin))
    }

    async fn pipe(&self, source: &CommandSpec, filter: &CommandSpec) -> io::Result<PipeOutput> {
        let produced = self.execute(source, None);
        self.state().calls.push(filter.clone());
        let pattern = filter.args.first().map(String::as_str).unwrap_or_default();

        Ok(PipeOutput {
            source_code: produced.code,
            source_stderr: produced.stderr,
            filter: grep(pattern, &produced.stdout),
        })
    }
}

/// Keeps every recorded error for assertions.
#[derive(Debug, Clone, Default)]
pub struct CapturingRecorder {
    events: Arc<Mutex<Vec<(ErrorId, String)>>>,
}

impl CapturingRecorder {
    pub fn events(&self) -> Vec<(ErrorId, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn ids(&self) -> Vec<ErrorId> {
        self.events().into_iter().map(|(id, _)| id).collect()
    }
}

impl ErrorRecorder for CapturingRecorder {
    fn record_error(&self, id: ErrorId, message: &str) {
        self.events.lock().unwrap().push((id, message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_is_all_or_nothing() {
        let fake = FakeIptables::new();
        let mut state = fake.state();
        let out = state.run_restore("*filter\n:KFENCE - -\n-A KFENCE -j MISSING\nCOMMIT\n");

        assert_eq!(out.code, Some(1));
        assert!(out.combined().contains("line 3 failed"));
        assert!(!state.table.chains.contains_key("KFENCE"));
    }

    #[test]
    fn tokenizer_keeps_quoted_arguments() {
        assert_eq!(
            tokenize(r#"-A X -m comment --comment "a b" -j ACCEPT"#),
            rule(&["-A", "X", "-m", "comment", "--comment", "a b", "-j", "ACCEPT"])
        );
    }

    #[test]
    fn grep_alternation() {
        let out = grep("Chain A-\\|Chain B-", b"Chain A-1 (0 references)\nChain C\nChain B-2 (1 references)\n");
        assert_eq!(
            String::from_utf8(out.stdout).unwrap(),
            "Chain A-1 (0 references)\nChain B-2 (1 references)\n"
        );
    }
}
