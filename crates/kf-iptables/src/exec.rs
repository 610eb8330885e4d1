use kf_core::{CommandError, ExitCode, IptablesConfig};
use std::future::Future;
use std::io;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, info};

pub const WAIT_FLAG: &str = "-w";
pub const CHECK_FLAG: &str = "-C";
pub const INSERT_FLAG: &str = "-I";
pub const APPEND_FLAG: &str = "-A";
pub const DELETE_FLAG: &str = "-D";
pub const FLUSH_FLAG: &str = "-F";
pub const DESTROY_FLAG: &str = "-X";
pub const TABLE_FLAG: &str = "-t";
pub const NUMERIC_FLAG: &str = "-n";
pub const LIST_FLAG: &str = "-L";
pub const LINE_NUMBERS_FLAG: &str = "--line-numbers";
pub const RESTORE_TABLE_FLAG: &str = "-T";
pub const NO_FLUSH_FLAG: &str = "--noflush";

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Raw result of a finished process. `code` is `None` when it was killed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessOutput {
    pub fn success(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: vec![],
        }
    }

    pub fn failure(code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            code: Some(code),
            stdout: vec![],
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr, like a combined-output capture.
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

impl From<std::process::Output> for ProcessOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Result of piping one command into a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeOutput {
    pub source_code: Option<i32>,
    pub source_stderr: Vec<u8>,
    pub filter: ProcessOutput,
}

/// OS process seam. Everything that touches the firewall goes through here,
/// so tests can swap in a simulated iptables.
pub trait CommandExecutor: Send + Sync {
    fn output(
        &self,
        cmd: &CommandSpec,
        stdin: Option<&str>,
    ) -> impl Future<Output = io::Result<ProcessOutput>> + Send;

    /// Run `source` with its stdout connected to the stdin of `filter`.
    /// Both processes are waited on before returning.
    fn pipe(
        &self,
        source: &CommandSpec,
        filter: &CommandSpec,
    ) -> impl Future<Output = io::Result<PipeOutput>> + Send;
}

/// Executes real processes with tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    async fn output(&self, cmd: &CommandSpec, stdin: Option<&str>) -> io::Result<ProcessOutput> {
        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let input_pipe = child.stdin.take();
        let writer = async move {
            let (Some(input), Some(mut pipe)) = (stdin, input_pipe) else {
                return Ok(());
            };
            match pipe.write_all(input.as_bytes()).await {
                // the tool quit before reading everything; its exit status says why
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                // dropping the pipe closes stdin so the tool sees EOF
                result => result,
            }
        };

        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output?;
        written?;
        Ok(output.into())
    }

    async fn pipe(&self, source: &CommandSpec, filter: &CommandSpec) -> io::Result<PipeOutput> {
        let mut producer = Command::new(&source.program)
            .args(&source.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = producer
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("source command has no stdout pipe"))?;
        let filter_stdin: Stdio = stdout.try_into()?;

        let consumer = Command::new(&filter.program)
            .args(&filter.args)
            .stdin(filter_stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let consumer = match consumer {
            Ok(child) => child,
            Err(e) => {
                let _ = producer.kill().await;
                return Err(e);
            }
        };

        let mut source_errors = producer.stderr.take();
        let read_errors = async {
            let mut buf = Vec::new();
            if let Some(stream) = source_errors.as_mut() {
                stream.read_to_end(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };
        let (filtered, source_stderr) = tokio::join!(consumer.wait_with_output(), read_errors);

        // always reap the source, otherwise defunct iptables processes pile up
        let source_status = producer.wait().await?;

        Ok(PipeOutput {
            source_code: source_status.code(),
            source_stderr: source_stderr?,
            filter: filtered?.into(),
        })
    }
}

/// Runs iptables, iptables-restore and the grep helper with the configured
/// lock wait, and turns exit statuses into [`CommandError`]s.
#[derive(Debug, Clone)]
pub struct IptablesRunner<E> {
    executor: E,
    binary: String,
    restore_binary: String,
    grep_binary: String,
    lock_wait: String,
    table: String,
}

impl<E: CommandExecutor> IptablesRunner<E> {
    pub fn new(executor: E, config: &IptablesConfig) -> Self {
        Self {
            executor,
            binary: config.binary.clone(),
            restore_binary: config.restore_binary.clone(),
            grep_binary: config.grep_binary.clone(),
            lock_wait: config.lock_wait_secs.to_string(),
            table: config.table.clone(),
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// `iptables -w <wait> -t <table> <operation> <args...>`
    pub async fn run(&self, operation: &str, args: &[String]) -> Result<(), CommandError> {
        let mut all_args = vec![
            WAIT_FLAG.to_string(),
            self.lock_wait.clone(),
            TABLE_FLAG.to_string(),
            self.table.clone(),
            operation.to_string(),
        ];
        all_args.extend(args.iter().cloned());
        let spec = CommandSpec::new(&self.binary, all_args);

        if operation == CHECK_FLAG {
            debug!(command = %spec.display(), "checking iptables rule");
        } else {
            info!(args = ?spec.args, "executing iptables command");
        }

        let output = self
            .executor
            .output(&spec, None)
            .await
            .map_err(|source| CommandError::Spawn {
                command: spec.display(),
                source,
            })?;
        classify(&spec, &output)
    }

    /// `-C`: `Ok(false)` when the tool says the rule does not exist.
    pub async fn check(&self, args: &[String]) -> Result<bool, CommandError> {
        match self.run(CHECK_FLAG, args).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Feed a restore program to `iptables-restore --noflush` in one call.
    pub async fn restore(&self, program: &str) -> Result<(), CommandError> {
        let spec = CommandSpec::new(
            &self.restore_binary,
            [
                WAIT_FLAG,
                self.lock_wait.as_str(),
                RESTORE_TABLE_FLAG,
                self.table.as_str(),
                NO_FLUSH_FLAG,
            ],
        );
        info!(command = %spec.display(), lines = program.lines().count(), "running restore");

        let output = self
            .executor
            .output(&spec, Some(program))
            .await
            .map_err(|source| CommandError::Spawn {
                command: spec.display(),
                source,
            })?;
        classify(&spec, &output)
    }

    /// `iptables -w <wait> -t <table> -n -L [chain] [--line-numbers]`
    pub fn list_command(&self, chain: Option<&str>) -> CommandSpec {
        let mut args = vec![
            WAIT_FLAG.to_string(),
            self.lock_wait.clone(),
            TABLE_FLAG.to_string(),
            self.table.clone(),
            NUMERIC_FLAG.to_string(),
            LIST_FLAG.to_string(),
        ];
        if let Some(chain) = chain {
            args.push(chain.to_string());
            args.push(LINE_NUMBERS_FLAG.to_string());
        }
        CommandSpec::new(&self.binary, args)
    }

    /// Pipe `listing` through `grep <pattern>`.
    ///
    /// `Ok(None)` means grep found nothing (its exit code 1). A failing
    /// listing command is an error even if grep happened to match.
    pub async fn grep(
        &self,
        listing: &CommandSpec,
        pattern: &str,
    ) -> Result<Option<String>, CommandError> {
        let grep = CommandSpec::new(&self.grep_binary, [pattern]);
        let command = format!("{} | {}", listing.display(), grep.display());

        let piped = self
            .executor
            .pipe(listing, &grep)
            .await
            .map_err(|source| CommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        match piped.source_code {
            Some(0) => {}
            Some(code) => {
                return Err(CommandError::Exit {
                    command: listing.display(),
                    code: ExitCode::from(code),
                    output: String::from_utf8_lossy(&piped.source_stderr)
                        .trim_end()
                        .to_string(),
                });
            }
            None => {
                return Err(CommandError::Signal {
                    command: listing.display(),
                });
            }
        }

        match piped.filter.code {
            Some(0) => Ok(Some(
                String::from_utf8_lossy(&piped.filter.stdout).into_owned(),
            )),
            Some(1) => Ok(None),
            Some(code) => Err(CommandError::Exit {
                command,
                code: ExitCode::from(code),
                output: piped.filter.combined().trim_end().to_string(),
            }),
            None => Err(CommandError::Signal { command }),
        }
    }
}

fn classify(spec: &CommandSpec, output: &ProcessOutput) -> Result<(), CommandError> {
    match output.code {
        Some(0) => Ok(()),
        Some(code) => Err(CommandError::Exit {
            command: spec.display(),
            code: ExitCode::from(code),
            output: output.combined().trim_end_matches('\n').to_string(),
        }),
        None => Err(CommandError::Signal {
            command: spec.display(),
        }),
    }
}
