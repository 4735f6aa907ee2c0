use anyhow::{Context, Result};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, trace};

/// A builder describing one external command invocation.
///
/// Environment values and registered secrets never show up in `Debug` or
/// [`Cmd::display`], so a `Cmd` can be logged freely.
#[derive(Clone, Default)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    workdir: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    stream: bool,
    secrets: Vec<String>,
}

impl Cmd {
    /// Create a new command builder
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable on the child process
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &Path) -> Self {
        self.workdir = Some(path.to_path_buf());
        self
    }

    /// Pipe the given bytes to the child's stdin, then close it
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Echo stdout/stderr to the terminal while capturing them
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Mask this value wherever the command is displayed
    pub fn secret(mut self, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.secrets.push(value);
        }
        self
    }

    /// Human-readable command line with secrets masked.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&self.redact(arg));
        }
        line
    }

    fn redact(&self, text: &str) -> String {
        self.secrets
            .iter()
            .fold(text.to_string(), |acc, secret| acc.replace(secret, "***"))
    }
}

/// Accessors for asserting on built commands.
#[cfg(test)]
impl Cmd {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.iter().map(|(k, _)| k.as_str()).collect();
        f.debug_struct("Cmd")
            .field("command", &self.display())
            .field("env", &env_keys)
            .field("workdir", &self.workdir)
            .field("stdin_bytes", &self.stdin.as_ref().map(Vec::len))
            .field("stream", &self.stream)
            .finish()
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` if the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Exit code with signal terminations folded into a generic failure.
    pub fn code(&self) -> i32 {
        self.status.unwrap_or(1)
    }
}

/// Executes commands to completion.
///
/// `Err` means the process could not be started at all; a process that ran
/// and exited non-zero is an `Ok` with that status.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, cmd: &Cmd) -> Result<ProcessOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<ProcessOutput> {
        trace!(command = %cmd.display(), workdir = ?cmd.workdir, "cmd:run start");

        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        if let Some(dir) = &cmd.workdir {
            command.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to execute command: {}", cmd.display()))?;

        if let (Some(input), Some(mut pipe)) = (cmd.stdin.clone(), child.stdin.take()) {
            // Feed stdin from a thread so a chatty child can't deadlock us.
            thread::spawn(move || {
                let _ = pipe.write_all(&input);
            });
        }

        let child_stdout = child.stdout.take().context("child stdout not captured")?;
        let child_stderr = child.stderr.take().context("child stderr not captured")?;
        let stream = cmd.stream;

        let stdout_handle = thread::spawn(move || {
            let terminal = stream.then(std::io::stdout);
            pump_output(child_stdout, terminal)
        });
        let stderr_handle = thread::spawn(move || {
            let terminal = stream.then(std::io::stderr);
            pump_output(child_stderr, terminal)
        });

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for command: {}", cmd.display()))?;

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        let output = ProcessOutput {
            status: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };

        if output.success() {
            trace!(command = %cmd.program, "cmd:run success");
        } else {
            debug!(
                command = %cmd.display(),
                status = ?output.status,
                stderr = %output.stderr.trim(),
                "cmd:run non-zero exit"
            );
        }
        Ok(output)
    }
}

/// Copy a child pipe into a buffer, optionally echoing each chunk.
fn pump_output<R: Read, T: Write>(mut reader: R, mut terminal: Option<T>) -> Vec<u8> {
    let mut captured = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break, // EOF
            Ok(n) => {
                let data = &buf[..n];
                captured.extend_from_slice(data);
                if let Some(term) = terminal.as_mut() {
                    let _ = term.write_all(data);
                    let _ = term.flush();
                }
            }
            Err(_) => break,
        }
    }
    captured
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&Cmd) -> Result<ProcessOutput> + Send + Sync>;

    /// Records every invocation and answers from a closure.
    pub struct ScriptedRunner {
        calls: Mutex<Vec<Cmd>>,
        responder: Responder,
    }

    impl ScriptedRunner {
        pub fn new(responder: impl Fn(&Cmd) -> Result<ProcessOutput> + Send + Sync + 'static) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responder: Box::new(responder),
            }
        }

        /// A runner that answers every command with exit 0 and the given stdout.
        pub fn succeeding(stdout: &str) -> Self {
            let stdout = stdout.to_string();
            Self::new(move |_| Ok(ok_output(&stdout)))
        }

        pub fn calls(&self) -> Vec<Cmd> {
            self.calls.lock().unwrap().clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl ProcessRunner for ScriptedRunner {
        fn run(&self, cmd: &Cmd) -> Result<ProcessOutput> {
            self.calls.lock().unwrap().push(cmd.clone());
            (self.responder)(cmd)
        }
    }

    pub fn ok_output(stdout: &str) -> ProcessOutput {
        ProcessOutput {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed_output(code: i32, stderr: &str) -> ProcessOutput {
        ProcessOutput {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}
