use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::{Error, Result};

/// Splits a command string into tokens on unquoted whitespace.
///
/// Single and double quotes group words; there are no backslash escapes
/// and no environment expansion. A service that needs shell semantics
/// must invoke the shell explicitly (`bash -c "..."`). An unterminated
/// quote consumes the rest of the string.
pub fn split_command(cmd: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for ch in cmd.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }

    if in_token {
        tokens.push(current);
    }
    tokens
}

/// Signal to deliver when asking a service to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopSignal {
    #[serde(rename = "SIGTERM")]
    Term,
    #[serde(rename = "SIGINT")]
    Int,
    #[serde(rename = "SIGQUIT")]
    Quit,
    #[serde(rename = "SIGHUP")]
    Hup,
    #[serde(rename = "SIGUSR1")]
    Usr1,
    #[serde(rename = "SIGUSR2")]
    Usr2,
    #[serde(rename = "SIGKILL")]
    Kill,
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::Term
    }
}

impl FromStr for StopSignal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SIGTERM" | "TERM" => Ok(StopSignal::Term),
            "SIGINT" | "INT" => Ok(StopSignal::Int),
            "SIGQUIT" | "QUIT" => Ok(StopSignal::Quit),
            "SIGHUP" | "HUP" => Ok(StopSignal::Hup),
            "SIGUSR1" | "USR1" => Ok(StopSignal::Usr1),
            "SIGUSR2" | "USR2" => Ok(StopSignal::Usr2),
            "SIGKILL" | "KILL" => Ok(StopSignal::Kill),
            other => Err(Error::InvalidConfig(format!("unknown signal '{other}'"))),
        }
    }
}

impl StopSignal {
    #[cfg(unix)]
    fn to_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Nix;
        match self {
            StopSignal::Term => Nix::SIGTERM,
            StopSignal::Int => Nix::SIGINT,
            StopSignal::Quit => Nix::SIGQUIT,
            StopSignal::Hup => Nix::SIGHUP,
            StopSignal::Usr1 => Nix::SIGUSR1,
            StopSignal::Usr2 => Nix::SIGUSR2,
            StopSignal::Kill => Nix::SIGKILL,
        }
    }
}

/// Delivers `signal` to `pid` without holding a child handle.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: StopSignal) -> Result<()> {
    use nix::sys::signal;
    use nix::unistd::Pid;
    signal::kill(Pid::from_raw(pid as i32), signal.to_nix())?;
    Ok(())
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, signal: StopSignal) -> Result<()> {
    // Closest-to-graceful mapping: only hard termination is available.
    match signal {
        StopSignal::Term | StopSignal::Int | StopSignal::Kill => Err(Error::Signal(
            "pid-based signalling is not supported on this platform".to_string(),
        )),
        other => Err(Error::Signal(format!(
            "signal {other:?} not supported on this platform"
        ))),
    }
}

/// Exit outcome of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    code: Option<i32>,
    signal: Option<i32>,
}

impl ExitStatus {
    pub fn from_std(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            #[cfg(unix)]
            signal: {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            },
            #[cfg(not(unix))]
            signal: None,
        }
    }

    pub fn new(code: Option<i32>, signal: Option<i32>) -> Self {
        Self { code, signal }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn code(&self) -> Option<i32> {
        self.code
    }

    pub fn signal(&self) -> Option<i32> {
        self.signal
    }

    /// Single integer surfaced to observers: the exit code when the child
    /// exited, `128 + signal` when it was killed.
    pub fn indicator(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

/// Builder for launching a service or probe command.
pub struct ServiceCommand {
    tokens: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    capture_output: bool,
}

impl ServiceCommand {
    /// Builds from an unparsed command string, tokenizing per
    /// [`split_command`].
    pub fn parse(cmd: &str) -> Self {
        Self {
            tokens: split_command(cmd),
            cwd: None,
            env: Vec::new(),
            capture_output: true,
        }
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (k, v) in vars {
            self.env.push((k.clone(), v.clone()));
        }
        self
    }

    /// Discards child stdout/stderr instead of piping them. Used for
    /// health probes, whose output is never captured.
    pub fn discard_output(mut self) -> Self {
        self.capture_output = false;
        self
    }

    pub fn spawn(self) -> Result<SpawnedChild> {
        let program = self
            .tokens
            .first()
            .ok_or_else(|| Error::Spawn("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.tokens[1..]).stdin(Stdio::null()).kill_on_drop(true);

        if self.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn(format!("{program}: exited before pid was known")))?;

        Ok(SpawnedChild { pid, child })
    }
}

/// A launched child process with captured streams.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: u32,
    child: Child,
}

impl SpawnedChild {
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Waits for the child to exit, reaping it.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        Ok(ExitStatus::from_std(status))
    }

    /// Hard-kills the child through the handle.
    pub async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}
