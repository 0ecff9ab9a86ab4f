//! Execution wrapper for the collaborator tools (`cryptsetup`, `tpm2_*`,
//! `mkinitcpio`, `objcopy`, `efibootmgr`, `lsblk`).
//!
//! Everything that shells out goes through [`CommandRunner`] so the
//! provisioning logic can be driven by a scripted runner in tests.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to execute `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` exited with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
}

pub type Result<T, E = ExecError> = core::result::Result<T, E>;

/// A single collaborator invocation.
#[derive(Clone)]
pub struct Cmd {
    program: PathBuf,
    args: Vec<OsString>,
    stdin: Option<Zeroizing<Vec<u8>>>,
}

impl Cmd {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Bytes written to the child's stdin. Never shown in logs.
    pub fn stdin(mut self, payload: &[u8]) -> Self {
        self.stdin = Some(Zeroizing::new(payload.to_vec()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// File name of the program, e.g. `cryptsetup`.
    pub fn name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Value following `flag` in the argument list.
    pub fn arg_after(&self, flag: &str) -> Option<&OsStr> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(OsString::as_os_str)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("command", &self.to_string())
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Output {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Turn a non-zero exit status into [`ExecError::Failed`].
    pub fn check(self, cmd: &Cmd) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(ExecError::Failed {
            program: cmd.name(),
            status: self.status,
            stderr: self.stderr.trim().to_string(),
        })
    }
}

pub trait CommandRunner {
    fn run(&self, cmd: &Cmd) -> Result<Output>;
}

/// Runs commands on the host, blocking until each one exits.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &Cmd) -> Result<Output> {
        log::debug!("*{}", cmd);
        let spawn_err = |source| ExecError::Spawn {
            program: cmd.name(),
            source,
        };

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(match cmd.stdin {
                Some(_) => Stdio::piped(),
                None => Stdio::null(),
            });

        let mut child = command.spawn().map_err(spawn_err)?;
        if let (Some(payload), Some(mut stdin)) = (cmd.stdin.as_ref(), child.stdin.take()) {
            stdin.write_all(payload).map_err(spawn_err)?;
        }
        let out = child.wait_with_output().map_err(spawn_err)?;

        Ok(Output {
            status: out.status.code().unwrap_or(-1),
            stdout: out.stdout,
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}
