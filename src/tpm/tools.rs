//! [`TpmBackend`] over the `tpm2-tools` command line, the same tools the
//! early-boot hook uses to unseal.

use super::pcr::{parse_pcr_read, PcrSelection, PcrValues};
use super::{PersistentHandle, Result, TpmBackend, TpmError};
use crate::exec::{Cmd, CommandRunner, ExecError};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const PRIMARY_CTX: &str = "primary.ctx";
const POLICY: &str = "pcr.policy";
const SEAL_PUB: &str = "seal.pub";
const SEAL_PRIV: &str = "seal.priv";
const SEAL_CTX: &str = "seal.ctx";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictAction {
    Persisted,
    Evicted,
}

/// Parsed `tpm2_evictcontrol` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictOutput {
    pub handle: PersistentHandle,
    pub action: EvictAction,
}

/// Grammar:
///
/// ```text
/// persistent-handle: 0x81000000
/// action: persisted
/// ```
pub fn parse_evict_output(output: &str) -> Result<EvictOutput> {
    let unexpected = || TpmError::UnexpectedOutput {
        tool: "tpm2_evictcontrol",
        output: output.trim().to_string(),
    };
    let mut handle = None;
    let mut action = None;

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (key, value) = line.split_once(':').ok_or_else(unexpected)?;
        match (key.trim(), value.trim()) {
            ("persistent-handle", value) => {
                handle = Some(value.parse::<PersistentHandle>().map_err(|_| unexpected())?)
            }
            ("action", "persisted") => action = Some(EvictAction::Persisted),
            ("action", "evicted") => action = Some(EvictAction::Evicted),
            _ => return Err(unexpected()),
        }
    }

    match (handle, action) {
        (Some(handle), Some(action)) => Ok(EvictOutput { handle, action }),
        _ => Err(unexpected()),
    }
}

/// Context files produced by `create_sealed_object`.
#[derive(Debug)]
pub struct ToolsObject {
    context: PathBuf,
}

pub struct Tpm2Tools<'r, R: CommandRunner> {
    runner: &'r R,
    tools_dir: PathBuf,
    work_dir: PathBuf,
    tcti: String,
}

impl<'r, R: CommandRunner> Tpm2Tools<'r, R> {
    pub fn new(runner: &'r R, tools_dir: &Path, work_dir: &Path, tcti: &str) -> Self {
        Self {
            runner,
            tools_dir: tools_dir.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
            tcti: tcti.to_string(),
        }
    }

    fn file(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    fn cmd(&self, tool: &str) -> Cmd {
        Cmd::new(self.tools_dir.join(format!("tpm2_{}", tool)))
            .arg("-T")
            .arg(&self.tcti)
    }

    fn run(&self, cmd: Cmd) -> Result<Vec<u8>> {
        let out = self.runner.run(&cmd)?.check(&cmd)?;
        Ok(out.stdout)
    }
}

impl<'r, R: CommandRunner> TpmBackend for Tpm2Tools<'r, R> {
    type Object = ToolsObject;

    fn read_pcrs(&mut self) -> Result<PcrValues> {
        let stdout = self
            .run(self.cmd("pcrread"))
            .map_err(|err| TpmError::Communication(err.to_string()))?;
        Ok(parse_pcr_read(&String::from_utf8_lossy(&stdout))?)
    }

    fn create_sealed_object(
        &mut self,
        secret: &[u8],
        selection: &PcrSelection,
    ) -> Result<ToolsObject> {
        std::fs::create_dir_all(&self.work_dir)?;
        let (primary, policy) = (self.file(PRIMARY_CTX), self.file(POLICY));
        let (public, private) = (self.file(SEAL_PUB), self.file(SEAL_PRIV));
        let context = self.file(SEAL_CTX);

        self.run(
            self.cmd("createprimary")
                .args(["-Q", "-C", "o", "-c"])
                .arg(&primary),
        )?;
        self.run(
            self.cmd("createpolicy")
                .args(["-Q", "--policy-pcr", "-l"])
                .arg(selection.to_string())
                .arg("-L")
                .arg(&policy),
        )?;
        self.run(
            self.cmd("create")
                .args(["-Q", "-C"])
                .arg(&primary)
                .arg("-L")
                .arg(&policy)
                .arg("-u")
                .arg(&public)
                .arg("-r")
                .arg(&private)
                .args(["-i", "-"])
                .stdin(secret),
        )?;
        self.run(
            self.cmd("load")
                .args(["-Q", "-C"])
                .arg(&primary)
                .arg("-u")
                .arg(&public)
                .arg("-r")
                .arg(&private)
                .arg("-c")
                .arg(&context),
        )?;

        Ok(ToolsObject { context })
    }

    fn persist(
        &mut self,
        object: ToolsObject,
        address: Option<PersistentHandle>,
    ) -> Result<PersistentHandle> {
        let mut cmd = self
            .cmd("evictcontrol")
            .args(["-C", "o", "-c"])
            .arg(&object.context);
        if let Some(address) = address {
            cmd = cmd.arg(address.to_string());
        }
        let out = parse_evict_output(&String::from_utf8_lossy(&self.run(cmd)?))?;
        if out.action != EvictAction::Persisted {
            return Err(TpmError::UnexpectedOutput {
                tool: "tpm2_evictcontrol",
                output: format!("object at {} was evicted, not persisted", out.handle),
            });
        }
        Ok(out.handle)
    }

    fn evict(&mut self, address: PersistentHandle) -> Result<()> {
        let stdout = self.run(
            self.cmd("evictcontrol")
                .args(["-C", "o", "-c"])
                .arg(address.to_string()),
        )?;
        let out = parse_evict_output(&String::from_utf8_lossy(&stdout))?;
        match out {
            EvictOutput {
                handle,
                action: EvictAction::Evicted,
            } if handle == address => Ok(()),
            _ => Err(TpmError::UnexpectedOutput {
                tool: "tpm2_evictcontrol",
                output: format!("{} was not evicted", address),
            }),
        }
    }

    fn unseal(
        &mut self,
        address: PersistentHandle,
        selection: &PcrSelection,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let cmd = self
            .cmd("unseal")
            .arg("-c")
            .arg(address.to_string())
            .arg("-p")
            .arg(format!("pcr:{}", selection));
        let out = self.runner.run(&cmd)?;
        let stdout = Zeroizing::new(out.stdout);
        if out.status != 0 {
            return Err(TpmError::Unseal {
                handle: address,
                reason: ExecError::Failed {
                    program: cmd.name(),
                    status: out.status,
                    stderr: out.stderr.trim().to_string(),
                }
                .to_string(),
            });
        }
        Ok(stdout)
    }
}
