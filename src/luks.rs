use crate::device::{find_root_device, ResolveError};
use crate::exec::{Cmd, CommandRunner, ExecError};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum LuksError {
    #[error("wrong passphrase supplied for {device}")]
    WrongPassphrase { device: String },
    #[error("failed to stage key material at `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read passphrase: {0}")]
    Prompt(#[source] io::Error),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    CryptSetup(#[from] ExecError),
}

pub type Result<T, E = LuksError> = core::result::Result<T, E>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> LuksError + '_ {
    move |source| LuksError::Io {
        path: path.to_path_buf(),
        source,
    }
}

pub trait PassphrasePrompt {
    fn prompt(&mut self, message: &str) -> io::Result<Zeroizing<String>>;
}

/// Reads the passphrase from the controlling terminal without echo.
pub struct TerminalPrompt;

impl PassphrasePrompt for TerminalPrompt {
    fn prompt(&mut self, message: &str) -> io::Result<Zeroizing<String>> {
        rpassword::prompt_password(message).map(Zeroizing::new)
    }
}

/// Parse `Key slot N unlocked.` from `cryptsetup --verbose` output.
pub fn parse_unlocked_slot(output: &str) -> Option<u8> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("Key slot ")?
            .strip_suffix(" unlocked.")?
            .parse()
            .ok()
    })
}

/// Passphrase staged in a 0600 temp file for one `--key-file` use. The file is
/// removed when this is dropped, on every return path.
pub struct StagedSecret {
    file: NamedTempFile,
}

impl StagedSecret {
    pub fn new(dir: &Path, secret: &[u8]) -> Result<Self> {
        fs::create_dir_all(dir).map_err(io_err(dir))?;
        let mut file = NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        fs::set_permissions(file.path(), fs::Permissions::from_mode(0o600))
            .map_err(io_err(dir))?;
        file.write_all(secret).map_err(io_err(dir))?;
        file.flush().map_err(io_err(dir))?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

pub struct LuksManager<'r, R: CommandRunner> {
    runner: &'r R,
    cryptsetup: PathBuf,
    device: String,
}

impl<'r, R: CommandRunner> LuksManager<'r, R> {
    pub fn new(runner: &'r R, cryptsetup: &Path, device: &str) -> Self {
        Self {
            runner,
            cryptsetup: cryptsetup.to_path_buf(),
            device: device.to_string(),
        }
    }

    fn cmd(&self, action: &str) -> Cmd {
        Cmd::new(&self.cryptsetup).args([action, "--batch-mode"])
    }

    /// Check `key_file` opens the volume without activating it. Returns the
    /// slot it unlocked.
    pub fn test_key(&self, key_file: &Path) -> Result<Option<u8>> {
        let cmd = self
            .cmd("open")
            .args(["--test-passphrase", "--verbose", "--key-file"])
            .arg(key_file)
            .arg(&self.device);
        let out = self.runner.run(&cmd)?;
        if !out.success() {
            log::debug!("cryptsetup: {}", out.stderr.trim());
            return Err(LuksError::WrongPassphrase {
                device: self.device.clone(),
            });
        }
        let mut text = out.stdout_str();
        text.push_str(&out.stderr);
        Ok(parse_unlocked_slot(&text))
    }

    /// Add `new_key` as a new key slot, authorised by `existing`.
    pub fn add_key(
        &self,
        existing: &Path,
        new_key: &Path,
        iter_time_ms: Option<u32>,
    ) -> Result<()> {
        let mut cmd = self.cmd("luksAddKey");
        if let Some(ms) = iter_time_ms {
            cmd = cmd.arg("--iter-time").arg(ms.to_string());
        }
        let cmd = cmd
            .arg("--key-file")
            .arg(existing)
            .arg(&self.device)
            .arg(new_key);
        self.runner.run(&cmd)?.check(&cmd)?;
        Ok(())
    }

    pub fn kill_slot(&self, existing: &Path, slot: u8) -> Result<()> {
        let cmd = self
            .cmd("luksKillSlot")
            .arg("--key-file")
            .arg(existing)
            .arg(&self.device)
            .arg(slot.to_string());
        self.runner.run(&cmd)?.check(&cmd)?;
        Ok(())
    }

    /// Copy the passphrase in slot 0 to a free slot and wipe slot 0.
    pub fn evacuate_slot_zero(&self, passphrase: &Path) -> Result<()> {
        log::info!("Moving LUKS passphrase from slot 0 to another slot");
        self.add_key(passphrase, passphrase, None)?;
        self.kill_slot(passphrase, 0)
    }
}

/// Everything `ensure_key` needs besides the runner.
pub struct KeyOptions<'a> {
    pub key_file: &'a Path,
    pub key_size: usize,
    pub staging_dir: &'a Path,
    pub cryptsetup: &'a Path,
    pub lsblk: &'a Path,
    pub iter_time_ms: u32,
}

/// Make sure a disposable key exists on disk and in a key slot of the root
/// volume. Returns `false` when the key was already there.
pub fn ensure_key<R, P>(runner: &R, prompt: &mut P, opts: &KeyOptions<'_>) -> Result<bool>
where
    R: CommandRunner,
    P: PassphrasePrompt,
{
    if opts.key_file.exists() {
        log::debug!("disposable key {} already present", opts.key_file.display());
        return Ok(false);
    }

    let device = find_root_device(runner, opts.lsblk)?;
    let luks = LuksManager::new(runner, opts.cryptsetup, &device);

    let passphrase = prompt
        .prompt("Please type your LUKS passphrase: ")
        .map_err(LuksError::Prompt)?;
    let staged = StagedSecret::new(opts.staging_dir, passphrase.as_bytes())?;
    drop(passphrase);

    log::info!("Verifying passphrase");
    if luks.test_key(staged.path())? == Some(0) {
        luks.evacuate_slot_zero(staged.path())?;
    }

    // Written under a temp name and only renamed into place once the slot
    // exists, so a present key file always has a matching key slot.
    let key_dir = opts
        .key_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut key = Zeroizing::new(vec![0u8; opts.key_size]);
    OsRng.fill_bytes(&mut key);
    let new_key = StagedSecret::new(key_dir, &key)?;

    log::info!("Adding disposable key to {device}");
    luks.add_key(staged.path(), new_key.path(), Some(opts.iter_time_ms))?;

    new_key
        .file
        .persist(opts.key_file)
        .map_err(|err| LuksError::Io {
            path: opts.key_file.to_path_buf(),
            source: err.error,
        })?;
    Ok(true)
}
