//! The two-phase provisioning workflow.
//!
//! `setup1` runs from the ordinary boot entry: it adds the disposable key,
//! seals it against the current PCRs to claim a persistent handle, and
//! builds and registers a boot image whose early-boot hook unseals from that
//! handle. `setup2` runs after booting that image, when the PCRs finally
//! describe it, and reseals the key at the same handle.

use crate::config::Config;
use crate::exec::CommandRunner;
use crate::initramfs::{self, HookScripts, InitramfsError};
use crate::luks::{self, KeyOptions, LuksError, PassphrasePrompt};
use crate::state::{StateError, StateStore};
use crate::tpm::pcr::PcrSelection;
use crate::tpm::{PersistentHandle, SealedKeyStore, TpmBackend, TpmError};
use crate::uki::{self, ImageComposer, ImageError};
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use zeroize::Zeroizing;

const RAMDISK: &str = "initramfs-measured-unlock.img";

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("administrative privileges are required, run as root")]
    PrivilegeRequired,
    #[error("missing dependencies: {}", display_paths(.0))]
    DependencyMissing(Vec<PathBuf>),
    #[error("no persistent handle recorded; run setup1 and boot the new entry before setup2")]
    PhaseOrderViolation,
    #[error("sealed key at {handle} did not unseal to the disposable key")]
    TpmSelfTestFailed { handle: PersistentHandle },
    #[error("resealed key at {handle} did not unseal to the disposable key")]
    TpmResealVerifyFailed { handle: PersistentHandle },
    #[error("failed to read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Luks(#[from] LuksError),
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Initramfs(#[from] InitramfsError),
    #[error(transparent)]
    Image(#[from] ImageError),
}

pub type Result<T, E = ProvisionError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Unprovisioned,
    KeyAdded,
    AddressAllocated,
    SealedAndTested,
    HooksInstalled,
    ImageBuilt,
    BootEntryCreated,
    Resealed,
    Verified,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Settings fixed for the whole run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Config,
    pub pcrs: PcrSelection,
    pub boot_label: String,
}

pub struct Provisioner<'a, R, B, P>
where
    R: CommandRunner,
    B: TpmBackend,
    P: PassphrasePrompt,
{
    ctx: &'a RunContext,
    runner: &'a R,
    keys: SealedKeyStore<B>,
    prompt: P,
    state: ProvisionState,
}

impl<'a, R, B, P> Provisioner<'a, R, B, P>
where
    R: CommandRunner,
    B: TpmBackend,
    P: PassphrasePrompt,
{
    pub fn new(ctx: &'a RunContext, runner: &'a R, keys: SealedKeyStore<B>, prompt: P) -> Self {
        Self {
            ctx,
            runner,
            keys,
            prompt,
            state: ProvisionState::Unprovisioned,
        }
    }

    pub fn state(&self) -> ProvisionState {
        self.state
    }

    pub fn keys(&self) -> &SealedKeyStore<B> {
        &self.keys
    }

    pub fn keys_mut(&mut self) -> &mut SealedKeyStore<B> {
        &mut self.keys
    }

    fn advance(&mut self, next: ProvisionState) {
        log::info!("state: {} -> {}", self.state, next);
        self.state = next;
    }

    fn ensure_key(&mut self, store: &StateStore) -> Result<()> {
        let ctx = self.ctx;
        let config = &ctx.config;
        let opts = KeyOptions {
            key_file: &config.key_file,
            key_size: config.key_size,
            staging_dir: store.dir(),
            cryptsetup: &config.tools.cryptsetup,
            lsblk: &config.tools.lsblk,
            iter_time_ms: config.kdf_iter_time_ms,
        };
        luks::ensure_key(self.runner, &mut self.prompt, &opts)?;
        self.advance(ProvisionState::KeyAdded);
        Ok(())
    }

    fn read_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        let path = &self.ctx.config.key_file;
        fs::read(path)
            .map(Zeroizing::new)
            .map_err(|source| ProvisionError::Io {
                path: path.clone(),
                source,
            })
    }

    /// Phase 1, from the ordinary boot entry. Safe to re-run.
    pub fn setup1(&mut self) -> Result<()> {
        let ctx = self.ctx;
        let config = &ctx.config;
        self.state = ProvisionState::Unprovisioned;
        let store = StateStore::open(&config.data_dir)?;
        let kernel = uki::select_kernel(&config.boot.boot_dir)?;

        self.ensure_key(&store)?;

        let handle = match store.persistent_handle()? {
            Some(handle) => {
                log::info!("Reusing persistent handle {handle} from an earlier run");
                self.advance(ProvisionState::AddressAllocated);
                handle
            }
            None => {
                let key = self.read_key()?;
                let handle = self.keys.allocate(&key, &ctx.pcrs)?;
                self.advance(ProvisionState::AddressAllocated);
                if !self.keys.verify(handle, &ctx.pcrs, &key) {
                    if let Err(err) = self.keys.backend_mut().evict(handle) {
                        log::error!("failed to evict untested object at {handle}: {err}");
                    }
                    return Err(ProvisionError::TpmSelfTestFailed { handle });
                }
                store.save_persistent_handle(handle)?;
                handle
            }
        };
        self.advance(ProvisionState::SealedAndTested);

        let hooks = &config.initramfs;
        HookScripts::render(hooks, handle, &ctx.pcrs).install(hooks)?;
        let build_config = initramfs::prepare_build_config(hooks, store.dir())?;
        self.advance(ProvisionState::HooksInstalled);

        let ramdisk = store.path(RAMDISK);
        initramfs::build_ramdisk(
            self.runner,
            &config.tools.mkinitcpio,
            &build_config,
            &kernel,
            &ramdisk,
        )?;
        let composer = ImageComposer::new(self.runner, &config.boot, &config.tools);
        composer.compose(&kernel, &ramdisk, &store)?;
        self.advance(ProvisionState::ImageBuilt);

        composer.register(&ctx.boot_label, &store)?;
        self.advance(ProvisionState::BootEntryCreated);
        Ok(())
    }

    /// Phase 2, from the boot entry created by [`Self::setup1`].
    pub fn setup2(&mut self) -> Result<()> {
        let ctx = self.ctx;
        self.state = ProvisionState::Unprovisioned;
        let store = StateStore::open(&ctx.config.data_dir)?;
        let handle = store
            .persistent_handle()?
            .ok_or(ProvisionError::PhaseOrderViolation)?;

        self.ensure_key(&store)?;
        let key = self.read_key()?;

        self.keys.reseal(handle, &key, &ctx.pcrs)?;
        self.advance(ProvisionState::Resealed);
        if !self.keys.verify(handle, &ctx.pcrs, &key) {
            return Err(ProvisionError::TpmResealVerifyFailed { handle });
        }
        self.advance(ProvisionState::Verified);
        Ok(())
    }
}
