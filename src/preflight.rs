//! Startup checks run before anything touches the disk or the TPM.

use crate::config::Config;
use crate::provision::{ProvisionError, Result};
use std::path::PathBuf;

/// `tpm2_*` tools driven by the command line backend.
const TPM2_BACKEND_TOOLS: &[&str] = &[
    "createprimary",
    "createpolicy",
    "create",
    "load",
    "evictcontrol",
    "pcrread",
];

#[cfg(unix)]
fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

pub fn ensure_root() -> Result<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(ProvisionError::PrivilegeRequired)
    }
}

/// Everything that has to exist on the host. `tpm2_unseal` is always needed
/// since the early-boot hook bundles it.
pub fn required_paths(config: &Config, tpm2_tools_backend: bool) -> Vec<PathBuf> {
    let tools = &config.tools;
    let mut paths = vec![
        tools.cryptsetup.clone(),
        tools.lsblk.clone(),
        tools.mkinitcpio.clone(),
        tools.objcopy.clone(),
        tools.efibootmgr.clone(),
        tools.tpm2("unseal"),
        config.boot.efi_stub.clone(),
        config.initramfs.tcti_library.clone(),
    ];
    if tpm2_tools_backend {
        paths.extend(TPM2_BACKEND_TOOLS.iter().map(|tool| tools.tpm2(tool)));
    }
    paths
}

pub fn check_dependencies(config: &Config, tpm2_tools_backend: bool) -> Result<()> {
    let missing: Vec<PathBuf> = required_paths(config, tpm2_tools_backend)
        .into_iter()
        .filter(|path| !path.exists())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    for path in &missing {
        log::error!("missing dependency: {}", path.display());
    }
    Err(ProvisionError::DependencyMissing(missing))
}
