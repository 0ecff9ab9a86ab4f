use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/measured-unlock.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("config must select at least one PCR")]
    NoPcrs,
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Holds TPM contexts, the persistent handle record, captured cmdline and
    /// the boot-menu registration marker.
    pub data_dir: PathBuf,
    /// Disposable LUKS key, lives on the encrypted root.
    pub key_file: PathBuf,
    pub key_size: usize,
    /// PCR indices the sealed key is bound to. PCR 4 measures the boot image.
    pub pcrs: Vec<u8>,
    /// `cryptsetup --iter-time` for the disposable key slot.
    pub kdf_iter_time_ms: u32,
    pub boot: BootConfig,
    pub initramfs: InitramfsConfig,
    pub tools: Tools,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "/var/lib/measured-unlock".into(),
            key_file: "/crypto_keyfile_measured-unlock.bin".into(),
            key_size: 32,
            pcrs: vec![0, 2, 4, 7],
            kdf_iter_time_ms: 60,
            boot: BootConfig::default(),
            initramfs: InitramfsConfig::default(),
            tools: Tools::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BootConfig {
    pub boot_dir: PathBuf,
    pub esp_mount: PathBuf,
    pub image: PathBuf,
    pub efi_stub: PathBuf,
    pub os_release: PathBuf,
    pub cmdline_source: PathBuf,
    pub cpuinfo: PathBuf,
    pub mounts: PathBuf,
    pub label_suffix: String,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            boot_dir: "/boot".into(),
            esp_mount: "/boot/efi".into(),
            image: "/boot/efi/EFI/MeasuredUnlock/linux.efi".into(),
            efi_stub: "/usr/lib/systemd/boot/efi/linuxx64.efi.stub".into(),
            os_release: "/usr/lib/os-release".into(),
            cmdline_source: "/proc/cmdline".into(),
            cpuinfo: "/proc/cpuinfo".into(),
            mounts: "/proc/self/mounts".into(),
            label_suffix: "Measured Unlock".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct InitramfsConfig {
    pub base_config: PathBuf,
    pub hooks_dir: PathBuf,
    pub install_dir: PathBuf,
    pub hook_name: String,
    /// Key path the `encrypt` hook reads, also the one distro installers
    /// bake into FILES=.
    pub plaintext_key: String,
    pub kernel_modules: Vec<String>,
    pub tcti_library: PathBuf,
}

impl Default for InitramfsConfig {
    fn default() -> Self {
        Self {
            base_config: "/etc/mkinitcpio.conf".into(),
            hooks_dir: "/usr/lib/initcpio/hooks".into(),
            install_dir: "/usr/lib/initcpio/install".into(),
            hook_name: "measured-unlock".into(),
            plaintext_key: "/crypto_keyfile.bin".into(),
            kernel_modules: vec!["tpm_crb".into(), "tpm_tis".into()],
            tcti_library: "/usr/lib/libtss2-tcti-device.so".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Tools {
    pub cryptsetup: PathBuf,
    pub lsblk: PathBuf,
    pub mkinitcpio: PathBuf,
    pub objcopy: PathBuf,
    pub efibootmgr: PathBuf,
    /// Directory holding the `tpm2_*` binaries.
    pub tpm2_tools_dir: PathBuf,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            cryptsetup: "/usr/bin/cryptsetup".into(),
            lsblk: "/usr/bin/lsblk".into(),
            mkinitcpio: "/usr/bin/mkinitcpio".into(),
            objcopy: "/usr/bin/objcopy".into(),
            efibootmgr: "/usr/bin/efibootmgr".into(),
            tpm2_tools_dir: "/usr/bin".into(),
        }
    }
}

impl Tools {
    pub fn tpm2(&self, tool: &str) -> PathBuf {
        self.tpm2_tools_dir.join(format!("tpm2_{}", tool))
    }
}

impl Config {
    /// Load `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log::debug!("no config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_yaml(&text).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        if config.pcrs.is_empty() {
            return Err(ConfigError::NoPcrs);
        }
        Ok(config)
    }

    /// Defaults with every host path re-rooted under `root`.
    #[cfg(test)]
    pub(crate) fn rooted_at(root: &Path) -> Self {
        let at = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        let mut c = Config::default();
        c.data_dir = at(&c.data_dir);
        c.key_file = at(&c.key_file);
        c.boot.boot_dir = at(&c.boot.boot_dir);
        c.boot.esp_mount = at(&c.boot.esp_mount);
        c.boot.image = at(&c.boot.image);
        c.boot.efi_stub = at(&c.boot.efi_stub);
        c.boot.os_release = at(&c.boot.os_release);
        c.boot.cmdline_source = at(&c.boot.cmdline_source);
        c.boot.cpuinfo = at(&c.boot.cpuinfo);
        c.boot.mounts = at(&c.boot.mounts);
        c.initramfs.base_config = at(&c.initramfs.base_config);
        c.initramfs.hooks_dir = at(&c.initramfs.hooks_dir);
        c.initramfs.install_dir = at(&c.initramfs.install_dir);
        c.initramfs.tcti_library = at(&c.initramfs.tcti_library);
        let tools = &mut c.tools;
        for path in [
            &mut tools.cryptsetup,
            &mut tools.lsblk,
            &mut tools.mkinitcpio,
            &mut tools.objcopy,
            &mut tools.efibootmgr,
            &mut tools.tpm2_tools_dir,
        ] {
            *path = at(path.as_path());
        }
        c
    }
}
