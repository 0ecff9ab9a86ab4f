//! Records that must survive the reboot between `setup1` and `setup2`.

use crate::tpm::PersistentHandle;
use serde::{Deserialize, Serialize};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

const HANDLE_FILE: &str = "persistent-handle";
const CMDLINE_FILE: &str = "kernel-command-line.txt";
const BOOT_ENTRY_FILE: &str = "boot-entry.yaml";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt provisioning record `{path}`: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

pub type Result<T, E = StateError> = core::result::Result<T, E>;

/// Firmware boot-menu entry created for the composed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootEntryRecord {
    pub disk: String,
    pub partition: u8,
    pub label: String,
    pub loader: String,
}

/// Write `contents` to `path`, readable by the owner only.
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the root-only data directory.
    pub fn open(dir: &Path) -> Result<Self> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
            .map_err(|source| StateError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn read(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io { path, source }),
        }
    }

    fn write(&self, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.path(name);
        write_private(&path, contents).map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn persistent_handle(&self) -> Result<Option<PersistentHandle>> {
        let Some(text) = self.read(HANDLE_FILE)? else {
            return Ok(None);
        };
        text.trim()
            .parse()
            .map(Some)
            .map_err(|err: crate::tpm::TpmError| StateError::Corrupt {
                path: self.path(HANDLE_FILE),
                reason: err.to_string(),
            })
    }

    pub fn save_persistent_handle(&self, handle: PersistentHandle) -> Result<()> {
        self.write(HANDLE_FILE, handle.to_string().as_bytes())?;
        Ok(())
    }

    /// Store the kernel command line and return the file `objcopy` embeds.
    pub fn save_cmdline(&self, cmdline: &str) -> Result<PathBuf> {
        self.write(CMDLINE_FILE, cmdline.as_bytes())
    }

    pub fn boot_entry(&self) -> Result<Option<BootEntryRecord>> {
        let Some(text) = self.read(BOOT_ENTRY_FILE)? else {
            return Ok(None);
        };
        serde_yaml::from_str(&text)
            .map(Some)
            .map_err(|err| StateError::Corrupt {
                path: self.path(BOOT_ENTRY_FILE),
                reason: err.to_string(),
            })
    }

    pub fn save_boot_entry(&self, entry: &BootEntryRecord) -> Result<()> {
        let yaml = serde_yaml::to_string(entry).map_err(|err| StateError::Corrupt {
            path: self.path(BOOT_ENTRY_FILE),
            reason: err.to_string(),
        })?;
        self.write(BOOT_ENTRY_FILE, yaml.as_bytes())?;
        Ok(())
    }
}
