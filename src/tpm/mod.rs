use self::pcr::{PcrError, PcrSelection, PcrValues};
use crate::exec::ExecError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(feature = "esapi")]
pub mod esapi;
pub mod pcr;
pub mod tools;

/// First handle of the owner persistent range.
pub const PERSISTENT_FIRST: u32 = 0x8100_0000;
/// Last handle of the owner persistent range.
pub const PERSISTENT_LAST: u32 = 0x81FF_FFFF;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("cannot communicate with the TPM: {0}")]
    Communication(String),
    #[error("TPM assigned {actual} but the provisioning record holds {expected}; re-run setup1")]
    AddressDrift {
        expected: PersistentHandle,
        actual: PersistentHandle,
    },
    #[error("`{0}` is not an owner persistent handle")]
    InvalidHandle(String),
    #[error("no free persistent handle left in the owner range")]
    HandlesExhausted,
    #[error("unexpected {tool} output: `{output}`")]
    UnexpectedOutput { tool: &'static str, output: String },
    #[error("unseal of {handle} refused: {reason}")]
    Unseal {
        handle: PersistentHandle,
        reason: String,
    },
    #[error("failed to stage TPM context files: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    PcrError(#[from] PcrError),
    #[cfg(feature = "esapi")]
    #[error(transparent)]
    TssEsapi(#[from] tss_esapi::Error),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// Owner-hierarchy persistent handle (`0x81xxxxxx`) holding the sealed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersistentHandle(u32);

impl PersistentHandle {
    pub fn new(raw: u32) -> Result<Self> {
        if (PERSISTENT_FIRST..=PERSISTENT_LAST).contains(&raw) {
            Ok(Self(raw))
        } else {
            Err(TpmError::InvalidHandle(format!("{:#010x}", raw)))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PersistentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl FromStr for PersistentHandle {
    type Err = TpmError;

    /// Accepts exactly `0x` followed by eight hex digits.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || TpmError::InvalidHandle(s.to_string());
        let digits = s.strip_prefix("0x").ok_or_else(invalid)?;
        if digits.len() != 8 {
            return Err(invalid());
        }
        let bytes: [u8; 4] = hex::decode(digits)
            .map_err(|_| invalid())?
            .try_into()
            .map_err(|_| invalid())?;
        Self::new(u32::from_be_bytes(bytes)).map_err(|_| invalid())
    }
}

impl TryFrom<String> for PersistentHandle {
    type Error = TpmError;

    fn try_from(s: String) -> Result<Self> {
        s.trim().parse()
    }
}

impl From<PersistentHandle> for String {
    fn from(handle: PersistentHandle) -> Self {
        handle.to_string()
    }
}

/// The narrow operation set this tool needs from the TPM. Implementations
/// must not be driven concurrently.
pub trait TpmBackend {
    /// Transient sealed object, loaded but not yet persisted.
    type Object;

    fn read_pcrs(&mut self) -> Result<PcrValues>;

    /// Create a primary key, a PCR policy over the current values of
    /// `selection`, and a sealed object holding `secret` under that policy.
    fn create_sealed_object(
        &mut self,
        secret: &[u8],
        selection: &PcrSelection,
    ) -> Result<Self::Object>;

    /// Make `object` persistent at `address`, or wherever the TPM puts it when
    /// `address` is `None`.
    fn persist(
        &mut self,
        object: Self::Object,
        address: Option<PersistentHandle>,
    ) -> Result<PersistentHandle>;

    fn evict(&mut self, address: PersistentHandle) -> Result<()>;

    fn unseal(
        &mut self,
        address: PersistentHandle,
        selection: &PcrSelection,
    ) -> Result<Zeroizing<Vec<u8>>>;
}

/// Sealed disposable key, bound to a PCR selection and held at a persistent
/// handle.
pub struct SealedKeyStore<B: TpmBackend> {
    backend: B,
}

impl<B: TpmBackend> SealedKeyStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Pick the PCR bank to seal against. sha256 is used only when the
    /// firmware actually extends it, sha1 otherwise.
    pub fn select_pcrs(&mut self, slots: &[u8]) -> Result<PcrSelection> {
        let values = self.backend.read_pcrs()?;
        let bank = values.choose_bank(slots).ok_or_else(|| {
            TpmError::Communication("neither sha1 nor sha256 PCR values could be read".into())
        })?;
        if bank != pcr::PcrBank::Sha256 {
            log::warn!("sha256 PCRs are not populated by this TPM, sealing against {bank}");
        }
        Ok(PcrSelection::new(bank, slots)?)
    }

    /// Seal `secret` at a fresh handle chosen by the TPM.
    pub fn allocate(&mut self, secret: &[u8], pcrs: &PcrSelection) -> Result<PersistentHandle> {
        let object = self.backend.create_sealed_object(secret, pcrs)?;
        let handle = self.backend.persist(object, None)?;
        log::info!("Sealed key persisted at {handle} ({pcrs})");
        Ok(handle)
    }

    /// Replace the object at `existing` with `secret` sealed against the
    /// current values of `pcrs`. The handle must come back unchanged.
    pub fn reseal(
        &mut self,
        existing: PersistentHandle,
        secret: &[u8],
        pcrs: &PcrSelection,
    ) -> Result<PersistentHandle> {
        let target = match self.backend.evict(existing) {
            Ok(()) => Some(existing),
            Err(err) => {
                log::warn!("failed to evict previous object at {existing}: {err}");
                None
            }
        };
        let object = self.backend.create_sealed_object(secret, pcrs)?;
        let actual = self.backend.persist(object, target)?;
        if actual != existing {
            if let Err(err) = self.backend.evict(actual) {
                log::error!("failed to evict drifted object at {actual}: {err}");
            }
            return Err(TpmError::AddressDrift {
                expected: existing,
                actual,
            });
        }
        log::info!("Resealed key at {actual} ({pcrs})");
        Ok(actual)
    }

    pub fn unseal_test(
        &mut self,
        handle: PersistentHandle,
        pcrs: &PcrSelection,
    ) -> Result<Zeroizing<Vec<u8>>> {
        self.backend.unseal(handle, pcrs)
    }

    /// Unseal with the current PCRs and compare against `expected`. The
    /// recovered bytes are wiped before returning.
    pub fn verify(
        &mut self,
        handle: PersistentHandle,
        pcrs: &PcrSelection,
        expected: &[u8],
    ) -> bool {
        match self.unseal_test(handle, pcrs) {
            Ok(recovered) => recovered.as_slice() == expected,
            Err(err) => {
                log::warn!("test unseal of {handle} failed: {err}");
                false
            }
        }
    }
}
