//! [`TpmBackend`] talking to the TPM directly through `tss-esapi`.
//!
//! Enabled with the `esapi` feature. Objects created here are
//! interchangeable with the ones `tpm2-tools` produces, so the early-boot
//! hook can still unseal them with `tpm2_unseal`.

use super::pcr::{PcrBank, PcrSelection, PcrValues, PCR_COUNT};
use super::{PersistentHandle, Result, TpmBackend, TpmError, PERSISTENT_FIRST, PERSISTENT_LAST};
use sha2::{Digest as _, Sha256};
use std::str::FromStr;
use tss_esapi::attributes::{ObjectAttributes, SessionAttributes};
use tss_esapi::constants::{CapabilityType, SessionType, StartupType};
use tss_esapi::handles::{KeyHandle, PersistentTpmHandle, SessionHandle, TpmHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{Hierarchy, Provision};
use tss_esapi::interface_types::session_handles::AuthSession;
use tss_esapi::structures::{
    CapabilityData, CreateKeyResult, CreatePrimaryKeyResult, Digest, EccPoint, KeyedHashScheme,
    PcrSelectionList, PcrSlot, Public, PublicEccParametersBuilder, PublicKeyedHashParameters,
    SensitiveData, SymmetricDefinition, SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use zeroize::Zeroizing;

fn hashing_algorithm(bank: PcrBank) -> HashingAlgorithm {
    match bank {
        PcrBank::Sha1 => HashingAlgorithm::Sha1,
        PcrBank::Sha256 => HashingAlgorithm::Sha256,
    }
}

fn pcr_slot(index: u8) -> Result<PcrSlot> {
    match index {
        0 => Ok(PcrSlot::Slot0),
        1 => Ok(PcrSlot::Slot1),
        2 => Ok(PcrSlot::Slot2),
        3 => Ok(PcrSlot::Slot3),
        4 => Ok(PcrSlot::Slot4),
        5 => Ok(PcrSlot::Slot5),
        6 => Ok(PcrSlot::Slot6),
        7 => Ok(PcrSlot::Slot7),
        8 => Ok(PcrSlot::Slot8),
        9 => Ok(PcrSlot::Slot9),
        10 => Ok(PcrSlot::Slot10),
        11 => Ok(PcrSlot::Slot11),
        12 => Ok(PcrSlot::Slot12),
        13 => Ok(PcrSlot::Slot13),
        14 => Ok(PcrSlot::Slot14),
        15 => Ok(PcrSlot::Slot15),
        16 => Ok(PcrSlot::Slot16),
        17 => Ok(PcrSlot::Slot17),
        18 => Ok(PcrSlot::Slot18),
        19 => Ok(PcrSlot::Slot19),
        20 => Ok(PcrSlot::Slot20),
        21 => Ok(PcrSlot::Slot21),
        22 => Ok(PcrSlot::Slot22),
        23 => Ok(PcrSlot::Slot23),
        _ => Err(super::pcr::PcrError::InvalidPcrSlot(index.to_string()).into()),
    }
}

fn selection_list(bank: PcrBank, slots: &[u8]) -> Result<PcrSelectionList> {
    let slots = slots
        .iter()
        .map(|s| pcr_slot(*s))
        .collect::<Result<Vec<_>>>()?;
    Ok(PcrSelectionList::builder()
        .with_selection(hashing_algorithm(bank), &slots)
        .build()?)
}

/// Primary key and loaded sealed object, both transient until `persist`.
pub struct EsapiObject {
    primary: KeyHandle,
    sealed: KeyHandle,
}

pub struct Esapi {
    ctx: tss_esapi::Context,
}

impl Esapi {
    /// Open the TPM named by a TCTI string such as `device:/dev/tpmrm0`.
    pub fn open(tcti: &str) -> Result<Self> {
        let conf = TctiNameConf::from_str(tcti)
            .map_err(|err| TpmError::Communication(format!("invalid TCTI `{tcti}`: {err}")))?;
        log::debug!("TCTI config {:?}", conf);
        let mut ctx = tss_esapi::Context::new(conf)
            .map_err(|err| TpmError::Communication(err.to_string()))?;
        // Firmware has normally started the TPM already.
        ctx.startup(StartupType::Clear).ok();
        let mut tpm = Self { ctx };
        tpm.flush_transient()?;
        Ok(tpm)
    }

    fn flush_transient(&mut self) -> Result<()> {
        let (capabilities, _) = self.ctx.get_capability(CapabilityType::Handles, 0x8000_0000, 80)?;
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles
                .into_inner()
                .into_iter()
                .filter(|h| matches!(h, TpmHandle::Transient(_)))
            {
                let handle = self
                    .ctx
                    .execute_without_session(|ctx| ctx.tr_from_tpm_public(handle))?;
                self.ctx.flush_context(handle).ok();
            }
        }
        Ok(())
    }

    fn flush_session(&mut self, session: AuthSession) -> Result<()> {
        if matches!(session, AuthSession::Password) {
            return Ok(());
        }
        let handle: SessionHandle = session.into();
        self.ctx.flush_context(handle.into())?;
        Ok(())
    }

    fn make_session(&mut self, t: SessionType) -> Result<AuthSession> {
        let session = self
            .ctx
            .start_auth_session(
                None,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(|| TpmError::Communication("failed to create auth session".into()))?;
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_decrypt(true)
            .with_encrypt(true)
            .build();
        self.ctx
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;
        Ok(session)
    }

    /// Digest PolicyPCR expects: sha256 over the selected PCR values in
    /// ascending slot order.
    fn pcr_digest(&mut self, selection: &PcrSelection) -> Result<Digest> {
        let values = self.read_pcrs()?;
        let mut hasher = Sha256::new();
        for slot in selection.slots() {
            let value = values.get(selection.bank(), *slot).ok_or_else(|| {
                TpmError::Communication(format!(
                    "PCR {}:{} is not readable",
                    selection.bank(),
                    slot
                ))
            })?;
            hasher.update(value);
        }
        Ok(Digest::try_from(hasher.finalize().to_vec())?)
    }

    /// Open a policy (or trial) session already satisfied for the current
    /// values of `selection`.
    fn pcr_session(&mut self, t: SessionType, selection: &PcrSelection) -> Result<AuthSession> {
        let digest = self.pcr_digest(selection)?;
        let list = selection_list(selection.bank(), selection.slots())?;
        let session = self.make_session(t)?;
        self.ctx.policy_pcr(session.try_into()?, digest, list)?;
        Ok(session)
    }

    fn create_primary(&mut self) -> Result<KeyHandle> {
        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .with_sensitive_data_origin(true)
            .with_user_with_auth(true)
            .with_decrypt(true)
            .with_sign_encrypt(false)
            .with_restricted(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_ecc_parameters(
                PublicEccParametersBuilder::new_restricted_decryption_key(
                    SymmetricDefinitionObject::AES_128_CFB,
                    EccCurve::NistP256,
                )
                .build()?,
            )
            .with_ecc_unique_identifier(EccPoint::default())
            .build()?;

        let CreatePrimaryKeyResult {
            key_handle: key, ..
        } = self.ctx.execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
        })?;
        Ok(key)
    }

    fn used_persistent_handles(&mut self) -> Result<Vec<u32>> {
        let (capabilities, _) =
            self.ctx
                .get_capability(CapabilityType::Handles, PERSISTENT_FIRST, 255)?;
        let mut used = Vec::new();
        if let CapabilityData::Handles(handles) = capabilities {
            for handle in handles.into_inner() {
                if let TpmHandle::Persistent(handle) = handle {
                    used.push(u32::from(handle));
                }
            }
        }
        Ok(used)
    }
}

impl TpmBackend for Esapi {
    type Object = EsapiObject;

    fn read_pcrs(&mut self) -> Result<PcrValues> {
        let mut values = PcrValues::default();
        for bank in [PcrBank::Sha1, PcrBank::Sha256] {
            for slot in 0..PCR_COUNT {
                let list = selection_list(bank, &[slot])?;
                let (_update_counter, _selection, digests) = self
                    .ctx
                    .execute_without_session(|ctx| ctx.pcr_read(list))
                    .map_err(|err| TpmError::Communication(err.to_string()))?;
                if let Some(digest) = digests.value().first() {
                    values.insert(bank, slot, digest.value().to_vec());
                } else {
                    values.add_bank(bank);
                }
            }
        }
        Ok(values)
    }

    fn create_sealed_object(
        &mut self,
        secret: &[u8],
        selection: &PcrSelection,
    ) -> Result<EsapiObject> {
        let primary = self.create_primary()?;

        let trial = self.pcr_session(SessionType::Trial, selection)?;
        let policy_digest = self.ctx.policy_get_digest(trial.try_into()?)?;
        self.flush_session(trial)?;

        let object_attributes = ObjectAttributes::builder()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()?;

        let public = Public::builder()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(object_attributes)
            .with_auth_policy(policy_digest)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()?;

        let data = SensitiveData::try_from(secret.to_vec())?;
        let sealed = self
            .ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                let CreateKeyResult {
                    out_private,
                    out_public,
                    ..
                } = ctx.create(primary, public, None, Some(data), None, None)?;
                ctx.load(primary, out_private, out_public)
            })?;

        Ok(EsapiObject { primary, sealed })
    }

    fn persist(
        &mut self,
        object: EsapiObject,
        address: Option<PersistentHandle>,
    ) -> Result<PersistentHandle> {
        let raw = match address {
            Some(address) => address.value(),
            None => {
                let used = self.used_persistent_handles()?;
                (PERSISTENT_FIRST..=PERSISTENT_LAST)
                    .find(|h| !used.contains(h))
                    .ok_or(TpmError::HandlesExhausted)?
            }
        };
        let handle = PersistentTpmHandle::new(raw)?;

        let EsapiObject { primary, sealed } = object;
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                let mut persistent = ctx.evict_control(
                    Provision::Owner,
                    sealed.into(),
                    Persistent::Persistent(handle),
                )?;
                ctx.flush_context(sealed.into())?;
                ctx.flush_context(primary.into())?;
                ctx.tr_close(&mut persistent)?;
                Ok::<(), TpmError>(())
            })?;

        PersistentHandle::new(raw)
    }

    fn evict(&mut self, address: PersistentHandle) -> Result<()> {
        let handle = PersistentTpmHandle::new(address.value())?;
        let retrieved = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))?;
        // Evicting a persistent object needs an owner authorization session.
        self.ctx
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, retrieved, Persistent::Persistent(handle))
            })?;
        self.flush_transient().ok();
        Ok(())
    }

    fn unseal(
        &mut self,
        address: PersistentHandle,
        selection: &PcrSelection,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let session = self.pcr_session(SessionType::Policy, selection)?;
        let handle = PersistentTpmHandle::new(address.value())?;
        let unsealed = self
            .ctx
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::Persistent(handle)))
            .and_then(|object| {
                self.ctx
                    .execute_with_session(Some(session), |ctx| ctx.unseal(object))
            });
        self.flush_session(session).ok();
        let data = unsealed.map_err(|err| TpmError::Unseal {
            handle: address,
            reason: err.to_string(),
        })?;
        Ok(Zeroizing::new(data.value().to_vec()))
    }
}
