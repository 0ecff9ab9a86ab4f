//! Scripted collaborators for unit tests.

use crate::exec::{Cmd, CommandRunner, Output, Result as ExecResult};
use crate::luks::PassphrasePrompt;
use crate::tpm::pcr::{PcrBank, PcrSelection, PcrValues, PCR_COUNT};
use crate::tpm::{PersistentHandle, Result, TpmBackend, TpmError, PERSISTENT_FIRST};
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use zeroize::Zeroizing;

type Responder = Box<dyn FnMut(&Cmd) -> Output>;

/// Records every command and answers with whatever the closure returns. The
/// closure may also create files to stand in for tool side effects.
pub(crate) struct FakeRunner {
    commands: RefCell<Vec<Cmd>>,
    respond: RefCell<Responder>,
}

impl FakeRunner {
    pub(crate) fn new(respond: impl FnMut(&Cmd) -> Output + 'static) -> Self {
        Self {
            commands: RefCell::new(Vec::new()),
            respond: RefCell::new(Box::new(respond)),
        }
    }

    pub(crate) fn commands(&self) -> Vec<Cmd> {
        self.commands.borrow().clone()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.commands
            .borrow()
            .iter()
            .filter(|c| c.name() == name)
            .count()
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &Cmd) -> ExecResult<Output> {
        self.commands.borrow_mut().push(cmd.clone());
        let mut guard = self.respond.borrow_mut();
        let respond: &mut Responder = &mut guard;
        Ok(respond(cmd))
    }
}

pub(crate) fn ok_stdout(stdout: &str) -> Output {
    Output {
        stdout: stdout.as_bytes().to_vec(),
        ..Output::default()
    }
}

/// Answers every prompt with the same passphrase.
pub(crate) struct StaticPrompt(pub &'static str);

impl PassphrasePrompt for StaticPrompt {
    fn prompt(&mut self, _message: &str) -> io::Result<Zeroizing<String>> {
        Ok(Zeroizing::new(self.0.to_string()))
    }
}

pub(crate) struct SoftObject {
    secret: Vec<u8>,
    selection: PcrSelection,
    policy: Vec<u8>,
}

/// In-memory TPM that enforces PCR policies on unseal.
pub(crate) struct SoftTpm {
    pcrs: BTreeMap<(PcrBank, u8), Vec<u8>>,
    banks: Vec<PcrBank>,
    persistent: BTreeMap<u32, SoftObject>,
    /// Handle whose eviction is refused.
    pub(crate) locked: Option<PersistentHandle>,
    /// Seal a corrupted copy of the secret.
    pub(crate) corrupt_seal: bool,
    pub(crate) mutations: usize,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::with_populated(&[PcrBank::Sha1, PcrBank::Sha256])
    }
}

impl SoftTpm {
    /// sha256 is supported but the firmware never extends it.
    pub(crate) fn sha1_only() -> Self {
        Self::with_populated(&[PcrBank::Sha1])
    }

    fn with_populated(populated: &[PcrBank]) -> Self {
        let mut pcrs = BTreeMap::new();
        for bank in populated {
            for slot in 0..PCR_COUNT {
                pcrs.insert((*bank, slot), vec![0; bank.digest_len()]);
            }
        }
        Self {
            pcrs,
            banks: vec![PcrBank::Sha1, PcrBank::Sha256],
            persistent: BTreeMap::new(),
            locked: None,
            corrupt_seal: false,
            mutations: 0,
        }
    }

    pub(crate) fn extend(&mut self, bank: PcrBank, slot: u8, data: &[u8]) {
        let old = self
            .pcrs
            .get(&(bank, slot))
            .cloned()
            .unwrap_or_else(|| vec![0; bank.digest_len()]);
        let mut hasher = Sha256::new();
        hasher.update(&old);
        hasher.update(Sha256::digest(data));
        self.pcrs
            .insert((bank, slot), hasher.finalize()[..bank.digest_len()].to_vec());
    }

    pub(crate) fn persistent_count(&self) -> usize {
        self.persistent.len()
    }

    fn policy_digest(&self, selection: &PcrSelection) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(selection.to_string());
        for slot in selection.slots() {
            if let Some(value) = self.pcrs.get(&(selection.bank(), *slot)) {
                hasher.update(value);
            }
        }
        hasher.finalize().to_vec()
    }
}

impl TpmBackend for SoftTpm {
    type Object = SoftObject;

    fn read_pcrs(&mut self) -> Result<PcrValues> {
        let mut values = PcrValues::default();
        for bank in &self.banks {
            values.add_bank(*bank);
        }
        for ((bank, slot), digest) in &self.pcrs {
            values.insert(*bank, *slot, digest.clone());
        }
        Ok(values)
    }

    fn create_sealed_object(
        &mut self,
        secret: &[u8],
        selection: &PcrSelection,
    ) -> Result<SoftObject> {
        self.mutations += 1;
        let mut secret = secret.to_vec();
        if self.corrupt_seal {
            if let Some(first) = secret.first_mut() {
                *first ^= 0xff;
            }
        }
        Ok(SoftObject {
            secret,
            selection: selection.clone(),
            policy: self.policy_digest(selection),
        })
    }

    fn persist(
        &mut self,
        object: SoftObject,
        address: Option<PersistentHandle>,
    ) -> Result<PersistentHandle> {
        self.mutations += 1;
        let raw = match address {
            Some(address) => address.value(),
            None => (PERSISTENT_FIRST..)
                .find(|h| !self.persistent.contains_key(h))
                .ok_or(TpmError::HandlesExhausted)?,
        };
        if self.persistent.contains_key(&raw) {
            return Err(TpmError::Communication(format!("{:#010x} is in use", raw)));
        }
        self.persistent.insert(raw, object);
        PersistentHandle::new(raw)
    }

    fn evict(&mut self, address: PersistentHandle) -> Result<()> {
        if self.locked == Some(address) {
            return Err(TpmError::Communication("evict refused".into()));
        }
        self.mutations += 1;
        self.persistent
            .remove(&address.value())
            .map(|_| ())
            .ok_or_else(|| TpmError::Communication(format!("nothing persisted at {address}")))
    }

    fn unseal(
        &mut self,
        address: PersistentHandle,
        selection: &PcrSelection,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let refused = |reason: &str| TpmError::Unseal {
            handle: address,
            reason: reason.to_string(),
        };
        let object = self
            .persistent
            .get(&address.value())
            .ok_or_else(|| refused("no object at handle"))?;
        if &object.selection != selection || object.policy != self.policy_digest(selection) {
            return Err(refused("a policy check failed"));
        }
        Ok(Zeroizing::new(object.secret.clone()))
    }
}
