use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// PC client TPMs expose PCRs 0 through 23.
pub const PCR_COUNT: u8 = 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least on selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list specification `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("unexpected tpm2_pcrread output line `{0}`")]
    UnexpectedPcrRead(String),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// Hash banks this tool knows how to seal against, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcrBank {
    Sha1,
    Sha256,
}

impl PcrBank {
    pub fn as_str(&self) -> &'static str {
        match self {
            PcrBank::Sha1 => "sha1",
            PcrBank::Sha256 => "sha256",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            PcrBank::Sha1 => 20,
            PcrBank::Sha256 => 32,
        }
    }
}

impl fmt::Display for PcrBank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PcrBank {
    type Err = PcrError;

    fn from_str(bank: &str) -> Result<Self> {
        parse_pcr_bank(bank)
    }
}

fn parse_pcr_bank(bank: &str) -> Result<PcrBank> {
    match bank {
        "sha1" => Ok(PcrBank::Sha1),
        "sha256" => Ok(PcrBank::Sha256),
        _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
    }
}

fn parse_slot(slot: &str) -> Result<u8> {
    match slot.parse::<u8>() {
        Ok(index) if index < PCR_COUNT && !slot.starts_with('+') => Ok(index),
        _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
    }
}

fn parse_slots(slots: &str) -> Result<Vec<u8>> {
    slots.split(',').map(parse_slot).collect()
}

/// Ordered set of PCR indices in one hash bank, rendered in the
/// `tpm2-tools` form `sha256:0,2,4,7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PcrSelection {
    bank: PcrBank,
    slots: Vec<u8>,
}

impl PcrSelection {
    pub fn new(bank: PcrBank, slots: &[u8]) -> Result<Self> {
        if slots.is_empty() {
            return Err(PcrError::EmptyPcrSelectionList);
        }
        if let Some(bad) = slots.iter().find(|s| **s >= PCR_COUNT) {
            return Err(PcrError::InvalidPcrSlot(bad.to_string()));
        }
        let mut slots = slots.to_vec();
        slots.sort_unstable();
        slots.dedup();
        Ok(Self { bank, slots })
    }

    pub fn bank(&self) -> PcrBank {
        self.bank
    }

    pub fn slots(&self) -> &[u8] {
        &self.slots
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.bank)?;
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", slot)?;
        }
        Ok(())
    }
}

impl FromStr for PcrSelection {
    type Err = PcrError;

    fn from_str(expression: &str) -> Result<Self> {
        parse_pcr_selection_list(expression)
    }
}

pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelection> {
    let (bank, slots) = expression
        .split_once(':')
        .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
    let bank = parse_pcr_bank(bank)?;
    if slots.is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    let slots = parse_slots(slots)?;
    PcrSelection::new(bank, &slots)
}

/// Current PCR values per bank. A bank the firmware never extends shows up
/// with no values at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrValues {
    banks: BTreeMap<PcrBank, BTreeMap<u8, Vec<u8>>>,
}

impl PcrValues {
    pub fn insert(&mut self, bank: PcrBank, slot: u8, digest: Vec<u8>) {
        self.banks.entry(bank).or_default().insert(slot, digest);
    }

    /// Register a bank that is supported but may have no values.
    pub fn add_bank(&mut self, bank: PcrBank) {
        self.banks.entry(bank).or_default();
    }

    pub fn has_bank(&self, bank: PcrBank) -> bool {
        self.banks.contains_key(&bank)
    }

    pub fn get(&self, bank: PcrBank, slot: u8) -> Option<&[u8]> {
        self.banks
            .get(&bank)
            .and_then(|values| values.get(&slot))
            .map(Vec::as_slice)
    }

    /// Every slot in `slots` has a live value of the bank's digest size.
    pub fn is_populated(&self, bank: PcrBank, slots: &[u8]) -> bool {
        slots.iter().all(|slot| {
            self.get(bank, *slot)
                .map(|d| d.len() == bank.digest_len())
                .unwrap_or(false)
        })
    }

    /// Prefer sha256 only when it carries live values for `slots`, otherwise
    /// fall back to sha1. `None` when neither bank is usable.
    pub fn choose_bank(&self, slots: &[u8]) -> Option<PcrBank> {
        if self.is_populated(PcrBank::Sha256, slots) {
            return Some(PcrBank::Sha256);
        }
        if self.is_populated(PcrBank::Sha1, slots) {
            return Some(PcrBank::Sha1);
        }
        None
    }
}

/// Parse `tpm2_pcrread` output:
///
/// ```text
///   sha1:
///     0 : 0x3DCA...
///   sha256:
///     0 : 0xA1B2...
/// ```
///
/// Banks other than sha1/sha256 are skipped.
pub fn parse_pcr_read(output: &str) -> Result<PcrValues> {
    let mut values = PcrValues::default();
    // Some(None) while inside a bank we skip.
    let mut current: Option<Option<PcrBank>> = None;

    for raw in output.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let unexpected = || PcrError::UnexpectedPcrRead(line.to_string());
        let (key, value) = line.split_once(':').ok_or_else(unexpected)?;
        let (key, value) = (key.trim(), value.trim());

        if value.is_empty() {
            let bank = key.parse::<PcrBank>().ok();
            if let Some(bank) = bank {
                values.add_bank(bank);
            }
            current = Some(bank);
            continue;
        }

        let bank = current.ok_or_else(unexpected)?;
        let digest = value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
            .and_then(|h| hex::decode(h).ok())
            .ok_or_else(unexpected)?;
        let slot = parse_slot(key).map_err(|_| unexpected())?;
        if let Some(bank) = bank {
            values.insert(bank, slot, digest);
        }
    }

    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_no_bank_delimiter() {
        let parsed = parse_pcr_selection_list("1,2,3");
        assert_eq!(
            parsed,
            Err(PcrError::InvalidPcrSelectionString("1,2,3".to_string()))
        );
    }

    #[test]
    fn parse_no_bank() {
        let parsed = parse_pcr_selection_list(":1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("".to_string())));
    }

    #[test]
    fn parse_bad_bank() {
        let parsed = parse_pcr_selection_list("bunk:1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("bunk".to_string())));
    }

    #[test]
    fn parse_no_selections() {
        let parsed = parse_pcr_selection_list("sha1:");
        assert_eq!(parsed, Err(PcrError::EmptyPcrSelectionList));
    }

    #[test]
    fn parse_bad_slot() {
        let parsed = parse_pcr_selection_list("sha1:1,bad,2");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("bad".to_string())));
    }

    #[test]
    fn parse_out_of_range_slot() {
        let parsed = parse_pcr_selection_list("sha1:1,24");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("24".to_string())));
    }

    #[test]
    fn parse_happy() -> Result<()> {
        let parsed = parse_pcr_selection_list("sha1:1")?;
        assert_eq!(parsed, PcrSelection::new(PcrBank::Sha1, &[1])?);
        let parsed = parse_pcr_selection_list("sha256:7,0,4,2")?;
        assert_eq!(parsed.slots(), &[0, 2, 4, 7]);
        assert_eq!(parsed.to_string(), "sha256:0,2,4,7");
        Ok(())
    }

    const PCRREAD_BOTH: &str = "  sha1:
    0 : 0x3DCAE0B3A1E4C0F34FAD5AF2A2DE8D7BBD2B1C0B
    2 : 0xB2A83B0EBF2F8374299A5B2BDFC31EA955AD7236
  sha256:
    0 : 0xA3B5B5E2D5F1A3B8C0E3F8D2A1B4C5D6E7F8091A2B3C4D5E6F708192A3B4C5D6
    2 : 0x3D458CFE55CC03EA1F443F1562BEEC8DF51C75E14A9FCF9A7234A13F198E7969
";

    const PCRREAD_SHA256_EMPTY: &str = "  sha1:
    0 : 0x3DCAE0B3A1E4C0F34FAD5AF2A2DE8D7BBD2B1C0B
    2 : 0xB2A83B0EBF2F8374299A5B2BDFC31EA955AD7236
  sha256:
  sha384:
";

    #[test]
    fn pcrread_prefers_populated_sha256() -> Result<()> {
        let values = parse_pcr_read(PCRREAD_BOTH)?;
        assert_eq!(values.choose_bank(&[0, 2]), Some(PcrBank::Sha256));
        assert_eq!(values.get(PcrBank::Sha1, 2).map(<[u8]>::len), Some(20));
        Ok(())
    }

    #[test]
    fn pcrread_supported_but_unpopulated_falls_back() -> Result<()> {
        let values = parse_pcr_read(PCRREAD_SHA256_EMPTY)?;
        assert!(values.has_bank(PcrBank::Sha256));
        assert_eq!(values.choose_bank(&[0, 2]), Some(PcrBank::Sha1));
        // slot 4 not reported at all
        assert_eq!(values.choose_bank(&[0, 4]), None);
        Ok(())
    }

    #[test]
    fn pcrread_rejects_garbage() {
        assert_eq!(
            parse_pcr_read("ERROR: Could not open TPM"),
            Err(PcrError::UnexpectedPcrRead(
                "ERROR: Could not open TPM".to_string()
            ))
        );
        assert!(parse_pcr_read("  0 : 0x00").is_err());
        assert!(parse_pcr_read("sha1:\n  0 : 0xZZ").is_err());
    }
}
