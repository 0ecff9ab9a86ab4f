//! Measured-boot TPM auto-unlock for a LUKS root volume.
//!
//! `measured-unlock setup1` adds a disposable key to the root volume, seals
//! it in the TPM, builds a unified kernel image whose ramdisk unseals that
//! key, and registers the image with the firmware. After rebooting into it,
//! `measured-unlock setup2` reseals the key against the PCR values the new
//! boot chain produced.
//!
//! # Get Started
//!
//! ```bash
//! sudo measured-unlock setup1
//! # reboot into the new boot entry
//! sudo measured-unlock setup2
//! ```

pub mod cli;
pub mod config;
pub mod device;
pub mod exec;
pub mod initramfs;
pub mod luks;
pub mod preflight;
pub mod provision;
pub mod state;
pub mod tpm;
pub mod uki;

#[cfg(test)]
pub(crate) mod testing;
