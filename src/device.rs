//! Find the LUKS container that backs the mounted root filesystem.
//!
//! The unlocked mapping (`luks-<uuid>`, mounted at `/`) and the container
//! (`crypto_LUKS`, carrying `<uuid>`) are separate `lsblk` rows, joined
//! through the volume UUID embedded in the mapping name.

use crate::exec::{Cmd, CommandRunner, ExecError};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

const MAPPING_PREFIX: &str = "luks-";
const LUKS_FSTYPE: &str = "crypto_LUKS";

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("could not find the block device containing the root LUKS volume: {0}")]
    DeviceNotFound(String),
    #[error("failed to parse lsblk JSON output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T, E = ResolveError> = core::result::Result<T, E>;

/// One row of `lsblk --json --list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BlockDevice {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub mountpoint: Option<String>,
    #[serde(default)]
    pub mountpoints: Vec<Option<String>>,
    #[serde(default)]
    pub children: Vec<BlockDevice>,
}

impl BlockDevice {
    fn node(&self) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/dev/{}", self.name))
    }

    fn is_mounted_at(&self, target: &str) -> bool {
        self.mountpoint.as_deref() == Some(target)
            || self.mountpoints.iter().flatten().any(|m| m == target)
    }

    fn is_luks_container(&self) -> bool {
        self.fstype.as_deref() == Some(LUKS_FSTYPE)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkResponse {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

/// Volume UUID taken from an unlocked mapping's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeId(String);

impl VolumeId {
    fn from_mapping_name(name: &str) -> Option<Self> {
        name.strip_prefix(MAPPING_PREFIX)
            .filter(|id| !id.is_empty() && !id.contains(char::is_whitespace))
            .map(|id| Self(id.to_string()))
    }

    fn matches(&self, uuid: &str) -> bool {
        self.0.eq_ignore_ascii_case(uuid)
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn parse_lsblk(json: &[u8]) -> Result<Vec<BlockDevice>> {
    let decoded: LsblkResponse = serde_json::from_slice(json)?;
    let mut rows = Vec::new();
    for device in decoded.blockdevices {
        flatten(device, &mut rows);
    }
    Ok(rows)
}

fn flatten(mut device: BlockDevice, rows: &mut Vec<BlockDevice>) {
    let children = std::mem::take(&mut device.children);
    rows.push(device);
    for child in children {
        flatten(child, rows);
    }
}

fn exactly_one<T>(mut found: Vec<T>, what: &str) -> Result<T> {
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(ResolveError::DeviceNotFound(format!("no {what}"))),
        n => Err(ResolveError::DeviceNotFound(format!(
            "{n} candidates for {what}, only a single encrypted root is supported"
        ))),
    }
}

/// Identify the mapping mounted at `/`, then the container carrying its
/// volume UUID.
pub fn resolve_root_volume(rows: &[BlockDevice]) -> Result<String> {
    let ids = rows
        .iter()
        .filter(|row| row.is_mounted_at("/"))
        .filter_map(|row| VolumeId::from_mapping_name(&row.name))
        .collect();
    let id = exactly_one(ids, "`luks-<uuid>` mapping mounted at /")?;
    log::debug!("root is mounted from LUKS volume {id}");

    let containers = rows
        .iter()
        .filter(|row| row.is_luks_container())
        .filter(|row| row.uuid.as_deref().map(|u| id.matches(u)).unwrap_or(false))
        .map(BlockDevice::node)
        .collect();
    exactly_one(containers, &format!("{LUKS_FSTYPE} device with UUID {id}"))
}

/// Run `lsblk` and resolve the root LUKS container.
pub fn find_root_device<R: CommandRunner>(runner: &R, lsblk: &Path) -> Result<String> {
    let cmd = Cmd::new(lsblk).args([
        "--json",
        "--list",
        "--output",
        "NAME,PATH,FSTYPE,UUID,MOUNTPOINT",
    ]);
    let out = runner.run(&cmd)?.check(&cmd)?;
    let device = resolve_root_volume(&parse_lsblk(&out.stdout)?)?;
    log::info!("Root partition device detected: {device}");
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ok_stdout, FakeRunner};
    use eyre::Result;

    fn row(
        name: &str,
        path: &str,
        fstype: &str,
        uuid: Option<&str>,
        mount: Option<&str>,
    ) -> BlockDevice {
        BlockDevice {
            name: name.into(),
            path: Some(path.into()),
            fstype: Some(fstype.into()),
            uuid: uuid.map(Into::into),
            mountpoint: mount.map(Into::into),
            ..BlockDevice::default()
        }
    }

    #[test]
    fn resolves_container_through_volume_id() -> Result<()> {
        let rows = vec![
            row("luks-ABCD1234", "/dev/sda2", "ext4", None, Some("/")),
            row("sda1", "/dev/sda1", "crypto_LUKS", Some("ABCD1234"), None),
        ];
        assert_eq!(resolve_root_volume(&rows)?, "/dev/sda1");
        Ok(())
    }

    #[test]
    fn prefix_identifier_is_not_a_match() -> Result<()> {
        let short = uuid::Uuid::new_v4().to_string();
        let long = format!("{short}0");
        let rows = vec![
            row(&format!("luks-{short}"), "/dev/mapper/root", "btrfs", None, Some("/")),
            row("nvme0n1p3", "/dev/nvme0n1p3", "crypto_LUKS", Some(&long), None),
            row("nvme0n1p2", "/dev/nvme0n1p2", "crypto_LUKS", Some(&short), None),
        ];
        assert_eq!(resolve_root_volume(&rows)?, "/dev/nvme0n1p2");
        Ok(())
    }

    #[test]
    fn unencrypted_root_is_not_found() {
        let rows = vec![row("sda2", "/dev/sda2", "ext4", Some("1234"), Some("/"))];
        assert!(matches!(
            resolve_root_volume(&rows),
            Err(ResolveError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn missing_container_is_not_found() {
        let rows = vec![row("luks-ABCD", "/dev/mapper/luks-ABCD", "ext4", None, Some("/"))];
        assert!(matches!(
            resolve_root_volume(&rows),
            Err(ResolveError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn duplicate_containers_are_rejected() {
        let rows = vec![
            row("luks-ABCD", "/dev/mapper/luks-ABCD", "ext4", None, Some("/")),
            row("sda1", "/dev/sda1", "crypto_LUKS", Some("abcd"), None),
            row("sdb1", "/dev/sdb1", "crypto_LUKS", Some("ABCD"), None),
        ];
        match resolve_root_volume(&rows) {
            Err(ResolveError::DeviceNotFound(reason)) => assert!(reason.contains("2 candidates")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_tree_and_mountpoints_forms() -> Result<()> {
        let json = br#"{"blockdevices": [
            {"name": "sda", "path": "/dev/sda", "fstype": null, "children": [
                {"name": "sda1", "path": "/dev/sda1", "fstype": "vfat", "mountpoints": ["/boot/efi"]},
                {"name": "sda2", "path": "/dev/sda2", "fstype": "crypto_LUKS", "uuid": "0f1e2d3c", "children": [
                    {"name": "luks-0f1e2d3c", "path": "/dev/mapper/luks-0f1e2d3c", "fstype": "ext4", "mountpoints": ["/"]}
                ]}
            ]}
        ]}"#;
        let rows = parse_lsblk(json)?;
        assert_eq!(rows.len(), 4);
        assert_eq!(resolve_root_volume(&rows)?, "/dev/sda2");
        Ok(())
    }

    #[test]
    fn find_root_device_runs_lsblk() -> Result<()> {
        let runner = FakeRunner::new(|_| {
            ok_stdout(
                r#"{"blockdevices": [
                    {"name": "luks-ABCD1234", "path": "/dev/mapper/luks-ABCD1234", "fstype": "ext4", "uuid": "ffff", "mountpoint": "/"},
                    {"name": "sda1", "path": "/dev/sda1", "fstype": "crypto_LUKS", "uuid": "ABCD1234", "mountpoint": null}
                ]}"#,
            )
        });
        assert_eq!(find_root_device(&runner, Path::new("/usr/bin/lsblk"))?, "/dev/sda1");
        assert_eq!(runner.count("lsblk"), 1);
        Ok(())
    }
}
