//! Unified kernel image assembly and firmware boot-menu registration.

use crate::config::{BootConfig, Tools};
use crate::exec::{Cmd, CommandRunner, ExecError};
use crate::state::{BootEntryRecord, StateError, StateStore};
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const KERNEL_PREFIX: &str = "vmlinuz";
const MICROCODE_RAMDISK: &str = "initramfs-ucode.img";

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("no `vmlinuz*` kernel image in {0}")]
    KernelNotFound(PathBuf),
    #[error("failed to write boot image `{path}`: {reason}")]
    ImageWriteFailed { path: PathBuf, reason: String },
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("nothing is mounted at the EFI system partition mount point {0}")]
    EspNotMounted(PathBuf),
    #[error("boot image {image} is not on the EFI system partition {esp}")]
    OutsideEsp { image: PathBuf, esp: PathBuf },
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T, E = ImageError> = core::result::Result<T, E>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ImageError + '_ {
    move |source| ImageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Every decimal run in `name`, e.g. `vmlinuz-6.1.12-arch1` -> `[6, 1, 12, 1]`.
fn version_key(name: &str) -> Vec<u64> {
    name.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .map(|run| run.parse().unwrap_or(u64::MAX))
        .collect()
}

/// Newest `vmlinuz*` in `boot_dir`; equal versions fall back to the
/// lexically greatest path.
pub fn select_kernel(boot_dir: &Path) -> Result<PathBuf> {
    let mut candidates = Vec::new();
    for entry in fs::read_dir(boot_dir).map_err(io_err(boot_dir))? {
        let path = entry.map_err(io_err(boot_dir))?.path();
        let is_kernel = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(KERNEL_PREFIX))
            .unwrap_or(false);
        if is_kernel && path.is_file() {
            candidates.push(path);
        }
    }
    candidates.sort();

    let key = |p: &PathBuf| version_key(&p.file_name().unwrap_or_default().to_string_lossy());
    let chosen = candidates
        .iter()
        .max_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.cmp(b)))
        .cloned()
        .ok_or_else(|| ImageError::KernelNotFound(boot_dir.to_path_buf()))?;

    log::info!("Using kernel:");
    for candidate in &candidates {
        let mark = if *candidate == chosen { "X" } else { " " };
        log::info!(" [{mark}] {}", candidate.display());
    }
    Ok(chosen)
}

/// Running kernel command line, up to the first control character.
pub fn capture_cmdline(source: &Path) -> Result<String> {
    let raw = fs::read(source).map_err(io_err(source))?;
    let end = raw.iter().position(|b| *b < 0x20).unwrap_or(raw.len());
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuVendor {
    Intel,
    Amd,
}

impl CpuVendor {
    pub fn from_cpuinfo(cpuinfo: &str) -> Option<Self> {
        let vendor = cpuinfo.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == "vendor_id").then(|| value.trim())
        })?;
        match vendor {
            "GenuineIntel" => Some(Self::Intel),
            "AuthenticAMD" => Some(Self::Amd),
            _ => None,
        }
    }

    pub fn microcode_image(&self) -> &'static str {
        match self {
            Self::Intel => "intel-ucode.img",
            Self::Amd => "amd-ucode.img",
        }
    }
}

/// Microcode image for the running CPU, if the distribution installed one.
pub fn find_microcode(cpuinfo: &Path, boot_dir: &Path) -> Option<PathBuf> {
    let text = fs::read_to_string(cpuinfo).ok()?;
    let image = boot_dir.join(CpuVendor::from_cpuinfo(&text)?.microcode_image());
    image.is_file().then_some(image)
}

/// A PE section added to the EFI stub at a fixed virtual address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: &'static str,
    pub vma: u64,
    pub source: PathBuf,
}

impl Section {
    /// Kernel at 0x40000, ramdisk at 0x4000000 leaves the kernel ~60MiB.
    pub fn layout(os_release: &Path, cmdline: &Path, kernel: &Path, initrd: &Path) -> [Section; 4] {
        let section = |name: &'static str, vma: u64, source: &Path| Section {
            name,
            vma,
            source: source.to_path_buf(),
        };
        [
            section(".osrel", 0x30000, os_release),
            section(".cmdline", 0x38000, cmdline),
            section(".linux", 0x40000, kernel),
            section(".initrd", 0x4000000, initrd),
        ]
    }
}

pub fn objcopy_args(sections: &[Section], stub: &Path, image: &Path) -> Vec<OsString> {
    let mut args = Vec::new();
    for section in sections {
        let mut add = OsString::from(format!("{}=", section.name));
        add.push(&section.source);
        args.push("--add-section".into());
        args.push(add);
        args.push("--change-section-vma".into());
        args.push(format!("{}={:#x}", section.name, section.vma).into());
    }
    args.push(stub.into());
    args.push(image.into());
    args
}

/// `NAME=` from os-release without quotes or a trailing " Linux", then `suffix`.
pub fn boot_label(os_release: &str, suffix: &str) -> String {
    let name = os_release
        .lines()
        .find_map(|line| line.trim().strip_prefix("NAME="))
        .map(|value| {
            value
                .trim()
                .trim_matches(|c: char| c == '"' || c == '\'')
                .replace(" Linux", "")
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Linux".to_string());
    format!("{name} {suffix}")
}

/// Split the device mounted at `esp_mount` into disk and partition number.
pub fn esp_partition(mounts: &str, esp_mount: &Path) -> Result<(String, u8)> {
    let target = esp_mount.to_string_lossy();
    let device = mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .filter(|(_, mountpoint)| *mountpoint == target)
        .map(|(device, _)| device)
        .last()
        .ok_or_else(|| ImageError::EspNotMounted(esp_mount.to_path_buf()))?;

    let disk = device.trim_end_matches(|c: char| c.is_ascii_digit());
    let number = &device[disk.len()..];
    let partition = match number.len() {
        1 => number
            .parse()
            .map_err(|_| ImageError::Unsupported(format!("partition number of {device}")))?,
        0 => {
            return Err(ImageError::Unsupported(format!(
                "{device} is not a numbered partition"
            )))
        }
        _ => {
            return Err(ImageError::Unsupported(format!(
                "multi-digit partition number on {device}"
            )))
        }
    };
    // nvme0n1p1, mmcblk0p1
    let disk = match disk.strip_suffix('p') {
        Some(base) if base.ends_with(|c: char| c.is_ascii_digit()) => base,
        _ => disk,
    };
    Ok((disk.to_string(), partition))
}

/// Firmware loader path of `image`, e.g. `\EFI\MeasuredUnlock\linux.efi`.
pub fn loader_path(image: &Path, esp_mount: &Path) -> Result<String> {
    let relative = image
        .strip_prefix(esp_mount)
        .map_err(|_| ImageError::OutsideEsp {
            image: image.to_path_buf(),
            esp: esp_mount.to_path_buf(),
        })?;
    let mut loader = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            loader.push('\\');
            loader.push_str(&part.to_string_lossy());
        }
    }
    Ok(loader)
}

/// Assembles the boot image from the selected kernel and a fresh ramdisk.
pub struct ImageComposer<'a, R: CommandRunner> {
    runner: &'a R,
    boot: &'a BootConfig,
    tools: &'a Tools,
}

impl<'a, R: CommandRunner> ImageComposer<'a, R> {
    pub fn new(runner: &'a R, boot: &'a BootConfig, tools: &'a Tools) -> Self {
        Self {
            runner,
            boot,
            tools,
        }
    }

    /// Prepend microcode to `ramdisk` when available.
    fn initrd(&self, ramdisk: &Path, store: &StateStore) -> Result<PathBuf> {
        let Some(ucode) = find_microcode(&self.boot.cpuinfo, &self.boot.boot_dir) else {
            return Ok(ramdisk.to_path_buf());
        };
        log::info!("Prepending microcode {}", ucode.display());
        let mut combined = fs::read(&ucode).map_err(io_err(&ucode))?;
        combined.extend(fs::read(ramdisk).map_err(io_err(ramdisk))?);
        let path = store.path(MICROCODE_RAMDISK);
        fs::write(&path, combined).map_err(io_err(&path))?;
        Ok(path)
    }

    pub fn compose(&self, kernel: &Path, ramdisk: &Path, store: &StateStore) -> Result<PathBuf> {
        let cmdline = capture_cmdline(&self.boot.cmdline_source)?;
        log::info!("Kernel command line: {cmdline}");
        let cmdline_file = store.save_cmdline(&cmdline)?;
        let initrd = self.initrd(ramdisk, store)?;

        let image = &self.boot.image;
        let failed = |reason: String| ImageError::ImageWriteFailed {
            path: image.clone(),
            reason,
        };
        if let Some(parent) = image.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        match fs::remove_file(image) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(io_err(image)(err)),
            _ => {}
        }

        let sections = Section::layout(&self.boot.os_release, &cmdline_file, kernel, &initrd);
        let cmd = Cmd::new(&self.tools.objcopy).args(objcopy_args(
            &sections,
            &self.boot.efi_stub,
            image,
        ));
        let out = self.runner.run(&cmd)?;
        if !out.success() {
            return Err(failed(out.stderr.trim().to_string()));
        }
        if !image.is_file() {
            return Err(failed(format!("{} reported success", cmd.name())));
        }
        log::info!("Boot image written to {}", image.display());
        Ok(image.clone())
    }

    /// Add a firmware boot entry for the image unless one was already made.
    /// Returns whether an entry was created.
    pub fn register(&self, label: &str, store: &StateStore) -> Result<bool> {
        if let Some(entry) = store.boot_entry()? {
            log::info!("Boot entry \"{}\" already registered", entry.label);
            return Ok(false);
        }
        let mounts = fs::read_to_string(&self.boot.mounts).map_err(io_err(&self.boot.mounts))?;
        let (disk, partition) = esp_partition(&mounts, &self.boot.esp_mount)?;
        let entry = BootEntryRecord {
            disk,
            partition,
            label: label.to_string(),
            loader: loader_path(&self.boot.image, &self.boot.esp_mount)?,
        };

        let cmd = Cmd::new(&self.tools.efibootmgr)
            .arg("--create")
            .arg("--disk")
            .arg(&entry.disk)
            .arg("--part")
            .arg(entry.partition.to_string())
            .arg("--label")
            .arg(&entry.label)
            .arg("--loader")
            .arg(&entry.loader);
        self.runner.run(&cmd)?.check(&cmd)?;
        store.save_boot_entry(&entry)?;
        log::info!("Boot entry \"{}\" registered", entry.label);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::exec::Output;
    use crate::testing::FakeRunner;
    use eyre::Result;

    #[test]
    fn newest_kernel_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in [
            "vmlinuz-6.1.9-arch1-1",
            "vmlinuz-6.10.1-arch1-1",
            "vmlinuz-6.2.0-arch1-1",
            "initramfs-6.10.1.img",
        ] {
            fs::write(dir.path().join(name), b"")?;
        }
        assert_eq!(select_kernel(dir.path())?, dir.path().join("vmlinuz-6.10.1-arch1-1"));
        Ok(())
    }

    #[test]
    fn unversioned_kernels_tie_break_on_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("vmlinuz-linux"), b"")?;
        fs::write(dir.path().join("vmlinuz-linux-zen"), b"")?;
        assert_eq!(select_kernel(dir.path())?, dir.path().join("vmlinuz-linux-zen"));
        Ok(())
    }

    #[test]
    fn no_kernel() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            select_kernel(dir.path()),
            Err(ImageError::KernelNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn cmdline_stops_at_newline() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cmdline");
        fs::write(&path, "cryptdevice=UUID=abcd:root root=/dev/mapper/root rw\n")?;
        assert_eq!(
            capture_cmdline(&path)?,
            "cryptdevice=UUID=abcd:root root=/dev/mapper/root rw"
        );
        Ok(())
    }

    #[test]
    fn cpu_vendor() {
        let intel = "processor\t: 0\nvendor_id\t: GenuineIntel\ncpu family\t: 6\n";
        assert_eq!(CpuVendor::from_cpuinfo(intel), Some(CpuVendor::Intel));
        assert_eq!(
            CpuVendor::from_cpuinfo("vendor_id : AuthenticAMD"),
            Some(CpuVendor::Amd)
        );
        assert_eq!(CpuVendor::from_cpuinfo("vendor_id : HygonGenuine"), None);
    }

    #[test]
    fn labels() {
        let arch = "PRETTY_NAME=\"Arch Linux\"\nNAME=\"Arch Linux\"\nID=arch\n";
        assert_eq!(boot_label(arch, "Measured Unlock"), "Arch Measured Unlock");
        assert_eq!(boot_label("NAME='EndeavourOS'", "Unlock"), "EndeavourOS Unlock");
        assert_eq!(boot_label("ID=unknown", "Measured Unlock"), "Linux Measured Unlock");
    }

    #[test]
    fn esp_partitions() -> Result<()> {
        let mounts = "\
/dev/mapper/luks-abcd / ext4 rw,relatime 0 0
/dev/sda1 /boot/efi vfat rw 0 0
/dev/nvme0n1p1 /efi vfat rw 0 0
/dev/sdb12 /mnt/esp vfat rw 0 0
";
        assert_eq!(
            esp_partition(mounts, Path::new("/boot/efi"))?,
            ("/dev/sda".to_string(), 1)
        );
        assert_eq!(
            esp_partition(mounts, Path::new("/efi"))?,
            ("/dev/nvme0n1".to_string(), 1)
        );
        assert!(matches!(
            esp_partition(mounts, Path::new("/mnt/esp")),
            Err(ImageError::Unsupported(_))
        ));
        assert!(matches!(
            esp_partition(mounts, Path::new("/boot")),
            Err(ImageError::EspNotMounted(_))
        ));
        Ok(())
    }

    #[test]
    fn loader_paths() -> Result<()> {
        assert_eq!(
            loader_path(
                Path::new("/boot/efi/EFI/MeasuredUnlock/linux.efi"),
                Path::new("/boot/efi")
            )?,
            "\\EFI\\MeasuredUnlock\\linux.efi"
        );
        assert!(matches!(
            loader_path(Path::new("/boot/linux.efi"), Path::new("/boot/efi")),
            Err(ImageError::OutsideEsp { .. })
        ));
        Ok(())
    }

    #[test]
    fn section_layout() {
        let sections = Section::layout(
            Path::new("/usr/lib/os-release"),
            Path::new("/state/cmdline"),
            Path::new("/boot/vmlinuz-linux"),
            Path::new("/state/initramfs.img"),
        );
        let args: Vec<String> = objcopy_args(&sections, Path::new("stub.efi"), Path::new("out.efi"))
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args.join(" "),
            "--add-section .osrel=/usr/lib/os-release --change-section-vma .osrel=0x30000 \
             --add-section .cmdline=/state/cmdline --change-section-vma .cmdline=0x38000 \
             --add-section .linux=/boot/vmlinuz-linux --change-section-vma .linux=0x40000 \
             --add-section .initrd=/state/initramfs.img --change-section-vma .initrd=0x4000000 \
             stub.efi out.efi"
        );
    }

    fn host(root: &Path) -> Result<Config> {
        let config = Config::rooted_at(root);
        fs::create_dir_all(&config.boot.boot_dir)?;
        fs::create_dir_all(config.boot.mounts.parent().unwrap())?;
        fs::write(&config.boot.cmdline_source, "root=/dev/mapper/root rw\n")?;
        fs::write(&config.boot.cpuinfo, "vendor_id\t: GenuineIntel\n")?;
        fs::write(
            &config.boot.mounts,
            format!("/dev/sda1 {} vfat rw 0 0\n", config.boot.esp_mount.display()),
        )?;
        Ok(config)
    }

    fn writes_image(cmd: &Cmd) -> Output {
        if let Some(image) = cmd.get_args().last() {
            let _ = fs::write(image, b"MZ");
        }
        Output::default()
    }

    #[test]
    fn compose_prepends_microcode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = host(dir.path())?;
        let store = StateStore::open(&config.data_dir)?;
        fs::write(config.boot.boot_dir.join("intel-ucode.img"), b"UCODE")?;
        let ramdisk = store.path("initramfs.img");
        fs::write(&ramdisk, b"RAMDISK")?;

        let runner = FakeRunner::new(writes_image);
        let composer = ImageComposer::new(&runner, &config.boot, &config.tools);
        let image = composer.compose(Path::new("/boot/vmlinuz-linux"), &ramdisk, &store)?;

        assert_eq!(image, config.boot.image);
        let combined = store.path(MICROCODE_RAMDISK);
        assert_eq!(fs::read(&combined)?, b"UCODERAMDISK");
        assert_eq!(
            fs::read_to_string(store.path("kernel-command-line.txt"))?,
            "root=/dev/mapper/root rw"
        );
        let commands = runner.commands();
        assert!(commands[0]
            .to_string()
            .contains(&format!(".initrd={}", combined.display())));
        Ok(())
    }

    #[test]
    fn missing_image_is_write_failure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = host(dir.path())?;
        let store = StateStore::open(&config.data_dir)?;
        let ramdisk = store.path("initramfs.img");
        fs::write(&ramdisk, b"RAMDISK")?;

        let runner = FakeRunner::new(|_| Output::default());
        let composer = ImageComposer::new(&runner, &config.boot, &config.tools);
        assert!(matches!(
            composer.compose(Path::new("/boot/vmlinuz-linux"), &ramdisk, &store),
            Err(ImageError::ImageWriteFailed { .. })
        ));
        Ok(())
    }

    #[test]
    fn registers_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = host(dir.path())?;
        let store = StateStore::open(&config.data_dir)?;
        let runner = FakeRunner::new(|_| Output::default());
        let composer = ImageComposer::new(&runner, &config.boot, &config.tools);

        assert!(composer.register("Arch Measured Unlock", &store)?);
        assert!(!composer.register("Arch Measured Unlock", &store)?);
        assert_eq!(runner.count("efibootmgr"), 1);

        let entry = store.boot_entry()?.unwrap();
        assert_eq!(entry.disk, "/dev/sda");
        assert_eq!(entry.partition, 1);
        assert_eq!(entry.loader, "\\EFI\\MeasuredUnlock\\linux.efi");
        let commands = runner.commands();
        assert_eq!(commands[0].arg_after("--label").unwrap(), "Arch Measured Unlock");
        Ok(())
    }
}
