//! mkinitcpio integration: a patched build config that runs our hook before
//! `encrypt`, the hook scripts themselves and the ramdisk build.

use crate::config::InitramfsConfig;
use crate::exec::{Cmd, CommandRunner, ExecError};
use crate::tpm::pcr::PcrSelection;
use crate::tpm::PersistentHandle;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HOOKS_KEY: &str = "HOOKS=";
const DECRYPT_HOOK: &str = "encrypt";
const SPLASH_DECRYPT_HOOK: &str = "plymouth-encrypt";
const SPLASH_HOOK: &str = "plymouth";
const PATCHED_CONFIG: &str = "mkinitcpio.conf";

#[derive(Error, Debug)]
pub enum InitramfsError {
    #[error("cannot place the `{hook}` hook: {reason}")]
    InjectionPointMissing { hook: String, reason: String },
    #[error("HOOKS already lists `{0}`, patch the distribution default instead")]
    AlreadyPatched(String),
    #[error("ramdisk build did not produce `{output}`: {reason}")]
    RamdiskBuildFailed { output: PathBuf, reason: String },
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Exec(#[from] ExecError),
}

pub type Result<T, E = InitramfsError> = core::result::Result<T, E>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> InitramfsError + '_ {
    move |source| InitramfsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

/// Rewrite `HOOKS=(...)` / `HOOKS="..."` so `hook` runs right before `encrypt`.
fn patch_hooks_line(line: &str, hook: &str) -> Result<String> {
    let value = line[HOOKS_KEY.len()..].trim();
    let (open, close) = match value.chars().next() {
        Some('(') => ("(", ")"),
        Some('"') => ("\"", "\""),
        _ => ("", ""),
    };
    let body = value
        .strip_prefix(open)
        .and_then(|v| v.strip_suffix(close))
        .unwrap_or(value);

    let mut hooks: Vec<&str> = Vec::new();
    for token in body.split_whitespace() {
        if token == hook {
            return Err(InitramfsError::AlreadyPatched(hook.to_string()));
        }
        match token {
            SPLASH_HOOK => continue,
            SPLASH_DECRYPT_HOOK => hooks.push(DECRYPT_HOOK),
            other => hooks.push(other),
        }
    }

    let at = hooks
        .iter()
        .position(|h| *h == DECRYPT_HOOK)
        .ok_or_else(|| InitramfsError::InjectionPointMissing {
            hook: hook.to_string(),
            reason: format!("HOOKS has no `{DECRYPT_HOOK}` entry"),
        })?;
    hooks.insert(at, hook);

    Ok(format!(
        "{HOOKS_KEY}{open}{}{close} # edited by {hook}",
        hooks.join(" ")
    ))
}

/// Produce a build config from the distribution's default. Comments and
/// blank lines are dropped, lines naming `plaintext_key` are disabled and
/// `hook` is inserted before `encrypt`.
pub fn patch_build_config(original: &str, hook: &str, plaintext_key: &str) -> Result<String> {
    let mut patched = String::with_capacity(original.len());
    let mut hooks_seen = false;

    for raw in original.lines() {
        let line = strip_comment(raw.trim_start()).trim_end();
        let line = if line.contains(plaintext_key) {
            format!("#{line} # removed by {hook}")
        } else if line.starts_with(HOOKS_KEY) {
            hooks_seen = true;
            patch_hooks_line(line, hook)?
        } else {
            line.to_string()
        };
        if !line.is_empty() {
            patched.push_str(&line);
            patched.push('\n');
        }
    }

    if !hooks_seen {
        return Err(InitramfsError::InjectionPointMissing {
            hook: hook.to_string(),
            reason: "no HOOKS= line".into(),
        });
    }
    Ok(patched)
}

/// Patch the base config into `data_dir`, leaving the original untouched.
pub fn prepare_build_config(cfg: &InitramfsConfig, data_dir: &Path) -> Result<PathBuf> {
    let original = fs::read_to_string(&cfg.base_config).map_err(io_err(&cfg.base_config))?;
    let patched = patch_build_config(&original, &cfg.hook_name, &cfg.plaintext_key)?;
    let path = data_dir.join(PATCHED_CONFIG);
    fs::write(&path, patched).map_err(io_err(&path))?;
    log::info!("Patched ramdisk build config written to {}", path.display());
    Ok(path)
}

/// Early-boot hook and build-time installer for mkinitcpio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookScripts {
    pub run_hook: String,
    pub install: String,
}

impl HookScripts {
    pub fn render(cfg: &InitramfsConfig, handle: PersistentHandle, pcrs: &PcrSelection) -> Self {
        let key = &cfg.plaintext_key;
        let run_hook = format!(
            r#"#!/usr/bin/ash
run_hook() {{
    modprobe -a -q {modules} >/dev/null 2>&1
    tpm2_unseal -c {handle} -p pcr:{pcrs} -o {key} >/dev/null 2>&1
    if [ ! -f "{key}" ]; then
        echo "{name}: the TPM did not release the disk key"
        echo "    first boot before running setup2, a kernel or ramdisk update,"
        echo "    or a change in the boot chain. Falling back to the passphrase."
        echo
    fi
}}
"#,
            modules = cfg.kernel_modules.join(" "),
            name = cfg.hook_name,
        );

        let mut install = String::from("#!/bin/bash\nbuild() {\n");
        for module in &cfg.kernel_modules {
            install.push_str(&format!("    add_module \"{module}\"\n"));
        }
        install.push_str(&format!(
            r#"    add_binary "tpm2_unseal"
    add_binary "{tcti}"
    add_runscript
}}
help() {{
    cat <<HELPEOF
Unseals the disk encryption key from the TPM when the boot measurements match.
HELPEOF
}}
"#,
            tcti = cfg.tcti_library.display(),
        ));

        Self { run_hook, install }
    }

    /// Write both scripts, replacing earlier copies.
    pub fn install(&self, cfg: &InitramfsConfig) -> Result<()> {
        for (dir, body) in [(&cfg.hooks_dir, &self.run_hook), (&cfg.install_dir, &self.install)] {
            fs::create_dir_all(dir).map_err(io_err(dir))?;
            let path = dir.join(&cfg.hook_name);
            fs::write(&path, body).map_err(io_err(&path))?;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                .map_err(io_err(&path))?;
            log::debug!("installed {}", path.display());
        }
        Ok(())
    }
}

/// Run `mkinitcpio` against `config` for `kernel`. The output is removed
/// first so that its presence afterwards is proof of a build.
pub fn build_ramdisk<R: CommandRunner>(
    runner: &R,
    mkinitcpio: &Path,
    config: &Path,
    kernel: &Path,
    output: &Path,
) -> Result<()> {
    match fs::remove_file(output) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(io_err(output)(err)),
        _ => {}
    }

    let cmd = Cmd::new(mkinitcpio)
        .arg("-c")
        .arg(config)
        .arg("-g")
        .arg(output)
        .arg("-k")
        .arg(kernel);
    let out = runner.run(&cmd)?;

    let failed = |reason: String| InitramfsError::RamdiskBuildFailed {
        output: output.to_path_buf(),
        reason,
    };
    if !out.success() {
        return Err(failed(format!(
            "{} exited with status {}: {}",
            cmd.name(),
            out.status,
            out.stderr.trim()
        )));
    }
    if !output.is_file() {
        return Err(failed(format!("{} reported success", cmd.name())));
    }
    log::info!("Ramdisk built: {}", output.display());
    Ok(())
}
