use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::exec::{CommandRunner, SystemRunner};
use crate::luks::TerminalPrompt;
use crate::preflight;
use crate::provision::{Provisioner, RunContext};
use crate::state::StateStore;
use crate::tpm::tools::Tpm2Tools;
use crate::tpm::{SealedKeyStore, TpmBackend};
use crate::uki::boot_label;
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use eyre::Result;
use std::fs;
use std::path::PathBuf;

const TPM_ENV_VAR: &str = "TCTI";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration, built-in defaults are used when it does not exist
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// TPM device specified in TCTI format
    #[arg(short = 'T', long, default_value = "device:/dev/tpmrm0", env = TPM_ENV_VAR)]
    tcti: String,

    /// Talk to the TPM through the TSS ESAPI instead of the tpm2-tools binaries
    #[cfg(feature = "esapi")]
    #[arg(long)]
    esapi: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Commands {
    /// Add a disposable LUKS key, seal it in the TPM, then build and register the boot image
    Setup1,
    /// After booting the new entry: reseal the key against the measured boot chain
    Setup2,
}

impl Cli {
    /// Parse the command line. An unknown subcommand prints usage and yields
    /// `None`.
    pub fn new() -> Option<Self> {
        match Self::try_parse() {
            Ok(cli) => Some(cli),
            Err(err) if err.kind() == ErrorKind::InvalidSubcommand => {
                println!("Unknown command");
                Self::print_usage();
                None
            }
            Err(err) => err.exit(),
        }
    }

    fn print_usage() {
        if Self::command().print_help().is_ok() {
            println!();
        }
    }

    fn uses_esapi(&self) -> bool {
        #[cfg(feature = "esapi")]
        return self.esapi;
        #[cfg(not(feature = "esapi"))]
        return false;
    }

    pub fn run(&self) -> Result<()> {
        let Some(command) = self.command else {
            Self::print_usage();
            return Ok(());
        };

        preflight::ensure_root()?;
        let config = Config::load(&self.config)?;
        preflight::check_dependencies(&config, !self.uses_esapi())?;
        let runner = SystemRunner;

        #[cfg(feature = "esapi")]
        if self.esapi {
            let backend = crate::tpm::esapi::Esapi::open(&self.tcti)?;
            return provision(command, config, &runner, backend);
        }

        let state = StateStore::open(&config.data_dir)?;
        let backend = Tpm2Tools::new(
            &runner,
            &config.tools.tpm2_tools_dir,
            state.dir(),
            &self.tcti,
        );
        provision(command, config, &runner, backend)
    }
}

fn provision<R, B>(command: Commands, config: Config, runner: &R, backend: B) -> Result<()>
where
    R: CommandRunner,
    B: TpmBackend,
{
    let mut keys = SealedKeyStore::new(backend);
    let pcrs = keys.select_pcrs(&config.pcrs)?;
    let os_release = fs::read_to_string(&config.boot.os_release).unwrap_or_else(|err| {
        log::warn!("cannot read {}: {err}", config.boot.os_release.display());
        String::new()
    });
    let ctx = RunContext {
        boot_label: boot_label(&os_release, &config.boot.label_suffix),
        pcrs,
        config,
    };
    log::info!("Sealing against {}", ctx.pcrs);

    let mut provisioner = Provisioner::new(&ctx, runner, keys, TerminalPrompt);
    match command {
        Commands::Setup1 => {
            provisioner.setup1()?;
            println!(
                "\nPlease restart your computer and select the \"{}\" entry \
                 in the firmware boot menu.\n\
                 You will need to type the passphrase one more time.\n\
                 Run \"measured-unlock setup2\" after the reboot to finish the setup.",
                ctx.boot_label
            );
        }
        Commands::Setup2 => {
            provisioner.setup2()?;
            println!("Done.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn subcommand_is_optional() -> eyre::Result<()> {
        let cli = Cli::try_parse_from(["measured-unlock"])?;
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        Ok(())
    }

    #[test]
    fn parses_phases() -> eyre::Result<()> {
        let cli = Cli::try_parse_from(["measured-unlock", "-T", "mssim:host=localhost", "setup2"])?;
        assert!(matches!(cli.command, Some(Commands::Setup2)));
        assert_eq!(cli.tcti, "mssim:host=localhost");
        Ok(())
    }

    #[test]
    fn unknown_subcommand_kind() {
        let err = Cli::try_parse_from(["measured-unlock", "setup3"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidSubcommand);
    }
}
