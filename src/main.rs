/// To build a distributable binary with the `esapi` backend linked in
/// statically:
/// ```
/// rustup target add x86_64-unknown-linux-musl
/// MEASURED_UNLOCK_BUILD_STATIC=1 cargo build --release --features esapi --target=x86_64-unknown-linux-musl
/// ```
use eyre::Result;
use measured_unlock::cli::Cli;

fn main() -> Result<()> {
    let Some(cli) = Cli::new() else {
        return Ok(());
    };
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
    #[cfg(feature = "esapi")]
    std::env::set_var("TSS2_LOG", "all+NONE");
    cli.run()?;
    Ok(())
}
