use anyhow::Context as _;

/// Chapter-level progress is the interesting signal here, so the crate's
/// own events default to debug while dependencies stay at info. `RUST_LOG`
/// overrides both.
const DEFAULT_DIRECTIVES: &str = "info,mangashelf=debug";

pub fn init() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(DEFAULT_DIRECTIVES))
        .context("build log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("initialize tracing subscriber: {err}"))?;

    Ok(())
}
