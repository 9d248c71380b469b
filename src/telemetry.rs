use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Instala un subscriber `fmt` filtrado por `RUST_LOG`.
///
/// `default_directive` (e.g. `"open_link=debug"`) is added on top of whatever
/// `RUST_LOG` says. Calling it twice returns an error instead of panicking.
pub fn init_tracing(default_directive: &str) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(default_directive.parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing already initialised: {e}"))?;

    tracing::info!("🎵 open-link v{} listo para registrar", env!("CARGO_PKG_VERSION"));
    Ok(())
}
