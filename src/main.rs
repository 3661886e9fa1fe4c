use clap::Parser;
use color_eyre::eyre::Context;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt, fmt::time::ChronoLocal, layer::SubscriberExt, util::SubscriberInitExt,
};
use tunman::{ApplicationConfig, entrypoint};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let config = ApplicationConfig::parse();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| "Invalid log level")?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(ChronoLocal::rfc_3339()))
        .with(ErrorLayer::default())
        .init();
    entrypoint(config).await
}
