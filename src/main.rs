use anyhow::{Error, Result};
use notification_dispatcher::{app::App, config::Config};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = Config::load()?;
    info!("Configuration validated, starting notification dispatcher");

    let app = App::bootstrap(config).await?;
    app.run().await
}
