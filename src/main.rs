use tracing::info;

use eggnat::botnet::config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("eggnat {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    if config.session.leaf_mode {
        info!("leaf mode: every downstream bot is masked");
    }

    eggnat::botnet::server::run(config).await
}
