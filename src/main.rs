use anyhow::Result;
use mxf::config;
use mxf::server::MxfServer;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().unwrap());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::args().nth(1);
    let config = config::load_config(config_path.as_deref().map(std::path::Path::new))?;

    let server = MxfServer::new(config).await?;
    server.run().await
}
