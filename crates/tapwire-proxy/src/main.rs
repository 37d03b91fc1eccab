use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use tapwire_core::{HostSigner, Proxy};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Intercepting HTTP(S) proxy with dynamic certificate minting"
)]
struct Args {
    /// Listen address. Clients use it as an HTTP proxy: absolute-form
    /// requests for plain HTTP, CONNECT for TLS.
    #[arg(long, env = "TAPWIRE_LISTEN", default_value = "0.0.0.0:8003")]
    listen: String,

    /// Path to the CA certificate PEM presented (indirectly) to clients.
    #[arg(long, env = "TAPWIRE_CA_CERT", default_value = "./cert/cert.pem")]
    ca_cert: PathBuf,

    /// Path to the CA private key PEM (PKCS#8, SEC1 EC, or PKCS#1 RSA).
    #[arg(long, env = "TAPWIRE_CA_KEY", default_value = "./cert/key.pem")]
    ca_key: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tapwire=info,tapwire_core=info".into()),
        )
        .compact()
        .init();

    let signer = HostSigner::load(&args.ca_cert, &args.ca_key)
        .context("CA material is required before serving")?;
    info!("CA loaded from {}", args.ca_cert.display());

    let handle = Proxy::new(signer)
        .start(&args.listen)
        .await
        .with_context(|| format!("failed to start on {}", args.listen))?;
    info!("ready on port {}", handle.port());

    tokio::signal::ctrl_c().await?;
    handle.stop();
    Ok(())
}
