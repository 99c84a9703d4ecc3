use std::io::IsTerminal;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use secure_relay::{
    cli::{Cli, Command},
    client,
    config::RelayConfig,
    server::Relay,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => {
            // RSA key generation is CPU-bound; keep it off the async workers.
            let config_args = args.clone();
            let config = tokio::task::spawn_blocking(move || RelayConfig::from_args(&config_args))
                .await
                .context("key setup task failed")??;

            let listener = TcpListener::bind(args.listen)
                .await
                .with_context(|| format!("failed to bind {}", args.listen))?;
            let relay = Relay::new(listener, config);
            let addr = relay.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = relay.run_until_ctrl_c().await {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::Keygen(args) => {
            let output = args.output.clone();
            tokio::task::spawn_blocking(move || {
                RelayConfig::generate(args.rsa_bits)?.save(&args.output)
            })
            .await
            .context("key generation task failed")??;
            info!(path = %output.display(), "wrote RSA private key");
        }
    }

    Ok(())
}
