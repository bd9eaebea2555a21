//! Tonpixo terminal client.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tonpixo::backend::{HttpBackend, TonAddressValidator};
use tonpixo::channels::ReplChannel;
use tonpixo::chat::{ChatSession, ChatSettings};
use tonpixo::cli::{Cli, Command, run_check_command};
use tonpixo::config::Config;
use tonpixo::session::{FileAmbientSource, SessionIdentity};

fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tonpixo=warn"))
}

/// Logs go to stderr so they never interleave with the answer on stdout.
/// `TONPIXO_LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() {
    let json = std::env::var("TONPIXO_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(log_filter());
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tonpixo::bootstrap::load_tonpixo_env();
    init_tracing();

    let cli = Cli::parse();

    if let Some(Command::Check { timeout }) = &cli.command {
        return run_check_command(cli.config.as_deref(), Duration::from_secs(*timeout)).await;
    }

    let config = Config::from_env_with_toml(cli.config.as_deref())?;
    tracing::debug!(base_url = %config.api.base_url, user_id = %config.api.user_id, "Configuration loaded");

    let backend = Arc::new(HttpBackend::new(&config.api)?);
    let identity = SessionIdentity::new(Arc::new(FileAmbientSource::new(
        config.identity.pointer_path.clone(),
    )));
    if cli.new {
        identity.reset();
    }

    let session = ChatSession::new(
        backend,
        Arc::new(TonAddressValidator),
        identity,
        ChatSettings::from_config(&config),
    );
    tracing::info!(session_id = %session.session_id(), "Conversation ready");

    ReplChannel::new(session)
        .with_initial_address(cli.address)
        .run()
        .await;

    Ok(())
}
