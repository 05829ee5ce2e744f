use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;
use wxgate::config::{resolve_config_path, Config};
use wxgate::gateway::{run_gateway, AppState};
use wxgate::handler::ReplyResolver;
use wxgate::platform::{Forwarder, WeChatApiClient};
use wxgate::registry::{greeting, AccountScope, Registry};
use wxgate::security::{MemoryReplayCache, ReplayCache, SignatureVerifier};
use wxgate::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "wxgate", version, about = "WeChat Official Account message gateway")]
struct Cli {
    /// Config file (defaults to $WXGATE_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the callback gateway
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Validate the config file and exit
    Check,
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wxgate=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::rfc_3339())
        .with_ansi(true)
        .init();
}

fn build_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_fn("greeting", AccountScope::All, greeting);
    registry
}

fn warn_unregistered(config: &Config, registry: &Registry) -> usize {
    let (predicates, programs) = config.referenced_programs();
    let mut missing = 0;
    for name in predicates.into_iter().filter(|name| !registry.has_predicate(name)) {
        tracing::warn!(predicate = name, "custom rule refers to an unregistered predicate");
        missing += 1;
    }
    for name in programs.into_iter().filter(|name| !registry.has_program(name)) {
        tracing::warn!(program = name, "custom reply refers to an unregistered program");
        missing += 1;
    }
    missing
}

fn build_pipeline(config: &Config, registry: Registry) -> Result<Pipeline> {
    let accounts = config.build_accounts()?;
    for account in accounts.iter().filter(|account| !account.is_interactable()) {
        tracing::warn!(
            account = %account.name,
            "account is missing credentials and will answer 404"
        );
    }

    let replay: Option<Arc<dyn ReplayCache>> = if config.security.replay_protection {
        Some(Arc::new(MemoryReplayCache::new()))
    } else {
        tracing::warn!("replay protection disabled");
        None
    };
    let tolerance = Duration::from_secs(config.security.timestamp_tolerance_secs);
    let verifier = SignatureVerifier::new(tolerance, replay);

    let timeout = Duration::from_millis(config.outbound.timeout_ms);
    let platform =
        WeChatApiClient::new(&config.outbound.api_base_url, timeout, config.credentials())
            .context("failed to build platform client")?;
    let forwarder = Forwarder::new(timeout).context("failed to build forward client")?;
    let resolver = ReplyResolver::new(Arc::new(registry), Arc::new(platform), forwarder, timeout);

    Ok(Pipeline::new(accounts, verifier, resolver))
}

#[cfg(unix)]
fn spawn_reload_on_hangup(path: PathBuf, pipeline: Arc<Pipeline>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            reload(&path, &pipeline);
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_path: PathBuf, _pipeline: Arc<Pipeline>) -> Result<()> {
    Ok(())
}

fn reload(path: &Path, pipeline: &Pipeline) {
    let sets = Config::load(path).and_then(|config| Ok(config.build_handler_sets()?));
    match sets {
        Ok(sets) => {
            let updated = pipeline.reload_handlers(sets);
            tracing::info!(updated, "handlers reloaded");
        }
        Err(err) => tracing::error!("reload failed, keeping previous handlers: {err:#}"),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn serve(path: PathBuf, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = Config::load(&path)?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let registry = build_registry();
    warn_unregistered(&config, &registry);
    let pipeline = Arc::new(build_pipeline(&config, registry)?);
    spawn_reload_on_hangup(path, Arc::clone(&pipeline))?;

    run_gateway(&config.gateway, AppState { pipeline }, shutdown_signal()).await
}

fn check(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    let missing = warn_unregistered(&config, &build_registry());
    for account in &config.accounts {
        println!(
            "{}: {} handler(s), {:?} mode",
            account.name,
            account.handlers.len(),
            account.encoding_mode
        );
    }
    if missing > 0 {
        anyhow::bail!("{missing} custom program(s) are not registered");
    }
    println!("config ok: {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let path = resolve_config_path(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { host, port } => serve(path, host, port).await,
        Command::Check => check(&path),
    }
}
