use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use shared::types::Event;
use lanbrowse::{Config, DiscoveryEngine, SessionId, UdpTransport};

/// Browse the local network for a DNS-SD service type and print every
/// change as a JSON line
#[derive(Debug, Parser)]
#[command(name = "lanbrowse", version)]
struct Cli {
    /// Service type, e.g. "_http._tcp" or "_ipp._tcp.local.";
    /// "_services._dns-sd._udp" lists the service types instead
    service_type: String,

    /// TOML configuration file
    #[arg(short, long, env = "LANBROWSE_CONFIG")]
    config: Option<PathBuf>,

    /// Resolve every instance as it is found
    #[arg(short, long)]
    resolve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lanbrowse=info"))
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::default(),
    };

    let transport = Arc::new(UdpTransport::new(config.transport.clone()));
    let engine = Arc::new(DiscoveryEngine::new(transport, config));

    let (tx, rx) = flume::unbounded::<Event>();
    let id = engine
        .listen(&cli.service_type, Arc::new(tx))
        .await
        .with_context(|| format!("Failed to browse {}", cli.service_type))?;

    tracing::info!("Browsing {} (session {})", cli.service_type, id);

    loop {
        tokio::select! {
            event = rx.recv_async() => {
                let Ok(event) = event else { break };
                print_event(&event)?;
                if cli.resolve {
                    spawn_resolve(&engine, id, &event);
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for ctrl-c")?;
                tracing::info!("Shutdown signal received");
                break;
            }
        }
    }

    if let Err(e) = engine.stop(id).await {
        tracing::error!("Failed to stop session: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn print_event(event: &Event) -> Result<()> {
    let line = serde_json::to_string(event).context("Failed to encode event")?;
    println!("{}", line);
    Ok(())
}

/// Resolves a freshly found instance that arrived without endpoint data.
/// The outcome reaches stdout as a ServiceResolved event.
fn spawn_resolve(engine: &Arc<DiscoveryEngine<UdpTransport>>, id: SessionId, event: &Event) {
    let Event::ServiceFound(instance) = event else {
        return;
    };
    if instance.endpoint().is_some() {
        return;
    }

    let engine = engine.clone();
    let key = instance.key().clone();
    tokio::spawn(async move {
        if let Err(e) = engine.resolve(id, key.clone()).await {
            tracing::warn!("Failed to resolve {}: {}", key, e);
        }
    });
}
