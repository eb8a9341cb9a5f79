use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tunnelsquid::blocklist::{add_urls, remove_urls};
use tunnelsquid::config::{BLOCKLIST_FILE, PROXY_PORT};
use tunnelsquid::{Blocklist, ProxyCache, ProxyConfig, ProxyContext, ProxyServer, CACHE_CAPACITY};

#[derive(Parser, Debug)]
#[command(author, version, about = "Forwarding HTTP/HTTPS proxy with response caching")]
struct Cli {
    /// Blocklist file, one URL per line
    #[arg(long, global = true, default_value = BLOCKLIST_FILE)]
    blocklist: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy server
    Start {
        /// Enable verbose logging to show cache activity
        #[arg(short, long)]
        verbose: bool,

        /// Append timing information to each request summary
        #[arg(short, long)]
        timing: bool,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Port to listen on
        #[arg(long, default_value_t = PROXY_PORT)]
        port: u16,
    },
    /// Manage blocked origins
    Blocklist {
        #[command(subcommand)]
        action: BlocklistAction,
    },
}

#[derive(Subcommand, Debug)]
enum BlocklistAction {
    /// Refuse connections to these URLs
    Add {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Stop refusing connections to these URLs
    Remove {
        #[arg(required = true)]
        urls: Vec<String>,
    },
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}

fn init_logging(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let directive = if verbose { "tunnelsquid=debug" } else { "tunnelsquid=info" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

async fn start(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("[+] Loading blocklist...");
    let blocklist = Blocklist::load(&config.blocklist_path)?;
    if !blocklist.is_empty() {
        info!("[+] Blocking the following origins:");
        for key in blocklist.keys() {
            info!("\t{}", key);
        }
    }

    info!("[+] Starting proxy server...");
    info!("Cache size: {} entries", CACHE_CAPACITY);
    let ctx = ProxyContext::new(ProxyCache::new(), Arc::new(blocklist), config);
    let server = ProxyServer::bind(ctx).await?;
    info!("[+] Server listening on {}", server.local_addr()?);

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    let totals = server.run(shutdown).await;
    info!("[-] Server successfully stopped.");
    info!("[-] Total HTTP data sent: {} bytes.", totals.bytes_sent);
    info!("[-] Total HTTP data received: {} bytes.", totals.bytes_received);
    Ok(())
}

fn manage_blocklist(path: &Path, action: BlocklistAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        BlocklistAction::Add { urls } => {
            for outcome in add_urls(path, &urls)? {
                match outcome {
                    Ok(url) => info!("Added '{}' to blocklist.", url),
                    Err(e) => error!("Couldn't add to blocklist: {}", e),
                }
            }
        }
        BlocklistAction::Remove { urls } => {
            for outcome in remove_urls(path, &urls)? {
                match outcome {
                    Ok(url) => info!("Removed '{}' from blocklist.", url),
                    Err(e) => error!("Couldn't remove from blocklist: {}", e),
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            verbose,
            timing,
            bind,
            port,
        } => {
            init_logging(verbose)?;
            let config = ProxyConfig {
                blocklist_path: cli.blocklist,
                ..ProxyConfig::default()
            }
            .with_listen_addr(SocketAddr::new(bind, port))
            .with_timing(timing);
            start(config).await
        }
        Command::Blocklist { action } => {
            init_logging(false)?;
            manage_blocklist(&cli.blocklist, action)
        }
    }
}
