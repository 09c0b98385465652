//! Control-plane server binary

use clap::{Parser, Subcommand};
use minipd::common::utils::parse_duration;
use minipd::coordinator::http::create_router;
use minipd::{Config, Server};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "minipd-server")]
#[command(about = "minipd control-plane member")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a control-plane member
    Serve {
        /// Config file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Member name
        #[arg(long)]
        name: Option<String>,

        /// Bind address for HTTP
        #[arg(long)]
        bind: Option<String>,

        /// Data directory
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Advertised client URLs (comma-separated)
        #[arg(long)]
        client_urls: Option<String>,

        /// Advertised peer URLs (comma-separated)
        #[arg(long)]
        peer_urls: Option<String>,

        /// Leader lease in seconds
        #[arg(long)]
        lease: Option<u64>,

        /// Metadata store request timeout (e.g. "500ms", "3s")
        #[arg(long, value_parser = parse_duration)]
        store_timeout: Option<Duration>,

        /// Log level
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            name,
            bind,
            data_dir,
            client_urls,
            peer_urls,
            lease,
            store_timeout,
            log_level,
        } => {
            // File and environment first, CLI flags override
            let mut cfg = Config::load(config.as_deref())?;
            if let Some(name) = name {
                cfg.name = name;
            }
            if let Some(bind) = bind {
                cfg.bind_addr = bind;
            }
            if let Some(data_dir) = data_dir {
                cfg.data_dir = data_dir;
            }
            if let Some(urls) = client_urls {
                cfg.advertise_client_urls = urls;
            }
            if let Some(urls) = peer_urls {
                cfg.advertise_peer_urls = urls;
            }
            if let Some(lease) = lease {
                cfg.lease = lease;
            }
            if let Some(timeout) = store_timeout {
                cfg.store_timeout_ms = timeout.as_millis() as u64;
            }
            if let Some(level) = log_level {
                cfg.log_level = level;
            }
            cfg.validate()?;

            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
            let (filter, reload_handle) = reload::Layer::new(filter);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();

            let bind_addr = cfg.bind_addr.clone();
            let server = Server::create(cfg).await?;
            server.set_log_level_hook(Box::new(move |level: &str| {
                reload_handle
                    .reload(EnvFilter::new(level))
                    .map_err(|e| minipd::Error::Internal(e.to_string()))
            }));
            server.run().await?;

            let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
            tracing::info!("✓ minipd {} ready on {}", minipd::VERSION, bind_addr);

            let router = create_router(server.clone());
            let res = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("received shutdown signal");
                })
                .await;
            if let Err(e) = res {
                tracing::error!("HTTP server error: {}", e);
            }

            server.close().await;
        }
    }

    Ok(())
}
