//! Service Virtualizer - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use service_virtualizer::pipeline::{MemoryCache, ResponseCache};
use service_virtualizer::{ContentStore, HostsConfig, Pipeline, Request, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "service-virtualizer",
    about = "Service virtualization server - filesystem-backed mocks with latency and error injection",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "service-virtualizer.yaml")]
    config: PathBuf,

    /// Directory holding the mock bodies (overrides the configuration file)
    #[arg(short, long)]
    mocks_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Leave latency injection out of the pipeline
    #[arg(long)]
    disable_latency: bool,

    /// Leave error injection out of the pipeline
    #[arg(long)]
    disable_error: bool,

    /// Leave response caching out of the pipeline
    #[arg(long)]
    disable_cache: bool,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// List the stored mocks and exit
    #[arg(long)]
    list: bool,

    /// Push one request through the pipeline, print the response and exit
    #[arg(long, num_args = 3, value_names = ["METHOD", "HOST", "URI"])]
    request: Option<Vec<String>>,

    /// Accept header sent with --request
    #[arg(long, default_value = "*/*")]
    accept: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print default config if requested
    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ServerConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no host rules)");
        ServerConfig::default()
    };

    // Validate and exit if requested
    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} hosts configured)",
            config.hosts.len()
        );
        return Ok(());
    }

    if let Some(mocks_dir) = args.mocks_dir {
        config.settings.mocks_dir = mocks_dir;
    }
    config.settings.disable_latency |= args.disable_latency;
    config.settings.disable_error |= args.disable_error;
    config.settings.disable_cache |= args.disable_cache;
    if config.settings.mocks_dir.is_relative() {
        config.settings.mocks_dir = std::env::current_dir()?.join(&config.settings.mocks_dir);
    }

    let store = Arc::new(
        ContentStore::open(&config.settings.mocks_dir).with_context(|| {
            format!(
                "failed to open mocks directory {}",
                config.settings.mocks_dir.display()
            )
        })?,
    );

    if args.list {
        let mut mocks = store.list().await?;
        mocks.sort_by(|a, b| (&a.host, &a.uri, &a.method).cmp(&(&b.host, &b.uri, &b.method)));
        for mock in &mocks {
            println!("{} {}{}", mock.method, mock.host, mock.uri);
        }
        println!("{} mocks", mocks.len());
        return Ok(());
    }

    let hosts = Arc::new(HostsConfig::new(config.hosts.clone())?);
    let cache: Arc<dyn ResponseCache> = Arc::new(MemoryCache::new());
    let pipeline = Pipeline::new(&config.settings, hosts, Some(store.clone()), cache).await;

    if let Some(parts) = args.request {
        let [method, host, uri] = <[String; 3]>::try_from(parts)
            .map_err(|_| anyhow::anyhow!("--request takes METHOD HOST URI"))?;
        let request = Request::new(host, method.to_uppercase(), uri)
            .with_accept(args.accept)
            .with_correlation_id("cli");
        let response = pipeline.handle(request).await;

        println!("{}", response.status);
        if let Some(content_type) = &response.content_type {
            println!("Content-Type: {}", content_type);
        }
        let mut headers: Vec<_> = response.headers.iter().collect();
        headers.sort();
        for (name, value) in headers {
            println!("{}: {}", name, value);
        }
        println!();
        println!("{}", response.body_str());
        return Ok(());
    }

    // Keep the store live and report changes until interrupted
    if !store.ensure_watching().await {
        anyhow::bail!("live reload unavailable for {}", store.root().display());
    }
    let events = store.subscribe("cli", &[]).await;
    info!(
        mocks_dir = %store.root().display(),
        stages = ?pipeline.stage_names(),
        "Service virtualizer ready"
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => info!(
                    kind = ?event.kind,
                    host = %event.data.host,
                    uri = %event.data.uri,
                    method = %event.data.method,
                    "Mock changed"
                ),
                None => break,
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
